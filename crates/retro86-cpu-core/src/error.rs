//! Host-level errors. These indicate a configuration or implementation bug and are
//! never produced by guest behaviour; architectural faults are [`crate::Fault`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unknown CPU model `{0}`")]
    UnknownModel(String),

    #[error("opcode table for {model} is inconsistent: {detail}")]
    InconsistentTable { model: &'static str, detail: String },

    #[error("invalid CPU configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("snapshot is for {found}, core is {expected}")]
    SnapshotModel { expected: &'static str, found: String },

    #[error("snapshot format {found} is not supported (expected {expected})")]
    SnapshotVersion { expected: u32, found: u32 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("MAC needs at least one entry per side")]
    ZeroMacEntries,

    #[error("code cache hash table size must be a non-zero power of two, got {0}")]
    HashEntries(usize),

    #[error("max_block_instructions must be in 1..={max}, got {got}")]
    BlockInstructions { got: u32, max: u32 },

    #[error("max_block_bytes must be in 16..=4096, got {0}")]
    BlockBytes(u32),
}
