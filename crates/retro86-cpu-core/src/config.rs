use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use retro86_mmu::DEFAULT_MAC_ENTRIES;

/// Hard cap on instructions per recompiled block.
pub const MAX_BLOCK_INSTRUCTIONS: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CpuConfig {
    /// Name of a record in [`crate::model::MODELS`].
    pub model: String,
    /// Use the recompiler when the model supports it.
    pub dynarec: bool,
    /// MAC entries per side (read and write).
    pub mac_entries: usize,
    pub jit: JitConfig,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            model: "486DX".to_owned(),
            dynarec: true,
            mac_entries: DEFAULT_MAC_ENTRIES,
            jit: JitConfig::default(),
        }
    }
}

impl CpuConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mac_entries == 0 {
            return Err(ConfigError::ZeroMacEntries);
        }
        self.jit.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JitConfig {
    /// Direct-mapped hash table slots; must be a power of two.
    pub hash_entries: usize,
    pub max_block_instructions: u32,
    /// Byte budget of a block; a block may cross into a second page only while
    /// under this budget.
    pub max_block_bytes: u32,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            hash_entries: 4096,
            max_block_instructions: 64,
            max_block_bytes: 512,
        }
    }
}

impl JitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hash_entries == 0 || !self.hash_entries.is_power_of_two() {
            return Err(ConfigError::HashEntries(self.hash_entries));
        }
        if self.max_block_instructions == 0 || self.max_block_instructions > MAX_BLOCK_INSTRUCTIONS
        {
            return Err(ConfigError::BlockInstructions {
                got: self.max_block_instructions,
                max: MAX_BLOCK_INSTRUCTIONS,
            });
        }
        if !(16..=4096).contains(&self.max_block_bytes) {
            return Err(ConfigError::BlockBytes(self.max_block_bytes));
        }
        Ok(())
    }
}
