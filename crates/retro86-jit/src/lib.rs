#![forbid(unsafe_code)]

//! Portable threaded-code backend for the retro86 recompiler.
//!
//! Each instruction the scheduler retires on a compile pass is decoded with
//! iced-x86 and lowered to a [`ir::MicroOp`] when it only touches general
//! registers and flags (or is a register FXCH). Everything else becomes a
//! [`ir::Step::Interp`] that calls back into the interpreter. Running a block
//! walks its steps in order, with the same per-instruction exit checks as the
//! reference backend.

pub mod backend;
pub mod ir;
pub mod lower;

pub use backend::{BackendStats, ThreadedBackend};

use retro86_cpu_core::{CpuCore, Scheduler};

/// Scheduler for `core` driving a fresh [`ThreadedBackend`].
pub fn scheduler(core: &CpuCore) -> Scheduler<ThreadedBackend> {
    Scheduler::new(&core.config().jit, ThreadedBackend::new())
}
