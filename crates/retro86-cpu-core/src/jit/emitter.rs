//! Code emission interface.
//!
//! A block is translated while it is interpreted: after each instruction
//! retires on the compile pass, the scheduler hands the backend an
//! [`InsnRecord`] with the bytes it executed and where execution went next.

use crate::interp::Flow;

use super::CpuStatus;

/// Backend-assigned name for a translated block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHandle(pub u32);

/// One instruction retired on the compile pass.
#[derive(Debug, Clone, Copy)]
pub struct InsnRecord<'a> {
    pub pc: u32,
    /// EIP after the instruction retired. A backend exits the block when a
    /// later run does not end up here.
    pub next_pc: u32,
    pub bytes: &'a [u8],
    pub status: CpuStatus,
    pub flow: Flow,
    /// FPU stack TOP before the instruction ran.
    pub fpu_top: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompiledBlock {
    pub handle: BlockHandle,
    /// The translation names FPU registers physically, so it is only valid for
    /// the stack TOP it was built against.
    pub fpu_top_dependent: bool,
}

pub trait CodeEmitter {
    fn begin_block(&mut self, pc: u32, status: CpuStatus);

    fn emit(&mut self, insn: &InsnRecord<'_>);

    /// Close the open block. `None` if the backend declines to translate it.
    fn finish_block(&mut self) -> Option<CompiledBlock>;

    /// Throw the open block away.
    fn abandon_block(&mut self);
}
