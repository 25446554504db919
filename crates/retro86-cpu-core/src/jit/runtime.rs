//! Executing translated blocks.

use crate::exception::Fault;
use crate::flags::FLAG_TF;
use crate::interp::Flow;
use crate::platform::Platform;
use crate::CpuCore;

use super::emitter::{BlockHandle, CodeEmitter, CompiledBlock, InsnRecord};
use super::CpuStatus;

/// How a translated block left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JitBlockExit {
    /// Instructions retired.
    pub instructions: u32,
    /// Fault raised by the instruction after the last retired one. EIP points
    /// at that instruction; the scheduler delivers it.
    pub fault: Option<Fault>,
    /// The block stopped early because guest code changed under it or a trap
    /// became pending; the next step should interpret.
    pub exit_to_interpreter: bool,
}

pub trait JitBackend: CodeEmitter {
    fn execute(
        &mut self,
        handle: BlockHandle,
        core: &mut CpuCore,
        platform: &mut dyn Platform,
    ) -> JitBlockExit;

    fn release(&mut self, handle: BlockHandle);

    /// Drop every block.
    fn clear(&mut self);
}

/// Checks a backend makes after every retired instruction.
#[derive(Debug, Clone, Copy)]
pub struct BlockGuard {
    writes: u64,
}

impl BlockGuard {
    pub fn new(core: &CpuCore) -> Self {
        Self {
            writes: core.code_write_count(),
        }
    }

    /// Guest code was written since the block started.
    #[inline]
    pub fn code_written(&self, core: &CpuCore) -> bool {
        core.code_write_count() != self.writes
    }

    /// A single-step trap must be taken before anything else runs.
    #[inline]
    pub fn trap_pending(core: &CpuCore) -> bool {
        core.pending.single_step || core.state.flags.get(FLAG_TF)
    }

    /// Whether the block has to stop after an instruction that was expected to
    /// continue at `expected_next`.
    #[inline]
    pub fn must_exit(&self, core: &CpuCore, expected_next: u32) -> bool {
        core.state.eip != expected_next
            || core.state.halted
            || self.code_written(core)
            || Self::trap_pending(core)
    }
}

/// Reference backend: a block is the list of its instruction boundaries, and
/// running it steps the interpreter across them.
#[derive(Debug, Default)]
pub struct ReplayBackend {
    blocks: Vec<Option<Vec<u32>>>,
    free: Vec<u32>,
    open: Option<Vec<u32>>,
}

impl ReplayBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks currently held.
    pub fn live_blocks(&self) -> usize {
        self.blocks.iter().flatten().count()
    }
}

impl CodeEmitter for ReplayBackend {
    fn begin_block(&mut self, _pc: u32, _status: CpuStatus) {
        self.open = Some(Vec::new());
    }

    fn emit(&mut self, insn: &InsnRecord<'_>) {
        if let Some(open) = self.open.as_mut() {
            open.push(insn.next_pc);
        }
    }

    fn finish_block(&mut self) -> Option<CompiledBlock> {
        let pcs = self.open.take().filter(|pcs| !pcs.is_empty())?;
        let id = match self.free.pop() {
            Some(id) => {
                self.blocks[id as usize] = Some(pcs);
                id
            }
            None => {
                self.blocks.push(Some(pcs));
                (self.blocks.len() - 1) as u32
            }
        };
        Some(CompiledBlock {
            handle: BlockHandle(id),
            fpu_top_dependent: false,
        })
    }

    fn abandon_block(&mut self) {
        self.open = None;
    }
}

impl JitBackend for ReplayBackend {
    fn execute(
        &mut self,
        handle: BlockHandle,
        core: &mut CpuCore,
        platform: &mut dyn Platform,
    ) -> JitBlockExit {
        let Some(Some(pcs)) = self.blocks.get(handle.0 as usize) else {
            return JitBlockExit {
                exit_to_interpreter: true,
                ..JitBlockExit::default()
            };
        };
        let guard = BlockGuard::new(core);
        let mut exit = JitBlockExit::default();
        for &next in pcs {
            match core.step_instruction(platform) {
                Ok(flow) => {
                    exit.instructions += 1;
                    if guard.must_exit(core, next) {
                        exit.exit_to_interpreter =
                            guard.code_written(core) || BlockGuard::trap_pending(core);
                        break;
                    }
                    if flow == Flow::EndBlock {
                        break;
                    }
                }
                Err(fault) => {
                    exit.fault = Some(fault);
                    break;
                }
            }
        }
        exit
    }

    fn release(&mut self, handle: BlockHandle) {
        if let Some(slot) = self.blocks.get_mut(handle.0 as usize) {
            if slot.take().is_some() {
                self.free.push(handle.0);
            }
        }
    }

    fn clear(&mut self) {
        self.blocks.clear();
        self.free.clear();
        self.open = None;
    }
}
