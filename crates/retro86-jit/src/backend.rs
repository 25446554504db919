use retro86_cpu_core::interp::{alu, inc_dec, Flow};
use retro86_cpu_core::jit::emitter::{BlockHandle, CodeEmitter, CompiledBlock, InsnRecord};
use retro86_cpu_core::jit::runtime::{BlockGuard, JitBackend, JitBlockExit};
use retro86_cpu_core::jit::CpuStatus;
use retro86_cpu_core::state::{CR0_EM, CR0_NE, CR0_TS, FPU_SW_ES, FPU_TAG_EMPTY};
use retro86_cpu_core::{CpuCore, Features, Platform};

use crate::ir::{IrBlock, MicroOp, Step};
use crate::lower::lower;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub blocks: u64,
    pub lowered_native: u64,
    pub lowered_interp: u64,
    pub executed_native: u64,
    pub executed_interp: u64,
}

/// Runs blocks as a list of micro-ops, calling the interpreter for anything
/// without a lowering.
#[derive(Debug, Default)]
pub struct ThreadedBackend {
    blocks: Vec<Option<IrBlock>>,
    free: Vec<u32>,
    open: Option<IrBlock>,
    stats: BackendStats,
}

impl ThreadedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> BackendStats {
        self.stats
    }

    pub fn live_blocks(&self) -> usize {
        self.blocks.iter().flatten().count()
    }

    pub fn block(&self, handle: BlockHandle) -> Option<&IrBlock> {
        self.blocks.get(handle.0 as usize)?.as_ref()
    }
}

impl CodeEmitter for ThreadedBackend {
    fn begin_block(&mut self, pc: u32, _status: CpuStatus) {
        self.open = Some(IrBlock::new(pc));
    }

    fn emit(&mut self, insn: &InsnRecord<'_>) {
        if let Some(open) = self.open.as_mut() {
            open.steps.push(lower(insn));
        }
    }

    fn finish_block(&mut self) -> Option<CompiledBlock> {
        let block = self.open.take().filter(|b| !b.steps.is_empty())?;
        let native = block.native_count() as u64;
        let total = block.steps.len() as u64;
        self.stats.blocks += 1;
        self.stats.lowered_native += native;
        self.stats.lowered_interp += total - native;
        tracing::trace!(entry = block.entry, native, total, "lowered block");

        let fpu_top_dependent = block.fpu_dependent();
        let id = match self.free.pop() {
            Some(id) => {
                self.blocks[id as usize] = Some(block);
                id
            }
            None => {
                self.blocks.push(Some(block));
                (self.blocks.len() - 1) as u32
            }
        };
        Some(CompiledBlock {
            handle: BlockHandle(id),
            fpu_top_dependent,
        })
    }

    fn abandon_block(&mut self) {
        self.open = None;
    }
}

impl JitBackend for ThreadedBackend {
    fn execute(
        &mut self,
        handle: BlockHandle,
        core: &mut CpuCore,
        platform: &mut dyn Platform,
    ) -> JitBlockExit {
        let Some(Some(block)) = self.blocks.get(handle.0 as usize) else {
            return JitBlockExit {
                exit_to_interpreter: true,
                ..JitBlockExit::default()
            };
        };
        // Native ops charge flat register-form costs; a modelled prefetch
        // queue needs the interpreter's byte fetches.
        let direct = core.model().prefetch_bytes == 0;
        let guard = BlockGuard::new(core);
        let mut exit = JitBlockExit::default();
        let (mut native, mut interp) = (0u64, 0u64);
        for step in &block.steps {
            let retired = match *step {
                Step::Native { next_pc, flow, op } => (direct
                    && !BlockGuard::trap_pending(core)
                    && run_native(core, op, next_pc))
                .then_some(flow),
                Step::Interp { .. } => None,
            };
            let ran = match retired {
                Some(flow) => {
                    native += 1;
                    Ok(flow)
                }
                None => {
                    interp += 1;
                    core.step_instruction(platform)
                }
            };
            match ran {
                Ok(flow) => {
                    exit.instructions += 1;
                    if guard.must_exit(core, step.next_pc()) {
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
        self.stats.executed_native += native;
        self.stats.executed_interp += interp;
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

/// Retire `op` directly against the register file. `false` leaves the core
/// untouched so the caller can interpret the instruction instead.
fn run_native(core: &mut CpuCore, op: MicroOp, next_pc: u32) -> bool {
    let cost = match op {
        MicroOp::Nop => None,
        MicroOp::Mov { w, dst, src } => {
            let v = src.read(&core.state, w);
            core.state.set_reg(w, dst, v);
            None
        }
        MicroOp::Alu {
            op,
            w,
            dst,
            src,
            store,
        } => {
            let a = core.state.reg(w, dst);
            let b = src.read(&core.state, w);
            let res = alu(&mut core.state.flags, op, w, a, b);
            if store {
                core.state.set_reg(w, dst, res);
            }
            None
        }
        MicroOp::IncDec { dec, w, reg } => {
            let a = core.state.reg(w, reg);
            let res = inc_dec(&mut core.state.flags, dec, w, a);
            core.state.set_reg(w, reg, res);
            None
        }
        MicroOp::Fxch {
            top,
            phys_a,
            phys_b,
        } => {
            if !fxch_direct(core, top, phys_a, phys_b) {
                return false;
            }
            let fpu = &mut core.state.fpu;
            let (a, b) = (fpu.st[usize::from(phys_a)], fpu.st[usize::from(phys_b)]);
            fpu.set_phys(usize::from(phys_a), b);
            fpu.set_phys(usize::from(phys_b), a);
            Some(core.model().timings.fpu)
        }
    };
    match cost {
        Some(cycles) => core.charge(i64::from(cycles)),
        None => core.charge_ea(false, false),
    }
    core.state.eip = next_pc;
    core.stats.instructions += 1;
    true
}

/// FXCH can only skip the interpreter when it cannot fault or hit an empty
/// register, and the stack sits where it did at translation time.
fn fxch_direct(core: &CpuCore, top: u8, phys_a: u8, phys_b: u8) -> bool {
    let fpu = &core.state.fpu;
    core.model().has(Features::FPU)
        && core.state.cr0 & (CR0_EM | CR0_TS) == 0
        && !(fpu.sw & FPU_SW_ES != 0 && core.state.cr0 & CR0_NE != 0)
        && fpu.top == top
        && fpu.tag(usize::from(phys_a)) != FPU_TAG_EMPTY
        && fpu.tag(usize::from(phys_b)) != FPU_TAG_EMPTY
}
