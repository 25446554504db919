//! Tiered execution: the interpreter plus the block cache and a recompiler
//! backend.
//!
//! A PC goes through three visits before it runs translated code. The first
//! marks it and interprets. The second interprets again while handing every
//! retired instruction to the backend. From the third on, the backend's block
//! runs, after the cache has checked its bytes are unchanged.

use crate::config::JitConfig;
use crate::interp::Flow;
use crate::interrupts::{deliver_exception, service_events};
use crate::jit::block::{BlockBuilder, BlockId, BlockKey};
use crate::jit::cache::{current_key, CodeCache, Probe};
use crate::jit::emitter::InsnRecord;
use crate::jit::runtime::{BlockGuard, JitBackend, ReplayBackend};
use crate::jit::CpuStatus;
use crate::platform::Platform;
use crate::CpuCore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutedTier {
    Interpreter,
    Jit,
}

/// Which visit of a block a step was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Plain interpretation; the block is not cached.
    Interpret,
    /// First visit: the block was marked.
    Mark,
    /// Interpreted while emitting a translation.
    Compile,
    Execute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    InterruptDelivered,
    /// Halted with nothing to deliver; the rest of the budget was burnt.
    Idle,
    Block {
        tier: ExecutedTier,
        tick: Tick,
        entry_pc: u32,
        instructions: u32,
    },
}

impl StepOutcome {
    pub fn instructions(&self) -> u32 {
        match *self {
            StepOutcome::Block { instructions, .. } => instructions,
            _ => 0,
        }
    }
}

#[derive(Debug)]
pub struct Scheduler<B: JitBackend = ReplayBackend> {
    backend: B,
    cache: CodeCache,
    config: JitConfig,
    /// Core flush epoch the cache is in sync with.
    epoch: Option<u64>,
    force_interpreter: bool,
}

impl Scheduler<ReplayBackend> {
    /// Scheduler with the reference backend, sized from `core`'s config.
    pub fn for_core(core: &CpuCore) -> Self {
        Self::new(&core.config().jit, ReplayBackend::new())
    }
}

impl<B: JitBackend> Scheduler<B> {
    pub fn new(config: &JitConfig, backend: B) -> Self {
        Self {
            backend,
            cache: CodeCache::new(config),
            config: config.clone(),
            epoch: None,
            force_interpreter: false,
        }
    }

    pub fn cache(&self) -> &CodeCache {
        &self.cache
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Flush the core's code bookkeeping and everything cached here.
    pub fn flush(&mut self, core: &mut CpuCore) {
        core.flush_code_cache("scheduler flush");
        self.sync_epoch(core);
    }

    fn sync_epoch(&mut self, core: &CpuCore) {
        let epoch = core.code_epoch();
        if self.epoch == Some(epoch) {
            return;
        }
        if self.epoch.is_some() {
            tracing::debug!(epoch, blocks = self.cache.len(), "dropping translated blocks");
        }
        self.cache.flush();
        self.cache.take_retired();
        self.backend.clear();
        self.epoch = Some(epoch);
    }

    fn release_retired(&mut self) {
        for handle in self.cache.take_retired() {
            self.backend.release(handle);
        }
    }

    /// Run one cycle budget. Models without recompiler support, or a config
    /// with it turned off, go straight to [`CpuCore::run`].
    pub fn run(&mut self, core: &mut CpuCore, platform: &mut dyn Platform, budget: i64) -> i64 {
        if !core.dynarec_enabled() {
            return core.run(platform, budget);
        }
        platform.begin_period(budget);
        core.state.cycles += budget;
        let start = core.state.cycles;
        while core.state.cycles > 0 {
            if self.step(core, platform) == StepOutcome::Idle {
                break;
            }
        }
        let executed = (start - core.state.cycles).max(0);
        platform.end_period(executed);
        executed
    }

    /// Service events, then execute one block by whichever tier applies.
    pub fn step(&mut self, core: &mut CpuCore, platform: &mut dyn Platform) -> StepOutcome {
        if service_events(core, platform) {
            return StepOutcome::InterruptDelivered;
        }
        if core.state.halted {
            core.idle();
            return StepOutcome::Idle;
        }
        self.sync_epoch(core);

        let entry_pc = core.state.eip;
        if self.force_interpreter || BlockGuard::trap_pending(core) {
            self.force_interpreter = false;
            return self.interpret(core, platform, Tick::Interpret);
        }
        // Fetch faults are raised by the interpreter with the right priority.
        let Ok(phys) = core.code_phys(platform) else {
            return self.interpret(core, platform, Tick::Interpret);
        };
        let key = current_key(core, phys);
        let probe = self.cache.probe(core, platform, key);
        self.release_retired();
        match probe {
            Probe::Mark => {
                self.cache.mark(key);
                self.interpret(core, platform, Tick::Mark)
            }
            Probe::Compile(id) => self.compile(core, platform, id, key),
            Probe::Execute(_, handle) => {
                let exit = self.backend.execute(handle, core, platform);
                if let Some(fault) = exit.fault {
                    deliver_exception(core, platform, fault);
                }
                self.force_interpreter = exit.exit_to_interpreter;
                StepOutcome::Block {
                    tier: ExecutedTier::Jit,
                    tick: Tick::Execute,
                    entry_pc,
                    instructions: exit.instructions,
                }
            }
        }
    }

    /// Interpret up to the end of a block.
    fn interpret(&mut self, core: &mut CpuCore, platform: &mut dyn Platform, tick: Tick) -> StepOutcome {
        let entry_pc = core.state.eip;
        let mut instructions = 0;
        loop {
            match core.step_instruction(platform) {
                Ok(flow) => {
                    instructions += 1;
                    if flow == Flow::EndBlock
                        || instructions >= self.config.max_block_instructions
                        || core.state.cycles <= 0
                        || core.state.halted
                        || core.pending.interrupt_shadow
                    {
                        break;
                    }
                }
                Err(fault) => {
                    deliver_exception(core, platform, fault);
                    break;
                }
            }
        }
        StepOutcome::Block {
            tier: ExecutedTier::Interpreter,
            tick,
            entry_pc,
            instructions,
        }
    }

    /// Second visit: interpret the block and hand each retired instruction to
    /// the backend.
    fn compile(
        &mut self,
        core: &mut CpuCore,
        platform: &mut dyn Platform,
        id: BlockId,
        key: BlockKey,
    ) -> StepOutcome {
        let fpu_top = core.state.fpu.top;
        let mut builder = BlockBuilder::new(key, &self.config);
        self.backend.begin_block(key.pc, key.status);
        let mut instructions = 0;
        loop {
            let pc = core.state.eip;
            let top = core.state.fpu.top;
            let writes = core.code_write_count();
            match core.step_instruction(platform) {
                Ok(flow) => {
                    instructions += 1;
                    let fetch = core.fetch;
                    // An instruction that wrote guest code ends the block
                    // without being part of it.
                    if writes != core.code_write_count()
                        || !builder.push(fetch.bytes(), fetch.first_phys, fetch.last_phys)
                    {
                        break;
                    }
                    self.backend.emit(&InsnRecord {
                        pc,
                        next_pc: core.state.eip,
                        bytes: fetch.bytes(),
                        status: key.status,
                        flow,
                        fpu_top: top,
                    });
                    if flow == Flow::EndBlock
                        || builder.full()
                        || core.state.halted
                        || core.pending.interrupt_shadow
                        || CpuStatus::current(&core.state) != key.status
                    {
                        break;
                    }
                }
                Err(fault) => {
                    deliver_exception(core, platform, fault);
                    break;
                }
            }
        }

        if builder.is_empty() {
            self.backend.abandon_block();
            self.cache.discard(core, id);
        } else {
            match self.backend.finish_block() {
                Some(compiled) => {
                    let top = compiled.fpu_top_dependent.then_some(fpu_top);
                    self.cache
                        .install(core, platform, id, builder, compiled.handle, top);
                }
                None => {
                    tracing::trace!(pc = format_args!("{:#010x}", key.pc), "backend declined block");
                    self.cache.discard(core, id);
                }
            }
        }
        self.release_retired();

        StepOutcome::Block {
            tier: ExecutedTier::Interpreter,
            tick: Tick::Compile,
            entry_pc: key.pc,
            instructions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::FlatTestBus;
    use crate::state::{EAX, EBX};
    use crate::test_util::{protected_core, real_core};

    // 0100: inc eax
    // 0101: cmp eax, 100
    // 0106: jne 0100
    // 0108: hlt
    const LOOP: [u8; 9] = [0x40, 0x3D, 100, 0, 0, 0, 0x75, 0xF8, 0xF4];

    fn restart(core: &mut CpuCore) {
        core.state.gpr[EAX] = 0;
        core.state.eip = 0x100;
        core.state.halted = false;
    }

    fn looping_core() -> (CpuCore, FlatTestBus) {
        let (core, mut bus) = protected_core("486DX");
        bus.load(0x100, &LOOP);
        (core, bus)
    }

    #[test]
    fn blocks_go_from_marked_to_executed() {
        let (mut core, mut bus) = looping_core();
        let mut sched = Scheduler::for_core(&core);
        core.state.cycles = 1_000_000;

        let ticks: Vec<_> = (0..3)
            .map(|_| match sched.step(&mut core, &mut bus) {
                StepOutcome::Block { tick, instructions, .. } => (tick, instructions),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(ticks, vec![(Tick::Mark, 3), (Tick::Compile, 3), (Tick::Execute, 3)]);
        assert_eq!(core.state.gpr[EAX], 3);
        assert_eq!(sched.backend().live_blocks(), 1);
    }

    #[test]
    fn recompiled_run_matches_interpreter() {
        let (mut jit_core, mut jit_bus) = looping_core();
        let mut sched = Scheduler::for_core(&jit_core);
        sched.run(&mut jit_core, &mut jit_bus, 1_000_000);

        let (mut core, mut bus) = looping_core();
        core.run(&mut bus, 1_000_000);

        assert!(jit_core.state.halted);
        assert_eq!(jit_core.state.gpr, core.state.gpr);
        assert_eq!(jit_core.state.eip, core.state.eip);
        assert_eq!(jit_core.state.flags.value(), core.state.flags.value());
        assert_eq!(jit_core.stats.instructions, core.stats.instructions);
        assert_eq!(jit_core.stats.instructions, 301);
        assert!(sched.cache().stats().hits > 90);
    }

    #[test]
    fn modified_code_is_recompiled() {
        let (mut core, mut bus) = looping_core();
        let mut sched = Scheduler::for_core(&core);
        sched.run(&mut core, &mut bus, 1_000_000);
        assert_eq!(core.state.gpr[EAX], 100);

        // Patch the compare immediate as a DMA write would.
        bus.load(0x102, &[50]);
        core.notify_phys_write(0x102, 1);
        restart(&mut core);
        sched.run(&mut core, &mut bus, 1_000_000);
        assert_eq!(core.state.gpr[EAX], 50);
        assert_eq!(sched.cache().stats().invalidated, 1);
    }

    #[test]
    fn core_flush_empties_cache() {
        let (mut core, mut bus) = looping_core();
        let mut sched = Scheduler::for_core(&core);
        sched.run(&mut core, &mut bus, 1_000_000);
        assert!(!sched.cache().is_empty());

        core.set_cr3(0x5000);
        restart(&mut core);
        core.state.cycles = 1_000_000;
        sched.step(&mut core, &mut bus);
        assert_eq!(sched.backend().live_blocks(), 0);
        assert_eq!(sched.cache().len(), 1);
    }

    #[test]
    fn interpreter_only_models_bypass_the_cache() {
        let (mut core, mut bus) = real_core("80286");
        bus.load(0x100, &[0x40, 0x40, 0xF4]);
        let mut sched = Scheduler::for_core(&core);
        sched.run(&mut core, &mut bus, 10_000);
        assert!(core.state.halted);
        assert_eq!(core.state.gpr[EAX] & 0xFFFF, 2);
        assert!(sched.cache().is_empty());
    }

    #[test]
    fn fault_inside_translated_block_is_delivered() {
        let (mut core, mut bus) = real_core("486DX");
        // 0100: div bl ; hlt
        bus.load(0x100, &[0xF6, 0xF3, 0xF4]);
        // #DE handler at 0:0300 is a HLT.
        bus.load(0, &[0x00, 0x03, 0x00, 0x00]);
        bus.load(0x300, &[0xF4]);
        core.state.cycles = 1_000_000;
        let mut sched = Scheduler::for_core(&core);

        // Mark, then compile, with a divisor that does not fault.
        for _ in 0..2 {
            restart(&mut core);
            core.state.gpr[EAX] = 4;
            core.state.gpr[EBX] = 1;
            sched.step(&mut core, &mut bus);
            assert!(core.state.halted);
        }

        restart(&mut core);
        core.state.gpr[EAX] = 0x1234;
        core.state.gpr[EBX] = 0;
        let first = sched.step(&mut core, &mut bus);
        assert!(matches!(first, StepOutcome::Block { tick: Tick::Execute, instructions: 0, .. }));
        assert_eq!(core.state.eip, 0x300);
        while !core.state.halted {
            sched.step(&mut core, &mut bus);
        }
        assert_eq!(core.state.eip, 0x301);
        assert_eq!(core.state.gpr[EAX], 0x1234);
        assert_eq!(core.stats.exceptions, 1);
    }
}
