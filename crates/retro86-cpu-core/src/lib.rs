#![forbid(unsafe_code)]

//! x86 CPU execution engine for 8088 through Pentium II class cores.
//!
//! [`CpuCore`] owns the register file, the paging unit and the opcode tables
//! for one CPU model. It is driven one cycle budget at a time, either by
//! [`CpuCore::run`] (interpreter only) or by [`exec::Scheduler`], which adds the
//! block cache and a recompiler backend. Everything the core needs from the
//! machine comes in through [`platform::Platform`].

pub mod config;
pub mod error;
pub mod exception;
pub mod exec;
pub mod flags;
pub mod interp;
pub mod interrupts;
pub mod jit;
pub mod mem;
pub mod model;
pub mod platform;
pub mod segmentation;
pub mod snapshot;
pub mod state;

pub use config::{CpuConfig, JitConfig};
pub use error::{ConfigError, CoreError};
pub use exception::{Exception, Fault};
pub use exec::Scheduler;
pub use mem::FlatTestBus;
pub use model::{CpuClass, CpuModel, Features, MODELS};
pub use platform::{InterruptController, IoBus, MemoryBus, Platform, TimerHooks};
pub use snapshot::CpuSnapshot;
pub use state::CpuState;

use retro86_mmu::{Mmu, PAGE_SHIFT};

use crate::interp::prefetch::PrefetchQueue;
use crate::interp::table::OpcodeTables;
use crate::interrupts::PendingEvents;
use crate::jit::dirty::CodePageMap;
use crate::mem::FetchLog;
use crate::state::{CR0_PE, CR0_PG};

/// Event counters. Not architectural; reset only with the core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreStats {
    pub instructions: u64,
    pub interrupts: u64,
    pub exceptions: u64,
    pub triple_faults: u64,
    pub code_flushes: u64,
}

#[derive(Debug)]
pub struct CpuCore {
    pub state: CpuState,
    pub mmu: Mmu,
    pub pending: PendingEvents,
    pub stats: CoreStats,
    pub(crate) tables: OpcodeTables,
    pub(crate) prefetch: PrefetchQueue,
    pub(crate) code_pages: CodePageMap,
    pub(crate) fetch: FetchLog,
    /// Set by a task switch inside the current instruction.
    pub(crate) switched_task: bool,
    model: &'static CpuModel,
    config: CpuConfig,
    /// Bumped on every full code-cache flush.
    code_epoch: u64,
}

impl CpuCore {
    pub fn new(config: CpuConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let model = CpuModel::by_name(&config.model)?;
        let tables = OpcodeTables::build(model)?;
        let mut mmu = Mmu::new(config.mac_entries);
        mmu.set_capabilities(model.has(Features::WP), model.has(Features::PSE));
        let state = CpuState::reset(model);
        mmu.set_cr0(state.cr0);
        mmu.set_cr3(state.cr3);
        mmu.set_cr4(state.cr4);
        tracing::debug!(
            model = model.name,
            dynarec = config.dynarec && model.dynarec_capable,
            "cpu core created"
        );
        Ok(Self {
            state,
            mmu,
            pending: PendingEvents::default(),
            stats: CoreStats::default(),
            tables,
            prefetch: PrefetchQueue::new(model),
            code_pages: CodePageMap::default(),
            fetch: FetchLog::default(),
            switched_task: false,
            model,
            config,
            code_epoch: 0,
        })
    }

    /// Default configuration for the named model.
    pub fn with_model(name: &str) -> Result<Self, CoreError> {
        Self::new(CpuConfig {
            model: name.to_owned(),
            ..CpuConfig::default()
        })
    }

    #[inline]
    pub fn model(&self) -> &'static CpuModel {
        self.model
    }

    #[inline]
    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    /// Whether blocks may be recompiled for this core.
    #[inline]
    pub fn dynarec_enabled(&self) -> bool {
        self.config.dynarec && self.model.dynarec_capable
    }

    /// Power-on reset. Counters survive.
    pub fn reset(&mut self) {
        self.state = CpuState::reset(self.model);
        self.pending = PendingEvents::default();
        self.prefetch = PrefetchQueue::new(self.model);
        self.fetch.clear();
        self.switched_task = false;
        self.mmu.set_cr0(self.state.cr0);
        self.mmu.set_cr3(self.state.cr3);
        self.mmu.set_cr4(self.state.cr4);
        self.flush_code_cache("reset");
    }

    /// Shutdown after a fault during double-fault delivery: the core resets.
    pub fn triple_fault(&mut self) {
        tracing::warn!(
            eip = format_args!("{:#010x}", self.state.eip),
            cs = format_args!("{:#06x}", self.state.seg(state::SegReg::Cs).selector),
            "triple fault, resetting cpu"
        );
        self.stats.triple_faults += 1;
        self.reset();
    }

    pub fn set_cr0(&mut self, value: u32) {
        let old = self.state.cr0;
        self.state.cr0 = value;
        self.mmu.set_cr0(value);
        let changed = old ^ value;
        if changed & CR0_PE != 0 {
            tracing::debug!(
                protected = value & CR0_PE != 0,
                eip = format_args!("{:#010x}", self.state.eip),
                "protection enable changed"
            );
        }
        if changed & CR0_PG != 0 {
            tracing::debug!(paging = value & CR0_PG != 0, "paging changed");
        }
        if changed & (CR0_PE | CR0_PG) != 0 {
            self.flush_code_cache("cr0");
        }
    }

    pub fn set_cr3(&mut self, value: u32) {
        self.state.cr3 = value;
        self.mmu.set_cr3(value);
        self.flush_code_cache("cr3");
    }

    pub fn set_cr4(&mut self, value: u32) {
        self.state.cr4 = value;
        self.mmu.set_cr4(value);
    }

    /// Drop every translated block. The scheduler notices through
    /// [`Self::code_epoch`] and clears its cache and backend.
    pub fn flush_code_cache(&mut self, reason: &'static str) {
        if self.code_pages.code_pages() != 0 {
            tracing::debug!(reason, pages = self.code_pages.code_pages(), "code cache flush");
        }
        self.code_pages.clear();
        self.mmu.clear_code_frames();
        self.code_epoch += 1;
        self.stats.code_flushes += 1;
    }

    #[inline]
    pub fn code_epoch(&self) -> u64 {
        self.code_epoch
    }

    #[inline]
    pub fn code_pages(&self) -> &CodePageMap {
        &self.code_pages
    }

    /// Writes that have hit translated code so far. A backend that sees this
    /// change mid-block must stop after the current instruction.
    #[inline]
    pub fn code_write_count(&self) -> u64 {
        self.code_pages.writes()
    }

    /// Register `len` bytes at `paddr` (one page) as translated code.
    pub(crate) fn register_code(&mut self, paddr: u32, len: u32) {
        if self.code_pages.add_code(paddr, len) {
            self.mmu.set_code_frame(paddr >> PAGE_SHIFT, true);
        }
    }

    pub(crate) fn release_code_page(&mut self, frame: u32) {
        self.code_pages.drop_page(frame);
        self.mmu.set_code_frame(frame, false);
    }

    /// Burn the rest of the budget while halted.
    pub(crate) fn idle(&mut self) {
        let left = self.state.cycles;
        if left > 0 {
            self.charge(left);
        }
    }

    /// Interpreter-only slice: add `budget` cycles and execute until they are
    /// spent, checking for events between instructions. Returns the cycles
    /// consumed.
    pub fn run(&mut self, platform: &mut dyn Platform, budget: i64) -> i64 {
        platform.begin_period(budget);
        self.state.cycles += budget;
        let start = self.state.cycles;
        while self.state.cycles > 0 {
            if interrupts::service_events(self, platform) {
                continue;
            }
            if self.state.halted {
                self.idle();
                break;
            }
            if let Err(fault) = self.step_instruction(platform) {
                interrupts::deliver_exception(self, platform, fault);
            }
        }
        let executed = (start - self.state.cycles).max(0);
        platform.end_period(executed);
        executed
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use crate::exception::Fault;
    use crate::mem::FlatTestBus;
    use crate::model::CpuClass;
    use crate::segmentation::descriptor::Descriptor;
    use crate::state::{SegReg, SegmentCache, TableReg, CR0_PE, ESP};
    use crate::CpuCore;

    pub const TEST_RAM: usize = 0x20_0000;
    pub const GDT_BASE: u32 = 0x800;

    /// Real-mode core with every segment at base 0, code at 0:0100.
    pub fn real_core(model: &str) -> (CpuCore, FlatTestBus) {
        let mut core = CpuCore::with_model(model).unwrap();
        for seg in SegReg::ALL {
            *core.state.seg_mut(seg) = SegmentCache::real_mode(0, seg == SegReg::Cs);
        }
        core.state.eip = 0x100;
        core.state.gpr[ESP] = 0xFFF0;
        (core, FlatTestBus::new(TEST_RAM))
    }

    fn flat(core: &CpuCore, access: u8) -> Descriptor {
        // A 286 has no granularity bit or 32-bit segments.
        if core.model().at_least(CpuClass::I386) {
            Descriptor::segment(0, 0xFFFFF, access, 0xC)
        } else {
            Descriptor::segment(0, 0xFFFF, access, 0)
        }
    }

    /// Protected-mode ring 0 core with a four-entry GDT at 0x800: 0x08 code,
    /// 0x10 data, 0x18 ring 3 code, 0x20 ring 3 data.
    pub fn protected_core(model: &str) -> (CpuCore, FlatTestBus) {
        let (mut core, mut bus) = real_core(model);
        let entries = [(0x08u16, 0x9Bu8), (0x10, 0x93), (0x18, 0xFB), (0x20, 0xF3)];
        for (sel, access) in entries {
            let d = flat(&core, access);
            bus.load(GDT_BASE + u32::from(sel), &d.raw.to_le_bytes());
        }
        core.state.gdtr = TableReg {
            base: GDT_BASE,
            limit: 0x27,
        };
        core.set_cr0(core.state.cr0 | CR0_PE);
        let code = flat(&core, 0x9B);
        let data = flat(&core, 0x93);
        for seg in SegReg::ALL {
            *core.state.seg_mut(seg) = if seg == SegReg::Cs {
                SegmentCache::from_descriptor(0x08, &code)
            } else {
                SegmentCache::from_descriptor(0x10, &data)
            };
        }
        core.state.eip = 0x100;
        (core, bus)
    }

    /// Drop a [`protected_core`] to CPL 3 with IOPL 0.
    pub fn enter_ring3(core: &mut CpuCore, _bus: &mut FlatTestBus) {
        let code = flat(core, 0xFB);
        let data = flat(core, 0xF3);
        *core.state.seg_mut(SegReg::Cs) = SegmentCache::from_descriptor(0x1B, &code);
        for seg in [SegReg::Ss, SegReg::Ds, SegReg::Es] {
            *core.state.seg_mut(seg) = SegmentCache::from_descriptor(0x23, &data);
        }
        core.state.gpr[ESP] = 0x6000;
        let eflags = core.state.flags.value() & !crate::flags::FLAG_IOPL_MASK;
        core.state.flags.set_eflags(eflags);
    }

    /// Load `code` at CS:EIP and step until EIP leaves it. Stops at the first
    /// fault, which is returned undelivered.
    pub fn run_bytes(core: &mut CpuCore, bus: &mut FlatTestBus, code: &[u8]) -> Result<(), Fault> {
        let start = core.state.eip;
        let base = core.state.seg(SegReg::Cs).base;
        bus.load(base.wrapping_add(start), code);
        if core.state.cycles <= 0 {
            core.state.cycles = 1_000_000;
        }
        let end = start + code.len() as u32;
        while (start..end).contains(&core.state.eip) {
            core.step_instruction(bus)?;
        }
        Ok(())
    }
}
