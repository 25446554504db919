//! Serializable CPU state.
//!
//! A snapshot holds the architectural registers plus the little bit of
//! between-instruction state the core carries (pending NMI, interrupt shadow,
//! single-step, prefetch queue). Lazy flags are materialized into `eflags`.
//! Translated code, the MAC and TLB contents are never saved; restoring
//! flushes them.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::flags::FlagState;
use crate::interp::prefetch::PrefetchQueue;
use crate::interrupts::PendingEvents;
use crate::state::{FpuState, SegmentCache, TableReg};
use crate::CpuCore;

/// Bumped whenever a field is added, removed or changes meaning.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuSnapshot {
    pub version: u32,
    pub model: String,
    pub gpr: [u32; 8],
    pub eip: u32,
    pub eflags: u32,
    pub segs: [SegmentCache; 6],
    pub gdtr: TableReg,
    pub idtr: TableReg,
    pub ldtr: SegmentCache,
    pub tr: SegmentCache,
    pub cr0: u32,
    pub cr2: u32,
    pub cr3: u32,
    pub cr4: u32,
    pub dr: [u32; 8],
    pub fpu: FpuState,
    pub tsc: u64,
    pub cycles: i64,
    pub halted: bool,
    pub pending: PendingEvents,
    pub prefetch: PrefetchQueue,
}

impl CpuCore {
    pub fn snapshot(&self) -> CpuSnapshot {
        let s = &self.state;
        CpuSnapshot {
            version: SNAPSHOT_VERSION,
            model: self.model().name.to_owned(),
            gpr: s.gpr,
            eip: s.eip,
            eflags: s.flags.value(),
            segs: s.segs,
            gdtr: s.gdtr,
            idtr: s.idtr,
            ldtr: s.ldtr,
            tr: s.tr,
            cr0: s.cr0,
            cr2: s.cr2,
            cr3: s.cr3,
            cr4: s.cr4,
            dr: s.dr,
            fpu: s.fpu,
            tsc: s.tsc,
            cycles: s.cycles,
            halted: s.halted,
            pending: self.pending,
            prefetch: self.prefetch,
        }
    }

    /// Load `snap` into this core. The snapshot must come from the same CPU
    /// model; the core is left untouched on error.
    pub fn restore(&mut self, snap: &CpuSnapshot) -> Result<(), CoreError> {
        if snap.version != SNAPSHOT_VERSION {
            return Err(CoreError::SnapshotVersion {
                expected: SNAPSHOT_VERSION,
                found: snap.version,
            });
        }
        if snap.model != self.model().name {
            return Err(CoreError::SnapshotModel {
                expected: self.model().name,
                found: snap.model.clone(),
            });
        }
        let s = &mut self.state;
        s.gpr = snap.gpr;
        s.eip = snap.eip;
        s.flags = FlagState::new(snap.eflags);
        s.segs = snap.segs;
        s.gdtr = snap.gdtr;
        s.idtr = snap.idtr;
        s.ldtr = snap.ldtr;
        s.tr = snap.tr;
        s.cr0 = snap.cr0;
        s.cr2 = snap.cr2;
        s.cr3 = snap.cr3;
        s.cr4 = snap.cr4;
        s.dr = snap.dr;
        s.fpu = snap.fpu;
        s.tsc = snap.tsc;
        s.cycles = snap.cycles;
        s.halted = snap.halted;
        self.pending = snap.pending;
        self.prefetch = snap.prefetch;
        self.fetch.clear();
        self.switched_task = false;

        self.mmu.set_cr0(snap.cr0);
        self.mmu.set_cr3(snap.cr3);
        self.mmu.set_cr4(snap.cr4);
        self.mmu.flush();
        self.flush_code_cache("restore");
        tracing::debug!(
            model = self.model().name,
            eip = format_args!("{:#010x}", snap.eip),
            "cpu state restored"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{SegReg, EAX};
    use crate::test_util::protected_core;

    #[test]
    fn restore_reproduces_state() {
        let (mut core, _bus) = protected_core("Pentium");
        core.state.gpr[EAX] = 0xDEAD_BEEF;
        core.state.eip = 0x1234;
        core.state.fpu.top = 5;
        core.pending.interrupt_shadow = true;
        let snap = core.snapshot();

        let mut other = CpuCore::with_model("Pentium").unwrap();
        other.restore(&snap).unwrap();
        assert_eq!(other.state.gpr, core.state.gpr);
        assert_eq!(other.state.flags.value(), core.state.flags.value());
        assert_eq!(other.pending, core.pending);
        assert!(other.state.protected());
        assert_eq!(other.state.seg(SegReg::Cs).selector, 0x08);
        assert_eq!(other.snapshot(), snap);
    }

    #[test]
    fn restore_flushes_translated_code() {
        let (mut core, _bus) = protected_core("486DX");
        let snap = core.snapshot();
        core.register_code(0x3000, 16);
        let epoch = core.code_epoch();
        core.restore(&snap).unwrap();
        assert!(!core.mmu.is_code_frame(3));
        assert_eq!(core.code_pages().code_pages(), 0);
        assert!(core.code_epoch() > epoch);
    }

    #[test]
    fn model_mismatch_is_rejected() {
        let (core, _bus) = protected_core("486DX");
        let snap = core.snapshot();
        let mut other = CpuCore::with_model("Pentium").unwrap();
        let before = other.state.clone();
        let err = other.restore(&snap).unwrap_err();
        assert!(matches!(err, CoreError::SnapshotModel { found, .. } if found == "486DX"));
        assert_eq!(other.state, before);
    }
}
