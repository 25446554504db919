//! Recompiler support: the block cache, the dirty-code bitmaps and the backend
//! interface. Backends live outside this crate (`retro86-jit`); the
//! [`runtime::ReplayBackend`] here re-runs the interpreter and serves as the
//! reference.

pub mod block;
pub mod cache;
pub mod dirty;
pub mod emitter;
pub mod runtime;

use bitflags::bitflags;

use crate::flags::FLAG_VM;
use crate::state::{CpuState, SegReg, CR0_PE, CR0_PG};

bitflags! {
    /// CPU status bits a block was translated under. A block only runs when the
    /// current status is identical.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct CpuStatus: u32 {
        const CODE32 = 1 << 0;
        const STACK32 = 1 << 1;
        const PROTECTED = 1 << 2;
        const V86 = 1 << 3;
        /// DS, ES and SS are flat 4 GB segments at base 0.
        const FLAT_SEGS = 1 << 4;
        const PAGING = 1 << 5;
    }
}

impl CpuStatus {
    pub fn current(state: &CpuState) -> Self {
        let mut s = Self::empty();
        s.set(Self::CODE32, state.code32());
        s.set(Self::STACK32, state.stack32());
        s.set(Self::PROTECTED, state.cr0 & CR0_PE != 0);
        s.set(Self::V86, state.flags.get(FLAG_VM));
        s.set(
            Self::FLAT_SEGS,
            [SegReg::Ds, SegReg::Es, SegReg::Ss]
                .iter()
                .all(|&r| state.seg(r).is_flat()),
        );
        s.set(Self::PAGING, state.cr0 & CR0_PG != 0);
        s
    }
}
