//! Segment register loads and descriptor-table access.
//!
//! All loads go through [`load_segment`] (or [`load_protected`] for callers that
//! need the cache entry before committing it). A failed load never touches the
//! live segment register.

pub mod descriptor;
pub mod far;
pub mod task;

use retro86_mmu::MemoryBus;

use crate::exception::Fault;
use crate::state::{SegReg, SegmentCache, ACCESS_ACCESSED};
use crate::CpuCore;

use self::descriptor::{Descriptor, SystemType};

/// Who is loading the segment; selects the fault used for descriptor problems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Instruction,
    TaskSwitch,
}

impl Origin {
    fn fault(self, selector: u16) -> Fault {
        match self {
            Origin::Instruction => Fault::gp_sel(selector),
            Origin::TaskSwitch => Fault::ts(selector),
        }
    }
}

/// A descriptor together with the linear address it was read from.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorRef {
    pub desc: Descriptor,
    pub addr: u32,
}

/// Read the descriptor named by `selector` from the GDT or LDT.
///
/// Returns `None` when the selector is outside its table (or names the LDT
/// while none is loaded). Null selectors are the caller's problem.
pub fn read_descriptor<B: MemoryBus + ?Sized>(
    core: &mut CpuCore,
    bus: &mut B,
    selector: u16,
) -> Result<Option<DescriptorRef>, Fault> {
    let (base, limit) = if selector & 4 != 0 {
        let ldtr = core.state.ldtr;
        if !ldtr.is_usable() {
            return Ok(None);
        }
        (ldtr.base, ldtr.limit)
    } else {
        (core.state.gdtr.base, u32::from(core.state.gdtr.limit))
    };
    let index = u32::from(selector & 0xFFF8);
    if index + 7 > limit {
        return Ok(None);
    }
    let addr = base.wrapping_add(index);
    let lo = core.read_system(bus, addr, 4)?;
    let hi = core.read_system(bus, addr.wrapping_add(4), 4)?;
    Ok(Some(DescriptorRef {
        desc: Descriptor::new(u64::from(lo) | (u64::from(hi) << 32)),
        addr,
    }))
}

/// Set the accessed bit of a code/data descriptor in memory.
pub fn set_accessed<B: MemoryBus + ?Sized>(
    core: &mut CpuCore,
    bus: &mut B,
    d: &mut DescriptorRef,
) -> Result<(), Fault> {
    if d.desc.is_system() || d.desc.accessed() {
        return Ok(());
    }
    let access = d.desc.access() | ACCESS_ACCESSED;
    core.write_system(bus, d.addr.wrapping_add(5), 1, u32::from(access))?;
    d.desc.raw |= 1 << 40;
    Ok(())
}

/// Flip the busy bit of a TSS descriptor.
pub fn set_busy<B: MemoryBus + ?Sized>(
    core: &mut CpuCore,
    bus: &mut B,
    selector: u16,
    busy: bool,
) -> Result<(), Fault> {
    let Some(d) = read_descriptor(core, bus, selector)? else {
        return Err(Fault::ts(selector));
    };
    let access = if busy {
        d.desc.access() | 0x02
    } else {
        d.desc.access() & !0x02
    };
    core.write_system(bus, d.addr.wrapping_add(5), 1, u32::from(access))
}

/// Validate a protected-mode load of `selector` into `seg` at privilege `cpl`
/// and return the cache entry it would produce. Sets the accessed bit.
pub fn load_protected<B: MemoryBus + ?Sized>(
    core: &mut CpuCore,
    bus: &mut B,
    seg: SegReg,
    selector: u16,
    cpl: u8,
    origin: Origin,
) -> Result<SegmentCache, Fault> {
    let rpl = (selector & 3) as u8;
    if selector & 0xFFFC == 0 {
        return match seg {
            SegReg::Ss | SegReg::Cs => Err(origin.fault(0)),
            _ => Ok(SegmentCache::null(selector)),
        };
    }
    let Some(mut d) = read_descriptor(core, bus, selector)? else {
        return Err(origin.fault(selector));
    };
    let desc = d.desc;
    match seg {
        SegReg::Ss => {
            if rpl != cpl || desc.dpl() != cpl || !desc.writable() {
                return Err(origin.fault(selector));
            }
            if !desc.present() {
                return Err(Fault::ss(selector));
            }
        }
        SegReg::Cs => {
            if !desc.is_code() {
                return Err(origin.fault(selector));
            }
            let ok = if desc.conforming() {
                desc.dpl() <= rpl
            } else {
                desc.dpl() == rpl
            };
            if !ok {
                return Err(origin.fault(selector));
            }
            if !desc.present() {
                return Err(Fault::np(selector));
            }
        }
        _ => {
            if !desc.readable() {
                return Err(origin.fault(selector));
            }
            if !desc.conforming() && cpl.max(rpl) > desc.dpl() {
                return Err(origin.fault(selector));
            }
            if !desc.present() {
                return Err(Fault::np(selector));
            }
        }
    }
    set_accessed(core, bus, &mut d)?;
    Ok(SegmentCache::from_descriptor(selector, &d.desc))
}

/// Load a segment register the way `MOV Sreg`, `POP Sreg` and `Lxx` do in the
/// current mode.
pub fn load_segment<B: MemoryBus + ?Sized>(
    core: &mut CpuCore,
    bus: &mut B,
    seg: SegReg,
    selector: u16,
) -> Result<(), Fault> {
    if !core.state.protected() {
        core.state.seg_mut(seg).reload_real(selector);
        return Ok(());
    }
    if core.state.v86() {
        *core.state.seg_mut(seg) = SegmentCache::v86(selector, seg == SegReg::Cs);
        return Ok(());
    }
    let cpl = core.state.cpl();
    let cache = load_protected(core, bus, seg, selector, cpl, Origin::Instruction)?;
    *core.state.seg_mut(seg) = cache;
    Ok(())
}

/// Load LDTR from a GDT selector (LLDT and task switches).
pub fn load_ldt<B: MemoryBus + ?Sized>(
    core: &mut CpuCore,
    bus: &mut B,
    selector: u16,
    origin: Origin,
) -> Result<(), Fault> {
    if selector & 0xFFFC == 0 {
        let mut ldtr = SegmentCache::null(selector);
        ldtr.access = 0x82;
        core.state.ldtr = ldtr;
        return Ok(());
    }
    if selector & 4 != 0 {
        return Err(origin.fault(selector));
    }
    let Some(d) = read_descriptor(core, bus, selector)? else {
        return Err(origin.fault(selector));
    };
    if d.desc.system_type() != Some(SystemType::Ldt) {
        return Err(origin.fault(selector));
    }
    if !d.desc.present() {
        return Err(match origin {
            Origin::Instruction => Fault::np(selector),
            Origin::TaskSwitch => Fault::ts(selector),
        });
    }
    core.state.ldtr = SegmentCache::from_descriptor(selector, &d.desc);
    Ok(())
}

/// After a privilege drop, data segments the new CPL may not use are nulled.
pub(crate) fn null_inaccessible_data_segments(core: &mut CpuCore) {
    let cpl = core.state.cpl();
    for seg in [SegReg::Es, SegReg::Ds, SegReg::Fs, SegReg::Gs] {
        let cache = core.state.seg(seg);
        if !cache.is_usable() {
            continue;
        }
        if !cache.conforming() && cache.dpl() < cpl {
            *core.state.seg_mut(seg) = SegmentCache::null(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::FlatTestBus;
    use crate::state::{TableReg, CR0_PE};
    use crate::test_util::protected_core;

    const GDT: u32 = 0x1000;

    fn setup(descs: &[(u16, Descriptor)]) -> (CpuCore, FlatTestBus) {
        let (mut core, mut bus) = protected_core("386DX");
        for &(sel, d) in descs {
            bus.load(GDT + u32::from(sel & 0xFFF8), &d.raw.to_le_bytes());
        }
        core.state.gdtr = TableReg {
            base: GDT,
            limit: 0x7F,
        };
        (core, bus)
    }

    #[test]
    fn null_selector_rules() {
        let (mut core, mut bus) = setup(&[]);
        load_segment(&mut core, &mut bus, SegReg::Ds, 0).unwrap();
        assert!(!core.state.seg(SegReg::Ds).is_usable());

        let before = *core.state.seg(SegReg::Ss);
        let err = load_segment(&mut core, &mut bus, SegReg::Ss, 0).unwrap_err();
        assert_eq!(err, Fault::gp0());
        assert_eq!(*core.state.seg(SegReg::Ss), before);
    }

    #[test]
    fn out_of_limit_selector_faults_and_keeps_cache() {
        let (mut core, mut bus) = setup(&[]);
        assert!(core.state.cr0 & CR0_PE != 0);
        let before = *core.state.seg(SegReg::Es);
        let err = load_segment(&mut core, &mut bus, SegReg::Es, 0x0080).unwrap_err();
        assert_eq!(err, Fault::gp(0x0080));
        assert_eq!(*core.state.seg(SegReg::Es), before);
    }

    #[test]
    fn data_load_checks_privilege_and_sets_accessed() {
        let (mut core, mut bus) = setup(&[(0x20, Descriptor::segment(0x5000, 0xFFFF, 0x92, 0))]);
        load_segment(&mut core, &mut bus, SegReg::Ds, 0x20).unwrap();
        assert_eq!(core.state.seg(SegReg::Ds).base, 0x5000);
        assert_eq!(bus.slice(GDT + 0x20 + 5, 1)[0], 0x93);

        // RPL 3 against a DPL 0 segment.
        let err = load_segment(&mut core, &mut bus, SegReg::Ds, 0x23).unwrap_err();
        assert_eq!(err, Fault::gp(0x20));
    }

    #[test]
    fn not_present_stack_segment_raises_ss() {
        let (mut core, mut bus) = setup(&[(0x28, Descriptor::segment(0, 0xFFFF, 0x12, 0))]);
        let err = load_segment(&mut core, &mut bus, SegReg::Ss, 0x28).unwrap_err();
        assert_eq!(err, Fault::ss(0x28));
    }
}
