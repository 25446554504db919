//! System instructions: port I/O, HLT, flag control, descriptor-table and
//! task registers, control/debug registers, and the Pentium model-specific
//! set (CPUID, RDTSC, RDMSR/WRMSR).

use tracing::{debug, warn};

use crate::exception::Fault;
use crate::flags::{Width, FLAG_CF, FLAG_DF, FLAG_IF, FLAG_ZF};
use crate::model::{CpuClass, Features};
use crate::platform::Platform;
use crate::segmentation::descriptor::SystemType;
use crate::segmentation::task::io_permitted;
use crate::segmentation::{load_ldt, read_descriptor, set_busy, Origin};
use crate::state::{
    SegmentCache, TableReg, CR0_CD, CR0_ET, CR0_NW, CR0_PE, CR0_PG, CR0_TS, CR4_TSD, EAX, EBX, ECX,
    EDX,
};
use crate::CpuCore;

use super::decode::{Ea, ModRm};
use super::{undefined_form, Flow, Insn};

/// Time-stamp counter MSR.
pub const MSR_TSC: u32 = 0x10;

/// CR4 bits the core accepts: VME, PVI, TSD, DE, PSE, MCE, PGE, PCE.
const CR4_SUPPORTED: u32 = 0x1DF;

/// Descriptor-table and LDT/TR instructions only exist outside real and V86 mode.
fn require_protected(core: &CpuCore) -> Result<(), Fault> {
    if !core.state.protected() || core.state.v86() {
        return Err(Fault::ud());
    }
    Ok(())
}

/// CLI/STI/IN/OUT privilege: CPL must not exceed IOPL.
fn iopl_sensitive(core: &CpuCore) -> bool {
    let st = &core.state;
    if !st.protected() {
        return true;
    }
    if st.v86() {
        return st.iopl() == 3;
    }
    st.cpl() <= st.iopl()
}

/// 63: ARPL r/m16, r16.
pub(crate) fn arpl(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    require_protected(core)?;
    let (reg, ea) = core.modrm(bus, insn)?;
    let dst = core.read_ea(bus, ea, Width::Word)?;
    let src = u32::from(core.state.reg16(reg));
    let adjust = dst & 3 < src & 3;
    if adjust {
        core.write_ea(bus, ea, Width::Word, (dst & !3) | (src & 3))?;
    }
    core.state.flags.set(FLAG_ZF, adjust);
    core.charge_ea(ea.is_mem(), true);
    Ok(Flow::Continue)
}

/// E4-E7 and EC-EF: IN and OUT with an immediate or DX port.
pub(crate) fn in_out(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let port = if insn.opcode & 8 == 0 {
        u16::from(core.fetch_u8(bus)?)
    } else {
        core.state.gpr[EDX] as u16
    };
    let w = insn.width();
    let size = w.bytes() as u8;
    if !io_permitted(core, bus, port, size)? {
        return Err(Fault::gp0());
    }
    core.charge_ea(true, false);
    if insn.opcode & 2 == 0 {
        let v = bus.io_read(port, size);
        core.state.set_reg(w, EAX as u8, v);
        Ok(Flow::Continue)
    } else {
        let v = core.state.reg(w, EAX as u8);
        bus.io_write(port, size, v);
        // The device may have raised an interrupt.
        Ok(Flow::EndBlock)
    }
}

/// F4: HLT.
pub(crate) fn hlt(
    core: &mut CpuCore,
    _bus: &mut dyn Platform,
    _insn: &mut Insn,
) -> Result<Flow, Fault> {
    core.require_cpl0()?;
    core.state.halted = true;
    core.charge_ea(false, false);
    Ok(Flow::EndBlock)
}

/// F5, F8-FD: CMC, CLC, STC, CLI, STI, CLD, STD.
pub(crate) fn flag_op(
    core: &mut CpuCore,
    _bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let f = &mut core.state.flags;
    let flow = match insn.opcode {
        0xF5 => {
            let c = f.carry();
            f.set(FLAG_CF, !c);
            Flow::Continue
        }
        0xF8 | 0xF9 => {
            f.set(FLAG_CF, insn.opcode & 1 != 0);
            Flow::Continue
        }
        0xFC | 0xFD => {
            f.set(FLAG_DF, insn.opcode & 1 != 0);
            Flow::Continue
        }
        op => {
            if !iopl_sensitive(core) {
                return Err(Fault::gp0());
            }
            let f = &mut core.state.flags;
            if op == 0xFB {
                // STI takes effect after the next instruction.
                if !f.get(FLAG_IF) {
                    core.pending.interrupt_shadow = true;
                }
                f.set(FLAG_IF, true);
            } else {
                f.set(FLAG_IF, false);
            }
            Flow::EndBlock
        }
    };
    core.charge_ea(false, false);
    Ok(flow)
}

/// Selector-valued store of SLDT/STR: register forms take the operand size,
/// memory forms always store a word.
fn store_selector(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &Insn,
    ea: Ea,
    sel: u16,
) -> Result<(), Fault> {
    let w = match ea {
        Ea::Reg(_) => insn.opw(),
        Ea::Mem { .. } => Width::Word,
    };
    core.write_ea(bus, ea, w, u32::from(sel))
}

/// Whether a code/data descriptor is visible at the current CPL with `rpl`.
fn visible(core: &CpuCore, desc_dpl: u8, conforming_code: bool, rpl: u8) -> bool {
    conforming_code || (desc_dpl >= core.state.cpl() && desc_dpl >= rpl)
}

/// VERR / VERW.
fn verify(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    sel: u16,
    write: bool,
) -> Result<bool, Fault> {
    if sel & 0xFFFC == 0 {
        return Ok(false);
    }
    let Some(d) = read_descriptor(core, bus, sel)? else {
        return Ok(false);
    };
    let desc = d.desc;
    if desc.is_system() {
        return Ok(false);
    }
    let conforming_code = desc.is_code() && desc.conforming();
    if !visible(core, desc.dpl(), conforming_code, (sel & 3) as u8) {
        return Ok(false);
    }
    Ok(if write {
        desc.is_data() && desc.writable()
    } else {
        !desc.is_code() || desc.readable()
    })
}

/// LTR: load the task register from an available TSS descriptor and mark it busy.
fn load_task_register(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    sel: u16,
) -> Result<(), Fault> {
    if sel & 0xFFFC == 0 {
        return Err(Fault::gp0());
    }
    if sel & 4 != 0 {
        return Err(Fault::gp_sel(sel));
    }
    let Some(d) = read_descriptor(core, bus, sel)? else {
        return Err(Fault::gp_sel(sel));
    };
    match d.desc.system_type() {
        Some(t) if t.is_tss() && !t.is_tss_busy() => {}
        _ => return Err(Fault::gp_sel(sel)),
    }
    if !d.desc.present() {
        return Err(Fault::np(sel));
    }
    set_busy(core, bus, sel, true)?;
    let mut tr = SegmentCache::from_descriptor(sel, &d.desc);
    tr.access |= 0x02;
    core.state.tr = tr;
    debug!(selector = sel, base = tr.base, "task register loaded");
    Ok(())
}

/// 0F 00: SLDT, STR, LLDT, LTR, VERR, VERW.
pub(crate) fn group6(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    require_protected(core)?;
    let (op, ea) = core.modrm(bus, insn)?;
    match op {
        0 => {
            let sel = core.state.ldtr.selector;
            store_selector(core, bus, insn, ea, sel)?;
        }
        1 => {
            let sel = core.state.tr.selector;
            store_selector(core, bus, insn, ea, sel)?;
        }
        2 | 3 => {
            core.require_cpl0()?;
            let sel = core.read_ea(bus, ea, Width::Word)? as u16;
            if op == 2 {
                load_ldt(core, bus, sel, Origin::Instruction)?;
            } else {
                load_task_register(core, bus, sel)?;
            }
            let t = core.model().timings.seg_load;
            core.charge(i64::from(t));
            return Ok(Flow::Continue);
        }
        4 | 5 => {
            let sel = core.read_ea(bus, ea, Width::Word)? as u16;
            let ok = verify(core, bus, sel, op == 5)?;
            core.state.flags.set(FLAG_ZF, ok);
        }
        _ => return Err(Fault::ud()),
    }
    core.charge_ea(ea.is_mem(), false);
    Ok(Flow::Continue)
}

/// Base stored by SGDT/SIDT: 286 cores return 0xFF in the top byte, 16-bit
/// operand size stores 24 bits.
fn stored_table_base(core: &CpuCore, base: u32, op32: bool) -> u32 {
    if core.model().class == CpuClass::I286 {
        base | 0xFF00_0000
    } else if op32 {
        base
    } else {
        base & 0x00FF_FFFF
    }
}

/// 0F 01: SGDT, SIDT, LGDT, LIDT, SMSW, LMSW, INVLPG.
pub(crate) fn group7(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let (op, ea) = core.modrm(bus, insn)?;
    match op {
        0 | 1 => {
            let (seg, off) = ea.mem()?;
            let table = if op == 0 { core.state.gdtr } else { core.state.idtr };
            let base_off = CpuCore::ea_offset(insn, off, 2);
            core.probe_write(bus, seg, base_off, Width::Dword)?;
            core.write_mem(bus, seg, off, Width::Word, u32::from(table.limit))?;
            let base = stored_table_base(core, table.base, insn.op32);
            core.write_mem(bus, seg, base_off, Width::Dword, base)?;
        }
        2 | 3 => {
            let (seg, off) = ea.mem()?;
            core.require_cpl0()?;
            let limit = core.read_mem(bus, seg, off, Width::Word)? as u16;
            let base_off = CpuCore::ea_offset(insn, off, 2);
            let mut base = core.read_mem(bus, seg, base_off, Width::Dword)?;
            if !insn.op32 {
                base &= 0x00FF_FFFF;
            }
            let reg = TableReg { base, limit };
            if op == 2 {
                core.state.gdtr = reg;
            } else {
                core.state.idtr = reg;
            }
        }
        4 => {
            let mut msw = core.state.cr0;
            if core.model().class == CpuClass::I286 {
                msw |= 0xFFF0;
            }
            let w = match ea {
                Ea::Reg(_) => insn.opw(),
                Ea::Mem { .. } => Width::Word,
            };
            core.write_ea(bus, ea, w, msw & w.mask())?;
        }
        6 => {
            core.require_cpl0()?;
            let v = core.read_ea(bus, ea, Width::Word)?;
            // LMSW sets PE but can never clear it.
            let cr0 = core.state.cr0;
            let new = (cr0 & !0xF) | (v & 0xF) | (cr0 & CR0_PE);
            core.set_cr0(new);
            core.charge_ea(ea.is_mem(), false);
            return Ok(Flow::EndBlock);
        }
        7 => {
            core.require_class(CpuClass::I486)?;
            let (seg, off) = ea.mem()?;
            core.require_cpl0()?;
            let linear = core.state.seg(seg).base.wrapping_add(off);
            core.mmu.invlpg(linear);
        }
        _ => return undefined_form(core),
    }
    core.charge_ea(ea.is_mem(), false);
    Ok(Flow::Continue)
}

/// 0F 02 / 0F 03: LAR and LSL.
pub(crate) fn lar_lsl(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    require_protected(core)?;
    let lsl = insn.opcode == 0x03;
    let (reg, ea) = core.modrm(bus, insn)?;
    let sel = core.read_ea(bus, ea, Width::Word)? as u16;
    core.charge_ea(ea.is_mem(), false);

    let found = if sel & 0xFFFC == 0 {
        None
    } else {
        read_descriptor(core, bus, sel)?
    };
    let Some(d) = found else {
        core.state.flags.set(FLAG_ZF, false);
        return Ok(Flow::Continue);
    };
    let desc = d.desc;
    let ok = if desc.is_system() {
        let allowed = match desc.system_type() {
            Some(SystemType::CallGate16 | SystemType::CallGate32 | SystemType::TaskGate) => !lsl,
            Some(t) => t.is_tss() || t == SystemType::Ldt,
            None => false,
        };
        allowed && visible(core, desc.dpl(), false, (sel & 3) as u8)
    } else {
        let conforming_code = desc.is_code() && desc.conforming();
        visible(core, desc.dpl(), conforming_code, (sel & 3) as u8)
    };
    if ok {
        let w = insn.opw();
        let v = if lsl {
            desc.effective_limit()
        } else {
            ((desc.raw >> 32) as u32) & 0x00F0_FF00
        };
        core.state.set_reg(w, reg, v);
    }
    core.state.flags.set(FLAG_ZF, ok);
    Ok(Flow::Continue)
}

/// 0F 06: CLTS.
pub(crate) fn clts(
    core: &mut CpuCore,
    _bus: &mut dyn Platform,
    _insn: &mut Insn,
) -> Result<Flow, Fault> {
    core.require_cpl0()?;
    core.set_cr0(core.state.cr0 & !CR0_TS);
    core.charge_ea(false, false);
    Ok(Flow::Continue)
}

/// 0F 08 / 0F 09: INVD and WBINVD. There is no cache model, so only the
/// privilege check remains.
pub(crate) fn invd(
    core: &mut CpuCore,
    _bus: &mut dyn Platform,
    _insn: &mut Insn,
) -> Result<Flow, Fault> {
    core.require_cpl0()?;
    let t = core.model().timings.mr;
    core.charge(i64::from(t) * 4);
    Ok(Flow::Continue)
}

/// 0F 0B: UD2.
pub(crate) fn ud2(
    _core: &mut CpuCore,
    _bus: &mut dyn Platform,
    _insn: &mut Insn,
) -> Result<Flow, Fault> {
    Err(Fault::ud())
}

fn has_cr4(core: &CpuCore) -> bool {
    core.model().at_least(CpuClass::Pentium)
}

fn read_cr(core: &CpuCore, n: u8) -> Result<u32, Fault> {
    match n {
        0 => Ok(core.state.cr0),
        2 => Ok(core.state.cr2),
        3 => Ok(core.state.cr3),
        4 if has_cr4(core) => Ok(core.state.cr4),
        _ => Err(Fault::ud()),
    }
}

fn write_cr(core: &mut CpuCore, n: u8, v: u32) -> Result<(), Fault> {
    match n {
        0 => {
            let mut v = v;
            if v & CR0_PG != 0 && v & CR0_PE == 0 {
                return Err(Fault::gp0());
            }
            if core.model().at_least(CpuClass::I486) {
                if v & CR0_NW != 0 && v & CR0_CD == 0 {
                    return Err(Fault::gp0());
                }
                v |= CR0_ET;
            }
            core.set_cr0(v);
        }
        2 => core.state.cr2 = v,
        3 => core.set_cr3(v),
        4 if has_cr4(core) => {
            if v & !CR4_SUPPORTED != 0 {
                return Err(Fault::gp0());
            }
            core.set_cr4(v);
        }
        _ => return Err(Fault::ud()),
    }
    Ok(())
}

/// 0F 20-23: MOV to and from control and debug registers. The ModR/M byte
/// always names a register regardless of its mod field.
pub(crate) fn mov_cr_dr(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let m = ModRm::new(core.fetch_u8(bus)?);
    let debug_reg = insn.opcode & 1 != 0;
    let to_special = insn.opcode & 2 != 0;
    if !debug_reg && matches!(m.reg, 1 | 5 | 6 | 7) {
        return Err(Fault::ud());
    }
    core.require_cpl0()?;
    if debug_reg {
        // DR4/DR5 alias DR6/DR7.
        let idx = match m.reg {
            4 | 5 => usize::from(m.reg) + 2,
            r => usize::from(r),
        };
        if to_special {
            core.state.dr[idx] = core.state.reg32(m.rm);
        } else {
            let v = core.state.dr[idx];
            core.state.set_reg32(m.rm, v);
        }
    } else if to_special {
        let v = core.state.reg32(m.rm);
        write_cr(core, m.reg, v)?;
    } else {
        let v = read_cr(core, m.reg)?;
        core.state.set_reg32(m.rm, v);
    }
    let t = core.model().timings.seg_load;
    core.charge(i64::from(t));
    Ok(if to_special {
        Flow::EndBlock
    } else {
        Flow::Continue
    })
}

/// CPUID leaf 1 EDX.
fn feature_bits(core: &CpuCore) -> u32 {
    let m = core.model();
    let mut edx = 0;
    for (feature, bit) in [
        (Features::FPU, 0),
        (Features::PSE, 3),
        (Features::TSC, 4),
        (Features::MSR, 5),
        (Features::CX8, 8),
        (Features::CMOV, 15),
    ] {
        if m.has(feature) {
            edx |= 1 << bit;
        }
    }
    edx
}

/// 0F A2: CPUID.
pub(crate) fn cpuid(
    core: &mut CpuCore,
    _bus: &mut dyn Platform,
    _insn: &mut Insn,
) -> Result<Flow, Fault> {
    let leaf = core.state.gpr[EAX];
    let regs = match leaf {
        0 => {
            let v = core.model().vendor;
            let word = |i: usize| u32::from_le_bytes([v[i], v[i + 1], v[i + 2], v[i + 3]]);
            [1, word(0), word(8), word(4)]
        }
        1 => [core.model().cpuid_signature, 0, 0, feature_bits(core)],
        _ => [0; 4],
    };
    let [a, b, c, d] = regs;
    core.state.gpr[EAX] = a;
    core.state.gpr[EBX] = b;
    core.state.gpr[ECX] = c;
    core.state.gpr[EDX] = d;
    let t = core.model().timings.int;
    core.charge(i64::from(t));
    Ok(Flow::Continue)
}

/// 0F 31: RDTSC.
pub(crate) fn rdtsc(
    core: &mut CpuCore,
    _bus: &mut dyn Platform,
    _insn: &mut Insn,
) -> Result<Flow, Fault> {
    if core.state.cr4 & CR4_TSD != 0 {
        core.require_cpl0()?;
    }
    let tsc = core.state.tsc;
    core.state.gpr[EAX] = tsc as u32;
    core.state.gpr[EDX] = (tsc >> 32) as u32;
    core.charge_ea(false, false);
    Ok(Flow::Continue)
}

/// 0F 32: RDMSR. Only the TSC is modelled; other MSRs read as zero.
pub(crate) fn rdmsr(
    core: &mut CpuCore,
    _bus: &mut dyn Platform,
    _insn: &mut Insn,
) -> Result<Flow, Fault> {
    core.require_cpl0()?;
    let msr = core.state.gpr[ECX];
    let v = if msr == MSR_TSC {
        core.state.tsc
    } else {
        warn!(msr = format_args!("{msr:#x}"), "read of unknown MSR");
        0
    };
    core.state.gpr[EAX] = v as u32;
    core.state.gpr[EDX] = (v >> 32) as u32;
    core.charge_ea(false, false);
    Ok(Flow::Continue)
}

/// 0F 30: WRMSR.
pub(crate) fn wrmsr(
    core: &mut CpuCore,
    _bus: &mut dyn Platform,
    _insn: &mut Insn,
) -> Result<Flow, Fault> {
    core.require_cpl0()?;
    let msr = core.state.gpr[ECX];
    let v = (u64::from(core.state.gpr[EDX]) << 32) | u64::from(core.state.gpr[EAX]);
    if msr == MSR_TSC {
        core.state.tsc = v;
    } else {
        warn!(msr = format_args!("{msr:#x}"), value = v, "write to unknown MSR ignored");
    }
    core.charge_ea(false, false);
    Ok(Flow::Continue)
}

#[cfg(test)]
mod tests {
    use crate::exception::Fault;
    use crate::flags::{FLAG_IF, FLAG_ZF};
    use crate::segmentation::descriptor::Descriptor;
    use crate::state::{CR0_PE, CR4_TSD, EAX, EBX, ECX, EDX};
    use crate::test_util::{enter_ring3, protected_core, real_core, run_bytes};

    #[test]
    fn hlt_is_privileged() {
        let (mut core, mut bus) = protected_core("386DX");
        run_bytes(&mut core, &mut bus, &[0xF4]).unwrap();
        assert!(core.state.halted);

        let (mut core, mut bus) = protected_core("386DX");
        enter_ring3(&mut core, &mut bus);
        let err = run_bytes(&mut core, &mut bus, &[0xF4]).unwrap_err();
        assert_eq!(err, Fault::gp0());
        assert!(!core.state.halted);
    }

    #[test]
    fn cli_at_ring3_without_iopl_faults() {
        let (mut core, mut bus) = protected_core("486DX");
        enter_ring3(&mut core, &mut bus);
        core.state.flags.set(FLAG_IF, true);
        let err = run_bytes(&mut core, &mut bus, &[0xFA]).unwrap_err();
        assert_eq!(err, Fault::gp0());
        assert!(core.state.flags.get(FLAG_IF));
    }

    #[test]
    fn sti_opens_interrupt_shadow_only_when_if_was_clear() {
        let (mut core, mut bus) = real_core("8086");
        run_bytes(&mut core, &mut bus, &[0xFB]).unwrap();
        assert!(core.state.flags.get(FLAG_IF));
        assert!(core.pending.interrupt_shadow);

        core.pending.interrupt_shadow = false;
        run_bytes(&mut core, &mut bus, &[0xFB]).unwrap();
        assert!(!core.pending.interrupt_shadow);
    }

    #[test]
    fn lgdt_sgdt_on_286_sets_top_byte() {
        let (mut core, mut bus) = real_core("80286");
        bus.load(0x3000, &[0x27, 0x00, 0x56, 0x34, 0x12, 0x78]);
        // LGDT [0x3000]; SGDT [0x3100]
        run_bytes(&mut core, &mut bus, &[0x0F, 0x01, 0x16, 0x00, 0x30]).unwrap();
        assert_eq!(core.state.gdtr.base, 0x12_3456);
        assert_eq!(core.state.gdtr.limit, 0x27);
        run_bytes(&mut core, &mut bus, &[0x0F, 0x01, 0x06, 0x00, 0x31]).unwrap();
        assert_eq!(bus.slice(0x3100, 6), &[0x27, 0x00, 0x56, 0x34, 0x12, 0xFF]);
    }

    #[test]
    fn lmsw_cannot_leave_protected_mode() {
        let (mut core, mut bus) = protected_core("80286");
        core.state.gpr[EAX] = 0;
        // LMSW AX
        run_bytes(&mut core, &mut bus, &[0x0F, 0x01, 0xF0]).unwrap();
        assert_ne!(core.state.cr0 & CR0_PE, 0);
    }

    #[test]
    fn mov_cr0_rejects_paging_without_protection() {
        let (mut core, mut bus) = real_core("386DX");
        core.state.gpr[EAX] = 0x8000_0000;
        let err = run_bytes(&mut core, &mut bus, &[0x0F, 0x22, 0xC0]).unwrap_err();
        assert_eq!(err, Fault::gp0());
        assert_eq!(core.state.cr0 & 0x8000_0000, 0);
    }

    #[test]
    fn cr4_needs_a_pentium() {
        let (mut core, mut bus) = protected_core("486DX");
        let err = run_bytes(&mut core, &mut bus, &[0x0F, 0x20, 0xE0]).unwrap_err();
        assert_eq!(err, Fault::ud());

        let (mut core, mut bus) = protected_core("Pentium");
        core.state.gpr[EAX] = 0x10;
        run_bytes(&mut core, &mut bus, &[0x0F, 0x22, 0xE0]).unwrap();
        assert_eq!(core.state.cr4, 0x10);
    }

    #[test]
    fn cpuid_reports_vendor_and_features() {
        let (mut core, mut bus) = protected_core("Pentium");
        core.state.gpr[EAX] = 0;
        run_bytes(&mut core, &mut bus, &[0x0F, 0xA2]).unwrap();
        let mut vendor = Vec::new();
        for r in [EBX, EDX, ECX] {
            vendor.extend_from_slice(&core.state.gpr[r].to_le_bytes());
        }
        assert_eq!(&vendor, b"GenuineIntel");

        core.state.gpr[EAX] = 1;
        run_bytes(&mut core, &mut bus, &[0x0F, 0xA2]).unwrap();
        assert_eq!(core.state.gpr[EAX], 0x0525);
        assert_ne!(core.state.gpr[EDX] & 1 << 4, 0);
        assert_eq!(core.state.gpr[EDX] & 1 << 15, 0);
    }

    #[test]
    fn rdtsc_honours_tsd_and_rdmsr_reads_tsc() {
        let (mut core, mut bus) = protected_core("Pentium");
        core.state.tsc = 0x1_2345_6789;
        core.state.gpr[ECX] = 0x10;
        run_bytes(&mut core, &mut bus, &[0x0F, 0x32]).unwrap();
        assert_eq!(core.state.gpr[EDX], 1);
        assert!(core.state.gpr[EAX] >= 0x2345_6789);

        core.state.cr4 |= CR4_TSD;
        enter_ring3(&mut core, &mut bus);
        let err = run_bytes(&mut core, &mut bus, &[0x0F, 0x31]).unwrap_err();
        assert_eq!(err, Fault::gp0());
    }

    #[test]
    fn ltr_marks_descriptor_busy() {
        let (mut core, mut bus) = protected_core("386DX");
        let tss = Descriptor::segment(0x7000, 0x67, 0x89, 0);
        bus.load(0x828, &tss.raw.to_le_bytes());
        core.state.gdtr.limit = 0x2F;
        core.state.gpr[EAX] = 0x28;
        run_bytes(&mut core, &mut bus, &[0x0F, 0x00, 0xD8]).unwrap();
        assert_eq!(core.state.tr.selector, 0x28);
        assert_eq!(core.state.tr.base, 0x7000);
        assert_eq!(bus.slice(0x82D, 1), &[0x8B]);

        // A busy TSS cannot be loaded again.
        let err = run_bytes(&mut core, &mut bus, &[0x0F, 0x00, 0xD8]).unwrap_err();
        assert_eq!(err, Fault::gp_sel(0x28));
    }

    #[test]
    fn lar_lsl_and_verify() {
        let (mut core, mut bus) = protected_core("386DX");
        core.state.gpr[EBX] = 0x10;
        // LSL EAX, EBX
        run_bytes(&mut core, &mut bus, &[0x0F, 0x03, 0xC3]).unwrap();
        assert!(core.state.flags.get(FLAG_ZF));
        assert_eq!(core.state.gpr[EAX], 0xFFFF_FFFF);
        // LAR EAX, EBX
        run_bytes(&mut core, &mut bus, &[0x0F, 0x02, 0xC3]).unwrap();
        assert_eq!(core.state.gpr[EAX], 0x00C0_9300);

        // VERW on the ring 0 code segment fails, VERR succeeds.
        core.state.gpr[EBX] = 0x08;
        run_bytes(&mut core, &mut bus, &[0x0F, 0x00, 0xEB]).unwrap();
        assert!(!core.state.flags.get(FLAG_ZF));
        run_bytes(&mut core, &mut bus, &[0x0F, 0x00, 0xE3]).unwrap();
        assert!(core.state.flags.get(FLAG_ZF));

        // Selectors past the GDT clear ZF without faulting.
        core.state.gpr[EBX] = 0x100;
        core.state.gpr[EAX] = 0x55;
        run_bytes(&mut core, &mut bus, &[0x0F, 0x03, 0xC3]).unwrap();
        assert!(!core.state.flags.get(FLAG_ZF));
        assert_eq!(core.state.gpr[EAX], 0x55);
    }

    #[test]
    fn group6_is_undefined_in_real_mode() {
        let (mut core, mut bus) = real_core("80286");
        let err = run_bytes(&mut core, &mut bus, &[0x0F, 0x00, 0xC0]).unwrap_err();
        assert_eq!(err, Fault::ud());
    }

    #[test]
    fn arpl_raises_rpl() {
        let (mut core, mut bus) = protected_core("80286");
        core.state.gpr[EAX] = 0x0010;
        core.state.gpr[EBX] = 0x0023;
        // ARPL AX, BX
        run_bytes(&mut core, &mut bus, &[0x63, 0xD8]).unwrap();
        assert_eq!(core.state.gpr[EAX] & 0xFFFF, 0x0013);
        assert!(core.state.flags.get(FLAG_ZF));
    }

    #[test]
    fn port_io_records_writes_and_checks_privilege() {
        let (mut core, mut bus) = real_core("8088");
        core.state.gpr[EAX] = 0x42;
        // OUT 0x80, AL
        run_bytes(&mut core, &mut bus, &[0xE6, 0x80]).unwrap();
        assert_eq!(bus.io_writes, vec![(0x80, 1, 0x42)]);
        bus.io_read_value = 0x1234;
        core.state.gpr[EDX] = 0x60;
        // IN AX, DX
        run_bytes(&mut core, &mut bus, &[0xED]).unwrap();
        assert_eq!(core.state.gpr[EAX] & 0xFFFF, 0x1234);

        let (mut core, mut bus) = protected_core("386DX");
        enter_ring3(&mut core, &mut bus);
        let err = run_bytes(&mut core, &mut bus, &[0xE4, 0x60]).unwrap_err();
        assert_eq!(err, Fault::gp0());
    }
}
