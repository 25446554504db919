//! Interrupt and exception delivery (IVT/IDT), double/triple fault escalation,
//! IRET, and the instruction-boundary event check.
//!
//! Architectural state lives in [`crate::state::CpuState`]; bookkeeping that is
//! not architecturally visible (NMI blocking, the STI/MOV SS shadow, a pending
//! single-step trap) lives in [`PendingEvents`].

use serde::{Deserialize, Serialize};

use retro86_mmu::MemoryBus;

use crate::exception::{should_double_fault, Exception, Fault};
use crate::flags::{
    ARITH_FLAGS, FLAG_AC, FLAG_DF, FLAG_ID, FLAG_IF, FLAG_IOPL_MASK, FLAG_NT, FLAG_RF, FLAG_TF,
    FLAG_VM,
};
use crate::mem::StackFrame;
use crate::model::CpuClass;
use crate::platform::Platform;
use crate::segmentation::descriptor::{Descriptor, SystemType};
use crate::segmentation::far::outer_stack;
use crate::segmentation::task::{load_inner_stack, SwitchReason, TaskSwitch};
use crate::segmentation::{null_inaccessible_data_segments, read_descriptor, set_accessed};
use crate::state::{SegReg, SegmentCache, ESP};
use crate::CpuCore;

/// Nested delivery attempts before giving up and resetting.
const MAX_DELIVERY_ATTEMPTS: u32 = 4;

/// Non-architectural event state carried between instructions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEvents {
    pub nmi_pending: bool,
    /// Set from NMI delivery until the next IRET.
    pub nmi_blocked: bool,
    /// Maskable interrupts are held off for one instruction (STI, MOV SS, POP SS).
    pub interrupt_shadow: bool,
    /// TF was set when the last instruction started.
    pub single_step: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptKind {
    /// INT n, INT3, INTO.
    Software,
    /// Hardware IRQ or NMI.
    External,
    /// CPU exception (including INT1/#DB traps).
    Exception,
}

fn idt_fault(vector: u8, ext: bool) -> u32 {
    u32::from(vector) * 8 + 2 + u32::from(ext)
}

/// Deliver `vector` through the IVT or IDT. The pushed return address is the
/// current EIP, so callers set it first (instruction start for faults, next
/// instruction for traps and software interrupts).
pub fn raise<B: MemoryBus + ?Sized>(
    core: &mut CpuCore,
    bus: &mut B,
    vector: u8,
    kind: InterruptKind,
    error_code: Option<u32>,
) -> Result<(), Fault> {
    core.stats.interrupts += 1;
    core.prefetch.flush();
    let cycles = i64::from(core.model().timings.int);
    core.charge(cycles);
    if !core.state.protected() {
        return raise_real(core, bus, vector);
    }
    raise_protected(core, bus, vector, kind, error_code)
}

fn raise_real<B: MemoryBus + ?Sized>(core: &mut CpuCore, bus: &mut B, vector: u8) -> Result<(), Fault> {
    let entry = u32::from(vector) * 4;
    if entry + 3 > u32::from(core.state.idtr.limit) {
        return Err(Fault::gp(u16::from(vector) * 8 + 2));
    }
    let base = core.state.idtr.base;
    let ip = core.read_system(bus, base + entry, 2)?;
    let cs = core.read_system(bus, base + entry + 2, 2)? as u16;

    let flags = core.state.flags.materialize();
    let mut frame = StackFrame::current(core);
    let old_cs = u32::from(core.state.seg(SegReg::Cs).selector);
    let old_ip = core.state.eip & 0xFFFF;
    frame.push(core, bus, flags & 0xFFFF, 2)?;
    frame.push(core, bus, old_cs, 2)?;
    frame.push(core, bus, old_ip, 2)?;
    frame.commit(core);

    core.state.seg_mut(SegReg::Cs).reload_real(cs);
    core.state.eip = ip;
    core.state.flags.set(FLAG_IF, false);
    core.state.flags.set(FLAG_TF, false);
    if core.model().at_least(CpuClass::I486) {
        core.state.flags.set(FLAG_AC, false);
    }
    Ok(())
}

fn raise_protected<B: MemoryBus + ?Sized>(
    core: &mut CpuCore,
    bus: &mut B,
    vector: u8,
    kind: InterruptKind,
    error_code: Option<u32>,
) -> Result<(), Fault> {
    let ext = kind == InterruptKind::External;
    let from_v86 = core.state.v86();
    if kind == InterruptKind::Software && from_v86 && core.state.iopl() < 3 {
        return Err(Fault::gp0());
    }

    let entry = u32::from(vector) * 8;
    if entry + 7 > u32::from(core.state.idtr.limit) {
        return Err(Fault::with_code(Exception::GeneralProtection, idt_fault(vector, ext)));
    }
    let base = core.state.idtr.base;
    let lo = core.read_system(bus, base + entry, 4)?;
    let hi = core.read_system(bus, base + entry + 4, 4)?;
    let gate = Descriptor::new(u64::from(lo) | (u64::from(hi) << 32));
    let gate_type = gate.system_type();
    let gate_ok = matches!(
        gate_type,
        Some(
            SystemType::InterruptGate16
                | SystemType::InterruptGate32
                | SystemType::TrapGate16
                | SystemType::TrapGate32
                | SystemType::TaskGate
        )
    );
    if !gate_ok {
        return Err(Fault::with_code(Exception::GeneralProtection, idt_fault(vector, ext)));
    }
    let cpl = core.state.cpl();
    if kind == InterruptKind::Software && gate.dpl() < cpl {
        return Err(Fault::with_code(Exception::GeneralProtection, idt_fault(vector, false)));
    }
    if !gate.present() {
        return Err(Fault::with_code(Exception::SegmentNotPresent, idt_fault(vector, ext)));
    }

    if gate_type == Some(SystemType::TaskGate) {
        let ts = TaskSwitch::new(core, bus, gate.gate_selector(), SwitchReason::Interrupt)
            .map_err(|f| f.external(ext))?;
        let eip = core.state.eip;
        return ts.execute(core, bus, eip, error_code);
    }

    let target_sel = gate.gate_selector();
    if target_sel & 0xFFFC == 0 {
        return Err(Fault::gp(0).external(ext));
    }
    let Some(mut target) = read_descriptor(core, bus, target_sel)? else {
        return Err(Fault::gp_sel(target_sel).external(ext));
    };
    let desc = target.desc;
    if !desc.is_code() || desc.dpl() > cpl {
        return Err(Fault::gp_sel(target_sel).external(ext));
    }
    if !desc.present() {
        return Err(Fault::np(target_sel).external(ext));
    }
    let inner = !desc.conforming() && desc.dpl() < cpl;
    if from_v86 && (!inner || desc.dpl() != 0) {
        return Err(Fault::gp_sel(target_sel).external(ext));
    }

    let gate32 = gate_type.is_some_and(|t| t.is_32());
    let w = if gate32 { 4 } else { 2 };
    let new_cpl = if inner { desc.dpl() } else { cpl };
    let offset = gate.gate_offset();
    let new_cs = SegmentCache::from_descriptor((target_sel & 0xFFFC) | u16::from(new_cpl), &desc);
    if !new_cs.contains(offset, 1) {
        return Err(Fault::gp0().external(ext));
    }

    let eflags = core.state.flags.materialize();
    let old_cs = u32::from(core.state.seg(SegReg::Cs).selector);
    let old_eip = core.state.eip;
    let mut frame = if inner {
        let mut frame = load_inner_stack(core, bus, new_cpl).map_err(|f| f.external(ext))?;
        if from_v86 {
            for seg in [SegReg::Gs, SegReg::Fs, SegReg::Ds, SegReg::Es] {
                let sel = u32::from(core.state.seg(seg).selector);
                frame.push(core, bus, sel, w)?;
            }
        }
        let old_ss = u32::from(core.state.seg(SegReg::Ss).selector);
        let old_esp = core.state.gpr[ESP];
        frame.push(core, bus, old_ss, w)?;
        frame.push(core, bus, old_esp, w)?;
        frame
    } else {
        StackFrame::current(core)
    };
    frame.push(core, bus, eflags, w)?;
    frame.push(core, bus, old_cs, w)?;
    frame.push(core, bus, old_eip, w)?;
    if let Some(code) = error_code {
        frame.push(core, bus, code, w)?;
    }
    set_accessed(core, bus, &mut target)?;

    frame.commit(core);
    if from_v86 {
        for seg in [SegReg::Es, SegReg::Ds, SegReg::Fs, SegReg::Gs] {
            *core.state.seg_mut(seg) = SegmentCache::null(0);
        }
    }
    core.state.segs[SegReg::Cs.index()] = new_cs;
    core.state.eip = offset;
    let mut clear = FLAG_TF | FLAG_NT | FLAG_VM | FLAG_RF;
    if matches!(
        gate_type,
        Some(SystemType::InterruptGate16 | SystemType::InterruptGate32)
    ) {
        clear |= FLAG_IF;
    }
    core.state.flags.set_eflags(eflags & !clear);
    if from_v86 {
        tracing::debug!(vector, "leaving virtual-8086 mode for interrupt");
    }
    Ok(())
}

/// Deliver an exception, escalating to #DF and then to a triple fault (core
/// reset) when delivery itself faults.
pub fn deliver_exception<B: MemoryBus + ?Sized>(core: &mut CpuCore, bus: &mut B, fault: Fault) {
    let mut current = fault;
    for _ in 0..MAX_DELIVERY_ATTEMPTS {
        core.stats.exceptions += 1;
        if let Some(cr2) = current.cr2 {
            core.state.cr2 = cr2;
        }
        let code = if core.state.protected() && current.exception.pushes_error_code() {
            Some(current.error_code.unwrap_or(0))
        } else {
            None
        };
        match raise(core, bus, current.vector(), InterruptKind::Exception, code) {
            Ok(()) => return,
            Err(next) => {
                if current.exception == Exception::DoubleFault {
                    break;
                }
                current = if should_double_fault(current.exception, next.exception) {
                    Fault::df()
                } else {
                    next
                };
            }
        }
    }
    core.triple_fault();
}

/// Deliver an external interrupt or NMI; a fault during delivery becomes an
/// exception in its own right.
pub fn deliver_external<B: MemoryBus + ?Sized>(core: &mut CpuCore, bus: &mut B, vector: u8) {
    if let Err(fault) = raise(core, bus, vector, InterruptKind::External, None) {
        deliver_exception(core, bus, fault);
    }
}

/// EFLAGS bits writable by POPF/IRET for this model and privilege.
pub(crate) fn writable_flags(core: &CpuCore, op32: bool) -> u32 {
    let mut mask = ARITH_FLAGS | FLAG_TF | FLAG_DF;
    let class = core.model().class;
    if class >= CpuClass::I286 && core.state.protected() {
        mask |= FLAG_NT;
        if core.state.cpl() == 0 {
            mask |= FLAG_IOPL_MASK;
        }
    } else if class >= CpuClass::I286 {
        mask |= FLAG_NT | FLAG_IOPL_MASK;
    }
    if !core.state.protected() || core.state.cpl() <= core.state.iopl() {
        mask |= FLAG_IF;
    }
    if op32 {
        if class >= CpuClass::I486 {
            mask |= FLAG_AC;
        }
        if class >= CpuClass::Pentium {
            mask |= FLAG_ID;
        }
    } else {
        mask &= 0xFFFF;
    }
    mask
}

/// Merge `value` into EFLAGS under the POPF/IRET rules.
pub(crate) fn load_flags(core: &mut CpuCore, value: u32, op32: bool) {
    let mask = writable_flags(core, op32);
    let old = core.state.flags.materialize();
    let mut new = (old & !mask) | (value & mask);
    if core.model().class < CpuClass::I286 {
        new |= 0xF000;
    }
    core.state.flags.set_eflags(new);
}

/// IRET / IRETD.
pub fn iret<B: MemoryBus + ?Sized>(core: &mut CpuCore, bus: &mut B, op32: bool) -> Result<(), Fault> {
    let w = if op32 { 4 } else { 2 };
    core.prefetch.flush();
    let cycles = i64::from(core.model().timings.iret);
    core.charge(cycles);

    if !core.state.protected() {
        let mut frame = StackFrame::current(core);
        let eip = frame.pop(core, bus, w)?;
        let cs = frame.pop(core, bus, w)? as u16;
        let flags = frame.pop(core, bus, w)?;
        frame.commit(core);
        core.state.seg_mut(SegReg::Cs).reload_real(cs);
        core.state.eip = if op32 { eip } else { eip & 0xFFFF };
        load_flags(core, flags, op32);
        core.pending.nmi_blocked = false;
        return Ok(());
    }

    if core.state.v86() {
        if core.state.iopl() < 3 {
            return Err(Fault::gp0());
        }
        let mut frame = StackFrame::current(core);
        let eip = frame.pop(core, bus, w)?;
        let cs = frame.pop(core, bus, w)? as u16;
        let flags = frame.pop(core, bus, w)?;
        frame.commit(core);
        *core.state.seg_mut(SegReg::Cs) = SegmentCache::v86(cs, true);
        core.state.eip = eip & 0xFFFF;
        // IOPL is not writable from V86; VM stays set.
        let keep = FLAG_IOPL_MASK | FLAG_VM;
        let old = core.state.flags.materialize();
        let mask = writable_flags(core, op32) & !keep;
        core.state.flags.set_eflags((old & !mask) | (flags & mask));
        core.pending.nmi_blocked = false;
        return Ok(());
    }

    core.pending.nmi_blocked = false;

    if core.state.flags.get(FLAG_NT) {
        let link = core.read_system(bus, core.state.tr.base, 2)? as u16;
        let ts = TaskSwitch::new(core, bus, link, SwitchReason::Iret)?;
        let eip = core.state.eip;
        return ts.execute(core, bus, eip, None);
    }

    let cpl = core.state.cpl();
    let mut frame = StackFrame::current(core);
    let eip = frame.pop(core, bus, w)?;
    let cs_sel = frame.pop(core, bus, w)? as u16;
    let flags = frame.pop(core, bus, w)?;

    if op32 && flags & FLAG_VM != 0 && cpl == 0 {
        return iret_to_v86(core, bus, frame, eip, cs_sel, flags);
    }

    let rpl = (cs_sel & 3) as u8;
    if cs_sel & 0xFFFC == 0 {
        return Err(Fault::gp0());
    }
    if rpl < cpl {
        return Err(Fault::gp_sel(cs_sel));
    }
    let Some(mut target) = read_descriptor(core, bus, cs_sel)? else {
        return Err(Fault::gp_sel(cs_sel));
    };
    let desc = target.desc;
    let ok = desc.is_code()
        && if desc.conforming() {
            desc.dpl() <= rpl
        } else {
            desc.dpl() == rpl
        };
    if !ok {
        return Err(Fault::gp_sel(cs_sel));
    }
    if !desc.present() {
        return Err(Fault::np(cs_sel));
    }
    let new_cs = SegmentCache::from_descriptor(cs_sel, &desc);
    let eip = if op32 { eip } else { eip & 0xFFFF };
    if !new_cs.contains(eip, 1) {
        return Err(Fault::gp0());
    }

    if rpl == cpl {
        set_accessed(core, bus, &mut target)?;
        frame.commit(core);
        load_flags(core, flags, op32);
        core.state.segs[SegReg::Cs.index()] = new_cs;
        core.state.eip = eip;
        return Ok(());
    }

    let new_esp = frame.pop(core, bus, w)?;
    let ss_sel = frame.pop(core, bus, w)? as u16;
    let new_ss = outer_stack(core, bus, ss_sel, rpl)?;
    set_accessed(core, bus, &mut target)?;
    // Flags are merged under the privilege of the interrupted-from level.
    load_flags(core, flags, op32);
    StackFrame::new(new_ss, new_esp, rpl).commit(core);
    core.state.segs[SegReg::Cs.index()] = new_cs;
    core.state.eip = eip;
    null_inaccessible_data_segments(core);
    Ok(())
}

fn iret_to_v86<B: MemoryBus + ?Sized>(
    core: &mut CpuCore,
    bus: &mut B,
    mut frame: StackFrame,
    eip: u32,
    cs: u16,
    flags: u32,
) -> Result<(), Fault> {
    let esp = frame.pop(core, bus, 4)?;
    let ss = frame.pop(core, bus, 4)? as u16;
    let es = frame.pop(core, bus, 4)? as u16;
    let ds = frame.pop(core, bus, 4)? as u16;
    let fs = frame.pop(core, bus, 4)? as u16;
    let gs = frame.pop(core, bus, 4)? as u16;

    core.state.flags.set_eflags(flags | FLAG_VM);
    for (seg, sel) in [
        (SegReg::Es, es),
        (SegReg::Cs, cs),
        (SegReg::Ss, ss),
        (SegReg::Ds, ds),
        (SegReg::Fs, fs),
        (SegReg::Gs, gs),
    ] {
        *core.state.seg_mut(seg) = SegmentCache::v86(sel, seg == SegReg::Cs);
    }
    core.state.gpr[ESP] = esp;
    core.state.eip = eip & 0xFFFF;
    tracing::debug!(
        cs = format_args!("{cs:#06x}"),
        ip = format_args!("{:#06x}", eip & 0xFFFF),
        "entering virtual-8086 mode"
    );
    Ok(())
}

/// Instruction-boundary check: pending single-step trap, NMI, then maskable
/// interrupts. Returns `true` if anything was delivered.
pub fn service_events(core: &mut CpuCore, platform: &mut dyn Platform) -> bool {
    if core.pending.single_step {
        core.pending.single_step = false;
        core.state.dr[6] |= 1 << 14;
        deliver_exception(core, platform, Fault::db());
        core.state.halted = false;
        return true;
    }

    if platform.take_nmi() {
        core.pending.nmi_pending = true;
    }
    if core.pending.nmi_pending && !core.pending.nmi_blocked {
        core.pending.nmi_pending = false;
        core.pending.nmi_blocked = true;
        core.state.halted = false;
        deliver_external(core, platform, Exception::NonMaskableInterrupt.vector());
        return true;
    }

    if core.pending.interrupt_shadow {
        core.pending.interrupt_shadow = false;
        return false;
    }
    if !core.state.flags.get(FLAG_IF) {
        return false;
    }
    let Some(vector) = platform.poll_interrupt() else {
        return false;
    };
    core.state.halted = false;
    deliver_external(core, platform, vector);
    true
}
