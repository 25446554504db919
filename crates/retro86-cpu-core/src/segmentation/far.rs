//! Far JMP / CALL / RET.
//!
//! Protected-mode far transfers resolve the target selector to either a code
//! segment, a call gate, a task gate or a TSS, and every check runs before any
//! register or stack is committed.

use retro86_mmu::MemoryBus;

use crate::exception::Fault;
use crate::mem::StackFrame;
use crate::state::{SegReg, SegmentCache};
use crate::CpuCore;

use super::descriptor::{Descriptor, SystemType};
use super::task::{load_inner_stack, SwitchReason, TaskSwitch};
use super::{null_inaccessible_data_segments, read_descriptor, set_accessed, DescriptorRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FarKind {
    Jmp,
    Call,
}

/// A decoded far JMP or CALL.
#[derive(Debug, Clone, Copy)]
pub struct FarTransfer {
    pub kind: FarKind,
    pub selector: u16,
    pub offset: u32,
    /// Operand size of the instruction (return-address width for calls).
    pub op32: bool,
}

impl FarTransfer {
    pub fn execute<B: MemoryBus + ?Sized>(
        self,
        core: &mut CpuCore,
        bus: &mut B,
    ) -> Result<(), Fault> {
        let offset = if self.op32 {
            self.offset
        } else {
            self.offset & 0xFFFF
        };
        if !core.state.protected() || core.state.v86() {
            return self.real(core, bus, offset);
        }
        if self.selector & 0xFFFC == 0 {
            return Err(Fault::gp0());
        }
        let Some(target) = read_descriptor(core, bus, self.selector)? else {
            return Err(Fault::gp_sel(self.selector));
        };
        if target.desc.is_code() {
            return self.to_code_segment(core, bus, target, offset);
        }
        match target.desc.system_type() {
            Some(SystemType::CallGate16 | SystemType::CallGate32) => {
                self.through_call_gate(core, bus, target.desc)
            }
            Some(SystemType::TaskGate) => {
                self.check_gate_privilege(core, &target.desc)?;
                if !target.desc.present() {
                    return Err(Fault::np(self.selector));
                }
                self.task_switch(core, bus, target.desc.gate_selector())
            }
            Some(SystemType::Tss16Available | SystemType::Tss32Available) => {
                self.check_gate_privilege(core, &target.desc)?;
                self.task_switch(core, bus, self.selector)
            }
            _ => Err(Fault::gp_sel(self.selector)),
        }
    }

    fn reason(&self) -> SwitchReason {
        match self.kind {
            FarKind::Jmp => SwitchReason::Jmp,
            FarKind::Call => SwitchReason::Call,
        }
    }

    fn real<B: MemoryBus + ?Sized>(
        self,
        core: &mut CpuCore,
        bus: &mut B,
        offset: u32,
    ) -> Result<(), Fault> {
        if self.kind == FarKind::Call {
            let mut frame = StackFrame::current(core);
            let w = if self.op32 { 4 } else { 2 };
            let cs = u32::from(core.state.seg(SegReg::Cs).selector);
            let eip = core.state.eip;
            frame.push(core, bus, cs, w)?;
            frame.push(core, bus, eip, w)?;
            frame.commit(core);
        }
        let cs = if core.state.v86() {
            SegmentCache::v86(self.selector, true)
        } else {
            let mut cs = *core.state.seg(SegReg::Cs);
            cs.reload_real(self.selector);
            cs
        };
        core.state.segs[SegReg::Cs.index()] = cs;
        core.state.eip = offset;
        Ok(())
    }

    fn check_gate_privilege(&self, core: &CpuCore, gate: &Descriptor) -> Result<(), Fault> {
        let cpl = core.state.cpl();
        let rpl = (self.selector & 3) as u8;
        if gate.dpl() < cpl.max(rpl) {
            return Err(Fault::gp_sel(self.selector));
        }
        Ok(())
    }

    fn task_switch<B: MemoryBus + ?Sized>(
        self,
        core: &mut CpuCore,
        bus: &mut B,
        tss: u16,
    ) -> Result<(), Fault> {
        let ts = TaskSwitch::new(core, bus, tss, self.reason())?;
        let eip = core.state.eip;
        ts.execute(core, bus, eip, None)
    }

    fn to_code_segment<B: MemoryBus + ?Sized>(
        self,
        core: &mut CpuCore,
        bus: &mut B,
        mut target: DescriptorRef,
        offset: u32,
    ) -> Result<(), Fault> {
        let cpl = core.state.cpl();
        let rpl = (self.selector & 3) as u8;
        let desc = target.desc;
        let ok = if desc.conforming() {
            desc.dpl() <= cpl
        } else {
            rpl <= cpl && desc.dpl() == cpl
        };
        if !ok {
            return Err(Fault::gp_sel(self.selector));
        }
        if !desc.present() {
            return Err(Fault::np(self.selector));
        }
        let new_cs = SegmentCache::from_descriptor((self.selector & 0xFFFC) | u16::from(cpl), &desc);
        if !new_cs.contains(offset, 1) {
            return Err(Fault::gp0());
        }
        let mut frame = StackFrame::current(core);
        if self.kind == FarKind::Call {
            let w = if self.op32 { 4 } else { 2 };
            let cs = u32::from(core.state.seg(SegReg::Cs).selector);
            let eip = core.state.eip;
            frame.push(core, bus, cs, w)?;
            frame.push(core, bus, eip, w)?;
        }
        set_accessed(core, bus, &mut target)?;
        frame.commit(core);
        core.state.segs[SegReg::Cs.index()] = new_cs;
        core.state.eip = offset;
        Ok(())
    }

    fn through_call_gate<B: MemoryBus + ?Sized>(
        self,
        core: &mut CpuCore,
        bus: &mut B,
        gate: Descriptor,
    ) -> Result<(), Fault> {
        self.check_gate_privilege(core, &gate)?;
        if !gate.present() {
            return Err(Fault::np(self.selector));
        }
        let target_sel = gate.gate_selector();
        if target_sel & 0xFFFC == 0 {
            return Err(Fault::gp0());
        }
        let Some(mut target) = read_descriptor(core, bus, target_sel)? else {
            return Err(Fault::gp_sel(target_sel));
        };
        let desc = target.desc;
        let cpl = core.state.cpl();
        if !desc.is_code() || desc.dpl() > cpl {
            return Err(Fault::gp_sel(target_sel));
        }
        if self.kind == FarKind::Jmp && !desc.conforming() && desc.dpl() != cpl {
            return Err(Fault::gp_sel(target_sel));
        }
        if !desc.present() {
            return Err(Fault::np(target_sel));
        }

        let gate32 = gate.system_type().is_some_and(|t| t.is_32());
        let w = if gate32 { 4 } else { 2 };
        let offset = gate.gate_offset();
        let new_cpl = if desc.conforming() || self.kind == FarKind::Jmp {
            cpl
        } else {
            desc.dpl()
        };
        let new_cs = SegmentCache::from_descriptor((target_sel & 0xFFFC) | u16::from(new_cpl), &desc);
        if !new_cs.contains(offset, 1) {
            return Err(Fault::gp0());
        }

        let old_cs = u32::from(core.state.seg(SegReg::Cs).selector);
        let old_eip = core.state.eip;
        let frame = match self.kind {
            FarKind::Jmp => StackFrame::current(core),
            FarKind::Call if new_cpl < cpl => {
                let mut frame = load_inner_stack(core, bus, new_cpl)?;
                let old = StackFrame::current(core);
                frame.push(core, bus, u32::from(old.ss.selector), w)?;
                frame.push(core, bus, old.esp, w)?;
                // Parameters are copied highest address first.
                let count = u32::from(gate.gate_params());
                let old_mask = if old.ss.big() { 0xFFFF_FFFF } else { 0xFFFF };
                for i in (0..count).rev() {
                    let off = (old.esp & old_mask).wrapping_add(i * w) & old_mask;
                    if !old.ss.contains(off, w) {
                        return Err(Fault::ss(0));
                    }
                    let v = core.read_linear(bus, old.ss.base.wrapping_add(off), w, old.who)?;
                    frame.push(core, bus, v, w)?;
                }
                frame.push(core, bus, old_cs, w)?;
                frame.push(core, bus, old_eip, w)?;
                frame
            }
            FarKind::Call => {
                let mut frame = StackFrame::current(core);
                frame.push(core, bus, old_cs, w)?;
                frame.push(core, bus, old_eip, w)?;
                frame
            }
        };
        set_accessed(core, bus, &mut target)?;
        frame.commit(core);
        core.state.segs[SegReg::Cs.index()] = new_cs;
        core.state.eip = offset;
        Ok(())
    }
}

/// Far RET with `imm` bytes of parameters to release.
pub fn far_return<B: MemoryBus + ?Sized>(
    core: &mut CpuCore,
    bus: &mut B,
    op32: bool,
    imm: u16,
) -> Result<(), Fault> {
    let w = if op32 { 4 } else { 2 };
    let mut frame = StackFrame::current(core);
    let eip = frame.pop(core, bus, w)?;
    let cs_sel = frame.pop(core, bus, w)? as u16;

    if !core.state.protected() || core.state.v86() {
        frame.skip(u32::from(imm));
        let eip = eip & if op32 { 0xFFFF_FFFF } else { 0xFFFF };
        let cs = if core.state.v86() {
            SegmentCache::v86(cs_sel, true)
        } else {
            let mut cs = *core.state.seg(SegReg::Cs);
            cs.reload_real(cs_sel);
            cs
        };
        frame.commit(core);
        core.state.segs[SegReg::Cs.index()] = cs;
        core.state.eip = eip;
        return Ok(());
    }

    let cpl = core.state.cpl();
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
    let eip = eip & if op32 { 0xFFFF_FFFF } else { 0xFFFF };
    if !new_cs.contains(eip, 1) {
        return Err(Fault::gp0());
    }
    frame.skip(u32::from(imm));

    if rpl == cpl {
        set_accessed(core, bus, &mut target)?;
        frame.commit(core);
        core.state.segs[SegReg::Cs.index()] = new_cs;
        core.state.eip = eip;
        return Ok(());
    }

    let new_esp = frame.pop(core, bus, w)?;
    let ss_sel = frame.pop(core, bus, w)? as u16;
    let new_ss = outer_stack(core, bus, ss_sel, rpl)?;
    set_accessed(core, bus, &mut target)?;
    let mut outer = StackFrame::new(new_ss, new_esp, rpl);
    outer.skip(u32::from(imm));
    outer.commit(core);
    core.state.segs[SegReg::Cs.index()] = new_cs;
    core.state.eip = eip;
    null_inaccessible_data_segments(core);
    Ok(())
}

/// Validate the outer-level SS popped by RET/IRET.
pub(crate) fn outer_stack<B: MemoryBus + ?Sized>(
    core: &mut CpuCore,
    bus: &mut B,
    ss_sel: u16,
    rpl: u8,
) -> Result<SegmentCache, Fault> {
    if ss_sel & 0xFFFC == 0 {
        return Err(Fault::gp0());
    }
    let Some(mut d) = read_descriptor(core, bus, ss_sel)? else {
        return Err(Fault::gp_sel(ss_sel));
    };
    let desc = d.desc;
    if (ss_sel & 3) as u8 != rpl || desc.dpl() != rpl || !desc.writable() {
        return Err(Fault::gp_sel(ss_sel));
    }
    if !desc.present() {
        return Err(Fault::ss(ss_sel));
    }
    set_accessed(core, bus, &mut d)?;
    Ok(SegmentCache::from_descriptor(ss_sel, &d.desc))
}
