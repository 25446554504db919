//! Hardware task switching and TSS helpers.

use retro86_mmu::MemoryBus;

use crate::exception::Fault;
use crate::flags::{FLAG_NT, FLAG_VM};
use crate::mem::StackFrame;
use crate::state::{SegReg, SegmentCache, CR0_TS};
use crate::CpuCore;

use super::descriptor::Descriptor;
use super::{load_ldt, load_protected, read_descriptor, set_busy, DescriptorRef, Origin};

/// Why the task switch happens; decides busy-bit, NT and back-link handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchReason {
    Jmp,
    Call,
    Iret,
    Interrupt,
}

/// Field offsets of one TSS format.
#[derive(Debug, Clone, Copy)]
struct TssLayout {
    min_limit: u32,
    width: u32,
    eip: u32,
    eflags: u32,
    gpr: u32,
    seg: u32,
    ldt: u32,
    cr3: Option<u32>,
}

const TSS32: TssLayout = TssLayout {
    min_limit: 0x67,
    width: 4,
    eip: 0x20,
    eflags: 0x24,
    gpr: 0x28,
    seg: 0x48,
    ldt: 0x60,
    cr3: Some(0x1C),
};

const TSS16: TssLayout = TssLayout {
    min_limit: 0x2B,
    width: 2,
    eip: 0x0E,
    eflags: 0x10,
    gpr: 0x12,
    seg: 0x22,
    ldt: 0x2A,
    cr3: None,
};

impl TssLayout {
    fn for_access(access: u8) -> Self {
        if access & 0x08 != 0 {
            TSS32
        } else {
            TSS16
        }
    }

    /// 16-bit TSSs hold ES, CS, SS, DS only.
    fn seg_count(&self) -> usize {
        if self.width == 4 {
            6
        } else {
            4
        }
    }

    fn seg_offset(&self, i: usize) -> u32 {
        self.seg + i as u32 * self.width
    }
}

/// Values read out of the incoming TSS before anything is committed.
#[derive(Debug, Clone, Copy, Default)]
struct TaskImage {
    eip: u32,
    eflags: u32,
    gpr: [u32; 8],
    segs: [u16; 6],
    ldt: u16,
    cr3: Option<u32>,
}

/// A validated task switch, ready to run.
#[derive(Debug, Clone, Copy)]
pub struct TaskSwitch {
    reason: SwitchReason,
    selector: u16,
    target: DescriptorRef,
}

impl TaskSwitch {
    /// Check the target TSS descriptor.
    pub fn new<B: MemoryBus + ?Sized>(
        core: &mut CpuCore,
        bus: &mut B,
        selector: u16,
        reason: SwitchReason,
    ) -> Result<Self, Fault> {
        let wrong = |sel| {
            if reason == SwitchReason::Iret {
                Fault::ts(sel)
            } else {
                Fault::gp_sel(sel)
            }
        };
        if selector & 4 != 0 || selector & 0xFFFC == 0 {
            return Err(wrong(selector));
        }
        let Some(target) = read_descriptor(core, bus, selector)? else {
            return Err(wrong(selector));
        };
        let Some(ty) = target.desc.system_type().filter(|t| t.is_tss()) else {
            return Err(wrong(selector));
        };
        // IRET returns to a busy task; everything else needs an available one.
        if ty.is_tss_busy() != (reason == SwitchReason::Iret) {
            return Err(wrong(selector));
        }
        if !target.desc.present() {
            return Err(Fault::np(selector));
        }
        let layout = TssLayout::for_access(target.desc.access());
        if target.desc.effective_limit() < layout.min_limit {
            return Err(Fault::ts(selector));
        }
        Ok(Self {
            reason,
            selector,
            target,
        })
    }

    pub fn selector(&self) -> u16 {
        self.selector
    }

    /// Save the outgoing task, load the incoming one. `return_eip` is the EIP
    /// saved for the outgoing task; `error_code` is pushed on the new stack for
    /// exceptions delivered through a task gate.
    pub fn execute<B: MemoryBus + ?Sized>(
        self,
        core: &mut CpuCore,
        bus: &mut B,
        return_eip: u32,
        error_code: Option<u32>,
    ) -> Result<(), Fault> {
        let old_tr = core.state.tr;
        let old_layout = TssLayout::for_access(old_tr.access);
        let new_layout = TssLayout::for_access(self.target.desc.access());
        let new_base = self.target.desc.base();

        if old_layout.min_limit > old_tr.limit {
            return Err(Fault::ts(old_tr.selector));
        }

        let image = read_image(core, bus, new_base, &new_layout)?;

        let mut old_eflags = core.state.flags.materialize();
        if self.reason == SwitchReason::Iret {
            old_eflags &= !FLAG_NT;
        }
        if matches!(self.reason, SwitchReason::Jmp | SwitchReason::Iret) {
            set_busy(core, bus, old_tr.selector, false)?;
        }
        save_image(core, bus, old_tr.base, &old_layout, return_eip, old_eflags)?;

        let mut new_eflags = image.eflags;
        if matches!(self.reason, SwitchReason::Call | SwitchReason::Interrupt) {
            core.write_system(bus, new_base, 2, u32::from(old_tr.selector))?;
            new_eflags |= FLAG_NT;
        }
        if self.reason != SwitchReason::Iret {
            set_busy(core, bus, self.selector, true)?;
        }

        let busy = Descriptor::new(self.target.desc.raw | (0x02u64 << 40));
        core.state.tr = SegmentCache::from_descriptor(self.selector, &busy);
        // From here on a fault belongs to the incoming task.
        core.switched_task = true;
        core.set_cr0(core.state.cr0 | CR0_TS);
        if let Some(cr3) = image.cr3 {
            if core.state.paging() {
                core.set_cr3(cr3);
            }
        }

        core.state.gpr = image.gpr;
        core.state.eip = image.eip;
        core.state.flags.set_eflags(new_eflags);

        // Raw selectors first, so a failing validation below reports against
        // the new task's state.
        for (i, &sel) in image.segs.iter().enumerate() {
            if let Some(seg) = SegReg::from_index(i as u8) {
                let cache = core.state.seg_mut(seg);
                cache.selector = sel;
                cache.valid = false;
            }
        }
        core.state.ldtr.selector = image.ldt;

        tracing::debug!(
            from = format_args!("{:#06x}", old_tr.selector),
            to = format_args!("{:#06x}", self.selector),
            reason = ?self.reason,
            "task switch"
        );

        load_ldt(core, bus, image.ldt, Origin::TaskSwitch)?;

        if new_eflags & FLAG_VM != 0 {
            for seg in SegReg::ALL {
                let sel = image.segs[seg.index()];
                *core.state.seg_mut(seg) = SegmentCache::v86(sel, seg == SegReg::Cs);
            }
        } else {
            let cs_sel = image.segs[SegReg::Cs.index()];
            let cpl = (cs_sel & 3) as u8;
            let cs = load_protected(core, bus, SegReg::Cs, cs_sel, cpl, Origin::TaskSwitch)?;
            core.state.segs[SegReg::Cs.index()] = cs;
            for seg in [SegReg::Ss, SegReg::Ds, SegReg::Es, SegReg::Fs, SegReg::Gs] {
                let sel = image.segs[seg.index()];
                let cache = load_protected(core, bus, seg, sel, cpl, Origin::TaskSwitch)?;
                *core.state.seg_mut(seg) = cache;
            }
        }

        if let Some(code) = error_code {
            let mut frame = StackFrame::current(core);
            frame.push(core, bus, code, new_layout.width)?;
            frame.commit(core);
        }
        if !core.state.seg(SegReg::Cs).contains(core.state.eip, 1) {
            return Err(Fault::gp0());
        }
        core.prefetch.flush();
        Ok(())
    }
}

fn read_image<B: MemoryBus + ?Sized>(
    core: &mut CpuCore,
    bus: &mut B,
    base: u32,
    layout: &TssLayout,
) -> Result<TaskImage, Fault> {
    let w = layout.width;
    let mut image = TaskImage {
        eip: core.read_system(bus, base + layout.eip, w)?,
        eflags: core.read_system(bus, base + layout.eflags, w)?,
        ..TaskImage::default()
    };
    for (i, slot) in image.gpr.iter_mut().enumerate() {
        *slot = core.read_system(bus, base + layout.gpr + i as u32 * w, w)?;
    }
    for i in 0..layout.seg_count() {
        image.segs[i] = core.read_system(bus, base + layout.seg_offset(i), 2)? as u16;
    }
    image.ldt = core.read_system(bus, base + layout.ldt, 2)? as u16;
    if let Some(off) = layout.cr3 {
        image.cr3 = Some(core.read_system(bus, base + off, 4)?);
    }
    if w == 2 {
        // A 16-bit task keeps the upper halves of the outgoing registers.
        for (i, slot) in image.gpr.iter_mut().enumerate() {
            *slot |= core.state.gpr[i] & 0xFFFF_0000;
        }
    }
    Ok(image)
}

fn save_image<B: MemoryBus + ?Sized>(
    core: &mut CpuCore,
    bus: &mut B,
    base: u32,
    layout: &TssLayout,
    eip: u32,
    eflags: u32,
) -> Result<(), Fault> {
    let w = layout.width;
    core.write_system(bus, base + layout.eip, w, eip)?;
    core.write_system(bus, base + layout.eflags, w, eflags)?;
    for i in 0..8 {
        let v = core.state.gpr[i];
        core.write_system(bus, base + layout.gpr + i as u32 * w, w, v)?;
    }
    for i in 0..layout.seg_count() {
        let sel = core.state.segs[i].selector;
        core.write_system(bus, base + layout.seg_offset(i), 2, u32::from(sel))?;
    }
    if let Some(off) = layout.cr3 {
        let cr3 = core.state.cr3;
        core.write_system(bus, base + off, 4, cr3)?;
    }
    Ok(())
}

/// SS:ESP for privilege level `dpl` from the current TSS.
pub fn tss_stack_for<B: MemoryBus + ?Sized>(
    core: &mut CpuCore,
    bus: &mut B,
    dpl: u8,
) -> Result<(u16, u32), Fault> {
    let tr = core.state.tr;
    let dpl = u32::from(dpl);
    if tr.access & 0x08 != 0 {
        let off = 4 + dpl * 8;
        if off + 5 > tr.limit {
            return Err(Fault::ts(tr.selector));
        }
        let esp = core.read_system(bus, tr.base + off, 4)?;
        let ss = core.read_system(bus, tr.base + off + 4, 2)? as u16;
        Ok((ss, esp))
    } else {
        let off = 2 + dpl * 4;
        if off + 3 > tr.limit {
            return Err(Fault::ts(tr.selector));
        }
        let sp = core.read_system(bus, tr.base + off, 2)?;
        let ss = core.read_system(bus, tr.base + off + 2, 2)? as u16;
        Ok((ss, sp))
    }
}

/// Validate the stack named by a TSS for a privilege change to `cpl`.
pub(crate) fn load_inner_stack<B: MemoryBus + ?Sized>(
    core: &mut CpuCore,
    bus: &mut B,
    cpl: u8,
) -> Result<StackFrame, Fault> {
    let (ss_sel, esp) = tss_stack_for(core, bus, cpl)?;
    if ss_sel & 0xFFFC == 0 {
        return Err(Fault::ts(ss_sel));
    }
    let Some(mut d) = read_descriptor(core, bus, ss_sel)? else {
        return Err(Fault::ts(ss_sel));
    };
    let desc = d.desc;
    if (ss_sel & 3) as u8 != cpl || desc.dpl() != cpl || !desc.writable() {
        return Err(Fault::ts(ss_sel));
    }
    if !desc.present() {
        return Err(Fault::ss(ss_sel));
    }
    super::set_accessed(core, bus, &mut d)?;
    Ok(StackFrame::new(
        SegmentCache::from_descriptor(ss_sel, &d.desc),
        esp,
        cpl,
    ))
}

/// I/O permission check for IN/OUT/INS/OUTS. Returns `Ok(false)` when the
/// access must raise #GP(0).
pub fn io_permitted<B: MemoryBus + ?Sized>(
    core: &mut CpuCore,
    bus: &mut B,
    port: u16,
    size: u8,
) -> Result<bool, Fault> {
    let st = &core.state;
    if !st.protected() || (!st.v86() && st.cpl() <= st.iopl()) {
        return Ok(true);
    }
    let tr = st.tr;
    if tr.access & 0x08 == 0 || tr.limit < 0x67 {
        return Ok(false);
    }
    let map = core.read_system(bus, tr.base + 0x66, 2)?;
    let byte = map + u32::from(port >> 3);
    if byte + 1 > tr.limit {
        return Ok(false);
    }
    let bits = core.read_system(bus, tr.base + byte, 2)?;
    let mask = ((1u32 << size) - 1) << (port & 7);
    Ok(bits & mask == 0)
}
