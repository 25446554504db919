//! Data movement: MOV forms, stack operations, exchanges, segment loads,
//! flag transfers and the 386+ conditional and atomic moves.

use crate::exception::Fault;
use crate::flags::{
    Width, FLAG_AF, FLAG_CF, FLAG_IOPL_MASK, FLAG_PF, FLAG_RF, FLAG_SF, FLAG_VM, FLAG_ZF,
};
use crate::interrupts::load_flags;
use crate::model::CpuClass;
use crate::platform::Platform;
use crate::segmentation::load_segment;
use crate::state::{SegReg, EAX, EBP, EBX, ECX, EDX, ESP};
use crate::CpuCore;

use super::decode::Ea;
use super::ops_alu::{alu, ADD, CMP};
use super::{undefined_form, Flow, Insn};

/// Segment register encoded in the PUSH/POP Sreg opcodes.
fn opcode_sreg(opcode: u8) -> SegReg {
    match opcode {
        0xA0 | 0xA1 => SegReg::Fs,
        0xA8 | 0xA9 => SegReg::Gs,
        op => match (op >> 3) & 3 {
            0 => SegReg::Es,
            1 => SegReg::Cs,
            2 => SegReg::Ss,
            _ => SegReg::Ds,
        },
    }
}

/// Finish a segment register load. SS loads hold off interrupts for one
/// instruction.
fn after_sreg_load(core: &mut CpuCore, seg: SegReg) -> Flow {
    if seg == SegReg::Ss {
        core.pending.interrupt_shadow = true;
    }
    let t = if core.state.protected() {
        core.model().timings.seg_load
    } else {
        core.model().timings.rm
    };
    core.charge(i64::from(t));
    Flow::EndBlock
}

pub(crate) fn push_sreg(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let sel = core.state.seg(opcode_sreg(insn.opcode)).selector;
    core.push(bus, u32::from(sel), insn.op32)?;
    core.charge_ea(true, false);
    Ok(Flow::Continue)
}

pub(crate) fn pop_sreg(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let seg = opcode_sreg(insn.opcode);
    let sel = core.pop(bus, insn.op32)? as u16;
    load_segment(core, bus, seg, sel)?;
    Ok(after_sreg_load(core, seg))
}

/// 0F on the 8086: POP CS.
pub(crate) fn pop_cs(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let sel = core.pop(bus, insn.op32)? as u16;
    core.state.seg_mut(SegReg::Cs).reload_real(sel);
    core.prefetch.flush();
    Ok(after_sreg_load(core, SegReg::Cs))
}

/// 50-57.
pub(crate) fn push_reg(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = insn.opw();
    let r = insn.opcode & 7;
    let mut v = core.state.reg(w, r);
    if usize::from(r) == ESP && !core.model().at_least(CpuClass::I286) {
        // The 8086 pushes the already-decremented SP.
        v = v.wrapping_sub(2) & 0xFFFF;
    }
    core.push(bus, v, insn.op32)?;
    core.charge_ea(true, false);
    Ok(Flow::Continue)
}

/// 58-5F.
pub(crate) fn pop_reg(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = insn.opw();
    let v = core.pop(bus, insn.op32)?;
    core.state.set_reg(w, insn.opcode & 7, v);
    core.charge_ea(true, false);
    Ok(Flow::Continue)
}

/// 68 / 6A.
pub(crate) fn push_imm(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = insn.opw();
    let v = if insn.opcode == 0x6A {
        w.sext(u32::from(core.fetch_u8(bus)?))
    } else {
        core.fetch_imm(bus, w)?
    };
    core.push(bus, v & w.mask(), insn.op32)?;
    core.charge_ea(true, false);
    Ok(Flow::Continue)
}

/// 8F /0: POP r/m. A memory operand using ESP sees the incremented value.
pub(crate) fn pop_rm(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = insn.opw();
    let v = core.pop(bus, insn.op32)?;
    let (op, ea) = core.modrm(bus, insn)?;
    if op != 0 {
        return undefined_form(core);
    }
    core.write_ea(bus, ea, w, v)?;
    core.charge_ea(ea.is_mem(), true);
    Ok(Flow::Continue)
}

/// 60: PUSHA / PUSHAD.
pub(crate) fn pusha(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = insn.opw();
    let regs: [u32; 8] = std::array::from_fn(|i| core.state.reg(w, i as u8));
    for v in regs {
        core.push(bus, v, insn.op32)?;
    }
    let t = core.model().timings.rm;
    core.charge(i64::from(t) * 2);
    Ok(Flow::Continue)
}

/// 61: POPA / POPAD. The stored SP is discarded.
pub(crate) fn popa(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = insn.opw();
    let mut vals = [0u32; 8];
    for i in (0..8).rev() {
        vals[i] = core.pop(bus, insn.op32)?;
    }
    for (i, v) in vals.into_iter().enumerate() {
        if i != ESP {
            core.state.set_reg(w, i as u8, v);
        }
    }
    let t = core.model().timings.rm;
    core.charge(i64::from(t) * 2);
    Ok(Flow::Continue)
}

/// 62: BOUND reg, m.
pub(crate) fn bound(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = insn.opw();
    let (reg, ea) = core.modrm(bus, insn)?;
    let (seg, off) = ea.mem()?;
    let lower = w.sext(core.read_mem(bus, seg, off, w)?) as i32;
    let upper_off = CpuCore::ea_offset(insn, off, w.bytes());
    let upper = w.sext(core.read_mem(bus, seg, upper_off, w)?) as i32;
    let idx = w.sext(core.state.reg(w, reg)) as i32;
    core.charge_ea(true, false);
    if idx < lower || idx > upper {
        return Err(Fault::br());
    }
    Ok(Flow::Continue)
}

/// 86/87: XCHG r/m, reg.
pub(crate) fn xchg_rm(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = insn.width();
    let (reg, ea) = core.modrm(bus, insn)?;
    let a = core.read_ea(bus, ea, w)?;
    let b = core.state.reg(w, reg);
    core.write_ea(bus, ea, w, b)?;
    core.state.set_reg(w, reg, a);
    core.charge_ea(ea.is_mem(), true);
    Ok(Flow::Continue)
}

/// 90-97: XCHG acc, reg (90 is NOP).
pub(crate) fn xchg_acc(
    core: &mut CpuCore,
    _bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = insn.opw();
    let r = insn.opcode & 7;
    if r != 0 {
        let a = core.state.reg(w, EAX as u8);
        let b = core.state.reg(w, r);
        core.state.set_reg(w, EAX as u8, b);
        core.state.set_reg(w, r, a);
    }
    core.charge_ea(false, false);
    Ok(Flow::Continue)
}

/// 88-8B.
pub(crate) fn mov_rm(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = insn.width();
    let (reg, ea) = core.modrm(bus, insn)?;
    if insn.opcode & 2 == 0 {
        let v = core.state.reg(w, reg);
        core.write_ea(bus, ea, w, v)?;
    } else {
        let v = core.read_ea(bus, ea, w)?;
        core.state.set_reg(w, reg, v);
    }
    core.charge_ea(ea.is_mem(), false);
    Ok(Flow::Continue)
}

/// C6/C7 /0: MOV r/m, imm.
pub(crate) fn mov_rm_imm(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = insn.width();
    let (op, ea) = core.modrm(bus, insn)?;
    let v = core.fetch_imm(bus, w)?;
    if op != 0 {
        return undefined_form(core);
    }
    core.write_ea(bus, ea, w, v)?;
    core.charge_ea(ea.is_mem(), false);
    Ok(Flow::Continue)
}

/// B0-BF: MOV reg, imm.
pub(crate) fn mov_reg_imm(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = if insn.opcode & 8 == 0 {
        Width::Byte
    } else {
        insn.opw()
    };
    let v = core.fetch_imm(bus, w)?;
    core.state.set_reg(w, insn.opcode & 7, v);
    core.charge_ea(false, false);
    Ok(Flow::Continue)
}

/// A0-A3: MOV between the accumulator and a direct offset.
pub(crate) fn mov_moffs(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = insn.width();
    let off = if insn.addr32 {
        core.fetch_u32(bus)?
    } else {
        u32::from(core.fetch_u16(bus)?)
    };
    let seg = insn.seg_or(SegReg::Ds);
    if insn.opcode & 2 == 0 {
        let v = core.read_mem(bus, seg, off, w)?;
        core.state.set_reg(w, EAX as u8, v);
    } else {
        let v = core.state.reg(w, EAX as u8);
        core.write_mem(bus, seg, off, w, v)?;
    }
    core.charge_ea(true, false);
    Ok(Flow::Continue)
}

/// 8C: MOV r/m, Sreg.
pub(crate) fn mov_rm_sreg(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let (reg, ea) = core.modrm(bus, insn)?;
    let Some(seg) = SegReg::from_index(reg) else {
        return Err(Fault::ud());
    };
    if matches!(seg, SegReg::Fs | SegReg::Gs) {
        core.require_class(CpuClass::I386)?;
    }
    let sel = u32::from(core.state.seg(seg).selector);
    let w = match ea {
        Ea::Reg(_) => insn.opw(),
        Ea::Mem { .. } => Width::Word,
    };
    core.write_ea(bus, ea, w, sel)?;
    core.charge_ea(ea.is_mem(), false);
    Ok(Flow::Continue)
}

/// 8E: MOV Sreg, r/m.
pub(crate) fn mov_sreg_rm(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let (reg, ea) = core.modrm(bus, insn)?;
    let Some(seg) = SegReg::from_index(reg) else {
        return Err(Fault::ud());
    };
    if matches!(seg, SegReg::Fs | SegReg::Gs) {
        core.require_class(CpuClass::I386)?;
    }
    let sel = core.read_ea(bus, ea, Width::Word)? as u16;
    if seg == SegReg::Cs {
        // MOV CS only exists on the 8086.
        if core.model().at_least(CpuClass::I186) {
            return Err(Fault::ud());
        }
        core.state.seg_mut(SegReg::Cs).reload_real(sel);
        core.prefetch.flush();
    } else {
        load_segment(core, bus, seg, sel)?;
    }
    Ok(after_sreg_load(core, seg))
}

/// 8D: LEA.
pub(crate) fn lea(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = insn.opw();
    let (reg, ea) = core.modrm(bus, insn)?;
    let (_, off) = ea.mem()?;
    core.state.set_reg(w, reg, off);
    core.charge_ea(false, false);
    Ok(Flow::Continue)
}

/// C4/C5 and 0F B2/B4/B5: LES, LDS, LSS, LFS, LGS.
pub(crate) fn load_far_ptr(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let seg = match insn.opcode {
        0xC4 => SegReg::Es,
        0xC5 => SegReg::Ds,
        0xB2 => SegReg::Ss,
        0xB4 => SegReg::Fs,
        _ => SegReg::Gs,
    };
    let w = insn.opw();
    let (reg, ea) = core.modrm(bus, insn)?;
    let (mseg, off) = ea.mem()?;
    let offset = core.read_mem(bus, mseg, off, w)?;
    let sel_off = CpuCore::ea_offset(insn, off, w.bytes());
    let sel = core.read_mem(bus, mseg, sel_off, Width::Word)? as u16;
    load_segment(core, bus, seg, sel)?;
    core.state.set_reg(w, reg, offset);
    Ok(after_sreg_load(core, seg))
}

/// 9C: PUSHF. VM and RF are never pushed.
pub(crate) fn pushf(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    if core.state.v86() && core.state.iopl() < 3 {
        return Err(Fault::gp0());
    }
    let mut v = core.state.flags.materialize() & !(FLAG_VM | FLAG_RF);
    match core.model().class {
        c if c < CpuClass::I286 => v |= 0xF000,
        CpuClass::I286 if !core.state.protected() => v &= !(FLAG_IOPL_MASK | 0xC000),
        _ => {}
    }
    if !insn.op32 {
        v &= 0xFFFF;
    }
    core.push(bus, v, insn.op32)?;
    core.charge_ea(true, false);
    Ok(Flow::Continue)
}

/// 9D: POPF.
pub(crate) fn popf(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    if core.state.v86() && core.state.iopl() < 3 {
        return Err(Fault::gp0());
    }
    let v = core.pop(bus, insn.op32)?;
    load_flags(core, v, insn.op32);
    core.charge_ea(true, false);
    Ok(Flow::EndBlock)
}

const AH_FLAGS: u32 = FLAG_SF | FLAG_ZF | FLAG_AF | FLAG_PF | FLAG_CF;

/// 9E: SAHF.
pub(crate) fn sahf(
    core: &mut CpuCore,
    _bus: &mut dyn Platform,
    _insn: &mut Insn,
) -> Result<Flow, Fault> {
    let ah = u32::from(core.state.reg8(4));
    let f = core.state.flags.materialize();
    core.state.flags.set_eflags((f & !AH_FLAGS) | (ah & AH_FLAGS));
    core.charge_ea(false, false);
    Ok(Flow::Continue)
}

/// 9F: LAHF.
pub(crate) fn lahf(
    core: &mut CpuCore,
    _bus: &mut dyn Platform,
    _insn: &mut Insn,
) -> Result<Flow, Fault> {
    let f = core.state.flags.value();
    core.state.set_reg8(4, f as u8);
    core.charge_ea(false, false);
    Ok(Flow::Continue)
}

/// D7: XLAT.
pub(crate) fn xlat(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let al = u32::from(core.state.reg8(0));
    let base = if insn.addr32 {
        core.state.gpr[EBX]
    } else {
        core.state.gpr[EBX] & 0xFFFF
    };
    let off = CpuCore::ea_offset(insn, base, al);
    let v = core.read_u8(bus, insn.seg_or(SegReg::Ds), off)?;
    core.state.set_reg8(0, v);
    core.charge_ea(true, false);
    Ok(Flow::Continue)
}

/// C8: ENTER imm16, imm8.
pub(crate) fn enter(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let size = u32::from(core.fetch_u16(bus)?);
    let level = core.fetch_u8(bus)? & 0x1F;
    let w = insn.opw();
    let big = core.state.stack32();
    let sp_mask = if big { 0xFFFF_FFFF } else { 0xFFFF };
    let mut bp = core.state.gpr[EBP];
    core.push(bus, bp & w.mask(), insn.op32)?;
    let frame = core.state.sp();
    for _ in 1..level {
        let cur = bp & sp_mask;
        let next = cur.wrapping_sub(w.bytes()) & sp_mask;
        bp = (bp & !sp_mask) | next;
        let v = core.read_mem(bus, SegReg::Ss, next, w)?;
        core.push(bus, v, insn.op32)?;
    }
    if level > 0 {
        core.push(bus, frame, insn.op32)?;
    }
    let new_sp = core.state.sp().wrapping_sub(size) & sp_mask;
    // The lowest byte of the new frame must be writable.
    if size > 0 {
        core.probe_write(bus, SegReg::Ss, new_sp, Width::Byte)?;
    }
    core.state.set_reg(w, EBP as u8, frame);
    core.state.set_sp(new_sp);
    let t = core.model().timings.call;
    core.charge(i64::from(t) + i64::from(level) * 4);
    Ok(Flow::Continue)
}

/// C9: LEAVE.
pub(crate) fn leave(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let bp = core.state.gpr[EBP];
    core.state.set_sp(bp);
    let v = core.pop(bus, insn.op32)?;
    core.state.set_reg(insn.opw(), EBP as u8, v);
    core.charge_ea(true, false);
    Ok(Flow::Continue)
}

/// 0F B6/B7/BE/BF: MOVZX and MOVSX.
pub(crate) fn movzx_movsx(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let src_w = if insn.opcode & 1 == 0 {
        Width::Byte
    } else {
        Width::Word
    };
    let (reg, ea) = core.modrm(bus, insn)?;
    let v = core.read_ea(bus, ea, src_w)?;
    let v = if insn.opcode & 8 != 0 {
        src_w.sext(v)
    } else {
        v
    };
    core.state.set_reg(insn.opw(), reg, v);
    core.charge_ea(ea.is_mem(), false);
    Ok(Flow::Continue)
}

/// 0F C8+r: BSWAP. The 16-bit form clears the register's low word.
pub(crate) fn bswap(
    core: &mut CpuCore,
    _bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let r = insn.opcode & 7;
    if insn.op32 {
        let v = core.state.reg32(r);
        core.state.set_reg32(r, v.swap_bytes());
    } else {
        core.state.set_reg16(r, 0);
    }
    core.charge_ea(false, false);
    Ok(Flow::Continue)
}

/// 0F C0/C1: XADD r/m, reg.
pub(crate) fn xadd(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = insn.width();
    let (reg, ea) = core.modrm(bus, insn)?;
    let dst = core.read_ea(bus, ea, w)?;
    let src = core.state.reg(w, reg);
    let mut f = core.state.flags;
    let sum = alu(&mut f, ADD, w, dst, src);
    if ea.is_mem() {
        core.write_ea(bus, ea, w, sum)?;
        core.state.set_reg(w, reg, dst);
    } else {
        core.state.set_reg(w, reg, dst);
        core.write_ea(bus, ea, w, sum)?;
    }
    core.state.flags = f;
    core.charge_ea(ea.is_mem(), true);
    Ok(Flow::Continue)
}

/// 0F B0/B1: CMPXCHG r/m, reg.
pub(crate) fn cmpxchg(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = insn.width();
    let (reg, ea) = core.modrm(bus, insn)?;
    let dst = core.read_ea(bus, ea, w)?;
    let acc = core.state.reg(w, EAX as u8);
    let mut f = core.state.flags;
    alu(&mut f, CMP, w, acc, dst);
    if acc & w.mask() == dst & w.mask() {
        let src = core.state.reg(w, reg);
        core.write_ea(bus, ea, w, src)?;
    } else {
        // The destination is written back either way.
        core.write_ea(bus, ea, w, dst)?;
        core.state.set_reg(w, EAX as u8, dst);
    }
    core.state.flags = f;
    core.charge_ea(ea.is_mem(), true);
    Ok(Flow::Continue)
}

/// 0F C7 /1: CMPXCHG8B m64.
pub(crate) fn cmpxchg8b(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let (op, ea) = core.modrm(bus, insn)?;
    if op != 1 {
        return Err(Fault::ud());
    }
    let (seg, off) = ea.mem()?;
    let hi_off = CpuCore::ea_offset(insn, off, 4);
    let lo = core.read_mem(bus, seg, off, Width::Dword)?;
    let hi = core.read_mem(bus, seg, hi_off, Width::Dword)?;
    let equal = lo == core.state.gpr[EAX] && hi == core.state.gpr[EDX];
    if equal {
        let (nlo, nhi) = (core.state.gpr[EBX], core.state.gpr[ECX]);
        core.probe_write(bus, seg, hi_off, Width::Dword)?;
        core.write_mem(bus, seg, off, Width::Dword, nlo)?;
        core.write_mem(bus, seg, hi_off, Width::Dword, nhi)?;
    } else {
        core.probe_write(bus, seg, hi_off, Width::Dword)?;
        core.write_mem(bus, seg, off, Width::Dword, lo)?;
        core.write_mem(bus, seg, hi_off, Width::Dword, hi)?;
        core.state.gpr[EAX] = lo;
        core.state.gpr[EDX] = hi;
    }
    core.state.flags.set(FLAG_ZF, equal);
    let t = core.model().timings.mr;
    core.charge(i64::from(t) * 3);
    Ok(Flow::Continue)
}

/// 0F 40-4F: CMOVcc. The source is always read.
pub(crate) fn cmovcc(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = insn.opw();
    let (reg, ea) = core.modrm(bus, insn)?;
    let v = core.read_ea(bus, ea, w)?;
    if core.state.flags.condition(insn.opcode) {
        core.state.set_reg(w, reg, v);
    }
    core.charge_ea(ea.is_mem(), false);
    Ok(Flow::Continue)
}

/// 0F 90-9F: SETcc r/m8.
pub(crate) fn setcc(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let (_, ea) = core.modrm(bus, insn)?;
    let v = u32::from(core.state.flags.condition(insn.opcode));
    core.write_ea(bus, ea, Width::Byte, v)?;
    core.charge_ea(ea.is_mem(), false);
    Ok(Flow::Continue)
}
