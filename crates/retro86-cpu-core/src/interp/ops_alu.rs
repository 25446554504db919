//! Integer arithmetic: the eight ALU rows, INC/DEC, shifts and rotates, group 3
//! (NOT/NEG/MUL/IMUL/DIV/IDIV), IMUL immediate forms and the BCD adjusts.

use crate::exception::Fault;
use crate::flags::{FlagState, LazyFlags, Width, FLAG_AF, FLAG_CF, FLAG_OF};
use crate::model::CpuClass;
use crate::platform::Platform;
use crate::state::{EAX, ECX, EDX};
use crate::CpuCore;

use super::decode::Ea;
use super::{undefined_form, Flow, Insn};

pub const ADD: u8 = 0;
pub const OR: u8 = 1;
pub const ADC: u8 = 2;
pub const SBB: u8 = 3;
pub const AND: u8 = 4;
pub const SUB: u8 = 5;
pub const XOR: u8 = 6;
pub const CMP: u8 = 7;

pub const ROL: u8 = 0;
pub const ROR: u8 = 1;
pub const RCL: u8 = 2;
pub const RCR: u8 = 3;
pub const SHL: u8 = 4;
pub const SHR: u8 = 5;
pub const SAL: u8 = 6;
pub const SAR: u8 = 7;

/// One of the eight ALU operations (`op` is the ModR/M `reg` / opcode row).
/// Returns the result; for CMP that is the difference, which callers discard.
pub fn alu(flags: &mut FlagState, op: u8, w: Width, a: u32, b: u32) -> u32 {
    let m = w.mask();
    let (a, b) = (a & m, b & m);
    match op & 7 {
        ADD => {
            let res = a.wrapping_add(b) & m;
            flags.defer(LazyFlags::Add { a, b, res, w });
            res
        }
        ADC => {
            let carry_in = flags.carry();
            let res = a.wrapping_add(b).wrapping_add(u32::from(carry_in)) & m;
            flags.defer(LazyFlags::Adc {
                a,
                b,
                carry_in,
                res,
                w,
            });
            res
        }
        SBB => {
            let carry_in = flags.carry();
            let res = a.wrapping_sub(b).wrapping_sub(u32::from(carry_in)) & m;
            flags.defer(LazyFlags::Sbb {
                a,
                b,
                carry_in,
                res,
                w,
            });
            res
        }
        SUB | CMP => {
            let res = a.wrapping_sub(b) & m;
            flags.defer(LazyFlags::Sub { a, b, res, w });
            res
        }
        op => {
            let res = match op {
                OR => a | b,
                AND => a & b,
                _ => a ^ b,
            };
            flags.defer(LazyFlags::Logic { res, w });
            res
        }
    }
}

/// Shift or rotate `a` by an already-masked `count`. A zero count leaves both
/// the operand and the flags untouched.
pub fn shift(flags: &mut FlagState, op: u8, w: Width, a: u32, count: u32) -> u32 {
    let m = w.mask();
    let bits = w.bits();
    let a = a & m;
    if count == 0 {
        return a;
    }
    match op & 7 {
        ROL | ROR => {
            let n = count % bits;
            let res = if op & 7 == ROL {
                ((a << n) | (a >> ((bits - n) % bits))) & m
            } else {
                ((a >> n) | (a << ((bits - n) % bits))) & m
            };
            let msb = res & w.sign() != 0;
            let (cf, of) = if op & 7 == ROL {
                let cf = res & 1 != 0;
                (cf, msb != cf)
            } else {
                (msb, msb != (res & (w.sign() >> 1) != 0))
            };
            flags.materialize();
            flags.set(FLAG_CF, cf);
            flags.set(FLAG_OF, of);
            res
        }
        RCL | RCR => {
            let n = count % (bits + 1);
            let mut cf = flags.carry();
            let mut res = a;
            let of_before = (a & w.sign() != 0) != cf;
            for _ in 0..n {
                if op & 7 == RCL {
                    let out = res & w.sign() != 0;
                    res = ((res << 1) | u32::from(cf)) & m;
                    cf = out;
                } else {
                    let out = res & 1 != 0;
                    res = (res >> 1) | if cf { w.sign() } else { 0 };
                    cf = out;
                }
            }
            let of = if op & 7 == RCL {
                (res & w.sign() != 0) != cf
            } else {
                of_before
            };
            flags.materialize();
            flags.set(FLAG_CF, cf);
            flags.set(FLAG_OF, of);
            res
        }
        SHL | SAL => {
            if count > bits {
                // Count past the width: 8086 unmasked counts, or 17-31 on a byte or word operand.
                flags.defer(LazyFlags::Logic { res: 0, w });
                return 0;
            }
            let res = ((u64::from(a) << count) as u32) & m;
            flags.defer(LazyFlags::Shl {
                a,
                count: count as u8,
                res,
                w,
            });
            res
        }
        SHR => {
            if count > bits {
                flags.defer(LazyFlags::Logic { res: 0, w });
                return 0;
            }
            let res = (u64::from(a) >> count) as u32;
            flags.defer(LazyFlags::Shr {
                a,
                count: count as u8,
                res,
                w,
            });
            res
        }
        _ => {
            let sa = i64::from(w.sext(a) as i32);
            let res = (sa >> count.min(63)) as u32 & m;
            flags.defer(LazyFlags::Sar {
                a,
                count: count.min(255) as u8,
                res,
                w,
            });
            res
        }
    }
}

/// Shift counts are masked to five bits from the 186 on.
#[inline]
fn mask_count(core: &CpuCore, count: u32) -> u32 {
    if core.model().at_least(CpuClass::I186) {
        count & 0x1F
    } else {
        count & 0xFF
    }
}

/// Apply `op` to an r/m destination. Flags are committed only after the write.
fn alu_to_ea(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    op: u8,
    w: Width,
    ea: Ea,
    b: u32,
) -> Result<(), Fault> {
    let a = core.read_ea(bus, ea, w)?;
    let mut f = core.state.flags;
    let res = alu(&mut f, op, w, a, b);
    if op != CMP {
        core.write_ea(bus, ea, w, res)?;
    }
    core.state.flags = f;
    core.charge_ea(ea.is_mem(), op != CMP);
    Ok(())
}

/// 00-3D: `op r/m, reg`, `op reg, r/m`, `op acc, imm`.
pub(crate) fn alu_std(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let op = (insn.opcode >> 3) & 7;
    let w = insn.width();
    match insn.opcode & 7 {
        0 | 1 => {
            let (reg, ea) = core.modrm(bus, insn)?;
            let b = core.state.reg(w, reg);
            alu_to_ea(core, bus, op, w, ea, b)?;
        }
        2 | 3 => {
            let (reg, ea) = core.modrm(bus, insn)?;
            let b = core.read_ea(bus, ea, w)?;
            alu_to_ea(core, bus, op, w, Ea::Reg(reg), b)?;
            if ea.is_mem() {
                let t = core.model().timings.rm;
                core.charge(i64::from(t.saturating_sub(core.model().timings.rr)));
            }
        }
        _ => {
            let b = core.fetch_imm(bus, w)?;
            alu_to_ea(core, bus, op, w, Ea::Reg(EAX as u8), b)?;
        }
    }
    Ok(Flow::Continue)
}

/// 80-83: `op r/m, imm`.
pub(crate) fn group1(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = if insn.opcode & 1 == 0 {
        Width::Byte
    } else {
        insn.opw()
    };
    let (op, ea) = core.modrm(bus, insn)?;
    let b = if insn.opcode == 0x83 {
        w.sext(u32::from(core.fetch_u8(bus)?))
    } else {
        core.fetch_imm(bus, w)?
    };
    alu_to_ea(core, bus, op, w, ea, b)?;
    Ok(Flow::Continue)
}

/// 84/85: TEST r/m, reg.
pub(crate) fn test_rm(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = insn.width();
    let (reg, ea) = core.modrm(bus, insn)?;
    let b = core.state.reg(w, reg);
    let a = core.read_ea(bus, ea, w)?;
    alu(&mut core.state.flags, AND, w, a, b);
    core.charge_ea(ea.is_mem(), false);
    Ok(Flow::Continue)
}

/// A8/A9: TEST acc, imm.
pub(crate) fn test_acc(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = insn.width();
    let b = core.fetch_imm(bus, w)?;
    let a = core.state.reg(w, EAX as u8);
    alu(&mut core.state.flags, AND, w, a, b);
    core.charge_ea(false, false);
    Ok(Flow::Continue)
}

/// INC/DEC of `a`, deferring the flags.
pub fn inc_dec(flags: &mut FlagState, dec: bool, w: Width, a: u32) -> u32 {
    let a = a & w.mask();
    if dec {
        let res = a.wrapping_sub(1) & w.mask();
        flags.defer(LazyFlags::Dec { a, res, w });
        res
    } else {
        let res = a.wrapping_add(1) & w.mask();
        flags.defer(LazyFlags::Inc { a, res, w });
        res
    }
}

/// INC/DEC on an r/m operand; shared with group 5.
pub(crate) fn inc_dec_ea(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    dec: bool,
    w: Width,
    ea: Ea,
) -> Result<(), Fault> {
    let a = core.read_ea(bus, ea, w)?;
    let mut f = core.state.flags;
    let res = inc_dec(&mut f, dec, w, a);
    core.write_ea(bus, ea, w, res)?;
    core.state.flags = f;
    core.charge_ea(ea.is_mem(), true);
    Ok(())
}

/// 40-4F: INC/DEC reg.
pub(crate) fn inc_dec_reg(
    core: &mut CpuCore,
    _bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = insn.opw();
    let r = insn.opcode & 7;
    let a = core.state.reg(w, r);
    let res = inc_dec(&mut core.state.flags, insn.opcode & 8 != 0, w, a);
    core.state.set_reg(w, r, res);
    core.charge_ea(false, false);
    Ok(Flow::Continue)
}

/// FE: INC/DEC r/m8.
pub(crate) fn group4(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let (op, ea) = core.modrm(bus, insn)?;
    match op {
        0 | 1 => {
            inc_dec_ea(core, bus, op == 1, Width::Byte, ea)?;
            Ok(Flow::Continue)
        }
        _ => undefined_form(core),
    }
}

/// C0/C1/D0-D3: shifts and rotates.
pub(crate) fn group2(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = insn.width();
    let (op, ea) = core.modrm(bus, insn)?;
    let raw = match insn.opcode {
        0xC0 | 0xC1 => u32::from(core.fetch_u8(bus)?),
        0xD0 | 0xD1 => 1,
        _ => core.state.gpr[ECX] & 0xFF,
    };
    let count = mask_count(core, raw);
    let a = core.read_ea(bus, ea, w)?;
    let mut f = core.state.flags;
    let res = shift(&mut f, op, w, a, count);
    if count != 0 {
        core.write_ea(bus, ea, w, res)?;
        core.state.flags = f;
    }
    core.charge_ea(ea.is_mem(), true);
    if !core.model().at_least(CpuClass::I286) && insn.opcode >= 0xD2 {
        core.charge(i64::from(count) * 4);
    }
    Ok(Flow::Continue)
}

/// F6/F7: TEST imm, NOT, NEG, MUL, IMUL, DIV, IDIV.
pub(crate) fn group3(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = insn.width();
    let (op, ea) = core.modrm(bus, insn)?;
    match op {
        0 | 1 => {
            let b = core.fetch_imm(bus, w)?;
            let a = core.read_ea(bus, ea, w)?;
            alu(&mut core.state.flags, AND, w, a, b);
            core.charge_ea(ea.is_mem(), false);
        }
        2 => {
            let a = core.read_ea(bus, ea, w)?;
            core.write_ea(bus, ea, w, !a & w.mask())?;
            core.charge_ea(ea.is_mem(), true);
        }
        3 => {
            let a = core.read_ea(bus, ea, w)? & w.mask();
            let res = a.wrapping_neg() & w.mask();
            core.write_ea(bus, ea, w, res)?;
            core.state.flags.defer(LazyFlags::Neg { a, res, w });
            core.charge_ea(ea.is_mem(), true);
        }
        4 | 5 => {
            let src = core.read_ea(bus, ea, w)?;
            multiply(core, w, src, op == 5);
        }
        _ => {
            let src = core.read_ea(bus, ea, w)?;
            divide(core, w, src, op == 7)?;
        }
    }
    Ok(Flow::Continue)
}

fn set_mul_flags(core: &mut CpuCore, w: Width, low: u32, overflow: bool) {
    let f = &mut core.state.flags;
    f.defer(LazyFlags::Logic { res: low, w });
    f.set(FLAG_CF, overflow);
    f.set(FLAG_OF, overflow);
}

/// One-operand MUL/IMUL into AX, DX:AX or EDX:EAX.
fn multiply(core: &mut CpuCore, w: Width, src: u32, signed: bool) {
    let acc = core.state.reg(w, EAX as u8);
    let (low, high, overflow) = if signed {
        let p = i64::from(w.sext(acc) as i32) * i64::from(w.sext(src) as i32);
        let low = p as u32 & w.mask();
        let high = (p >> w.bits()) as u32 & w.mask();
        (low, high, i64::from(w.sext(low) as i32) != p)
    } else {
        let p = u64::from(acc & w.mask()) * u64::from(src & w.mask());
        let low = p as u32 & w.mask();
        let high = (p >> w.bits()) as u32 & w.mask();
        (low, high, high != 0)
    };
    match w {
        Width::Byte => core.state.set_reg16(EAX as u8, (low | high << 8) as u16),
        _ => {
            core.state.set_reg(w, EAX as u8, low);
            core.state.set_reg(w, EDX as u8, high);
        }
    }
    set_mul_flags(core, w, low, overflow);
    let t = core.model().timings.mul;
    core.charge(i64::from(t));
}

/// One-operand DIV/IDIV. #DE on a zero divisor or a quotient that does not
/// fit, with the dividend untouched.
fn divide(core: &mut CpuCore, w: Width, src: u32, signed: bool) -> Result<(), Fault> {
    let bits = w.bits();
    let dividend: u64 = match w {
        Width::Byte => u64::from(core.state.reg16(EAX as u8)),
        _ => {
            u64::from(core.state.reg(w, EAX as u8))
                | u64::from(core.state.reg(w, EDX as u8)) << bits
        }
    };
    let divisor = src & w.mask();
    if divisor == 0 {
        return Err(Fault::de());
    }
    let (q, r) = if signed {
        let n = match w {
            Width::Byte => i64::from(dividend as u16 as i16),
            Width::Word => i64::from(dividend as u32 as i32),
            Width::Dword => dividend as i64,
        };
        let d = i64::from(w.sext(divisor) as i32);
        let Some(q) = n.checked_div(d) else {
            return Err(Fault::de());
        };
        let r = n.wrapping_rem(d);
        let half = 1i64 << (bits - 1);
        if q >= half || q < -half {
            return Err(Fault::de());
        }
        (q as u32 & w.mask(), r as u32 & w.mask())
    } else {
        let q = dividend / u64::from(divisor);
        if q > u64::from(w.mask()) {
            return Err(Fault::de());
        }
        (q as u32, (dividend % u64::from(divisor)) as u32)
    };
    match w {
        Width::Byte => core.state.set_reg16(EAX as u8, (q | r << 8) as u16),
        _ => {
            core.state.set_reg(w, EAX as u8, q);
            core.state.set_reg(w, EDX as u8, r);
        }
    }
    let t = core.model().timings.div;
    core.charge(i64::from(t));
    Ok(())
}

/// Truncating signed multiply shared by the two- and three-operand forms.
fn imul_trunc(core: &mut CpuCore, w: Width, a: u32, b: u32) -> u32 {
    let p = i64::from(w.sext(a) as i32) * i64::from(w.sext(b) as i32);
    let low = p as u32 & w.mask();
    set_mul_flags(core, w, low, i64::from(w.sext(low) as i32) != p);
    let t = core.model().timings.mul;
    core.charge(i64::from(t));
    low
}

/// 69/6B: IMUL reg, r/m, imm.
pub(crate) fn imul_imm(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = insn.opw();
    let (reg, ea) = core.modrm(bus, insn)?;
    let imm = if insn.opcode == 0x6B {
        w.sext(u32::from(core.fetch_u8(bus)?))
    } else {
        core.fetch_imm(bus, w)?
    };
    let a = core.read_ea(bus, ea, w)?;
    let res = imul_trunc(core, w, a, imm);
    core.state.set_reg(w, reg, res);
    Ok(Flow::Continue)
}

/// 0F AF: IMUL reg, r/m.
pub(crate) fn imul_r_rm(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = insn.opw();
    let (reg, ea) = core.modrm(bus, insn)?;
    let b = core.read_ea(bus, ea, w)?;
    let a = core.state.reg(w, reg);
    let res = imul_trunc(core, w, a, b);
    core.state.set_reg(w, reg, res);
    Ok(Flow::Continue)
}

fn set_al(core: &mut CpuCore, al: u8) {
    core.state.set_reg8(0, al);
}

/// 27: DAA.
pub(crate) fn daa(
    core: &mut CpuCore,
    _bus: &mut dyn Platform,
    _insn: &mut Insn,
) -> Result<Flow, Fault> {
    let old_al = core.state.reg8(0);
    let old_cf = core.state.flags.carry();
    let mut al = old_al;
    let af = old_al & 0x0F > 9 || core.state.flags.get(FLAG_AF);
    if af {
        al = al.wrapping_add(6);
    }
    let cf = old_cf || old_al > 0x99;
    if cf {
        al = al.wrapping_add(0x60);
    }
    bcd_flags(core, al, af, cf);
    Ok(Flow::Continue)
}

/// 2F: DAS.
pub(crate) fn das(
    core: &mut CpuCore,
    _bus: &mut dyn Platform,
    _insn: &mut Insn,
) -> Result<Flow, Fault> {
    let old_al = core.state.reg8(0);
    let old_cf = core.state.flags.carry();
    let mut al = old_al;
    let af = old_al & 0x0F > 9 || core.state.flags.get(FLAG_AF);
    let mut cf = false;
    if af {
        al = al.wrapping_sub(6);
        cf = old_cf || old_al < 6;
    }
    if old_cf || old_al > 0x99 {
        al = al.wrapping_sub(0x60);
        cf = true;
    }
    bcd_flags(core, al, af, cf);
    Ok(Flow::Continue)
}

fn bcd_flags(core: &mut CpuCore, al: u8, af: bool, cf: bool) {
    set_al(core, al);
    let f = &mut core.state.flags;
    f.defer(LazyFlags::Logic {
        res: u32::from(al),
        w: Width::Byte,
    });
    f.set(FLAG_AF, af);
    f.set(FLAG_CF, cf);
    let rr = core.model().timings.rr;
    core.charge(i64::from(rr) * 2);
}

/// 37/3F: AAA and AAS.
fn ascii_adjust(core: &mut CpuCore, sub: bool) {
    let al = core.state.reg8(0);
    let ah = core.state.reg8(4);
    let adjust = al & 0x0F > 9 || core.state.flags.get(FLAG_AF);
    let wide = core.model().at_least(CpuClass::I286);
    let (al, ah) = if !adjust {
        (al, ah)
    } else if sub {
        let ax = if wide {
            core.state.reg16(0).wrapping_sub(6)
        } else {
            u16::from(ah) << 8 | u16::from(al.wrapping_sub(6))
        };
        ((ax & 0xFF) as u8, ((ax >> 8) as u8).wrapping_sub(1))
    } else {
        let ax = if wide {
            core.state.reg16(0).wrapping_add(6)
        } else {
            u16::from(ah) << 8 | u16::from(al.wrapping_add(6))
        };
        ((ax & 0xFF) as u8, ((ax >> 8) as u8).wrapping_add(1))
    };
    core.state.set_reg16(0, u16::from(ah) << 8 | u16::from(al & 0x0F));
    let f = &mut core.state.flags;
    f.materialize();
    f.set(FLAG_AF, adjust);
    f.set(FLAG_CF, adjust);
    let rr = core.model().timings.rr;
    core.charge(i64::from(rr) * 3);
}

pub(crate) fn aaa(
    core: &mut CpuCore,
    _bus: &mut dyn Platform,
    _insn: &mut Insn,
) -> Result<Flow, Fault> {
    ascii_adjust(core, false);
    Ok(Flow::Continue)
}

pub(crate) fn aas(
    core: &mut CpuCore,
    _bus: &mut dyn Platform,
    _insn: &mut Insn,
) -> Result<Flow, Fault> {
    ascii_adjust(core, true);
    Ok(Flow::Continue)
}

/// D4 ib: AAM. A zero base raises #DE.
pub(crate) fn aam(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    _insn: &mut Insn,
) -> Result<Flow, Fault> {
    let base = core.fetch_u8(bus)?;
    if base == 0 {
        return Err(Fault::de());
    }
    let al = core.state.reg8(0);
    let (ah, al) = (al / base, al % base);
    core.state.set_reg16(0, u16::from(ah) << 8 | u16::from(al));
    core.state.flags.defer(LazyFlags::Logic {
        res: u32::from(al),
        w: Width::Byte,
    });
    let t = core.model().timings.div;
    core.charge(i64::from(t) / 2);
    Ok(Flow::Continue)
}

/// D5 ib: AAD.
pub(crate) fn aad(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    _insn: &mut Insn,
) -> Result<Flow, Fault> {
    let base = core.fetch_u8(bus)?;
    let al = core.state.reg8(0);
    let ah = core.state.reg8(4);
    let al = ah.wrapping_mul(base).wrapping_add(al);
    core.state.set_reg16(0, u16::from(al));
    core.state.flags.defer(LazyFlags::Logic {
        res: u32::from(al),
        w: Width::Byte,
    });
    let t = core.model().timings.mul;
    core.charge(i64::from(t) / 2);
    Ok(Flow::Continue)
}

/// D6: SALC (AL = CF ? FF : 00).
pub(crate) fn salc(
    core: &mut CpuCore,
    _bus: &mut dyn Platform,
    _insn: &mut Insn,
) -> Result<Flow, Fault> {
    let v = if core.state.flags.carry() { 0xFF } else { 0 };
    set_al(core, v);
    core.charge_ea(false, false);
    Ok(Flow::Continue)
}

/// 98: CBW / CWDE.
pub(crate) fn cbw(
    core: &mut CpuCore,
    _bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    if insn.op32 {
        let ax = core.state.reg16(0);
        core.state.gpr[EAX] = Width::Word.sext(u32::from(ax));
    } else {
        let al = core.state.reg8(0);
        core.state
            .set_reg16(0, Width::Byte.sext(u32::from(al)) as u16);
    }
    core.charge_ea(false, false);
    Ok(Flow::Continue)
}

/// 99: CWD / CDQ.
pub(crate) fn cwd(
    core: &mut CpuCore,
    _bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = insn.opw();
    let acc = core.state.reg(w, EAX as u8);
    let fill = if acc & w.sign() != 0 { w.mask() } else { 0 };
    core.state.set_reg(w, EDX as u8, fill);
    core.charge_ea(false, false);
    Ok(Flow::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exception::Exception;
    use crate::flags::{FLAG_PF, FLAG_SF, FLAG_ZF};
    use crate::state::EBX;
    use crate::test_util::{protected_core, real_core, run_bytes};

    #[test]
    fn sbb_consumes_carry() {
        let mut f = FlagState::default();
        f.set(FLAG_CF, true);
        let r = alu(&mut f, SBB, Width::Byte, 0x10, 0x0F);
        assert_eq!(r, 0);
        assert!(f.get(FLAG_ZF));
        assert!(!f.carry());
    }

    #[test]
    fn cmp_sets_flags_only() {
        let mut f = FlagState::default();
        let r = alu(&mut f, CMP, Width::Dword, 5, 7);
        assert_eq!(r, 0xFFFF_FFFE);
        assert!(f.carry());
        assert!(f.get(FLAG_SF));
    }

    #[test]
    fn rotates_update_only_cf_and_of() {
        let mut f = FlagState::default();
        alu(&mut f, XOR, Width::Byte, 1, 1);
        let r = shift(&mut f, ROL, Width::Byte, 0x81, 1);
        assert_eq!(r, 0x03);
        assert!(f.carry());
        // ZF from the XOR survives.
        assert!(f.get(FLAG_ZF));

        let r = shift(&mut f, RCR, Width::Word, 0x0001, 1);
        // CF was 1 going in.
        assert_eq!(r, 0x8000);
        assert!(f.carry());
    }

    #[test]
    fn zero_count_is_a_no_op() {
        let mut f = FlagState::default();
        alu(&mut f, SUB, Width::Byte, 0, 1);
        let before = f.value();
        assert_eq!(shift(&mut f, SHL, Width::Byte, 0x55, 0), 0x55);
        assert_eq!(f.value(), before);
    }

    #[test]
    fn unmasked_8086_shift_clears_operand() {
        let (mut core, mut bus) = real_core("8086");
        core.state.gpr[EAX] = 0x00FF;
        core.state.gpr[ECX] = 0x20;
        // SHL AL, CL
        run_bytes(&mut core, &mut bus, &[0xD2, 0xE0]).unwrap();
        assert_eq!(core.state.reg8(0), 0);

        let (mut core, mut bus) = real_core("80186");
        core.state.gpr[EAX] = 0x00FF;
        core.state.gpr[ECX] = 0x20;
        run_bytes(&mut core, &mut bus, &[0xD2, 0xE0]).unwrap();
        // Count masked to zero on the 186.
        assert_eq!(core.state.reg8(0), 0xFF);
    }

    #[test]
    fn divide_by_zero_leaves_dividend() {
        let (mut core, mut bus) = protected_core("386DX");
        core.state.gpr[EAX] = 0x1234_5678;
        core.state.gpr[EDX] = 0x9;
        core.state.gpr[EBX] = 0;
        // DIV EBX
        let err = run_bytes(&mut core, &mut bus, &[0xF7, 0xF3]).unwrap_err();
        assert_eq!(err.exception, Exception::DivideError);
        assert_eq!(core.state.gpr[EAX], 0x1234_5678);
        assert_eq!(core.state.gpr[EDX], 0x9);
    }

    #[test]
    fn idiv_overflow_faults() {
        let (mut core, mut bus) = real_core("8086");
        core.state.gpr[EAX] = 0x8000;
        core.state.gpr[EBX] = 0xFF;
        // IDIV BL: -32768 / -1 does not fit in AL.
        let err = run_bytes(&mut core, &mut bus, &[0xF6, 0xFB]).unwrap_err();
        assert_eq!(err.exception, Exception::DivideError);
        assert_eq!(core.state.gpr[EAX], 0x8000);
    }

    #[test]
    fn mul_sets_carry_on_high_half() {
        let (mut core, mut bus) = real_core("8086");
        core.state.gpr[EAX] = 0x0080;
        core.state.gpr[EBX] = 0x0002;
        // MUL BL
        run_bytes(&mut core, &mut bus, &[0xF6, 0xE3]).unwrap();
        assert_eq!(core.state.reg16(0), 0x0100);
        assert!(core.state.flags.carry());
        assert!(core.state.flags.get(FLAG_OF));
    }

    #[test]
    fn daa_adjusts_packed_bcd() {
        let (mut core, mut bus) = real_core("8086");
        // MOV AL, 0x19; ADD AL, 0x28; DAA
        run_bytes(&mut core, &mut bus, &[0xB0, 0x19, 0x04, 0x28, 0x27]).unwrap();
        assert_eq!(core.state.reg8(0), 0x47);
        assert!(!core.state.flags.carry());
    }

    #[test]
    fn das_adjusts_packed_bcd() {
        let (mut core, mut bus) = real_core("8086");
        // MOV AL, 0x47; SUB AL, 0x28; DAS
        run_bytes(&mut core, &mut bus, &[0xB0, 0x47, 0x2C, 0x28, 0x2F]).unwrap();
        assert_eq!(core.state.reg8(0), 0x19);
        assert!(!core.state.flags.carry());
    }

    #[test]
    fn das_low_digit_borrow_sets_carry() {
        let (mut core, mut bus) = real_core("8086");
        // MOV AL, 0x10; SUB AL, 0x0D leaves AL=03 with AF set and CF clear.
        run_bytes(&mut core, &mut bus, &[0xB0, 0x10, 0x2C, 0x0D, 0x2F]).unwrap();
        assert_eq!(core.state.reg8(0), 0xFD);
        assert!(core.state.flags.carry());
        assert!(core.state.flags.get(FLAG_AF));
    }

    #[test]
    fn aam_splits_digits_and_sets_parity() {
        let (mut core, mut bus) = real_core("8086");
        core.state.gpr[EAX] = 63;
        run_bytes(&mut core, &mut bus, &[0xD4, 0x0A]).unwrap();
        assert_eq!(core.state.reg16(0), 0x0603);
        assert!(core.state.flags.get(FLAG_PF));
        let err = run_bytes(&mut core, &mut bus, &[0xD4, 0x00]).unwrap_err();
        assert_eq!(err.exception, Exception::DivideError);
    }

    #[test]
    fn imul_three_operand_truncates() {
        let (mut core, mut bus) = protected_core("386DX");
        core.state.gpr[EBX] = 0x4000_0000;
        // IMUL EAX, EBX, 4
        run_bytes(&mut core, &mut bus, &[0x6B, 0xC3, 0x04]).unwrap();
        assert_eq!(core.state.gpr[EAX], 0);
        assert!(core.state.flags.get(FLAG_OF));
    }
}
