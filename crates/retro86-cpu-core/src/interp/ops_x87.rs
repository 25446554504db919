//! x87 subset on an `f64` register stack.
//!
//! Escape opcodes D8-DF are decoded here into loads, stores, arithmetic,
//! comparisons and control-word operations. Values are held in double
//! precision; extended-precision formats and the environment save/restore
//! instructions are not modelled.

use tracing::debug;

use crate::exception::Fault;
use crate::flags::Width;
use crate::model::{CpuClass, Features};
use crate::platform::Platform;
use crate::state::{
    FpuState, SegReg, CR0_EM, CR0_MP, CR0_NE, CR0_TS, EAX, FPU_SW_B, FPU_SW_ES, FPU_SW_IE,
    FPU_SW_ZE,
};
use crate::CpuCore;

use super::decode::Ea;
use super::{Flow, Insn};

const CW_IM: u16 = 1 << 0;
const CW_ZM: u16 = 1 << 2;
const CW_RC_SHIFT: u16 = 10;

/// Exception bits FNCLEX clears: the six flags, SF, ES and B.
const SW_CLEAR_MASK: u16 = 0x80FF;

/// Raise #MF for a pending unmasked exception when CR0.NE selects native
/// reporting. With NE clear the error would reach the PIC through FERR#,
/// which the platform owns.
fn check_pending(core: &CpuCore) -> Result<(), Fault> {
    if core.state.fpu.sw & FPU_SW_ES != 0 && core.state.cr0 & CR0_NE != 0 {
        return Err(Fault::mf());
    }
    Ok(())
}

/// 9B: FWAIT.
pub(crate) fn fwait(
    core: &mut CpuCore,
    _bus: &mut dyn Platform,
    _insn: &mut Insn,
) -> Result<Flow, Fault> {
    let cr0 = core.state.cr0;
    if cr0 & CR0_TS != 0 && cr0 & CR0_MP != 0 {
        return Err(Fault::nm());
    }
    if core.model().has(Features::FPU) {
        check_pending(core)?;
    }
    core.charge_ea(false, false);
    Ok(Flow::Continue)
}

/// Source operand read from the stack. An empty register is a stack fault;
/// with the invalid-operation exception masked the indefinite NaN is used.
fn stack_operand(fpu: &mut FpuState, i: u8) -> Option<f64> {
    if fpu.is_empty(i) {
        fpu.stack_fault(false);
        if fpu.cw & CW_IM != 0 {
            return Some(f64::NAN);
        }
        return None;
    }
    Some(fpu.st(i))
}

/// Arithmetic by ModR/M `reg` field: FADD, FMUL, FCOM, FCOMP, FSUB, FSUBR,
/// FDIV, FDIVR with `a` the destination.
fn arith(fpu: &mut FpuState, op: u8, a: f64, b: f64) -> Option<f64> {
    let divisor = match op {
        6 => b,
        7 => a,
        _ => 1.0,
    };
    if divisor == 0.0 && op >= 6 {
        let dividend = if op == 6 { a } else { b };
        if dividend != 0.0 && dividend.is_finite() {
            fpu.sw |= FPU_SW_ZE;
            if fpu.cw & CW_ZM == 0 {
                fpu.sw |= FPU_SW_ES | FPU_SW_B;
                return None;
            }
        }
    }
    Some(match op {
        0 => a + b,
        1 => a * b,
        4 => a - b,
        5 => b - a,
        6 => a / b,
        _ => b / a,
    })
}

/// Set C3/C2/C0 from a comparison of `a` with `b`.
fn compare(fpu: &mut FpuState, a: f64, b: f64) {
    match a.partial_cmp(&b) {
        Some(std::cmp::Ordering::Greater) => fpu.set_condition(false, false, false),
        Some(std::cmp::Ordering::Less) => fpu.set_condition(false, false, true),
        Some(std::cmp::Ordering::Equal) => fpu.set_condition(true, false, false),
        None => fpu.set_condition(true, true, true),
    }
}

/// Round by the control word's rounding-control field.
fn round(cw: u16, v: f64) -> f64 {
    match (cw >> CW_RC_SHIFT) & 3 {
        0 => {
            let r = v.round();
            if (v - v.trunc()).abs() == 0.5 {
                2.0 * (v / 2.0).round()
            } else {
                r
            }
        }
        1 => v.floor(),
        2 => v.ceil(),
        _ => v.trunc(),
    }
}

/// Convert to an integer of `bits` width; out-of-range values are an invalid
/// operation that stores the integer indefinite when masked.
fn to_int(fpu: &mut FpuState, v: f64, bits: u32) -> Option<i64> {
    let r = round(fpu.cw, v);
    let max = (1i128 << (bits - 1)) as f64;
    if r.is_nan() || r >= max || r < -max {
        fpu.sw |= FPU_SW_IE;
        if fpu.cw & CW_IM == 0 {
            fpu.sw |= FPU_SW_ES | FPU_SW_B;
            return None;
        }
        return Some(i64::MIN >> (64 - bits));
    }
    Some(r as i64)
}

fn read_m64(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &Insn,
    seg: SegReg,
    off: u32,
) -> Result<u64, Fault> {
    let lo = core.read_mem(bus, seg, off, Width::Dword)?;
    let hi_off = CpuCore::ea_offset(insn, off, 4);
    let hi = core.read_mem(bus, seg, hi_off, Width::Dword)?;
    Ok(u64::from(lo) | (u64::from(hi) << 32))
}

fn write_m64(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &Insn,
    seg: SegReg,
    off: u32,
    v: u64,
) -> Result<(), Fault> {
    let hi_off = CpuCore::ea_offset(insn, off, 4);
    core.probe_write(bus, seg, hi_off, Width::Dword)?;
    core.write_mem(bus, seg, off, Width::Dword, v as u32)?;
    core.write_mem(bus, seg, hi_off, Width::Dword, (v >> 32) as u32)
}

/// Memory operand formats of the escape opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemFormat {
    F32,
    F64,
    I16,
    I32,
    I64,
}

fn load_mem(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &Insn,
    fmt: MemFormat,
    seg: SegReg,
    off: u32,
) -> Result<f64, Fault> {
    Ok(match fmt {
        MemFormat::F32 => f64::from(f32::from_bits(core.read_mem(bus, seg, off, Width::Dword)?)),
        MemFormat::F64 => f64::from_bits(read_m64(core, bus, insn, seg, off)?),
        MemFormat::I16 => f64::from(core.read_mem(bus, seg, off, Width::Word)? as u16 as i16),
        MemFormat::I32 => f64::from(core.read_mem(bus, seg, off, Width::Dword)? as i32),
        MemFormat::I64 => read_m64(core, bus, insn, seg, off)? as i64 as f64,
    })
}

/// Store ST(0) in `fmt`. Returns false when an unmasked exception suppressed
/// the store.
fn store_mem(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &Insn,
    fmt: MemFormat,
    seg: SegReg,
    off: u32,
) -> Result<bool, Fault> {
    let mut fpu = core.state.fpu;
    let Some(v) = stack_operand(&mut fpu, 0) else {
        core.state.fpu = fpu;
        return Ok(false);
    };
    let int_bits = match fmt {
        MemFormat::I16 => Some(16),
        MemFormat::I32 => Some(32),
        MemFormat::I64 => Some(64),
        _ => None,
    };
    let int = match int_bits {
        Some(bits) => match to_int(&mut fpu, v, bits) {
            Some(i) => Some(i),
            None => {
                core.state.fpu = fpu;
                return Ok(false);
            }
        },
        None => None,
    };
    match (fmt, int) {
        (MemFormat::F32, _) => {
            core.write_mem(bus, seg, off, Width::Dword, (v as f32).to_bits())?
        }
        (MemFormat::F64, _) => write_m64(core, bus, insn, seg, off, v.to_bits())?,
        (MemFormat::I16, Some(i)) => core.write_mem(bus, seg, off, Width::Word, i as u32)?,
        (MemFormat::I32, Some(i)) => core.write_mem(bus, seg, off, Width::Dword, i as u32)?,
        (_, i) => write_m64(core, bus, insn, seg, off, i.unwrap_or(i64::MIN) as u64)?,
    }
    core.state.fpu = fpu;
    Ok(true)
}

/// D8-DF: floating-point escape.
pub(crate) fn esc(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let esc = insn.opcode & 7;
    let has_fpu = core.model().has(Features::FPU);
    if core.model().at_least(CpuClass::I286) {
        let cr0 = core.state.cr0;
        if !has_fpu || cr0 & (CR0_EM | CR0_TS) != 0 {
            return Err(Fault::nm());
        }
    }
    let (reg, ea) = core.modrm(bus, insn)?;
    if !has_fpu {
        // No coprocessor on the bus: the operand is decoded and ignored.
        core.charge_ea(ea.is_mem(), false);
        return Ok(Flow::Continue);
    }
    let t = core.model().timings.fpu;
    core.charge(i64::from(t));
    match ea {
        Ea::Mem { seg, offset } => esc_mem(core, bus, insn, esc, reg, seg, offset)?,
        Ea::Reg(rm) => esc_reg(core, esc, reg, rm)?,
    }
    Ok(Flow::Continue)
}

/// Instructions without the implicit wait: they never report pending errors.
fn no_wait(esc: u8, reg: u8, mem: bool, rm: u8) -> bool {
    match (esc, mem) {
        (1, true) => matches!(reg, 4..=7),
        (3, false) => reg == 4 && matches!(rm, 2 | 3),
        (5, true) => matches!(reg, 4 | 6 | 7),
        (7, false) => reg == 4 && rm == 0,
        _ => false,
    }
}

fn esc_mem(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &Insn,
    esc: u8,
    reg: u8,
    seg: SegReg,
    off: u32,
) -> Result<(), Fault> {
    if !no_wait(esc, reg, true, 0) {
        check_pending(core)?;
    }
    let arith_fmt = match esc {
        0 => Some(MemFormat::F32),
        2 => Some(MemFormat::I32),
        4 => Some(MemFormat::F64),
        6 => Some(MemFormat::I16),
        _ => None,
    };
    if let Some(fmt) = arith_fmt {
        let b = load_mem(core, bus, insn, fmt, seg, off)?;
        let mut fpu = core.state.fpu;
        let Some(a) = stack_operand(&mut fpu, 0) else {
            core.state.fpu = fpu;
            return Ok(());
        };
        match reg {
            2 | 3 => {
                compare(&mut fpu, a, b);
                if reg == 3 {
                    fpu.pop();
                }
            }
            op => {
                if let Some(r) = arith(&mut fpu, op, a, b) {
                    fpu.set_st(0, r);
                }
            }
        }
        core.state.fpu = fpu;
        return Ok(());
    }

    let load_store_fmt = match (esc, reg) {
        (1, 0 | 2 | 3) => MemFormat::F32,
        (3, 0 | 2 | 3) => MemFormat::I32,
        (5, 0 | 2 | 3) => MemFormat::F64,
        (7, 0 | 2 | 3) => MemFormat::I16,
        (7, 5 | 7) => MemFormat::I64,
        (1, 5) => {
            core.state.fpu.cw = core.read_mem(bus, seg, off, Width::Word)? as u16;
            return Ok(());
        }
        (1, 7) => {
            let cw = u32::from(core.state.fpu.cw);
            return core.write_mem(bus, seg, off, Width::Word, cw);
        }
        (5, 7) => {
            let sw = u32::from(core.state.fpu.status_word());
            return core.write_mem(bus, seg, off, Width::Word, sw);
        }
        _ => {
            debug!(opcode = 0xD8 | esc, reg, "unsupported x87 memory form ignored");
            return Ok(());
        }
    };
    match reg {
        0 | 5 => {
            let v = load_mem(core, bus, insn, load_store_fmt, seg, off)?;
            core.state.fpu.push(v);
        }
        2 => {
            store_mem(core, bus, insn, load_store_fmt, seg, off)?;
        }
        _ => {
            if store_mem(core, bus, insn, load_store_fmt, seg, off)? {
                core.state.fpu.pop();
            }
        }
    }
    Ok(())
}

fn esc_reg(core: &mut CpuCore, esc: u8, reg: u8, rm: u8) -> Result<(), Fault> {
    if !no_wait(esc, reg, false, rm) {
        check_pending(core)?;
    }
    let mut fpu = core.state.fpu;
    match (esc, reg) {
        (0, _) | (4, _) | (6, _) => {
            if esc == 6 && reg == 3 {
                // DE D9: FCOMPP.
                if rm == 1 {
                    if let (Some(a), Some(b)) =
                        (stack_operand(&mut fpu, 0), stack_operand(&mut fpu, 1))
                    {
                        compare(&mut fpu, a, b);
                        fpu.pop();
                        fpu.pop();
                    }
                }
                core.state.fpu = fpu;
                return Ok(());
            }
            let (Some(st0), Some(sti)) = (stack_operand(&mut fpu, 0), stack_operand(&mut fpu, rm))
            else {
                core.state.fpu = fpu;
                return Ok(());
            };
            if esc == 0 {
                match reg {
                    2 | 3 => {
                        compare(&mut fpu, st0, sti);
                        if reg == 3 {
                            fpu.pop();
                        }
                    }
                    op => {
                        if let Some(r) = arith(&mut fpu, op, st0, sti) {
                            fpu.set_st(0, r);
                        }
                    }
                }
            } else if matches!(reg, 2 | 3) {
                // DC D0-DF / DE D0-D7 alias FCOM/FCOMP.
                compare(&mut fpu, st0, sti);
                if reg == 3 || esc == 6 {
                    fpu.pop();
                }
            } else {
                // ST(i) is the destination: SUB/SUBR and DIV/DIVR swap.
                let op = match reg {
                    4 => 5,
                    5 => 4,
                    6 => 7,
                    7 => 6,
                    r => r,
                };
                if let Some(r) = arith(&mut fpu, op, sti, st0) {
                    fpu.set_st(rm, r);
                    if esc == 6 {
                        fpu.pop();
                    }
                }
            }
        }
        (1, 0) => {
            if let Some(v) = stack_operand(&mut fpu, rm) {
                fpu.push(v);
            }
        }
        (1, 1) => {
            if let (Some(a), Some(b)) = (stack_operand(&mut fpu, 0), stack_operand(&mut fpu, rm)) {
                fpu.set_st(0, b);
                fpu.set_st(rm, a);
            }
        }
        (1, 2) => {}
        (1, 4) => {
            if let Some(v) = stack_operand(&mut fpu, 0) {
                match rm {
                    0 => fpu.set_st(0, -v),
                    1 => fpu.set_st(0, v.abs()),
                    4 => compare(&mut fpu, v, 0.0),
                    _ => debug!(rm, "unsupported D9 E0 form ignored"),
                }
            }
        }
        (1, 5) => {
            let c = match rm {
                0 => Some(1.0),
                3 => Some(std::f64::consts::PI),
                6 => Some(0.0),
                1 => Some(std::f64::consts::LOG2_10),
                2 => Some(std::f64::consts::LOG2_E),
                4 => Some(std::f64::consts::LOG10_2),
                5 => Some(std::f64::consts::LN_2),
                _ => None,
            };
            if let Some(c) = c {
                fpu.push(c);
            }
        }
        (1, 7) if rm == 2 => {
            if let Some(v) = stack_operand(&mut fpu, 0) {
                fpu.set_st(0, v.sqrt());
            }
        }
        (2, 5) if rm == 1 => {
            // FUCOMPP.
            if let (Some(a), Some(b)) = (stack_operand(&mut fpu, 0), stack_operand(&mut fpu, 1)) {
                compare(&mut fpu, a, b);
                fpu.pop();
                fpu.pop();
            }
        }
        (3, 4) if rm == 2 => fpu.sw &= !SW_CLEAR_MASK,
        (3, 4) if rm == 3 => fpu = FpuState::default(),
        (5, 0) => {
            // FFREE.
            let p = fpu.phys(rm);
            fpu.tags |= 3 << (p * 2);
        }
        (5, 2) | (5, 3) => {
            if let Some(v) = stack_operand(&mut fpu, 0) {
                fpu.set_st(rm, v);
                if reg == 3 {
                    fpu.pop();
                }
            }
        }
        (5, 4) | (5, 5) => {
            if let (Some(a), Some(b)) = (stack_operand(&mut fpu, 0), stack_operand(&mut fpu, rm)) {
                compare(&mut fpu, a, b);
                if reg == 5 {
                    fpu.pop();
                }
            }
        }
        (7, 4) if rm == 0 => {
            let sw = fpu.status_word();
            core.state.set_reg16(EAX as u8, sw);
        }
        _ => debug!(opcode = 0xD8 | esc, reg, rm, "unsupported x87 register form ignored"),
    }
    core.state.fpu = fpu;
    Ok(())
}
