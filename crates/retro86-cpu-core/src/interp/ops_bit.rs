//! 386 bit instructions: BT/BTS/BTR/BTC, BSF/BSR, SHLD/SHRD.

use crate::exception::Fault;
use crate::flags::{LazyFlags, Width, FLAG_CF, FLAG_OF, FLAG_ZF};
use crate::platform::Platform;
use crate::state::ECX;
use crate::CpuCore;

use super::decode::Ea;
use super::{Flow, Insn};

const BT: u8 = 0;
const BTS: u8 = 1;
const BTR: u8 = 2;
const BTC: u8 = 3;

/// Apply a bit-test operation to `v`; returns the tested bit and the new value
/// (`None` for plain BT).
fn bit_op(op: u8, v: u32, bit: u32) -> (bool, Option<u32>) {
    let mask = 1u32 << bit;
    let set = v & mask != 0;
    let new = match op {
        BT => None,
        BTS => Some(v | mask),
        BTR => Some(v & !mask),
        _ => Some(v ^ mask),
    };
    (set, new)
}

fn bit_test(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &Insn,
    op: u8,
    ea: Ea,
    offset: u32,
    from_register: bool,
) -> Result<Flow, Fault> {
    let w = insn.opw();
    let bits = w.bits();
    // A register bit offset may reach outside the addressed operand; the
    // immediate form never does.
    let (ea, bit) = match ea {
        Ea::Mem { seg, offset: base } if from_register => {
            let signed = w.sext(offset & w.mask()) as i32;
            let words = signed >> bits.trailing_zeros();
            let disp = (words as u32).wrapping_mul(w.bytes());
            let off = CpuCore::ea_offset(insn, base, disp);
            (Ea::Mem { seg, offset: off }, offset & (bits - 1))
        }
        ea => (ea, offset & (bits - 1)),
    };
    let v = core.read_ea(bus, ea, w)?;
    let (set, new) = bit_op(op, v, bit);
    if let Some(n) = new {
        core.write_ea(bus, ea, w, n)?;
    }
    core.state.flags.set(FLAG_CF, set);
    core.charge_ea(ea.is_mem(), new.is_some());
    Ok(Flow::Continue)
}

/// 0F A3/AB/B3/BB: BT, BTS, BTR, BTC r/m, reg.
pub(crate) fn bt_rm(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let op = (insn.opcode >> 3) & 3;
    let (reg, ea) = core.modrm(bus, insn)?;
    let offset = core.state.reg(insn.opw(), reg);
    bit_test(core, bus, insn, op, ea, offset, true)
}

/// 0F BA /4-/7: BT, BTS, BTR, BTC r/m, imm8.
pub(crate) fn group8(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let (op, ea) = core.modrm(bus, insn)?;
    let imm = u32::from(core.fetch_u8(bus)?);
    if op < 4 {
        return Err(Fault::ud());
    }
    bit_test(core, bus, insn, op & 3, ea, imm, false)
}

/// 0F BC/BD: BSF and BSR. A zero source sets ZF and leaves the destination.
pub(crate) fn bsf_bsr(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = insn.opw();
    let (reg, ea) = core.modrm(bus, insn)?;
    let src = core.read_ea(bus, ea, w)? & w.mask();
    if src == 0 {
        core.state.flags.set(FLAG_ZF, true);
    } else {
        let idx = if insn.opcode == 0xBC {
            src.trailing_zeros()
        } else {
            31 - src.leading_zeros()
        };
        core.state.set_reg(w, reg, idx);
        core.state.flags.set(FLAG_ZF, false);
    }
    let t = core.model().timings.mul;
    core.charge(i64::from(t));
    Ok(Flow::Continue)
}

/// Double-precision shift of `dst` with bits from `src`. Returns the result and
/// the last bit shifted out; `count` is already masked and non-zero.
pub(crate) fn double_shift(left: bool, w: Width, dst: u32, src: u32, count: u32) -> (u32, bool) {
    let bits = w.bits();
    let m = u128::from(w.mask());
    let (dst, src) = (u128::from(dst) & m, u128::from(src) & m);
    if left {
        let wide = (dst << bits) | src;
        let shifted = wide << count;
        let res = ((shifted >> bits) & m) as u32;
        let cf = (shifted >> (2 * bits)) & 1 != 0;
        (res, cf)
    } else {
        let wide = (src << bits) | dst;
        let res = ((wide >> count) & m) as u32;
        let cf = (wide >> (count - 1)) & 1 != 0;
        (res, cf)
    }
}

/// 0F A4/A5/AC/AD: SHLD and SHRD with an immediate or CL count.
pub(crate) fn shld_shrd(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = insn.opw();
    let left = insn.opcode < 0xA8;
    let (reg, ea) = core.modrm(bus, insn)?;
    let count = if insn.opcode & 1 == 0 {
        u32::from(core.fetch_u8(bus)?)
    } else {
        core.state.gpr[ECX]
    } & 0x1F;
    let dst = core.read_ea(bus, ea, w)?;
    core.charge_ea(ea.is_mem(), true);
    if count == 0 {
        return Ok(Flow::Continue);
    }
    let src = core.state.reg(w, reg);
    let (res, cf) = double_shift(left, w, dst, src, count);
    core.write_ea(bus, ea, w, res)?;
    let f = &mut core.state.flags;
    f.defer(LazyFlags::Logic { res, w });
    f.set(FLAG_CF, cf);
    f.set(FLAG_OF, (res ^ dst) & w.sign() != 0);
    Ok(Flow::Continue)
}

#[cfg(test)]
mod tests {
    use super::double_shift;
    use crate::exception::Fault;
    use crate::flags::{Width, FLAG_CF, FLAG_ZF};
    use crate::state::{EAX, EBX, ECX};
    use crate::test_util::{protected_core, run_bytes};

    #[test]
    fn bts_with_register_offset_reaches_past_operand() {
        let (mut core, mut bus) = protected_core("386DX");
        core.state.gpr[EBX] = 0x3000;
        core.state.gpr[ECX] = 35;
        // BTS [EBX], ECX
        run_bytes(&mut core, &mut bus, &[0x0F, 0xAB, 0x0B]).unwrap();
        assert_eq!(bus.slice(0x3004, 1), &[0x08]);
        assert!(!core.state.flags.get(FLAG_CF));
        run_bytes(&mut core, &mut bus, &[0x0F, 0xA3, 0x0B]).unwrap();
        assert!(core.state.flags.get(FLAG_CF));
    }

    #[test]
    fn negative_bit_offset_addresses_below_base() {
        let (mut core, mut bus) = protected_core("386DX");
        bus.load(0x2FFC, &[0, 0, 0, 0x80]);
        core.state.gpr[EBX] = 0x3000;
        core.state.gpr[ECX] = (-1i32) as u32;
        // BTR [EBX], ECX
        run_bytes(&mut core, &mut bus, &[0x0F, 0xB3, 0x0B]).unwrap();
        assert!(core.state.flags.get(FLAG_CF));
        assert_eq!(bus.slice(0x2FFF, 1), &[0]);
    }

    #[test]
    fn immediate_bit_offset_wraps_in_register() {
        let (mut core, mut bus) = protected_core("386DX");
        core.state.gpr[EAX] = 1;
        // BTC EAX, 32
        run_bytes(&mut core, &mut bus, &[0x0F, 0xBA, 0xF8, 0x20]).unwrap();
        assert_eq!(core.state.gpr[EAX], 0);
        assert!(core.state.flags.get(FLAG_CF));

        let err = run_bytes(&mut core, &mut bus, &[0x0F, 0xBA, 0xC0, 0x01]).unwrap_err();
        assert_eq!(err, Fault::ud());
    }

    #[test]
    fn bsf_bsr_and_zero_source() {
        let (mut core, mut bus) = protected_core("386DX");
        core.state.gpr[EBX] = 0x0010_0100;
        run_bytes(&mut core, &mut bus, &[0x0F, 0xBC, 0xC3]).unwrap();
        assert_eq!(core.state.gpr[EAX], 8);
        run_bytes(&mut core, &mut bus, &[0x0F, 0xBD, 0xC3]).unwrap();
        assert_eq!(core.state.gpr[EAX], 20);
        assert!(!core.state.flags.get(FLAG_ZF));

        core.state.gpr[EBX] = 0;
        run_bytes(&mut core, &mut bus, &[0x0F, 0xBD, 0xC3]).unwrap();
        assert_eq!(core.state.gpr[EAX], 20);
        assert!(core.state.flags.get(FLAG_ZF));
    }

    #[test]
    fn double_shifts() {
        assert_eq!(
            double_shift(true, Width::Dword, 0x1234_5678, 0x9ABC_DEF0, 8),
            (0x3456_789A, false)
        );
        assert_eq!(
            double_shift(false, Width::Dword, 0x1234_5678, 0x9ABC_DEF0, 8),
            (0xF012_3456, false)
        );
        assert_eq!(double_shift(true, Width::Word, 0x8001, 0, 1), (0x0002, true));
        assert_eq!(double_shift(false, Width::Word, 0x0003, 0xFFFF, 1), (0x8001, true));
    }

    #[test]
    fn shld_through_instruction() {
        let (mut core, mut bus) = protected_core("386DX");
        core.state.gpr[EAX] = 0x8000_0000;
        core.state.gpr[EBX] = 0xC000_0000;
        core.state.gpr[ECX] = 2;
        // SHLD EAX, EBX, CL
        run_bytes(&mut core, &mut bus, &[0x0F, 0xA5, 0xD8]).unwrap();
        assert_eq!(core.state.gpr[EAX], 3);
        assert!(!core.state.flags.get(FLAG_CF));
    }
}
