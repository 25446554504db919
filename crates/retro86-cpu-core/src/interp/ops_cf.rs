//! Control transfer: conditional and unconditional jumps, calls, returns,
//! LOOP/JCXZ and software interrupts.

use crate::exception::{Exception, Fault};
use crate::flags::{Width, FLAG_OF, FLAG_ZF};
use crate::interrupts::{self, InterruptKind};
use crate::platform::Platform;
use crate::segmentation::far::{far_return, FarKind, FarTransfer};
use crate::state::ECX;
use crate::CpuCore;

use super::ops_alu::inc_dec_ea;
use super::{undefined_form, Flow, Insn};

/// Relative target from the end of the current instruction.
#[inline]
fn rel_target(core: &CpuCore, disp: u32) -> u32 {
    core.state.eip.wrapping_add(disp)
}

fn branch(core: &mut CpuCore, taken: bool, target: u32, op32: bool) -> Result<Flow, Fault> {
    if taken {
        core.jump_near(target, op32)?;
        let t = core.model().timings.bt;
        core.charge(i64::from(t));
    } else {
        let t = core.model().timings.bnt;
        core.charge(i64::from(t));
    }
    Ok(Flow::EndBlock)
}

/// 70-7F (and 60-6F on the 8086): Jcc rel8.
pub(crate) fn jcc_short(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let disp = core.fetch_u8(bus)? as i8 as u32;
    let taken = core.state.flags.condition(insn.opcode);
    let target = rel_target(core, disp);
    branch(core, taken, target, insn.op32)
}

/// 0F 80-8F: Jcc rel16/32.
pub(crate) fn jcc_near(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = insn.opw();
    let disp = w.sext(core.fetch_imm(bus, w)?);
    let taken = core.state.flags.condition(insn.opcode);
    let target = rel_target(core, disp);
    branch(core, taken, target, insn.op32)
}

/// EB: JMP rel8.
pub(crate) fn jmp_short(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let disp = core.fetch_u8(bus)? as i8 as u32;
    let target = rel_target(core, disp);
    core.jump_near(target, insn.op32)?;
    let t = core.model().timings.jmp;
    core.charge(i64::from(t));
    Ok(Flow::EndBlock)
}

/// E9: JMP rel16/32.
pub(crate) fn jmp_near_rel(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = insn.opw();
    let disp = w.sext(core.fetch_imm(bus, w)?);
    let target = rel_target(core, disp);
    core.jump_near(target, insn.op32)?;
    let t = core.model().timings.jmp;
    core.charge(i64::from(t));
    Ok(Flow::EndBlock)
}

/// E8: CALL rel16/32.
pub(crate) fn call_near_rel(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = insn.opw();
    let disp = w.sext(core.fetch_imm(bus, w)?);
    let ret = core.state.eip;
    let target = rel_target(core, disp);
    core.push(bus, ret, insn.op32)?;
    core.jump_near(target, insn.op32)?;
    let t = core.model().timings.call;
    core.charge(i64::from(t));
    Ok(Flow::EndBlock)
}

fn far_imm(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &Insn,
    kind: FarKind,
) -> Result<Flow, Fault> {
    let offset = core.fetch_imm(bus, insn.opw())?;
    let selector = core.fetch_u16(bus)?;
    far_transfer(core, bus, kind, selector, offset, insn.op32)
}

fn far_transfer(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    kind: FarKind,
    selector: u16,
    offset: u32,
    op32: bool,
) -> Result<Flow, Fault> {
    FarTransfer {
        kind,
        selector,
        offset,
        op32,
    }
    .execute(core, bus)?;
    core.prefetch.flush();
    let t = match kind {
        FarKind::Jmp => core.model().timings.jmp,
        FarKind::Call => core.model().timings.call,
    };
    core.charge(i64::from(t) * 2);
    Ok(Flow::EndBlock)
}

/// EA: JMP ptr16:16/32.
pub(crate) fn jmp_far_imm(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    far_imm(core, bus, insn, FarKind::Jmp)
}

/// 9A: CALL ptr16:16/32.
pub(crate) fn call_far_imm(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    far_imm(core, bus, insn, FarKind::Call)
}

/// C2/C3 (and C0/C1 on the 8086): RET [imm16].
pub(crate) fn ret_near(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let imm = if insn.opcode & 1 == 0 {
        u32::from(core.fetch_u16(bus)?)
    } else {
        0
    };
    let target = core.pop(bus, insn.op32)?;
    if imm != 0 {
        let sp = core.state.sp().wrapping_add(imm);
        core.state.set_sp(sp);
    }
    core.jump_near(target, insn.op32)?;
    let t = core.model().timings.call;
    core.charge(i64::from(t));
    Ok(Flow::EndBlock)
}

/// CA/CB (and C8/C9 on the 8086): RETF [imm16].
pub(crate) fn ret_far(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let imm = if insn.opcode & 1 == 0 {
        core.fetch_u16(bus)?
    } else {
        0
    };
    far_return(core, bus, insn.op32, imm)?;
    core.prefetch.flush();
    let t = core.model().timings.retf;
    core.charge(i64::from(t));
    Ok(Flow::EndBlock)
}

/// E0-E3: LOOPNE, LOOPE, LOOP, JCXZ. The count register follows the address
/// size.
pub(crate) fn loop_jcxz(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let disp = core.fetch_u8(bus)? as i8 as u32;
    let cw = Width::from_op32(insn.addr32);
    let count = core.state.reg(cw, ECX as u8);
    let target = rel_target(core, disp);
    if insn.opcode == 0xE3 {
        return branch(core, count == 0, target, insn.op32);
    }
    let count = count.wrapping_sub(1) & cw.mask();
    let taken = count != 0
        && match insn.opcode {
            0xE0 => !core.state.flags.get(FLAG_ZF),
            0xE1 => core.state.flags.get(FLAG_ZF),
            _ => true,
        };
    let flow = branch(core, taken, target, insn.op32)?;
    core.state.set_reg(cw, ECX as u8, count);
    Ok(flow)
}

/// CC, CD ib, CE, F1: INT3, INT n, INTO, INT1.
pub(crate) fn int_sw(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let (vector, kind) = match insn.opcode {
        0xCC => (Exception::Breakpoint.vector(), InterruptKind::Software),
        0xCD => (core.fetch_u8(bus)?, InterruptKind::Software),
        0xCE => {
            if !core.state.flags.get(FLAG_OF) {
                let t = core.model().timings.bnt;
                core.charge(i64::from(t));
                return Ok(Flow::Continue);
            }
            (Exception::Overflow.vector(), InterruptKind::Software)
        }
        _ => (Exception::Debug.vector(), InterruptKind::Exception),
    };
    interrupts::raise(core, bus, vector, kind, None)?;
    Ok(Flow::EndBlock)
}

/// CF: IRET / IRETD.
pub(crate) fn iret(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    interrupts::iret(core, bus, insn.op32)?;
    Ok(Flow::EndBlock)
}

/// FF: INC, DEC, CALL, CALL far, JMP, JMP far, PUSH.
pub(crate) fn group5(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let w = insn.opw();
    let (op, ea) = core.modrm(bus, insn)?;
    match op {
        0 | 1 => {
            inc_dec_ea(core, bus, op == 1, w, ea)?;
            Ok(Flow::Continue)
        }
        2 | 4 => {
            let target = core.read_ea(bus, ea, w)?;
            if op == 2 {
                let ret = core.state.eip;
                core.push(bus, ret, insn.op32)?;
            }
            core.jump_near(target, insn.op32)?;
            let t = if op == 2 {
                core.model().timings.call
            } else {
                core.model().timings.jmp
            };
            core.charge(i64::from(t));
            core.charge_ea(ea.is_mem(), false);
            Ok(Flow::EndBlock)
        }
        3 | 5 => {
            let (seg, off) = ea.mem()?;
            let offset = core.read_mem(bus, seg, off, w)?;
            let sel_off = CpuCore::ea_offset(insn, off, w.bytes());
            let selector = core.read_mem(bus, seg, sel_off, Width::Word)? as u16;
            let kind = if op == 3 { FarKind::Call } else { FarKind::Jmp };
            far_transfer(core, bus, kind, selector, offset, insn.op32)
        }
        6 => {
            let v = core.read_ea(bus, ea, w)?;
            core.push(bus, v, insn.op32)?;
            core.charge_ea(ea.is_mem(), false);
            Ok(Flow::Continue)
        }
        _ => undefined_form(core),
    }
}

#[cfg(test)]
mod tests {
    use crate::exception::Fault;
    use crate::flags::FLAG_ZF;
    use crate::interp::Flow;
    use crate::state::{SegReg, ECX, ESP};
    use crate::test_util::{protected_core, real_core, run_bytes};

    #[test]
    fn short_jcc_taken_and_not_taken() {
        let (mut core, mut bus) = real_core("8086");
        let start = core.state.eip;
        core.state.flags.set(FLAG_ZF, true);
        // JZ +4
        bus.load(start, &[0x74, 0x04]);
        assert_eq!(core.step_instruction(&mut bus), Ok(Flow::EndBlock));
        assert_eq!(core.state.eip, start + 6);

        core.state.eip = start;
        core.state.flags.set(FLAG_ZF, false);
        core.step_instruction(&mut bus).unwrap();
        assert_eq!(core.state.eip, start + 2);
    }

    #[test]
    fn jcc_alias_range_on_8086_only() {
        let (mut core, mut bus) = real_core("8086");
        let start = core.state.eip;
        core.state.flags.set(FLAG_ZF, true);
        // 64 aliases JZ on the 8086.
        bus.load(start, &[0x64, 0x10]);
        core.step_instruction(&mut bus).unwrap();
        assert_eq!(core.state.eip, start + 0x12);

        let (mut core, mut bus) = real_core("80186");
        let start = core.state.eip;
        bus.load(start, &[0x64, 0x10]);
        assert_eq!(core.step_instruction(&mut bus), Err(Fault::ud()));
    }

    #[test]
    fn call_and_ret_balance_the_stack() {
        let (mut core, mut bus) = real_core("8086");
        let start = core.state.eip;
        core.state.gpr[ESP] = 0x2000;
        // CALL +3; (3 bytes skipped) RET
        bus.load(start, &[0xE8, 0x03, 0x00, 0x90, 0x90, 0x90, 0xC3]);
        core.step_instruction(&mut bus).unwrap();
        assert_eq!(core.state.eip, start + 6);
        assert_eq!(core.state.gpr[ESP], 0x1FFE);
        core.step_instruction(&mut bus).unwrap();
        assert_eq!(core.state.eip, start + 3);
        assert_eq!(core.state.gpr[ESP], 0x2000);
    }

    #[test]
    fn loop_decrements_cx_and_exits_at_zero() {
        let (mut core, mut bus) = real_core("8086");
        let start = core.state.eip;
        core.state.gpr[ECX] = 2;
        // LOOP -2 (to itself)
        bus.load(start, &[0xE2, 0xFE]);
        core.step_instruction(&mut bus).unwrap();
        assert_eq!(core.state.eip, start);
        assert_eq!(core.state.gpr[ECX], 1);
        core.step_instruction(&mut bus).unwrap();
        assert_eq!(core.state.eip, start + 2);
        assert_eq!(core.state.gpr[ECX], 0);
    }

    #[test]
    fn far_jump_real_mode_reloads_cs() {
        let (mut core, mut bus) = real_core("8086");
        // JMP 1234:0010
        run_bytes(&mut core, &mut bus, &[0xEA, 0x10, 0x00, 0x34, 0x12]).unwrap();
        assert_eq!(core.state.seg(SegReg::Cs).base, 0x12340);
        assert_eq!(core.state.eip, 0x10);
    }

    #[test]
    fn near_jump_past_cs_limit_faults_without_moving() {
        let (mut core, mut bus) = protected_core("386DX");
        core.state.seg_mut(SegReg::Cs).limit_high = 0x0FFF;
        let start = core.state.eip;
        // JMP rel32 to 0x2000
        let disp = 0x2000u32.wrapping_sub(start + 5);
        let mut code = vec![0xE9];
        code.extend_from_slice(&disp.to_le_bytes());
        bus.load(start, &code);
        assert_eq!(core.step_instruction(&mut bus), Err(Fault::gp0()));
        assert_eq!(core.state.eip, start);
    }

    #[test]
    fn int3_in_real_mode_vectors_through_ivt() {
        let (mut core, mut bus) = real_core("8086");
        core.state.gpr[ESP] = 0x2000;
        bus.load(3 * 4, &[0x00, 0x05, 0x00, 0x00]);
        let start = core.state.eip;
        run_bytes(&mut core, &mut bus, &[0xCC]).unwrap();
        assert_eq!(core.state.eip, 0x0500);
        // Return address is the byte after INT3.
        assert_eq!(bus.slice(0x1FFA, 2), &((start + 1) as u16).to_le_bytes());
    }
}
