//! MOVS, CMPS, STOS, LODS, SCAS, INS and OUTS with the REP prefixes.
//!
//! Every iteration commits its own index and count updates, so a fault part
//! way through leaves the completed iterations in place and the instruction
//! restartable. When the cycle budget runs out with iterations left, EIP is
//! rewound to the first prefix and the block ends; the scheduler resumes the
//! instruction on its next slice.

use crate::exception::Fault;
use crate::flags::{Width, FLAG_DF, FLAG_ZF};
use crate::platform::Platform;
use crate::segmentation::task::io_permitted;
use crate::state::{SegReg, EAX, ECX, EDI, EDX, ESI};
use crate::CpuCore;

use super::ops_alu::{alu, CMP};
use super::{Flow, Insn, Rep};

fn bump(core: &mut CpuCore, aw: Width, reg: usize, delta: u32) {
    let v = core.state.reg(aw, reg as u8).wrapping_add(delta);
    core.state.set_reg(aw, reg as u8, v);
}

pub(crate) fn string_op(
    core: &mut CpuCore,
    bus: &mut dyn Platform,
    insn: &mut Insn,
) -> Result<Flow, Fault> {
    let op = insn.opcode;
    let w = insn.width();
    let aw = Width::from_op32(insn.addr32);
    let rep = insn.rep != Rep::None;
    let delta = if core.state.flags.get(FLAG_DF) {
        w.bytes().wrapping_neg()
    } else {
        w.bytes()
    };
    let src = insn.seg_or(SegReg::Ds);
    let port = core.state.gpr[EDX] as u16;
    let io_size = w.bytes() as u8;
    if matches!(op, 0x6C..=0x6F) && !io_permitted(core, bus, port, io_size)? {
        return Err(Fault::gp0());
    }
    let per_iteration = i64::from(core.model().timings.string);

    loop {
        if rep && core.state.reg(aw, ECX as u8) == 0 {
            break;
        }
        let si = core.state.reg(aw, ESI as u8);
        let di = core.state.reg(aw, EDI as u8);
        let mut again = true;
        match op {
            0xA4 | 0xA5 => {
                let v = core.read_mem(bus, src, si, w)?;
                core.write_mem(bus, SegReg::Es, di, w, v)?;
                bump(core, aw, ESI, delta);
                bump(core, aw, EDI, delta);
            }
            0xA6 | 0xA7 => {
                let a = core.read_mem(bus, src, si, w)?;
                let b = core.read_mem(bus, SegReg::Es, di, w)?;
                alu(&mut core.state.flags, CMP, w, a, b);
                bump(core, aw, ESI, delta);
                bump(core, aw, EDI, delta);
                again = core.state.flags.get(FLAG_ZF) == (insn.rep == Rep::Repe);
            }
            0xAA | 0xAB => {
                let v = core.state.reg(w, EAX as u8);
                core.write_mem(bus, SegReg::Es, di, w, v)?;
                bump(core, aw, EDI, delta);
            }
            0xAC | 0xAD => {
                let v = core.read_mem(bus, src, si, w)?;
                core.state.set_reg(w, EAX as u8, v);
                bump(core, aw, ESI, delta);
            }
            0xAE | 0xAF => {
                let b = core.read_mem(bus, SegReg::Es, di, w)?;
                let a = core.state.reg(w, EAX as u8);
                alu(&mut core.state.flags, CMP, w, a, b);
                bump(core, aw, EDI, delta);
                again = core.state.flags.get(FLAG_ZF) == (insn.rep == Rep::Repe);
            }
            0x6C | 0x6D => {
                core.probe_write(bus, SegReg::Es, di, w)?;
                let v = bus.io_read(port, io_size);
                core.write_mem(bus, SegReg::Es, di, w, v)?;
                bump(core, aw, EDI, delta);
            }
            _ => {
                let v = core.read_mem(bus, src, si, w)?;
                bus.io_write(port, io_size, v);
                bump(core, aw, ESI, delta);
            }
        }
        core.charge(per_iteration);
        if !rep {
            break;
        }
        let count = core.state.reg(aw, ECX as u8).wrapping_sub(1) & aw.mask();
        core.state.set_reg(aw, ECX as u8, count);
        if count == 0 || !again {
            break;
        }
        if core.state.cycles <= 0 {
            core.state.eip = insn.start;
            return Ok(Flow::EndBlock);
        }
    }
    Ok(Flow::Continue)
}

#[cfg(test)]
mod tests {
    use crate::exception::Fault;
    use crate::flags::{FLAG_DF, FLAG_ZF};
    use crate::interp::Flow;
    use crate::state::{EAX, ECX, EDI, EDX, ESI};
    use crate::test_util::{enter_ring3, protected_core, real_core, run_bytes};

    #[test]
    fn rep_movsb_copies_forward() {
        let (mut core, mut bus) = real_core("8086");
        bus.load(0x3000, b"hello");
        core.state.gpr[ESI] = 0x3000;
        core.state.gpr[EDI] = 0x4000;
        core.state.gpr[ECX] = 5;
        core.state.cycles = 10_000;
        run_bytes(&mut core, &mut bus, &[0xF3, 0xA4]).unwrap();
        assert_eq!(bus.slice(0x4000, 5), b"hello");
        assert_eq!(core.state.gpr[ECX], 0);
        assert_eq!(core.state.gpr[ESI], 0x3005);
    }

    #[test]
    fn std_runs_backwards() {
        let (mut core, mut bus) = real_core("8086");
        core.state.flags.set(FLAG_DF, true);
        core.state.gpr[EAX] = 0xAB;
        core.state.gpr[EDI] = 0x4002;
        core.state.gpr[ECX] = 3;
        core.state.cycles = 10_000;
        run_bytes(&mut core, &mut bus, &[0xF3, 0xAA]).unwrap();
        assert_eq!(bus.slice(0x4000, 3), &[0xAB; 3]);
        assert_eq!(core.state.gpr[EDI], 0x3FFF);
    }

    #[test]
    fn repe_cmpsb_stops_at_first_difference() {
        let (mut core, mut bus) = real_core("8086");
        bus.load(0x3000, b"abcX");
        bus.load(0x4000, b"abcY");
        core.state.gpr[ESI] = 0x3000;
        core.state.gpr[EDI] = 0x4000;
        core.state.gpr[ECX] = 10;
        core.state.cycles = 10_000;
        run_bytes(&mut core, &mut bus, &[0xF3, 0xA6]).unwrap();
        assert_eq!(core.state.gpr[ECX], 6);
        assert!(!core.state.flags.get(FLAG_ZF));
    }

    #[test]
    fn exhausted_budget_rewinds_to_prefix() {
        let (mut core, mut bus) = real_core("8086");
        let start = core.state.eip;
        bus.load(start, &[0xF3, 0xAB]);
        core.state.gpr[EDI] = 0x4000;
        core.state.gpr[ECX] = 100;
        core.state.cycles = 1;
        assert_eq!(core.step_instruction(&mut bus), Ok(Flow::EndBlock));
        assert_eq!(core.state.eip, start);
        let left = core.state.gpr[ECX];
        assert!(left < 100 && left > 0);
        core.state.cycles = 100_000;
        core.step_instruction(&mut bus).unwrap();
        assert_eq!(core.state.gpr[ECX], 0);
        assert_eq!(core.state.eip, start + 2);
        assert_eq!(core.state.gpr[EDI], 0x4000 + 200);
    }

    #[test]
    fn outsb_writes_port() {
        let (mut core, mut bus) = real_core("80186");
        bus.load(0x3000, &[0x5A]);
        core.state.gpr[ESI] = 0x3000;
        core.state.gpr[EDX] = 0x80;
        run_bytes(&mut core, &mut bus, &[0x6E]).unwrap();
        assert_eq!(bus.io_writes, vec![(0x80, 1, 0x5A)]);
    }

    #[test]
    fn ins_without_io_privilege_faults() {
        let (mut core, mut bus) = protected_core("386DX");
        enter_ring3(&mut core, &mut bus);
        core.state.gpr[EDX] = 0x60;
        let err = run_bytes(&mut core, &mut bus, &[0x6C]).unwrap_err();
        assert_eq!(err, Fault::gp0());
    }
}
