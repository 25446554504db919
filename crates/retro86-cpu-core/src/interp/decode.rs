//! ModR/M and SIB decoding into effective addresses.

use crate::exception::Fault;
use crate::flags::Width;
use crate::platform::Platform;
use crate::state::{SegReg, EBP, EBX, EDI, ESI, ESP};
use crate::CpuCore;

use super::Insn;

/// Decoded r/m operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ea {
    Reg(u8),
    Mem { seg: SegReg, offset: u32 },
}

impl Ea {
    #[inline]
    pub fn is_mem(&self) -> bool {
        matches!(self, Ea::Mem { .. })
    }

    /// The memory offset, or #UD for register forms of memory-only instructions.
    #[inline]
    pub fn mem(&self) -> Result<(SegReg, u32), Fault> {
        match *self {
            Ea::Mem { seg, offset } => Ok((seg, offset)),
            Ea::Reg(_) => Err(Fault::ud()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModRm {
    pub md: u8,
    pub reg: u8,
    pub rm: u8,
}

impl ModRm {
    #[inline]
    pub fn new(byte: u8) -> Self {
        Self {
            md: byte >> 6,
            reg: (byte >> 3) & 7,
            rm: byte & 7,
        }
    }
}

impl CpuCore {
    /// Fetch and decode a ModR/M operand. Returns the `reg` field and the r/m
    /// operand.
    pub(crate) fn modrm(
        &mut self,
        bus: &mut dyn Platform,
        insn: &Insn,
    ) -> Result<(u8, Ea), Fault> {
        let m = ModRm::new(self.fetch_u8(bus)?);
        if m.md == 3 {
            return Ok((m.reg, Ea::Reg(m.rm)));
        }
        let ea = if insn.addr32 {
            self.ea32(bus, insn, m)?
        } else {
            self.ea16(bus, insn, m)?
        };
        Ok((m.reg, ea))
    }

    fn ea16(&mut self, bus: &mut dyn Platform, insn: &Insn, m: ModRm) -> Result<Ea, Fault> {
        let r = |i: usize| self.state.gpr[i] & 0xFFFF;
        let (base, stack) = match m.rm {
            0 => (r(EBX) + r(ESI), false),
            1 => (r(EBX) + r(EDI), false),
            2 => (r(EBP) + r(ESI), true),
            3 => (r(EBP) + r(EDI), true),
            4 => (r(ESI), false),
            5 => (r(EDI), false),
            6 if m.md == 0 => (0, false),
            6 => (r(EBP), true),
            _ => (r(EBX), false),
        };
        let disp = match m.md {
            0 if m.rm == 6 => u32::from(self.fetch_u16(bus)?),
            1 => self.fetch_u8(bus)? as i8 as u32,
            2 => u32::from(self.fetch_u16(bus)?),
            _ => 0,
        };
        let seg = insn.seg.unwrap_or(if stack { SegReg::Ss } else { SegReg::Ds });
        Ok(Ea::Mem {
            seg,
            offset: base.wrapping_add(disp) & 0xFFFF,
        })
    }

    fn ea32(&mut self, bus: &mut dyn Platform, insn: &Insn, m: ModRm) -> Result<Ea, Fault> {
        let mut stack = false;
        let base = if m.rm == 4 {
            let sib = self.fetch_u8(bus)?;
            let scale = sib >> 6;
            let index = (sib >> 3) & 7;
            let base_reg = sib & 7;
            let index_val = if index == 4 {
                0
            } else {
                self.state.gpr[usize::from(index)] << scale
            };
            let base_val = if base_reg == 5 && m.md == 0 {
                self.fetch_u32(bus)?
            } else {
                stack = base_reg == ESP as u8 || base_reg == EBP as u8;
                self.state.gpr[usize::from(base_reg)]
            };
            base_val.wrapping_add(index_val)
        } else if m.rm == 5 && m.md == 0 {
            self.fetch_u32(bus)?
        } else {
            stack = m.rm == EBP as u8;
            self.state.gpr[usize::from(m.rm)]
        };
        let disp = match m.md {
            1 => self.fetch_u8(bus)? as i8 as u32,
            2 => self.fetch_u32(bus)?,
            _ => 0,
        };
        let seg = insn.seg.unwrap_or(if stack { SegReg::Ss } else { SegReg::Ds });
        Ok(Ea::Mem {
            seg,
            offset: base.wrapping_add(disp),
        })
    }

    pub(crate) fn read_ea(
        &mut self,
        bus: &mut dyn Platform,
        ea: Ea,
        w: Width,
    ) -> Result<u32, Fault> {
        match ea {
            Ea::Reg(r) => Ok(self.state.reg(w, r)),
            Ea::Mem { seg, offset } => self.read_mem(bus, seg, offset, w),
        }
    }

    pub(crate) fn write_ea(
        &mut self,
        bus: &mut dyn Platform,
        ea: Ea,
        w: Width,
        value: u32,
    ) -> Result<(), Fault> {
        match ea {
            Ea::Reg(r) => {
                self.state.set_reg(w, r, value);
                Ok(())
            }
            Ea::Mem { seg, offset } => self.write_mem(bus, seg, offset, w, value),
        }
    }

    /// Offset of `ea + delta` within the same segment, wrapped by address size.
    #[inline]
    pub(crate) fn ea_offset(insn: &Insn, offset: u32, delta: u32) -> u32 {
        let o = offset.wrapping_add(delta);
        if insn.addr32 {
            o
        } else {
            o & 0xFFFF
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::FlatTestBus;
    use crate::test_util::{protected_core, real_core};

    fn insn(addr32: bool) -> Insn {
        Insn {
            start: 0,
            opcode: 0,
            op32: addr32,
            addr32,
            seg: None,
            rep: super::super::Rep::None,
            lock: false,
        }
    }

    fn decode(core: &mut CpuCore, bus: &mut FlatTestBus, bytes: &[u8], addr32: bool) -> (u8, Ea) {
        let base = core.state.seg(SegReg::Cs).base;
        bus.load(base + 0x100, bytes);
        core.state.eip = 0x100;
        core.modrm(bus, &insn(addr32)).unwrap()
    }

    #[test]
    fn bp_based_16bit_forms_default_to_ss() {
        let (mut core, mut bus) = real_core("8086");
        core.state.gpr[EBP] = 0x1000;
        core.state.gpr[ESI] = 0x0020;
        // [BP+SI+0x10], reg=CX
        let (reg, ea) = decode(&mut core, &mut bus, &[0x4A, 0x10], false);
        assert_eq!(reg, 1);
        assert_eq!(
            ea,
            Ea::Mem {
                seg: SegReg::Ss,
                offset: 0x1030
            }
        );
    }

    #[test]
    fn sib_with_scaled_index_and_disp32() {
        let (mut core, mut bus) = protected_core("386DX");
        core.state.gpr[EBX] = 0x1000;
        core.state.gpr[ESI] = 0x10;
        // mod=10 rm=100, SIB scale=2 index=ESI base=EBX, disp32
        let (_, ea) = decode(&mut core, &mut bus, &[0x84, 0xB3, 0x00, 0x01, 0x00, 0x00], true);
        assert_eq!(
            ea,
            Ea::Mem {
                seg: SegReg::Ds,
                offset: 0x1000 + 0x40 + 0x100
            }
        );
        assert_eq!(core.state.eip, 0x106);
    }
}
