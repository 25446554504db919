//! Table-driven instruction interpreter.
//!
//! Prefixes are consumed here; everything from the opcode byte on is decoded by
//! the handler the opcode tables select. Handlers perform every access that can
//! fault before committing architectural state, so a returned [`Fault`] always
//! leaves the instruction restartable.

pub mod decode;
pub mod prefetch;
pub mod table;

pub(crate) mod ops_alu;
mod ops_bit;
mod ops_cf;
mod ops_data;
mod ops_string;
mod ops_system;
mod ops_x87;

pub use ops_alu::{alu, inc_dec, shift, ADC, ADD, AND, CMP, OR, SBB, SUB, XOR};

use crate::exception::Fault;
use crate::flags::{Width, FLAG_TF};
use crate::model::CpuClass;
use crate::platform::Platform;
use crate::state::{SegReg, ESP};
use crate::CpuCore;

/// What the scheduler should do after an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Control transfer, mode change or other block boundary.
    EndBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rep {
    None,
    /// F3: REP / REPE.
    Repe,
    /// F2: REPNE.
    Repne,
}

/// Per-instruction decode state shared with the handlers.
#[derive(Debug, Clone, Copy)]
pub struct Insn {
    /// EIP of the first prefix byte.
    pub start: u32,
    pub opcode: u8,
    pub op32: bool,
    pub addr32: bool,
    pub seg: Option<SegReg>,
    pub rep: Rep,
    pub lock: bool,
}

impl Insn {
    /// Operand width selected by bit 0 of the opcode.
    #[inline]
    pub fn width(&self) -> Width {
        if self.opcode & 1 == 0 {
            Width::Byte
        } else {
            self.opw()
        }
    }

    /// Word or dword by operand size.
    #[inline]
    pub fn opw(&self) -> Width {
        Width::from_op32(self.op32)
    }

    #[inline]
    pub fn seg_or(&self, default: SegReg) -> SegReg {
        self.seg.unwrap_or(default)
    }
}

/// Opcode handler.
pub type Handler = fn(&mut CpuCore, &mut dyn Platform, &mut Insn) -> Result<Flow, Fault>;

impl CpuCore {
    /// Decode and execute one instruction without delivering faults.
    ///
    /// On `Err` EIP and ESP are back at their values before the instruction,
    /// unless the instruction switched tasks, in which case the fault belongs
    /// to the new task.
    pub fn step_instruction(&mut self, bus: &mut dyn Platform) -> Result<Flow, Fault> {
        let start = self.state.eip;
        let esp = self.state.gpr[ESP];
        let trap = self.state.flags.get(FLAG_TF);
        self.fetch.clear();
        self.switched_task = false;
        match self.dispatch(bus, start) {
            Ok(flow) => {
                self.stats.instructions += 1;
                if trap {
                    self.pending.single_step = true;
                    return Ok(Flow::EndBlock);
                }
                Ok(flow)
            }
            Err(fault) => {
                if !self.switched_task {
                    self.state.eip = start;
                    self.state.gpr[ESP] = esp;
                }
                Err(fault)
            }
        }
    }

    fn dispatch(&mut self, bus: &mut dyn Platform, start: u32) -> Result<Flow, Fault> {
        let code32 = self.state.code32();
        let i386 = self.model().at_least(CpuClass::I386);
        let mut insn = Insn {
            start,
            opcode: 0,
            op32: code32,
            addr32: code32,
            seg: None,
            rep: Rep::None,
            lock: false,
        };
        loop {
            let b = self.fetch_u8(bus)?;
            match b {
                0x26 => insn.seg = Some(SegReg::Es),
                0x2E => insn.seg = Some(SegReg::Cs),
                0x36 => insn.seg = Some(SegReg::Ss),
                0x3E => insn.seg = Some(SegReg::Ds),
                0x64 if i386 => insn.seg = Some(SegReg::Fs),
                0x65 if i386 => insn.seg = Some(SegReg::Gs),
                0x66 if i386 => insn.op32 = !code32,
                0x67 if i386 => insn.addr32 = !code32,
                0xF0 => insn.lock = true,
                0xF2 => insn.rep = Rep::Repne,
                0xF3 => insn.rep = Rep::Repe,
                _ => {
                    insn.opcode = b;
                    break;
                }
            }
        }
        let handler = self.tables.primary(&insn);
        handler(self, bus, &mut insn)
    }

    /// Spend `cycles` of execution time.
    #[inline]
    pub fn charge(&mut self, cycles: i64) {
        self.state.cycles -= cycles;
        self.state.tsc = self.state.tsc.wrapping_add(cycles.max(0) as u64);
        self.prefetch.advance(cycles);
    }

    /// Register-form or memory-form cost of the current model.
    #[inline]
    pub fn charge_ea(&mut self, mem: bool, rmw: bool) {
        let t = &self.model().timings;
        let c = match (mem, rmw) {
            (false, _) => t.rr,
            (true, false) => t.rm,
            (true, true) => t.mr,
        };
        self.charge(i64::from(c));
    }

    /// Near jump within CS.
    pub(crate) fn jump_near(&mut self, target: u32, op32: bool) -> Result<(), Fault> {
        let target = if op32 { target } else { target & 0xFFFF };
        if self.model().at_least(CpuClass::I286)
            && !self.state.seg(SegReg::Cs).contains(target, 1)
        {
            return Err(Fault::gp0());
        }
        self.state.eip = target;
        self.prefetch.flush();
        Ok(())
    }

    /// Privileged instruction check: CPL 0 in protected mode (V86 counts as 3).
    #[inline]
    pub(crate) fn require_cpl0(&self) -> Result<(), Fault> {
        if self.state.protected() && self.state.cpl() != 0 {
            return Err(Fault::gp0());
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn require_class(&self, class: CpuClass) -> Result<(), Fault> {
        if self.model().at_least(class) {
            Ok(())
        } else {
            Err(Fault::ud())
        }
    }
}

/// Handler for opcodes with no table entry on 186 and later cores.
pub(crate) fn op_invalid(
    _core: &mut CpuCore,
    _bus: &mut dyn Platform,
    _insn: &mut Insn,
) -> Result<Flow, Fault> {
    Err(Fault::ud())
}

/// An undefined ModR/M form of a defined opcode: #UD from the 186 on, a no-op
/// before that.
pub(crate) fn undefined_form(core: &mut CpuCore) -> Result<Flow, Fault> {
    if core.model().at_least(CpuClass::I186) {
        return Err(Fault::ud());
    }
    let c = core.model().timings.rr;
    core.charge(i64::from(c));
    Ok(Flow::Continue)
}

/// 8086-class cores have no invalid-opcode exception; undefined opcodes fall
/// through as one-byte no-ops.
pub(crate) fn op_undefined_8086(
    core: &mut CpuCore,
    _bus: &mut dyn Platform,
    _insn: &mut Insn,
) -> Result<Flow, Fault> {
    let c = core.model().timings.rr;
    core.charge(i64::from(c));
    Ok(Flow::Continue)
}
