use retro86_cpu_core::flags::Width;
use retro86_cpu_core::interp::Flow;
use retro86_cpu_core::state::CpuState;

/// Second operand of a register op.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Src {
    /// Register index in the op's width (byte indices 4-7 are AH..BH).
    Reg(u8),
    Imm(u32),
}

impl Src {
    #[inline]
    pub fn read(self, state: &CpuState, w: Width) -> u32 {
        match self {
            Src::Reg(r) => state.reg(w, r),
            Src::Imm(v) => v & w.mask(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MicroOp {
    Nop,
    Mov {
        w: Width,
        dst: u8,
        src: Src,
    },
    /// `op` is the interpreter's ALU group index (ADD..CMP). `store` is false
    /// for CMP and TEST.
    Alu {
        op: u8,
        w: Width,
        dst: u8,
        src: Src,
        store: bool,
    },
    IncDec {
        dec: bool,
        w: Width,
        reg: u8,
    },
    /// FXCH against physical registers; only valid while the stack TOP is `top`.
    Fxch {
        top: u8,
        phys_a: u8,
        phys_b: u8,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Native { next_pc: u32, flow: Flow, op: MicroOp },
    Interp { next_pc: u32 },
}

impl Step {
    pub fn next_pc(&self) -> u32 {
        match *self {
            Step::Native { next_pc, .. } | Step::Interp { next_pc } => next_pc,
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, Step::Native { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IrBlock {
    pub entry: u32,
    pub steps: Vec<Step>,
}

impl IrBlock {
    pub fn new(entry: u32) -> Self {
        Self {
            entry,
            steps: Vec::new(),
        }
    }

    /// Names FPU registers physically.
    pub fn fpu_dependent(&self) -> bool {
        self.steps.iter().any(|s| {
            matches!(
                s,
                Step::Native {
                    op: MicroOp::Fxch { .. },
                    ..
                }
            )
        })
    }

    pub fn native_count(&self) -> usize {
        self.steps.iter().filter(|s| s.is_native()).count()
    }
}
