//! Lazy condition-flag evaluation.
//!
//! Flag-affecting instructions record the operation kind and its operands in a
//! [`LazyFlags`] value instead of computing CF/PF/AF/ZF/SF/OF eagerly. The
//! arithmetic flags are derived on demand from that record; everything else in
//! EFLAGS lives in the materialized word.

use serde::{Deserialize, Serialize};

pub const FLAG_CF: u32 = 1 << 0;
pub const FLAG_RESERVED1: u32 = 1 << 1;
pub const FLAG_PF: u32 = 1 << 2;
pub const FLAG_AF: u32 = 1 << 4;
pub const FLAG_ZF: u32 = 1 << 6;
pub const FLAG_SF: u32 = 1 << 7;
pub const FLAG_TF: u32 = 1 << 8;
pub const FLAG_IF: u32 = 1 << 9;
pub const FLAG_DF: u32 = 1 << 10;
pub const FLAG_OF: u32 = 1 << 11;
pub const FLAG_IOPL_MASK: u32 = 3 << 12;
pub const FLAG_IOPL_SHIFT: u32 = 12;
pub const FLAG_NT: u32 = 1 << 14;
pub const FLAG_RF: u32 = 1 << 16;
pub const FLAG_VM: u32 = 1 << 17;
pub const FLAG_AC: u32 = 1 << 18;
pub const FLAG_ID: u32 = 1 << 21;

/// The six flags owned by the deferral record.
pub const ARITH_FLAGS: u32 = FLAG_CF | FLAG_PF | FLAG_AF | FLAG_ZF | FLAG_SF | FLAG_OF;

/// Bits of EFLAGS that exist on any supported core.
const EFLAGS_DEFINED: u32 = 0x0027_7FD5 | FLAG_AC;

/// Operand width of a flag-affecting operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Width {
    Byte,
    Word,
    Dword,
}

impl Width {
    #[inline]
    pub const fn from_op32(op32: bool) -> Self {
        if op32 {
            Width::Dword
        } else {
            Width::Word
        }
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        match self {
            Width::Byte => 8,
            Width::Word => 16,
            Width::Dword => 32,
        }
    }

    #[inline]
    pub const fn bytes(self) -> u32 {
        self.bits() / 8
    }

    #[inline]
    pub const fn mask(self) -> u32 {
        match self {
            Width::Byte => 0xFF,
            Width::Word => 0xFFFF,
            Width::Dword => 0xFFFF_FFFF,
        }
    }

    #[inline]
    pub const fn sign(self) -> u32 {
        1 << (self.bits() - 1)
    }

    /// Sign-extend a value of this width to 32 bits.
    #[inline]
    pub const fn sext(self, value: u32) -> u32 {
        match self {
            Width::Byte => value as u8 as i8 as i32 as u32,
            Width::Word => value as u16 as i16 as i32 as u32,
            Width::Dword => value,
        }
    }
}

/// Flag-deferral record: the last flag-affecting operation and its operands.
///
/// Operands and results are stored already truncated to `w`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LazyFlags {
    /// Flags are already in the EFLAGS word.
    Materialized,
    Add { a: u32, b: u32, res: u32, w: Width },
    Adc { a: u32, b: u32, carry_in: bool, res: u32, w: Width },
    Sub { a: u32, b: u32, res: u32, w: Width },
    Sbb { a: u32, b: u32, carry_in: bool, res: u32, w: Width },
    /// AND/OR/XOR/TEST: CF=OF=0.
    Logic { res: u32, w: Width },
    /// CF is preserved from the previous state.
    Inc { a: u32, res: u32, w: Width },
    /// CF is preserved from the previous state.
    Dec { a: u32, res: u32, w: Width },
    Neg { a: u32, res: u32, w: Width },
    /// `count` is the masked, non-zero shift count.
    Shl { a: u32, count: u8, res: u32, w: Width },
    Shr { a: u32, count: u8, res: u32, w: Width },
    Sar { a: u32, count: u8, res: u32, w: Width },
}

#[inline]
fn parity(res: u32) -> bool {
    (res as u8).count_ones() % 2 == 0
}

#[inline]
fn szp(res: u32, w: Width) -> u32 {
    let mut f = 0;
    if res & w.mask() == 0 {
        f |= FLAG_ZF;
    }
    if res & w.sign() != 0 {
        f |= FLAG_SF;
    }
    if parity(res) {
        f |= FLAG_PF;
    }
    f
}

#[inline]
fn bit(cond: bool, flag: u32) -> u32 {
    if cond {
        flag
    } else {
        0
    }
}

fn carry_of(lazy: LazyFlags, old: u32) -> bool {
    match lazy {
        LazyFlags::Materialized | LazyFlags::Inc { .. } | LazyFlags::Dec { .. } => {
            old & FLAG_CF != 0
        }
        LazyFlags::Add { a, res, w, .. } => res & w.mask() < a,
        LazyFlags::Adc {
            a, b, carry_in, w, ..
        } => u64::from(a) + u64::from(b) + u64::from(carry_in) > u64::from(w.mask()),
        LazyFlags::Sub { a, b, .. } => a < b,
        LazyFlags::Sbb { a, b, carry_in, .. } => u64::from(a) < u64::from(b) + u64::from(carry_in),
        LazyFlags::Logic { .. } => false,
        LazyFlags::Neg { a, .. } => a != 0,
        LazyFlags::Shl { a, count, w, .. } => (u64::from(a) << count) >> w.bits() & 1 != 0,
        LazyFlags::Shr { a, count, .. } => (u64::from(a) >> (count - 1)) & 1 != 0,
        LazyFlags::Sar { a, count, w, .. } => {
            let sa = w.sext(a) as i32 as i64;
            (sa >> u32::from(count - 1).min(63)) & 1 != 0
        }
    }
}

/// Compute the arithmetic flags for `lazy`, merged into `old`.
fn compute(lazy: LazyFlags, old: u32) -> u32 {
    let cf = bit(carry_of(lazy, old), FLAG_CF);
    let arith = match lazy {
        LazyFlags::Materialized => return old,
        LazyFlags::Add { a, b, res, w }
        | LazyFlags::Adc {
            a, b, res, w, ..
        } => {
            szp(res, w)
                | cf
                | bit((a ^ b ^ res) & 0x10 != 0, FLAG_AF)
                | bit((!(a ^ b) & (a ^ res)) & w.sign() != 0, FLAG_OF)
        }
        LazyFlags::Sub { a, b, res, w }
        | LazyFlags::Sbb {
            a, b, res, w, ..
        } => {
            szp(res, w)
                | cf
                | bit((a ^ b ^ res) & 0x10 != 0, FLAG_AF)
                | bit(((a ^ b) & (a ^ res)) & w.sign() != 0, FLAG_OF)
        }
        LazyFlags::Logic { res, w } => szp(res, w),
        LazyFlags::Inc { res, w, .. } => {
            szp(res, w) | cf | bit(res & 0xF == 0, FLAG_AF) | bit(res == w.sign(), FLAG_OF)
        }
        LazyFlags::Dec { a, res, w } => {
            szp(res, w) | cf | bit(a & 0xF == 0, FLAG_AF) | bit(a == w.sign(), FLAG_OF)
        }
        LazyFlags::Neg { a, res, w } => {
            szp(res, w)
                | cf
                | bit((a ^ res) & 0x10 != 0, FLAG_AF)
                | bit(a == w.sign(), FLAG_OF)
        }
        LazyFlags::Shl { res, w, .. } => {
            szp(res, w) | cf | bit((res & w.sign() != 0) != (cf != 0), FLAG_OF)
        }
        LazyFlags::Shr { a, res, w, .. } => szp(res, w) | cf | bit(a & w.sign() != 0, FLAG_OF),
        LazyFlags::Sar { res, w, .. } => szp(res, w) | cf,
    };
    (old & !ARITH_FLAGS) | arith
}

/// EFLAGS with a pending deferral record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagState {
    eflags: u32,
    lazy: LazyFlags,
}

impl Default for FlagState {
    fn default() -> Self {
        Self::new(0)
    }
}

impl FlagState {
    pub fn new(eflags: u32) -> Self {
        Self {
            eflags: (eflags & EFLAGS_DEFINED) | FLAG_RESERVED1,
            lazy: LazyFlags::Materialized,
        }
    }

    /// Record a flag-affecting operation. O(1) except for INC/DEC, which first
    /// fold the carry of the previous record into EFLAGS.
    #[inline]
    pub fn defer(&mut self, lazy: LazyFlags) {
        if matches!(lazy, LazyFlags::Inc { .. } | LazyFlags::Dec { .. }) {
            let cf = self.carry();
            self.eflags = (self.eflags & !FLAG_CF) | bit(cf, FLAG_CF);
        }
        self.lazy = lazy;
    }

    #[inline]
    pub fn lazy(&self) -> LazyFlags {
        self.lazy
    }

    #[inline]
    pub fn is_deferred(&self) -> bool {
        !matches!(self.lazy, LazyFlags::Materialized)
    }

    /// Fold the deferral record into EFLAGS and return the result.
    #[inline]
    pub fn materialize(&mut self) -> u32 {
        if self.is_deferred() {
            self.eflags = compute(self.lazy, self.eflags);
            self.lazy = LazyFlags::Materialized;
        }
        self.eflags
    }

    /// EFLAGS as the guest would see it, without consuming the record.
    #[inline]
    pub fn value(&self) -> u32 {
        compute(self.lazy, self.eflags)
    }

    /// Carry-only evaluation.
    #[inline]
    pub fn carry(&self) -> bool {
        carry_of(self.lazy, self.eflags)
    }

    #[inline]
    pub fn get(&self, flag: u32) -> bool {
        if flag & ARITH_FLAGS == 0 {
            self.eflags & flag != 0
        } else if flag == FLAG_CF {
            self.carry()
        } else {
            self.value() & flag != 0
        }
    }

    /// Replace EFLAGS wholesale (POPF, IRET, task switch). Bit 1 stays set.
    #[inline]
    pub fn set_eflags(&mut self, value: u32) {
        self.eflags = (value & EFLAGS_DEFINED) | FLAG_RESERVED1;
        self.lazy = LazyFlags::Materialized;
    }

    #[inline]
    pub fn set(&mut self, flag: u32, on: bool) {
        if flag & ARITH_FLAGS != 0 {
            self.materialize();
        }
        if on {
            self.eflags |= flag;
        } else {
            self.eflags &= !flag;
        }
    }

    /// Evaluate a Jcc/SETcc/CMOVcc condition (low nibble of the opcode).
    pub fn condition(&self, cc: u8) -> bool {
        let taken = match (cc & 0xF) >> 1 {
            0 => self.get(FLAG_OF),
            1 => self.carry(),
            2 => self.get(FLAG_ZF),
            3 => {
                let f = self.value();
                f & (FLAG_CF | FLAG_ZF) != 0
            }
            4 => self.get(FLAG_SF),
            5 => self.get(FLAG_PF),
            6 => {
                let f = self.value();
                (f & FLAG_SF != 0) != (f & FLAG_OF != 0)
            }
            _ => {
                let f = self.value();
                f & FLAG_ZF != 0 || (f & FLAG_SF != 0) != (f & FLAG_OF != 0)
            }
        };
        taken != (cc & 1 != 0)
    }
}
