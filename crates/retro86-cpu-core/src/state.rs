//! Architectural register file.

use serde::{Deserialize, Serialize};

use crate::flags::{FlagState, Width, FLAG_IOPL_MASK, FLAG_IOPL_SHIFT, FLAG_VM};
use crate::model::{CpuClass, CpuModel};
use crate::segmentation::descriptor::Descriptor;

pub use retro86_mmu::{CR0_PE, CR0_PG, CR0_WP, CR4_PSE};

pub const CR0_MP: u32 = 1 << 1;
pub const CR0_EM: u32 = 1 << 2;
pub const CR0_TS: u32 = 1 << 3;
pub const CR0_ET: u32 = 1 << 4;
pub const CR0_NE: u32 = 1 << 5;
pub const CR0_AM: u32 = 1 << 18;
pub const CR0_NW: u32 = 1 << 29;
pub const CR0_CD: u32 = 1 << 30;

pub const CR4_TSD: u32 = 1 << 2;

pub const EAX: usize = 0;
pub const ECX: usize = 1;
pub const EDX: usize = 2;
pub const EBX: usize = 3;
pub const ESP: usize = 4;
pub const EBP: usize = 5;
pub const ESI: usize = 6;
pub const EDI: usize = 7;

/// Base value marking a segment register as unusable.
pub const UNUSABLE_BASE: u32 = 0xFFFF_FFFF;

pub const ACCESS_PRESENT: u8 = 0x80;
pub const ACCESS_S: u8 = 0x10;
pub const ACCESS_CODE: u8 = 0x08;
/// Conforming (code) / expand-down (data).
pub const ACCESS_CE: u8 = 0x04;
/// Readable (code) / writable (data).
pub const ACCESS_RW: u8 = 0x02;
pub const ACCESS_ACCESSED: u8 = 0x01;

pub const SEG_FLAG_G: u8 = 0x8;
pub const SEG_FLAG_DB: u8 = 0x4;

/// Segment register, numbered as in the ModR/M `sreg` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegReg {
    pub const ALL: [SegReg; 6] = [
        SegReg::Es,
        SegReg::Cs,
        SegReg::Ss,
        SegReg::Ds,
        SegReg::Fs,
        SegReg::Gs,
    ];

    #[inline]
    pub fn from_index(idx: u8) -> Option<Self> {
        Self::ALL.get(idx as usize).copied()
    }

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Hidden part of a segment register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentCache {
    pub selector: u16,
    pub base: u32,
    /// Byte-granular limit.
    pub limit: u32,
    /// Lowest valid offset (non-zero only for expand-down segments).
    pub limit_low: u32,
    /// Highest valid offset.
    pub limit_high: u32,
    /// Descriptor access-rights byte (P, DPL, S, type).
    pub access: u8,
    /// Descriptor flags nibble (G, D/B, L, AVL).
    pub flags: u8,
    /// Loaded through a validated path.
    pub valid: bool,
}

impl Default for SegmentCache {
    fn default() -> Self {
        Self::real_mode(0, false)
    }
}

impl SegmentCache {
    fn with_limits(mut self) -> Self {
        let expand_down = self.access & (ACCESS_S | ACCESS_CODE | ACCESS_CE) == ACCESS_S | ACCESS_CE;
        if expand_down {
            self.limit_low = self.limit.wrapping_add(1);
            self.limit_high = if self.flags & SEG_FLAG_DB != 0 {
                0xFFFF_FFFF
            } else {
                0xFFFF
            };
        } else {
            self.limit_low = 0;
            self.limit_high = self.limit;
        }
        self
    }

    pub fn real_mode(selector: u16, code: bool) -> Self {
        Self {
            selector,
            base: u32::from(selector) << 4,
            limit: 0xFFFF,
            limit_low: 0,
            limit_high: 0xFFFF,
            access: if code { 0x9B } else { 0x93 },
            flags: 0,
            valid: true,
        }
    }

    /// Virtual-8086 segment: real-mode addressing at DPL 3.
    pub fn v86(selector: u16, code: bool) -> Self {
        let mut s = Self::real_mode(selector, code);
        s.access |= 3 << 5;
        s
    }

    /// A null selector load (DS/ES/FS/GS only).
    pub fn null(selector: u16) -> Self {
        Self {
            selector,
            base: UNUSABLE_BASE,
            limit: 0,
            limit_low: 1,
            limit_high: 0,
            access: 0,
            flags: 0,
            valid: false,
        }
    }

    pub fn from_descriptor(selector: u16, desc: &Descriptor) -> Self {
        Self {
            selector,
            base: desc.base(),
            limit: desc.effective_limit(),
            limit_low: 0,
            limit_high: 0,
            access: desc.access(),
            flags: desc.flags(),
            valid: true,
        }
        .with_limits()
    }

    /// Real-mode reload: only the selector and base change; limit and attributes
    /// are retained so "unreal" limits survive.
    pub fn reload_real(&mut self, selector: u16) {
        self.selector = selector;
        self.base = u32::from(selector) << 4;
        if !self.valid || self.access & ACCESS_PRESENT == 0 {
            self.access = if self.access & ACCESS_CODE != 0 { 0x9B } else { 0x93 };
            self.limit = 0xFFFF;
            self.flags = 0;
        }
        self.valid = true;
        *self = self.with_limits();
    }

    #[inline]
    pub fn is_usable(&self) -> bool {
        self.valid && self.base != UNUSABLE_BASE
    }

    #[inline]
    pub fn rpl(&self) -> u8 {
        (self.selector & 3) as u8
    }

    #[inline]
    pub fn dpl(&self) -> u8 {
        (self.access >> 5) & 3
    }

    #[inline]
    pub fn is_code(&self) -> bool {
        self.access & ACCESS_CODE != 0
    }

    #[inline]
    pub fn conforming(&self) -> bool {
        self.is_code() && self.access & ACCESS_CE != 0
    }

    #[inline]
    pub fn readable(&self) -> bool {
        !self.is_code() || self.access & ACCESS_RW != 0
    }

    #[inline]
    pub fn writable(&self) -> bool {
        !self.is_code() && self.access & ACCESS_RW != 0
    }

    /// D/B bit: 32-bit code or stack.
    #[inline]
    pub fn big(&self) -> bool {
        self.flags & SEG_FLAG_DB != 0
    }

    /// Whether `offset..offset+len` lies within the limits.
    #[inline]
    pub fn contains(&self, offset: u32, len: u32) -> bool {
        let last = u64::from(offset) + u64::from(len.max(1)) - 1;
        offset >= self.limit_low && last <= u64::from(self.limit_high)
    }

    /// Base 0 with a 4 GB limit.
    #[inline]
    pub fn is_flat(&self) -> bool {
        self.is_usable() && self.base == 0 && self.limit == 0xFFFF_FFFF && self.limit_low == 0
    }
}

/// GDTR / IDTR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableReg {
    pub base: u32,
    pub limit: u16,
}

pub const FPU_TAG_VALID: u16 = 0;
pub const FPU_TAG_ZERO: u16 = 1;
pub const FPU_TAG_SPECIAL: u16 = 2;
pub const FPU_TAG_EMPTY: u16 = 3;

pub const FPU_SW_IE: u16 = 1 << 0;
pub const FPU_SW_ZE: u16 = 1 << 2;
pub const FPU_SW_SF: u16 = 1 << 6;
pub const FPU_SW_ES: u16 = 1 << 7;
pub const FPU_SW_C0: u16 = 1 << 8;
pub const FPU_SW_C1: u16 = 1 << 9;
pub const FPU_SW_C2: u16 = 1 << 10;
pub const FPU_SW_TOP_MASK: u16 = 7 << 11;
pub const FPU_SW_C3: u16 = 1 << 14;
pub const FPU_SW_B: u16 = 1 << 15;

/// x87 register stack, held as `f64`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FpuState {
    /// Physical registers R0..R7.
    pub st: [f64; 8],
    /// Two tag bits per physical register.
    pub tags: u16,
    pub top: u8,
    pub cw: u16,
    /// Status word without TOP (see [`FpuState::status_word`]).
    pub sw: u16,
}

impl Default for FpuState {
    fn default() -> Self {
        Self {
            st: [0.0; 8],
            tags: 0xFFFF,
            top: 0,
            cw: 0x037F,
            sw: 0,
        }
    }
}

impl FpuState {
    #[inline]
    pub fn phys(&self, i: u8) -> usize {
        usize::from(self.top.wrapping_add(i) & 7)
    }

    #[inline]
    pub fn tag(&self, phys: usize) -> u16 {
        (self.tags >> (phys * 2)) & 3
    }

    #[inline]
    fn set_tag(&mut self, phys: usize, tag: u16) {
        self.tags = (self.tags & !(3 << (phys * 2))) | (tag << (phys * 2));
    }

    fn tag_for(v: f64) -> u16 {
        if v == 0.0 {
            FPU_TAG_ZERO
        } else if v.is_finite() {
            FPU_TAG_VALID
        } else {
            FPU_TAG_SPECIAL
        }
    }

    #[inline]
    pub fn is_empty(&self, i: u8) -> bool {
        self.tag(self.phys(i)) == FPU_TAG_EMPTY
    }

    #[inline]
    pub fn st(&self, i: u8) -> f64 {
        self.st[self.phys(i)]
    }

    pub fn set_st(&mut self, i: u8, v: f64) {
        let p = self.phys(i);
        self.st[p] = v;
        self.set_tag(p, Self::tag_for(v));
    }

    /// Write a physical register directly (recompiled code with a baked TOP).
    pub fn set_phys(&mut self, phys: usize, v: f64) {
        self.st[phys & 7] = v;
        self.set_tag(phys & 7, Self::tag_for(v));
    }

    /// Push; on overflow flags a stack fault and loads the indefinite NaN.
    pub fn push(&mut self, v: f64) -> bool {
        self.top = self.top.wrapping_sub(1) & 7;
        let p = self.phys(0);
        if self.tag(p) != FPU_TAG_EMPTY {
            self.stack_fault(true);
            self.st[p] = f64::NAN;
            self.set_tag(p, FPU_TAG_SPECIAL);
            return false;
        }
        self.st[p] = v;
        self.set_tag(p, Self::tag_for(v));
        true
    }

    pub fn pop(&mut self) {
        let p = self.phys(0);
        self.set_tag(p, FPU_TAG_EMPTY);
        self.top = (self.top + 1) & 7;
    }

    /// Record an invalid-operation stack fault (`overflow` sets C1).
    pub fn stack_fault(&mut self, overflow: bool) {
        self.sw |= FPU_SW_IE | FPU_SW_SF;
        if overflow {
            self.sw |= FPU_SW_C1;
        } else {
            self.sw &= !FPU_SW_C1;
        }
        if self.cw & 1 == 0 {
            self.sw |= FPU_SW_ES | FPU_SW_B;
        }
    }

    pub fn status_word(&self) -> u16 {
        (self.sw & !FPU_SW_TOP_MASK) | (u16::from(self.top) << 11)
    }

    pub fn set_status_word(&mut self, sw: u16) {
        self.top = ((sw >> 11) & 7) as u8;
        self.sw = sw & !FPU_SW_TOP_MASK;
    }

    pub fn set_condition(&mut self, c3: bool, c2: bool, c0: bool) {
        self.sw &= !(FPU_SW_C0 | FPU_SW_C2 | FPU_SW_C3 | FPU_SW_C1);
        if c0 {
            self.sw |= FPU_SW_C0;
        }
        if c2 {
            self.sw |= FPU_SW_C2;
        }
        if c3 {
            self.sw |= FPU_SW_C3;
        }
    }
}

/// Coarse operating mode, as seen by logging and the recompiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperatingMode {
    Real,
    ProtectedFlat,
    ProtectedSegmented,
    Virtual8086,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CpuState {
    pub gpr: [u32; 8],
    pub eip: u32,
    pub flags: FlagState,
    pub segs: [SegmentCache; 6],
    pub gdtr: TableReg,
    pub idtr: TableReg,
    pub ldtr: SegmentCache,
    pub tr: SegmentCache,
    pub cr0: u32,
    pub cr2: u32,
    pub cr3: u32,
    pub cr4: u32,
    pub dr: [u32; 8],
    pub fpu: FpuState,
    pub tsc: u64,
    /// Remaining cycle budget; the run loops return once it drops to zero or below.
    pub cycles: i64,
    pub halted: bool,
}

impl CpuState {
    /// Power-on state for `model`.
    pub fn reset(model: &CpuModel) -> Self {
        let mut segs = [SegmentCache::real_mode(0, false); 6];
        let mut cs = SegmentCache::real_mode(0xF000, true);
        if model.at_least(CpuClass::I386) {
            // The first far jump reloads the base; until then fetches hit the top of
            // the address space.
            cs.base = 0xFFFF_0000;
        }
        segs[SegReg::Cs.index()] = cs;

        let mut gpr = [0u32; 8];
        if model.at_least(CpuClass::I386) {
            gpr[EDX] = model.cpuid_signature;
        }
        let cr0 = match model.class {
            c if c >= CpuClass::I486 => CR0_ET | CR0_CD | CR0_NW,
            CpuClass::I386 => CR0_ET,
            _ => 0,
        };
        let mut ldtr = SegmentCache::null(0);
        ldtr.access = 0x82;
        let mut tr = SegmentCache::null(0);
        tr.access = 0x8B;

        Self {
            gpr,
            eip: 0xFFF0,
            flags: FlagState::new(0),
            segs,
            gdtr: TableReg::default(),
            idtr: TableReg {
                base: 0,
                limit: 0x3FF,
            },
            ldtr,
            tr,
            cr0,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            dr: [0, 0, 0, 0, 0xFFFF_0FF0, 0x0400, 0xFFFF_0FF0, 0x0400],
            fpu: FpuState::default(),
            tsc: 0,
            cycles: 0,
            halted: false,
        }
    }

    #[inline]
    pub fn seg(&self, seg: SegReg) -> &SegmentCache {
        &self.segs[seg.index()]
    }

    #[inline]
    pub fn seg_mut(&mut self, seg: SegReg) -> &mut SegmentCache {
        &mut self.segs[seg.index()]
    }

    /// 8-bit register by ModR/M number (AL, CL, DL, BL, AH, CH, DH, BH).
    #[inline]
    pub fn reg8(&self, idx: u8) -> u8 {
        let i = usize::from(idx & 3);
        if idx & 4 == 0 {
            self.gpr[i] as u8
        } else {
            (self.gpr[i] >> 8) as u8
        }
    }

    #[inline]
    pub fn set_reg8(&mut self, idx: u8, v: u8) {
        let i = usize::from(idx & 3);
        if idx & 4 == 0 {
            self.gpr[i] = (self.gpr[i] & !0xFF) | u32::from(v);
        } else {
            self.gpr[i] = (self.gpr[i] & !0xFF00) | (u32::from(v) << 8);
        }
    }

    #[inline]
    pub fn reg16(&self, idx: u8) -> u16 {
        self.gpr[usize::from(idx & 7)] as u16
    }

    #[inline]
    pub fn set_reg16(&mut self, idx: u8, v: u16) {
        let i = usize::from(idx & 7);
        self.gpr[i] = (self.gpr[i] & 0xFFFF_0000) | u32::from(v);
    }

    #[inline]
    pub fn reg32(&self, idx: u8) -> u32 {
        self.gpr[usize::from(idx & 7)]
    }

    #[inline]
    pub fn set_reg32(&mut self, idx: u8, v: u32) {
        self.gpr[usize::from(idx & 7)] = v;
    }

    #[inline]
    pub fn reg(&self, w: Width, idx: u8) -> u32 {
        match w {
            Width::Byte => u32::from(self.reg8(idx)),
            Width::Word => u32::from(self.reg16(idx)),
            Width::Dword => self.reg32(idx),
        }
    }

    #[inline]
    pub fn set_reg(&mut self, w: Width, idx: u8, v: u32) {
        match w {
            Width::Byte => self.set_reg8(idx, v as u8),
            Width::Word => self.set_reg16(idx, v as u16),
            Width::Dword => self.set_reg32(idx, v),
        }
    }

    #[inline]
    pub fn protected(&self) -> bool {
        self.cr0 & CR0_PE != 0
    }

    #[inline]
    pub fn v86(&self) -> bool {
        self.protected() && self.flags.get(FLAG_VM)
    }

    #[inline]
    pub fn cpl(&self) -> u8 {
        if !self.protected() {
            0
        } else if self.flags.get(FLAG_VM) {
            3
        } else {
            self.segs[SegReg::Cs.index()].rpl()
        }
    }

    #[inline]
    pub fn iopl(&self) -> u8 {
        ((self.flags.value() & FLAG_IOPL_MASK) >> FLAG_IOPL_SHIFT) as u8
    }

    #[inline]
    pub fn code32(&self) -> bool {
        self.segs[SegReg::Cs.index()].big()
    }

    #[inline]
    pub fn stack32(&self) -> bool {
        self.segs[SegReg::Ss.index()].big()
    }

    /// Stack pointer, sized by SS.B.
    #[inline]
    pub fn sp(&self) -> u32 {
        if self.stack32() {
            self.gpr[ESP]
        } else {
            self.gpr[ESP] & 0xFFFF
        }
    }

    #[inline]
    pub fn set_sp(&mut self, v: u32) {
        if self.stack32() {
            self.gpr[ESP] = v;
        } else {
            self.gpr[ESP] = (self.gpr[ESP] & 0xFFFF_0000) | (v & 0xFFFF);
        }
    }

    #[inline]
    pub fn paging(&self) -> bool {
        self.cr0 & (CR0_PG | CR0_PE) == (CR0_PG | CR0_PE)
    }

    pub fn operating_mode(&self) -> OperatingMode {
        if !self.protected() {
            OperatingMode::Real
        } else if self.flags.get(FLAG_VM) {
            OperatingMode::Virtual8086
        } else if [SegReg::Cs, SegReg::Ds, SegReg::Es, SegReg::Ss]
            .iter()
            .all(|&s| self.seg(s).is_flat())
        {
            OperatingMode::ProtectedFlat
        } else {
            OperatingMode::ProtectedSegmented
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CpuModel;

    #[test]
    fn byte_register_views() {
        let mut s = CpuState::reset(CpuModel::by_name("386DX").unwrap());
        s.gpr[EBX] = 0x1234_5678;
        assert_eq!(s.reg8(3), 0x78); // BL
        assert_eq!(s.reg8(7), 0x56); // BH
        s.set_reg8(7, 0xAA);
        assert_eq!(s.gpr[EBX], 0x1234_AA78);
        s.set_reg16(3, 0xBEEF);
        assert_eq!(s.gpr[EBX], 0x1234_BEEF);
    }

    #[test]
    fn reset_vector() {
        let s = CpuState::reset(CpuModel::by_name("Pentium").unwrap());
        assert_eq!(s.seg(SegReg::Cs).base + s.eip, 0xFFFF_FFF0);
        let s = CpuState::reset(CpuModel::by_name("8088").unwrap());
        assert_eq!(s.seg(SegReg::Cs).base + s.eip, 0xF_FFF0);
    }

    #[test]
    fn expand_down_limits() {
        let mut seg = SegmentCache::real_mode(0, false);
        seg.access = 0x97; // data, expand-down, writable
        seg.limit = 0x0FFF;
        let seg = seg.with_limits();
        assert!(!seg.contains(0x0FFF, 1));
        assert!(seg.contains(0x1000, 2));
        assert!(!seg.contains(0xFFFF, 2));
    }

    #[test]
    fn fpu_push_pop_tracks_top_and_tags() {
        let mut f = FpuState::default();
        assert!(f.push(1.5));
        assert_eq!(f.top, 7);
        assert!(!f.is_empty(0));
        assert_eq!(f.st(0), 1.5);
        f.pop();
        assert_eq!(f.top, 0);
        assert!(f.is_empty(0));
    }
}
