//! Raw 8-byte segment and gate descriptors.

/// System descriptor types (S = 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemType {
    Tss16Available = 1,
    Ldt = 2,
    Tss16Busy = 3,
    CallGate16 = 4,
    TaskGate = 5,
    InterruptGate16 = 6,
    TrapGate16 = 7,
    Tss32Available = 9,
    Tss32Busy = 0xB,
    CallGate32 = 0xC,
    InterruptGate32 = 0xE,
    TrapGate32 = 0xF,
}

impl SystemType {
    pub fn from_type(ty: u8) -> Option<Self> {
        Some(match ty & 0xF {
            1 => SystemType::Tss16Available,
            2 => SystemType::Ldt,
            3 => SystemType::Tss16Busy,
            4 => SystemType::CallGate16,
            5 => SystemType::TaskGate,
            6 => SystemType::InterruptGate16,
            7 => SystemType::TrapGate16,
            9 => SystemType::Tss32Available,
            0xB => SystemType::Tss32Busy,
            0xC => SystemType::CallGate32,
            0xE => SystemType::InterruptGate32,
            0xF => SystemType::TrapGate32,
            _ => return None,
        })
    }

    #[inline]
    pub fn is_tss(self) -> bool {
        matches!(
            self,
            SystemType::Tss16Available
                | SystemType::Tss16Busy
                | SystemType::Tss32Available
                | SystemType::Tss32Busy
        )
    }

    #[inline]
    pub fn is_tss_busy(self) -> bool {
        matches!(self, SystemType::Tss16Busy | SystemType::Tss32Busy)
    }

    /// 32-bit gate or TSS.
    #[inline]
    pub fn is_32(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub raw: u64,
}

impl Descriptor {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self { raw }
    }

    /// Build a segment descriptor from its fields (tests and firmware helpers).
    pub const fn segment(base: u32, limit: u32, access: u8, flags: u8) -> Self {
        let raw = (limit as u64 & 0xFFFF)
            | ((base as u64 & 0xFF_FFFF) << 16)
            | ((access as u64) << 40)
            | (((limit as u64 >> 16) & 0xF) << 48)
            | (((flags as u64) & 0xF) << 52)
            | (((base as u64 >> 24) & 0xFF) << 56);
        Self { raw }
    }

    /// Build a gate descriptor.
    pub const fn gate(selector: u16, offset: u32, access: u8, params: u8) -> Self {
        let raw = (offset as u64 & 0xFFFF)
            | ((selector as u64) << 16)
            | (((params & 0x1F) as u64) << 32)
            | ((access as u64) << 40)
            | (((offset as u64 >> 16) & 0xFFFF) << 48);
        Self { raw }
    }

    #[inline]
    pub fn base(&self) -> u32 {
        (((self.raw >> 16) & 0xFF_FFFF) | (((self.raw >> 56) & 0xFF) << 24)) as u32
    }

    /// Raw 20-bit limit.
    #[inline]
    pub fn raw_limit(&self) -> u32 {
        ((self.raw & 0xFFFF) | (((self.raw >> 48) & 0xF) << 16)) as u32
    }

    /// Limit in bytes after granularity scaling.
    #[inline]
    pub fn effective_limit(&self) -> u32 {
        let limit = self.raw_limit();
        if self.flags() & 0x8 != 0 {
            (limit << 12) | 0xFFF
        } else {
            limit
        }
    }

    #[inline]
    pub fn access(&self) -> u8 {
        (self.raw >> 40) as u8
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        ((self.raw >> 52) & 0xF) as u8
    }

    #[inline]
    pub fn present(&self) -> bool {
        self.access() & 0x80 != 0
    }

    #[inline]
    pub fn dpl(&self) -> u8 {
        (self.access() >> 5) & 3
    }

    #[inline]
    pub fn is_system(&self) -> bool {
        self.access() & 0x10 == 0
    }

    #[inline]
    pub fn typ(&self) -> u8 {
        self.access() & 0xF
    }

    pub fn system_type(&self) -> Option<SystemType> {
        if self.is_system() {
            SystemType::from_type(self.typ())
        } else {
            None
        }
    }

    #[inline]
    pub fn is_code(&self) -> bool {
        !self.is_system() && self.typ() & 0x8 != 0
    }

    #[inline]
    pub fn is_data(&self) -> bool {
        !self.is_system() && self.typ() & 0x8 == 0
    }

    #[inline]
    pub fn conforming(&self) -> bool {
        self.is_code() && self.typ() & 0x4 != 0
    }

    #[inline]
    pub fn readable(&self) -> bool {
        self.is_data() || (self.is_code() && self.typ() & 0x2 != 0)
    }

    #[inline]
    pub fn writable(&self) -> bool {
        self.is_data() && self.typ() & 0x2 != 0
    }

    #[inline]
    pub fn accessed(&self) -> bool {
        self.typ() & 0x1 != 0
    }

    #[inline]
    pub fn gate_selector(&self) -> u16 {
        (self.raw >> 16) as u16
    }

    /// Gate target offset; 16-bit gates only carry the low word.
    #[inline]
    pub fn gate_offset(&self) -> u32 {
        let lo = (self.raw & 0xFFFF) as u32;
        match self.system_type() {
            Some(t) if t.is_32() => lo | ((((self.raw >> 48) & 0xFFFF) as u32) << 16),
            _ => lo,
        }
    }

    #[inline]
    pub fn gate_params(&self) -> u8 {
        ((self.raw >> 32) & 0x1F) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_fields_round_trip() {
        let d = Descriptor::segment(0x1234_5678, 0xABCDE, 0x9A, 0xC);
        assert_eq!(d.base(), 0x1234_5678);
        assert_eq!(d.raw_limit(), 0xABCDE);
        assert_eq!(d.effective_limit(), 0xABCD_EFFF);
        assert!(d.is_code() && d.readable() && !d.conforming());
        assert!(d.present());
    }

    #[test]
    fn gate_offset_depends_on_gate_size() {
        let g32 = Descriptor::gate(0x0008, 0x1234_5678, 0x8E, 0);
        assert_eq!(g32.gate_offset(), 0x1234_5678);
        assert_eq!(g32.system_type(), Some(SystemType::InterruptGate32));
        let g16 = Descriptor::gate(0x0008, 0x1234_5678, 0x86, 0);
        assert_eq!(g16.gate_offset(), 0x5678);
    }
}
