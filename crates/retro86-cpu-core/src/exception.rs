//! Architectural exceptions.
//!
//! A [`Fault`] aborts the in-flight instruction and travels back to the
//! dispatcher through `Result<_, Fault>`; nothing in the core panics or unwinds
//! on guest behaviour.

use retro86_mmu::PageFault;

/// Architecturally defined x86 exception vectors.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exception {
    DivideError = 0,          // #DE
    Debug = 1,                // #DB
    NonMaskableInterrupt = 2, // NMI
    Breakpoint = 3,           // #BP
    Overflow = 4,             // #OF
    BoundRangeExceeded = 5,   // #BR
    InvalidOpcode = 6,        // #UD
    DeviceNotAvailable = 7,   // #NM
    DoubleFault = 8,          // #DF
    InvalidTss = 10,          // #TS
    SegmentNotPresent = 11,   // #NP
    StackFault = 12,          // #SS
    GeneralProtection = 13,   // #GP
    PageFault = 14,           // #PF
    X87Fpu = 16,              // #MF
    AlignmentCheck = 17,      // #AC
}

impl Exception {
    #[inline]
    pub const fn vector(self) -> u8 {
        self as u8
    }

    /// Whether the CPU pushes an error code for this exception.
    #[inline]
    pub const fn pushes_error_code(self) -> bool {
        matches!(
            self,
            Exception::DoubleFault
                | Exception::InvalidTss
                | Exception::SegmentNotPresent
                | Exception::StackFault
                | Exception::GeneralProtection
                | Exception::PageFault
                | Exception::AlignmentCheck
        )
    }

    /// Faults report the address of the faulting instruction; traps the next one.
    #[inline]
    pub const fn is_trap(self) -> bool {
        matches!(
            self,
            Exception::Debug | Exception::Breakpoint | Exception::Overflow
        )
    }

    pub const fn from_vector(vector: u8) -> Option<Self> {
        Some(match vector {
            0 => Exception::DivideError,
            1 => Exception::Debug,
            2 => Exception::NonMaskableInterrupt,
            3 => Exception::Breakpoint,
            4 => Exception::Overflow,
            5 => Exception::BoundRangeExceeded,
            6 => Exception::InvalidOpcode,
            7 => Exception::DeviceNotAvailable,
            8 => Exception::DoubleFault,
            10 => Exception::InvalidTss,
            11 => Exception::SegmentNotPresent,
            12 => Exception::StackFault,
            13 => Exception::GeneralProtection,
            14 => Exception::PageFault,
            16 => Exception::X87Fpu,
            17 => Exception::AlignmentCheck,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExceptionClass {
    Benign,
    Contributory,
    PageFault,
    DoubleFault,
}

impl ExceptionClass {
    pub(crate) fn of(exception: Exception) -> Self {
        match exception {
            Exception::PageFault => Self::PageFault,
            Exception::DoubleFault => Self::DoubleFault,
            Exception::DivideError
            | Exception::InvalidTss
            | Exception::SegmentNotPresent
            | Exception::StackFault
            | Exception::GeneralProtection => Self::Contributory,
            _ => Self::Benign,
        }
    }
}

/// Whether `second`, raised while delivering `first`, escalates to #DF.
pub(crate) fn should_double_fault(first: Exception, second: Exception) -> bool {
    use ExceptionClass as C;
    matches!(
        (C::of(first), C::of(second)),
        (C::Contributory, C::Contributory) | (C::PageFault, C::Contributory | C::PageFault)
    )
}

/// A raised architectural exception, ready for delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub exception: Exception,
    pub error_code: Option<u32>,
    /// Linear address for #PF (loaded into CR2 on delivery).
    pub cr2: Option<u32>,
}

impl Fault {
    #[inline]
    pub const fn new(exception: Exception) -> Self {
        Self {
            exception,
            error_code: None,
            cr2: None,
        }
    }

    #[inline]
    pub const fn with_code(exception: Exception, code: u32) -> Self {
        Self {
            exception,
            error_code: Some(code),
            cr2: None,
        }
    }

    #[inline]
    pub const fn de() -> Self {
        Self::new(Exception::DivideError)
    }

    #[inline]
    pub const fn db() -> Self {
        Self::new(Exception::Debug)
    }

    #[inline]
    pub const fn br() -> Self {
        Self::new(Exception::BoundRangeExceeded)
    }

    #[inline]
    pub const fn ud() -> Self {
        Self::new(Exception::InvalidOpcode)
    }

    #[inline]
    pub const fn nm() -> Self {
        Self::new(Exception::DeviceNotAvailable)
    }

    #[inline]
    pub const fn mf() -> Self {
        Self::new(Exception::X87Fpu)
    }

    #[inline]
    pub const fn gp(code: u16) -> Self {
        Self::with_code(Exception::GeneralProtection, code as u32)
    }

    #[inline]
    pub const fn gp0() -> Self {
        Self::gp(0)
    }

    /// #GP with a selector-derived error code (RPL bits cleared).
    #[inline]
    pub const fn gp_sel(selector: u16) -> Self {
        Self::gp(selector & 0xFFFC)
    }

    #[inline]
    pub const fn np(selector: u16) -> Self {
        Self::with_code(Exception::SegmentNotPresent, (selector & 0xFFFC) as u32)
    }

    #[inline]
    pub const fn ss(selector: u16) -> Self {
        Self::with_code(Exception::StackFault, (selector & 0xFFFC) as u32)
    }

    #[inline]
    pub const fn ts(selector: u16) -> Self {
        Self::with_code(Exception::InvalidTss, (selector & 0xFFFC) as u32)
    }

    #[inline]
    pub const fn df() -> Self {
        Self::with_code(Exception::DoubleFault, 0)
    }

    #[inline]
    pub const fn vector(&self) -> u8 {
        self.exception.vector()
    }

    /// Set the EXT bit (bit 0) of the error code for externally caused events.
    #[inline]
    pub(crate) fn external(mut self, ext: bool) -> Self {
        if ext {
            if let Some(code) = self.error_code.as_mut() {
                if self.exception != Exception::PageFault {
                    *code |= 1;
                }
            }
        }
        self
    }
}

impl From<PageFault> for Fault {
    fn from(pf: PageFault) -> Self {
        Self {
            exception: Exception::PageFault,
            error_code: Some(pf.error_code as u32),
            cr2: Some(pf.addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_error_codes_drop_rpl() {
        assert_eq!(Fault::np(0x000B).error_code, Some(0x0008));
        assert_eq!(Fault::gp_sel(0x0013).error_code, Some(0x0010));
    }

    #[test]
    fn double_fault_matrix() {
        use Exception::*;
        assert!(should_double_fault(GeneralProtection, SegmentNotPresent));
        assert!(should_double_fault(PageFault, PageFault));
        assert!(should_double_fault(PageFault, GeneralProtection));
        assert!(!should_double_fault(GeneralProtection, PageFault));
        assert!(!should_double_fault(InvalidOpcode, GeneralProtection));
        assert!(!should_double_fault(Debug, PageFault));
    }
}
