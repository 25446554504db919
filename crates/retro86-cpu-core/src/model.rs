//! Read-only CPU model records: class, clock, feature mask, prefetch queue and bus
//! geometry, and the operand-class timing table handlers charge cycles from.

use bitflags::bitflags;

use crate::error::CoreError;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Features: u32 {
        /// On-chip (or always-present) x87.
        const FPU = 1 << 0;
        /// Protected mode (286+).
        const PROTECTED = 1 << 1;
        /// 32-bit operands/addresses, paging, V86 (386+).
        const I386 = 1 << 2;
        /// CR0.WP honoured by the paging unit.
        const WP = 1 << 3;
        const PSE = 1 << 4;
        const CPUID = 1 << 5;
        const TSC = 1 << 6;
        const MSR = 1 << 7;
        const CX8 = 1 << 8;
        const CMOV = 1 << 9;
        /// BSWAP, XADD, CMPXCHG, INVLPG.
        const I486 = 1 << 10;
    }
}

/// Instruction-set generation, ordered oldest to newest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CpuClass {
    I8088,
    I8086,
    I186,
    I286,
    I386,
    I486,
    Pentium,
    PentiumII,
}

/// Cycle costs for the operand classes handlers distinguish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Register, register.
    pub rr: u8,
    /// Register destination, memory source.
    pub rm: u8,
    /// Memory destination (read-modify-write).
    pub mr: u8,
    /// Branch taken.
    pub bt: u8,
    /// Branch not taken.
    pub bnt: u8,
    pub int: u8,
    pub iret: u8,
    pub call: u8,
    pub jmp: u8,
    pub retf: u8,
    pub mul: u8,
    pub div: u8,
    /// Per-iteration cost of string instructions.
    pub string: u8,
    /// Protected-mode segment load.
    pub seg_load: u8,
    pub fpu: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuModel {
    pub name: &'static str,
    pub class: CpuClass,
    pub clock_hz: u64,
    pub features: Features,
    /// Prefetch queue size in bytes; 0 disables the queue cycle model.
    pub prefetch_bytes: u8,
    /// External data bus width in bits.
    pub bus_width: u8,
    pub timings: Timings,
    /// Whether the recompiler may run code for this model.
    pub dynarec_capable: bool,
    /// CPUID leaf 1 EAX.
    pub cpuid_signature: u32,
    pub vendor: &'static [u8; 12],
}

impl CpuModel {
    #[inline]
    pub fn has(&self, f: Features) -> bool {
        self.features.contains(f)
    }

    #[inline]
    pub fn at_least(&self, class: CpuClass) -> bool {
        self.class >= class
    }

    pub fn by_name(name: &str) -> Result<&'static CpuModel, CoreError> {
        MODELS
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| CoreError::UnknownModel(name.to_owned()))
    }
}

const T_8086: Timings = Timings {
    rr: 3,
    rm: 9,
    mr: 16,
    bt: 16,
    bnt: 4,
    int: 51,
    iret: 24,
    call: 19,
    jmp: 15,
    retf: 26,
    mul: 118,
    div: 150,
    string: 17,
    seg_load: 2,
    fpu: 70,
};

const T_286: Timings = Timings {
    rr: 2,
    rm: 7,
    mr: 7,
    bt: 7,
    bnt: 3,
    int: 23,
    iret: 17,
    call: 7,
    jmp: 7,
    retf: 15,
    mul: 21,
    div: 22,
    string: 4,
    seg_load: 17,
    fpu: 40,
};

const T_386: Timings = Timings {
    rr: 2,
    rm: 6,
    mr: 7,
    bt: 7,
    bnt: 3,
    int: 37,
    iret: 22,
    call: 7,
    jmp: 7,
    retf: 18,
    mul: 14,
    div: 38,
    string: 4,
    seg_load: 18,
    fpu: 30,
};

const T_486: Timings = Timings {
    rr: 1,
    rm: 2,
    mr: 3,
    bt: 3,
    bnt: 1,
    int: 30,
    iret: 15,
    call: 3,
    jmp: 3,
    retf: 13,
    mul: 13,
    div: 40,
    string: 3,
    seg_load: 9,
    fpu: 10,
};

const T_P5: Timings = Timings {
    rr: 1,
    rm: 1,
    mr: 3,
    bt: 1,
    bnt: 1,
    int: 16,
    iret: 8,
    call: 1,
    jmp: 1,
    retf: 4,
    mul: 10,
    div: 41,
    string: 2,
    seg_load: 3,
    fpu: 3,
};

const F_386: Features = Features::PROTECTED.union(Features::I386);
const F_486: Features = F_386
    .union(Features::FPU)
    .union(Features::WP)
    .union(Features::I486);
const F_P5: Features = F_486
    .union(Features::PSE)
    .union(Features::CPUID)
    .union(Features::TSC)
    .union(Features::MSR)
    .union(Features::CX8);

const INTEL: &[u8; 12] = b"GenuineIntel";

/// The model table. Machine layers pick one record at configuration time.
pub static MODELS: &[CpuModel] = &[
    CpuModel {
        name: "8088",
        class: CpuClass::I8088,
        clock_hz: 4_772_728,
        features: Features::empty(),
        prefetch_bytes: 4,
        bus_width: 8,
        timings: T_8086,
        dynarec_capable: false,
        cpuid_signature: 0,
        vendor: INTEL,
    },
    CpuModel {
        name: "8086",
        class: CpuClass::I8086,
        clock_hz: 8_000_000,
        features: Features::empty(),
        prefetch_bytes: 6,
        bus_width: 16,
        timings: T_8086,
        dynarec_capable: false,
        cpuid_signature: 0,
        vendor: INTEL,
    },
    CpuModel {
        name: "80186",
        class: CpuClass::I186,
        clock_hz: 8_000_000,
        features: Features::empty(),
        prefetch_bytes: 6,
        bus_width: 16,
        timings: T_8086,
        dynarec_capable: false,
        cpuid_signature: 0,
        vendor: INTEL,
    },
    CpuModel {
        name: "80286",
        class: CpuClass::I286,
        clock_hz: 12_000_000,
        features: Features::PROTECTED,
        prefetch_bytes: 6,
        bus_width: 16,
        timings: T_286,
        dynarec_capable: false,
        cpuid_signature: 0,
        vendor: INTEL,
    },
    CpuModel {
        name: "386DX",
        class: CpuClass::I386,
        clock_hz: 33_000_000,
        features: F_386,
        prefetch_bytes: 0,
        bus_width: 32,
        timings: T_386,
        dynarec_capable: true,
        cpuid_signature: 0x0308,
        vendor: INTEL,
    },
    CpuModel {
        name: "486DX",
        class: CpuClass::I486,
        clock_hz: 66_000_000,
        features: F_486,
        prefetch_bytes: 0,
        bus_width: 32,
        timings: T_486,
        dynarec_capable: true,
        cpuid_signature: 0x0435,
        vendor: INTEL,
    },
    CpuModel {
        name: "Pentium",
        class: CpuClass::Pentium,
        clock_hz: 100_000_000,
        features: F_P5,
        prefetch_bytes: 0,
        bus_width: 64,
        timings: T_P5,
        dynarec_capable: true,
        cpuid_signature: 0x0525,
        vendor: INTEL,
    },
    CpuModel {
        name: "PentiumII",
        class: CpuClass::PentiumII,
        clock_hz: 300_000_000,
        features: F_P5.union(Features::CMOV),
        prefetch_bytes: 0,
        bus_width: 64,
        timings: T_P5,
        dynarec_capable: true,
        cpuid_signature: 0x0634,
        vendor: INTEL,
    },
];
