//! Per-model opcode dispatch tables.
//!
//! Each table has 1024 slots indexed by `opcode | op32 << 8 | addr32 << 9`. The
//! tables are built once per core from the registration lists below, filtered
//! by CPU class; overlapping registrations are rejected at construction.

use std::fmt;

use crate::error::CoreError;
use crate::model::{CpuClass, CpuModel};

use super::{
    op_invalid, op_undefined_8086, ops_alu as alu, ops_bit as bit, ops_cf as cf, ops_data as data,
    ops_string as string, ops_system as sys, ops_x87 as x87, Handler, Insn,
};

use CpuClass::{I186, I286, I386, I486, I8086, I8088, Pentium, PentiumII};

const SLOTS: usize = 1024;

#[derive(Clone, Copy)]
struct Entry {
    lo: u8,
    hi: u8,
    min: CpuClass,
    max: CpuClass,
    handler: Handler,
}

const fn from(lo: u8, hi: u8, min: CpuClass, handler: Handler) -> Entry {
    Entry {
        lo,
        hi,
        min,
        max: PentiumII,
        handler,
    }
}

const fn only(lo: u8, hi: u8, min: CpuClass, max: CpuClass, handler: Handler) -> Entry {
    Entry {
        lo,
        hi,
        min,
        max,
        handler,
    }
}

static PRIMARY: &[Entry] = &[
    from(0x00, 0x05, I8088, alu::alu_std),
    from(0x06, 0x06, I8088, data::push_sreg),
    from(0x07, 0x07, I8088, data::pop_sreg),
    from(0x08, 0x0D, I8088, alu::alu_std),
    from(0x0E, 0x0E, I8088, data::push_sreg),
    only(0x0F, 0x0F, I8088, I8086, data::pop_cs),
    from(0x0F, 0x0F, I286, escape_0f),
    from(0x10, 0x15, I8088, alu::alu_std),
    from(0x16, 0x16, I8088, data::push_sreg),
    from(0x17, 0x17, I8088, data::pop_sreg),
    from(0x18, 0x1D, I8088, alu::alu_std),
    from(0x1E, 0x1E, I8088, data::push_sreg),
    from(0x1F, 0x1F, I8088, data::pop_sreg),
    from(0x20, 0x25, I8088, alu::alu_std),
    from(0x27, 0x27, I8088, alu::daa),
    from(0x28, 0x2D, I8088, alu::alu_std),
    from(0x2F, 0x2F, I8088, alu::das),
    from(0x30, 0x35, I8088, alu::alu_std),
    from(0x37, 0x37, I8088, alu::aaa),
    from(0x38, 0x3D, I8088, alu::alu_std),
    from(0x3F, 0x3F, I8088, alu::aas),
    from(0x40, 0x4F, I8088, alu::inc_dec_reg),
    from(0x50, 0x57, I8088, data::push_reg),
    from(0x58, 0x5F, I8088, data::pop_reg),
    // 60-6F decode as Jcc on the 8086.
    only(0x60, 0x6F, I8088, I8086, cf::jcc_short),
    from(0x60, 0x60, I186, data::pusha),
    from(0x61, 0x61, I186, data::popa),
    from(0x62, 0x62, I186, data::bound),
    from(0x63, 0x63, I286, sys::arpl),
    from(0x68, 0x68, I186, data::push_imm),
    from(0x69, 0x69, I186, alu::imul_imm),
    from(0x6A, 0x6A, I186, data::push_imm),
    from(0x6B, 0x6B, I186, alu::imul_imm),
    from(0x6C, 0x6F, I186, string::string_op),
    from(0x70, 0x7F, I8088, cf::jcc_short),
    from(0x80, 0x83, I8088, alu::group1),
    from(0x84, 0x85, I8088, alu::test_rm),
    from(0x86, 0x87, I8088, data::xchg_rm),
    from(0x88, 0x8B, I8088, data::mov_rm),
    from(0x8C, 0x8C, I8088, data::mov_rm_sreg),
    from(0x8D, 0x8D, I8088, data::lea),
    from(0x8E, 0x8E, I8088, data::mov_sreg_rm),
    from(0x8F, 0x8F, I8088, data::pop_rm),
    from(0x90, 0x97, I8088, data::xchg_acc),
    from(0x98, 0x98, I8088, alu::cbw),
    from(0x99, 0x99, I8088, alu::cwd),
    from(0x9A, 0x9A, I8088, cf::call_far_imm),
    from(0x9B, 0x9B, I8088, x87::fwait),
    from(0x9C, 0x9C, I8088, data::pushf),
    from(0x9D, 0x9D, I8088, data::popf),
    from(0x9E, 0x9E, I8088, data::sahf),
    from(0x9F, 0x9F, I8088, data::lahf),
    from(0xA0, 0xA3, I8088, data::mov_moffs),
    from(0xA4, 0xA7, I8088, string::string_op),
    from(0xA8, 0xA9, I8088, alu::test_acc),
    from(0xAA, 0xAF, I8088, string::string_op),
    from(0xB0, 0xBF, I8088, data::mov_reg_imm),
    // C0/C1 and C8/C9 alias the RET forms on the 8086.
    only(0xC0, 0xC1, I8088, I8086, cf::ret_near),
    from(0xC0, 0xC1, I186, alu::group2),
    from(0xC2, 0xC3, I8088, cf::ret_near),
    from(0xC4, 0xC5, I8088, data::load_far_ptr),
    from(0xC6, 0xC7, I8088, data::mov_rm_imm),
    only(0xC8, 0xC9, I8088, I8086, cf::ret_far),
    from(0xC8, 0xC8, I186, data::enter),
    from(0xC9, 0xC9, I186, data::leave),
    from(0xCA, 0xCB, I8088, cf::ret_far),
    from(0xCC, 0xCE, I8088, cf::int_sw),
    from(0xCF, 0xCF, I8088, cf::iret),
    from(0xD0, 0xD3, I8088, alu::group2),
    from(0xD4, 0xD4, I8088, alu::aam),
    from(0xD5, 0xD5, I8088, alu::aad),
    from(0xD6, 0xD6, I8088, alu::salc),
    from(0xD7, 0xD7, I8088, data::xlat),
    from(0xD8, 0xDF, I8088, x87::esc),
    from(0xE0, 0xE3, I8088, cf::loop_jcxz),
    from(0xE4, 0xE7, I8088, sys::in_out),
    from(0xE8, 0xE8, I8088, cf::call_near_rel),
    from(0xE9, 0xE9, I8088, cf::jmp_near_rel),
    from(0xEA, 0xEA, I8088, cf::jmp_far_imm),
    from(0xEB, 0xEB, I8088, cf::jmp_short),
    from(0xEC, 0xEF, I8088, sys::in_out),
    from(0xF1, 0xF1, I386, cf::int_sw),
    from(0xF4, 0xF4, I8088, sys::hlt),
    from(0xF5, 0xF5, I8088, sys::flag_op),
    from(0xF6, 0xF7, I8088, alu::group3),
    from(0xF8, 0xFD, I8088, sys::flag_op),
    from(0xFE, 0xFE, I8088, alu::group4),
    from(0xFF, 0xFF, I8088, cf::group5),
];

static SECONDARY: &[Entry] = &[
    from(0x00, 0x00, I286, sys::group6),
    from(0x01, 0x01, I286, sys::group7),
    from(0x02, 0x03, I286, sys::lar_lsl),
    from(0x06, 0x06, I286, sys::clts),
    from(0x08, 0x09, I486, sys::invd),
    from(0x0B, 0x0B, PentiumII, sys::ud2),
    from(0x20, 0x23, I386, sys::mov_cr_dr),
    from(0x30, 0x30, Pentium, sys::wrmsr),
    from(0x31, 0x31, Pentium, sys::rdtsc),
    from(0x32, 0x32, Pentium, sys::rdmsr),
    from(0x40, 0x4F, PentiumII, data::cmovcc),
    from(0x80, 0x8F, I386, cf::jcc_near),
    from(0x90, 0x9F, I386, data::setcc),
    from(0xA0, 0xA0, I386, data::push_sreg),
    from(0xA1, 0xA1, I386, data::pop_sreg),
    from(0xA2, 0xA2, Pentium, sys::cpuid),
    from(0xA3, 0xA3, I386, bit::bt_rm),
    from(0xA4, 0xA5, I386, bit::shld_shrd),
    from(0xA8, 0xA8, I386, data::push_sreg),
    from(0xA9, 0xA9, I386, data::pop_sreg),
    from(0xAB, 0xAB, I386, bit::bt_rm),
    from(0xAC, 0xAD, I386, bit::shld_shrd),
    from(0xAF, 0xAF, I386, alu::imul_r_rm),
    from(0xB0, 0xB1, I486, data::cmpxchg),
    from(0xB2, 0xB2, I386, data::load_far_ptr),
    from(0xB3, 0xB3, I386, bit::bt_rm),
    from(0xB4, 0xB5, I386, data::load_far_ptr),
    from(0xB6, 0xB7, I386, data::movzx_movsx),
    from(0xBA, 0xBA, I386, bit::group8),
    from(0xBB, 0xBB, I386, bit::bt_rm),
    from(0xBC, 0xBD, I386, bit::bsf_bsr),
    from(0xBE, 0xBF, I386, data::movzx_movsx),
    from(0xC0, 0xC1, I486, data::xadd),
    from(0xC7, 0xC7, Pentium, data::cmpxchg8b),
    from(0xC8, 0xCF, I486, data::bswap),
];

/// Two-byte opcodes: fetch the second byte and dispatch through the secondary
/// table.
fn escape_0f(
    core: &mut crate::CpuCore,
    bus: &mut dyn crate::platform::Platform,
    insn: &mut Insn,
) -> Result<super::Flow, crate::exception::Fault> {
    insn.opcode = core.fetch_u8(bus)?;
    let handler = core.tables.secondary(insn);
    handler(core, bus, insn)
}

/// Dispatch tables for one CPU class.
pub struct OpcodeTables {
    class: CpuClass,
    primary: Box<[Handler; SLOTS]>,
    secondary: Box<[Handler; SLOTS]>,
    populated: (usize, usize),
}

impl fmt::Debug for OpcodeTables {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpcodeTables")
            .field("class", &self.class)
            .field("primary_opcodes", &self.populated.0)
            .field("secondary_opcodes", &self.populated.1)
            .finish()
    }
}

#[inline]
fn slot(insn: &Insn) -> usize {
    usize::from(insn.opcode) | usize::from(insn.op32) << 8 | usize::from(insn.addr32) << 9
}

impl OpcodeTables {
    pub fn build(model: &CpuModel) -> Result<Self, CoreError> {
        let class = model.class;
        let fallback: Handler = if class < I186 {
            op_undefined_8086
        } else {
            op_invalid
        };
        let (primary, p) = build_table(model, PRIMARY, fallback, "primary")?;
        let (secondary, s) = build_table(model, SECONDARY, op_invalid, "secondary")?;
        if class >= I286 && s == 0 {
            return Err(CoreError::InconsistentTable {
                model: model.name,
                detail: "0F escape present but secondary table is empty".to_owned(),
            });
        }
        Ok(Self {
            class,
            primary,
            secondary,
            populated: (p, s),
        })
    }

    #[inline]
    pub fn class(&self) -> CpuClass {
        self.class
    }

    #[inline]
    pub fn primary(&self, insn: &Insn) -> Handler {
        self.primary[slot(insn)]
    }

    #[inline]
    pub fn secondary(&self, insn: &Insn) -> Handler {
        self.secondary[slot(insn)]
    }

    /// Number of opcodes with a registered handler, per table.
    pub fn populated(&self) -> (usize, usize) {
        self.populated
    }
}

fn build_table(
    model: &CpuModel,
    entries: &[Entry],
    fallback: Handler,
    name: &str,
) -> Result<(Box<[Handler; SLOTS]>, usize), CoreError> {
    let class = model.class;
    let mut owner: [Option<usize>; 256] = [None; 256];
    for (i, e) in entries.iter().enumerate() {
        if class < e.min || class > e.max {
            continue;
        }
        if e.lo > e.hi {
            return Err(CoreError::InconsistentTable {
                model: model.name,
                detail: format!("{name} entry {i} has an empty range"),
            });
        }
        for op in e.lo..=e.hi {
            if let Some(prev) = owner[usize::from(op)] {
                return Err(CoreError::InconsistentTable {
                    model: model.name,
                    detail: format!("{name} opcode {op:#04x} registered by entries {prev} and {i}"),
                });
            }
            owner[usize::from(op)] = Some(i);
        }
    }
    let mut slots = vec![fallback; SLOTS];
    let wide = class >= I386;
    for (op, owner) in owner.iter().enumerate() {
        let Some(i) = owner else { continue };
        let handler = entries[*i].handler;
        for variant in 0..4usize {
            // Below the 386 there are no size prefixes; those slots stay at the
            // fallback and are unreachable.
            if variant != 0 && !wide {
                continue;
            }
            slots[op | variant << 8] = handler;
        }
    }
    let populated = owner.iter().filter(|o| o.is_some()).count();
    let table: Box<[Handler; SLOTS]> =
        slots
            .into_boxed_slice()
            .try_into()
            .map_err(|_| CoreError::InconsistentTable {
                model: model.name,
                detail: format!("{name} table has the wrong size"),
            })?;
    Ok((table, populated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MODELS;

    #[test]
    fn every_model_builds() {
        for m in MODELS {
            let t = OpcodeTables::build(m).unwrap();
            assert_eq!(t.class(), m.class);
            assert!(t.populated().0 > 200, "{}", m.name);
        }
    }

    #[test]
    fn later_models_populate_more_secondary_opcodes() {
        let p286 = OpcodeTables::build(CpuModel::by_name("80286").unwrap()).unwrap();
        let p386 = OpcodeTables::build(CpuModel::by_name("386DX").unwrap()).unwrap();
        let p6 = OpcodeTables::build(CpuModel::by_name("PentiumII").unwrap()).unwrap();
        assert!(p286.populated().1 < p386.populated().1);
        assert!(p386.populated().1 < p6.populated().1);
        let p8086 = OpcodeTables::build(CpuModel::by_name("8086").unwrap()).unwrap();
        assert_eq!(p8086.populated().1, 0);
    }

    #[test]
    fn overlapping_registrations_are_rejected() {
        let entries = [
            from(0x00, 0x05, I8088, alu::alu_std),
            from(0x05, 0x06, I8088, data::push_sreg),
        ];
        let err = build_table(CpuModel::by_name("8086").unwrap(), &entries, op_invalid, "t")
            .unwrap_err();
        assert!(matches!(err, CoreError::InconsistentTable { .. }));
    }
}
