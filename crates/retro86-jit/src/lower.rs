//! Instruction selection: one retired instruction to one [`Step`].

use iced_x86::{Code, Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};
use retro86_cpu_core::flags::Width;
use retro86_cpu_core::interp::{ADC, ADD, AND, CMP, OR, SBB, SUB, XOR};
use retro86_cpu_core::jit::emitter::InsnRecord;
use retro86_cpu_core::jit::CpuStatus;

use crate::ir::{MicroOp, Src, Step};

pub fn lower(rec: &InsnRecord<'_>) -> Step {
    match select(rec) {
        Some(op) => Step::Native {
            next_pc: rec.next_pc,
            flow: rec.flow,
            op,
        },
        None => Step::Interp {
            next_pc: rec.next_pc,
        },
    }
}

fn select(rec: &InsnRecord<'_>) -> Option<MicroOp> {
    let code32 = rec.status.contains(CpuStatus::CODE32);
    let bitness = if code32 { 32 } else { 16 };
    let mut decoder = Decoder::with_ip(bitness, rec.bytes, u64::from(rec.pc), DecoderOptions::NONE);
    let insn = decoder.decode();
    if insn.is_invalid() || insn.len() != rec.bytes.len() || insn.has_lock_prefix() {
        return None;
    }
    // Everything selected here falls through.
    let fallthrough = rec.pc.wrapping_add(insn.len() as u32);
    let fallthrough = if code32 { fallthrough } else { fallthrough & 0xFFFF };
    if rec.next_pc != fallthrough {
        return None;
    }

    match insn.mnemonic() {
        Mnemonic::Nop if insn.op_count() == 0 => Some(MicroOp::Nop),
        Mnemonic::Mov => {
            let (w, dst) = dst_reg(&insn)?;
            let src = src_operand(&insn, w)?;
            Some(MicroOp::Mov { w, dst, src })
        }
        Mnemonic::Add => alu(&insn, ADD, true),
        Mnemonic::Or => alu(&insn, OR, true),
        Mnemonic::Adc => alu(&insn, ADC, true),
        Mnemonic::Sbb => alu(&insn, SBB, true),
        Mnemonic::And => alu(&insn, AND, true),
        Mnemonic::Sub => alu(&insn, SUB, true),
        Mnemonic::Xor => alu(&insn, XOR, true),
        Mnemonic::Cmp => alu(&insn, CMP, false),
        Mnemonic::Test => alu(&insn, AND, false),
        Mnemonic::Inc | Mnemonic::Dec => {
            let (w, reg) = dst_reg(&insn)?;
            Some(MicroOp::IncDec {
                dec: insn.mnemonic() == Mnemonic::Dec,
                w,
                reg,
            })
        }
        Mnemonic::Fxch if insn.code() == Code::Fxch_st0_sti => {
            let i = st_index(insn.op1_register())?;
            let top = rec.fpu_top & 7;
            Some(MicroOp::Fxch {
                top,
                phys_a: top,
                phys_b: top.wrapping_add(i) & 7,
            })
        }
        _ => None,
    }
}

fn alu(insn: &Instruction, op: u8, store: bool) -> Option<MicroOp> {
    let (w, dst) = dst_reg(insn)?;
    let src = src_operand(insn, w)?;
    Some(MicroOp::Alu {
        op,
        w,
        dst,
        src,
        store,
    })
}

fn dst_reg(insn: &Instruction) -> Option<(Width, u8)> {
    if insn.op0_kind() != OpKind::Register {
        return None;
    }
    gpr(insn.op0_register())
}

fn src_operand(insn: &Instruction, w: Width) -> Option<Src> {
    if insn.op_count() != 2 {
        return None;
    }
    match insn.op1_kind() {
        OpKind::Register => {
            let (sw, r) = gpr(insn.op1_register())?;
            (sw == w).then_some(Src::Reg(r))
        }
        OpKind::Immediate8
        | OpKind::Immediate16
        | OpKind::Immediate32
        | OpKind::Immediate8to16
        | OpKind::Immediate8to32 => Some(Src::Imm(insn.immediate(1) as u32 & w.mask())),
        _ => None,
    }
}

/// General register in interpreter numbering.
fn gpr(reg: Register) -> Option<(Width, u8)> {
    let r = match reg {
        Register::AL => (Width::Byte, 0),
        Register::CL => (Width::Byte, 1),
        Register::DL => (Width::Byte, 2),
        Register::BL => (Width::Byte, 3),
        Register::AH => (Width::Byte, 4),
        Register::CH => (Width::Byte, 5),
        Register::DH => (Width::Byte, 6),
        Register::BH => (Width::Byte, 7),
        Register::AX => (Width::Word, 0),
        Register::CX => (Width::Word, 1),
        Register::DX => (Width::Word, 2),
        Register::BX => (Width::Word, 3),
        Register::SP => (Width::Word, 4),
        Register::BP => (Width::Word, 5),
        Register::SI => (Width::Word, 6),
        Register::DI => (Width::Word, 7),
        Register::EAX => (Width::Dword, 0),
        Register::ECX => (Width::Dword, 1),
        Register::EDX => (Width::Dword, 2),
        Register::EBX => (Width::Dword, 3),
        Register::ESP => (Width::Dword, 4),
        Register::EBP => (Width::Dword, 5),
        Register::ESI => (Width::Dword, 6),
        Register::EDI => (Width::Dword, 7),
        _ => return None,
    };
    Some(r)
}

fn st_index(reg: Register) -> Option<u8> {
    let i = match reg {
        Register::ST0 => 0,
        Register::ST1 => 1,
        Register::ST2 => 2,
        Register::ST3 => 3,
        Register::ST4 => 4,
        Register::ST5 => 5,
        Register::ST6 => 6,
        Register::ST7 => 7,
        _ => return None,
    };
    Some(i)
}
