//! Cross-check the hand encoder against iced-x86.
//!
//! Each encoder function is decoded back with iced's decoder and, where
//! iced's assembler can express the same instruction, compared with what
//! iced produces for it. Comparison goes through the NASM formatter so that
//! equivalent encodings (e.g. `89 /r` vs `8B /r`) are accepted.

use dslc::core::CodeBuffer;
use dslc::x64::encoder::{self as enc, JumpCondition};
use dslc::x64::Reg;
use iced_x86::code_asm::*;
use iced_x86::{Code, Decoder, DecoderOptions, Formatter, Instruction, NasmFormatter, Register};

const IP: u64 = 0x4000B0;

const ICED_GP64: [Register; 16] = [
    Register::RAX,
    Register::RCX,
    Register::RDX,
    Register::RBX,
    Register::RSP,
    Register::RBP,
    Register::RSI,
    Register::RDI,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

fn all_regs() -> impl Iterator<Item = Reg> {
    (0..16).filter_map(Reg::from_index)
}

fn iced(reg: Reg) -> Register {
    ICED_GP64[reg.index() as usize]
}

fn encode(f: impl FnOnce(&mut CodeBuffer)) -> Vec<u8> {
    let mut buf = CodeBuffer::new();
    f(&mut buf);
    buf.into_bytes()
}

/// Decode exactly one instruction that spans all of `bytes`.
fn decode_one(bytes: &[u8]) -> Instruction {
    let mut decoder = Decoder::with_ip(64, bytes, IP, DecoderOptions::NONE);
    let instruction = decoder.decode();
    assert_ne!(instruction.code(), Code::INVALID, "invalid encoding {bytes:02X?}");
    assert_eq!(instruction.len(), bytes.len(), "trailing bytes in {bytes:02X?}");
    instruction
}

fn format_all(bytes: &[u8]) -> Vec<String> {
    let mut decoder = Decoder::with_ip(64, bytes, IP, DecoderOptions::NONE);
    let mut formatter = NasmFormatter::new();
    let mut lines = Vec::new();
    for instruction in &mut decoder {
        let mut line = String::new();
        formatter.format(&instruction, &mut line);
        lines.push(line);
    }
    lines
}

fn assemble(f: impl FnOnce(&mut CodeAssembler) -> Result<(), IcedError>) -> Vec<u8> {
    let mut asm = CodeAssembler::new(64).unwrap();
    f(&mut asm).unwrap();
    asm.assemble(IP).unwrap()
}

#[test]
fn test_register_moves_decode_for_every_pair() {
    let _ = env_logger::builder().is_test(true).try_init();

    for dst in all_regs() {
        for src in all_regs() {
            let bytes = encode(|buf| enc::mov_reg_reg(buf, dst, src));
            let instruction = decode_one(&bytes);
            assert_eq!(instruction.code(), Code::Mov_rm64_r64);
            assert_eq!(instruction.op0_register(), iced(dst));
            assert_eq!(instruction.op1_register(), iced(src));
        }
    }
}

#[test]
fn test_arithmetic_decodes_for_every_pair() {
    let _ = env_logger::builder().is_test(true).try_init();

    let cases: [(fn(&mut CodeBuffer, Reg, Reg), Code); 5] = [
        (enc::add_reg_reg, Code::Add_rm64_r64),
        (enc::sub_reg_reg, Code::Sub_rm64_r64),
        (enc::imul_reg_reg, Code::Imul_r64_rm64),
        (enc::xor_reg_reg, Code::Xor_rm64_r64),
        (enc::cmp_reg_reg, Code::Cmp_r64_rm64),
    ];
    for (emit, code) in cases {
        for dst in all_regs() {
            for src in all_regs() {
                let bytes = encode(|buf| emit(buf, dst, src));
                let instruction = decode_one(&bytes);
                assert_eq!(instruction.code(), code);
                assert_eq!(instruction.op0_register(), iced(dst), "{code:?}");
                assert_eq!(instruction.op1_register(), iced(src), "{code:?}");
            }
        }
    }
}

#[test]
fn test_immediate_and_absolute_forms() {
    let _ = env_logger::builder().is_test(true).try_init();

    for reg in all_regs() {
        let instruction = decode_one(&encode(|buf| enc::mov_reg_imm64(buf, reg, -42)));
        assert_eq!(instruction.code(), Code::Mov_r64_imm64);
        assert_eq!(instruction.op0_register(), iced(reg));
        assert_eq!(instruction.immediate64() as i64, -42);

        let instruction = decode_one(&encode(|buf| enc::mov_reg_abs(buf, reg, 0x600028)));
        assert_eq!(instruction.code(), Code::Mov_r64_rm64);
        assert_eq!(instruction.op0_register(), iced(reg));
        assert_eq!(instruction.memory_base(), Register::None);
        assert_eq!(instruction.memory_index(), Register::None);
        assert_eq!(instruction.memory_displacement64(), 0x600028);

        let instruction = decode_one(&encode(|buf| enc::mov_abs_reg(buf, 0x600030, reg)));
        assert_eq!(instruction.code(), Code::Mov_rm64_r64);
        assert_eq!(instruction.op1_register(), iced(reg));
        assert_eq!(instruction.memory_displacement64(), 0x600030);

        let instruction = decode_one(&encode(|buf| enc::cmp_reg_imm32(buf, reg, -7)));
        assert_eq!(instruction.code(), Code::Cmp_rm64_imm32);
        assert_eq!(instruction.op0_register(), iced(reg));
        assert_eq!(instruction.immediate32to64(), -7);
    }
}

#[test]
fn test_byte_stores_through_every_base() {
    let _ = env_logger::builder().is_test(true).try_init();

    for base in all_regs() {
        let instruction = decode_one(&encode(|buf| enc::mov_mem8_imm8(buf, base, b'\n')));
        assert_eq!(instruction.code(), Code::Mov_rm8_imm8);
        assert_eq!(instruction.memory_base(), iced(base));
        assert_eq!(instruction.memory_displacement64(), 0);
        assert_eq!(instruction.immediate8(), b'\n');

        let instruction = decode_one(&encode(|buf| enc::mov_mem8_reg8(buf, base, Reg::Rdx)));
        assert_eq!(instruction.code(), Code::Mov_rm8_r8);
        assert_eq!(instruction.memory_base(), iced(base));
        assert_eq!(instruction.op1_register(), Register::DL);
    }

    let instruction = decode_one(&encode(|buf| enc::mov_mem8_reg8(buf, Reg::Rcx, Reg::Rsi)));
    assert_eq!(instruction.op1_register(), Register::SIL);
}

#[test]
fn test_branch_targets_follow_displacement() {
    let _ = env_logger::builder().is_test(true).try_init();

    let conditions = [
        JumpCondition::Below,
        JumpCondition::AboveEqual,
        JumpCondition::Equal,
        JumpCondition::NotEqual,
        JumpCondition::BelowEqual,
        JumpCondition::Above,
        JumpCondition::Sign,
        JumpCondition::NotSign,
        JumpCondition::Less,
        JumpCondition::GreaterEqual,
        JumpCondition::LessEqual,
        JumpCondition::Greater,
    ];
    for cond in conditions {
        let bytes = encode(|buf| {
            enc::jcc_rel32(buf, cond, 0x100);
        });
        assert_eq!(bytes.len(), enc::JCC_REL32_LEN);
        let instruction = decode_one(&bytes);
        assert_eq!(instruction.near_branch_target(), IP + 6 + 0x100);

        let negated = decode_one(&encode(|buf| {
            enc::jcc_rel32(buf, cond.negate(), 0x100);
        }));
        let mut expected = instruction;
        expected.negate_condition_code();
        assert_eq!(negated.code(), expected.code());
    }

    let jmp = decode_one(&encode(|buf| {
        enc::jmp_rel32(buf, -5);
    }));
    assert_eq!(jmp.code(), Code::Jmp_rel32_64);
    assert_eq!(jmp.near_branch_target(), IP);

    let call = decode_one(&encode(|buf| {
        enc::call_rel32(buf, 16);
    }));
    assert_eq!(call.code(), Code::Call_rel32_64);
    assert_eq!(call.near_branch_target(), IP + 5 + 16);
}

#[test]
fn test_matches_iced_assembler() {
    let _ = env_logger::builder().is_test(true).try_init();

    let ours = encode(|buf| {
        enc::emit_prologue(buf);
        enc::mov_reg_reg(buf, Reg::R12, Reg::Rbx);
        enc::add_reg_reg(buf, Reg::Rax, Reg::R15);
        enc::imul_reg_reg_imm32(buf, Reg::Rcx, Reg::R9, 10);
        enc::add_reg_imm8(buf, Reg::Rsp, 8);
        enc::sub_reg_imm8(buf, Reg::Rdi, 1);
        enc::push_reg(buf, Reg::Rdx);
        enc::cqo(buf);
        enc::idiv_reg(buf, Reg::R11);
        enc::div_reg(buf, Reg::Rbx);
        enc::pop_reg(buf, Reg::Rdx);
        enc::inc_reg(buf, Reg::R13);
        enc::dec_reg(buf, Reg::R11);
        enc::neg_reg(buf, Reg::R14);
        enc::test_reg_reg(buf, Reg::R11, Reg::R11);
        enc::movzx_reg_abs8(buf, Reg::Rax, 0x600000);
        enc::cvtsi2sd(buf, 0, Reg::R8);
        enc::sqrtsd(buf, 0, 0);
        enc::cvttsd2si(buf, Reg::R8, 0);
        enc::syscall(buf);
        enc::emit_epilogue(buf);
    });

    let theirs = assemble(|a| {
        a.push(rbp)?;
        a.mov(rbp, rsp)?;
        a.mov(r12, rbx)?;
        a.add(rax, r15)?;
        a.imul_3(rcx, r9, 10)?;
        a.add(rsp, 8)?;
        a.sub(rdi, 1)?;
        a.push(rdx)?;
        a.cqo()?;
        a.idiv(r11)?;
        a.div(rbx)?;
        a.pop(rdx)?;
        a.inc(r13)?;
        a.dec(r11)?;
        a.neg(r14)?;
        a.test(r11, r11)?;
        a.movzx(rax, byte_ptr(0x600000))?;
        a.cvtsi2sd(xmm0, r8)?;
        a.sqrtsd(xmm0, xmm0)?;
        a.cvttsd2si(r8, xmm0)?;
        a.syscall()?;
        a.mov(rsp, rbp)?;
        a.pop(rbp)?;
        a.ret()?;
        Ok(())
    });

    assert_eq!(format_all(&ours), format_all(&theirs));
}

#[test]
fn test_encoding_is_deterministic() {
    let _ = env_logger::builder().is_test(true).try_init();

    let emit = |buf: &mut CodeBuffer| {
        enc::mov_reg_imm64(buf, Reg::R10, i64::MIN);
        enc::mov_abs_reg(buf, 0x600028, Reg::R13);
        enc::cmp_reg_imm32(buf, Reg::Rbp, i32::MAX);
        enc::jcc_rel32(buf, JumpCondition::Less, -1);
    };
    assert_eq!(encode(emit), encode(emit));
}
