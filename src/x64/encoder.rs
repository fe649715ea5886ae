// This module provides the hand-built x86-64 instruction encoder used by the dslc code
// generator. Every function appends exactly one instruction to a CodeBuffer: REX prefix
// (operand size plus register-extension bits), opcode byte(s), ModR/M, optional SIB,
// optional displacement and optional immediate, and nothing else. There is no relocation
// model, so every data operand is a fixed 32-bit absolute address encoded through the SIB
// form "no base, no index" (mod=00, rm=100, SIB=0x25). Relative branches take an already
// computed signed displacement measured from the end of the instruction; computing it is
// the caller's job. The supported subset covers moves (register, imm64, absolute memory,
// byte stores through a base register), integer arithmetic (ADD, SUB, IMUL, IDIV, DIV, CQO,
// INC, DEC, NEG), comparisons (CMP, TEST), control flow (Jcc, JMP, CALL, RET), stack
// manipulation (PUSH, POP), SYSCALL and the scalar double triad used for integer square
// roots (CVTSI2SD, SQRTSD, CVTTSD2SI). Encoders cannot fail: registers are typed, so an
// out-of-range register number cannot reach them.

//! x86-64 instruction encoding.
//!
//! Pure append functions over [`CodeBuffer`]. Output for the same operands is
//! always byte-identical.

use super::registers::Reg;
use crate::core::CodeBuffer;

/// Length of `jcc rel32`.
pub const JCC_REL32_LEN: usize = 6;

const REX: u8 = 0x40;
const REX_W: u8 = 0x08;
const REX_R: u8 = 0x04;
const REX_B: u8 = 0x01;

const MOD_INDIRECT: u8 = 0b00;
const MOD_DISP8: u8 = 0b01;
const MOD_DIRECT: u8 = 0b11;

/// rm=100 selects a SIB byte.
const RM_SIB: u8 = 0b100;
/// SIB with no index and no base: disp32 only.
const SIB_ABS32: u8 = 0x25;
/// SIB with no index and base=rsp/r12.
const SIB_BASE_ONLY: u8 = 0x24;

/// Condition codes for `Jcc`, in hardware encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JumpCondition {
    Below = 0x2,
    AboveEqual = 0x3,
    Equal = 0x4,
    NotEqual = 0x5,
    BelowEqual = 0x6,
    Above = 0x7,
    Sign = 0x8,
    NotSign = 0x9,
    Less = 0xC,
    GreaterEqual = 0xD,
    LessEqual = 0xE,
    Greater = 0xF,
}

impl JumpCondition {
    /// The condition that holds exactly when `self` does not.
    pub fn negate(self) -> Self {
        match self {
            Self::Below => Self::AboveEqual,
            Self::AboveEqual => Self::Below,
            Self::Equal => Self::NotEqual,
            Self::NotEqual => Self::Equal,
            Self::BelowEqual => Self::Above,
            Self::Above => Self::BelowEqual,
            Self::Sign => Self::NotSign,
            Self::NotSign => Self::Sign,
            Self::Less => Self::GreaterEqual,
            Self::GreaterEqual => Self::Less,
            Self::LessEqual => Self::Greater,
            Self::Greater => Self::LessEqual,
        }
    }

    pub const fn code(self) -> u8 {
        self as u8
    }
}

fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    (mode << 6) | ((reg & 0b111) << 3) | (rm & 0b111)
}

/// REX.W plus the R (ModR/M.reg) and B (ModR/M.rm or opcode) extensions.
fn rex_w(reg: Option<Reg>, rm: Option<Reg>) -> u8 {
    let mut rex = REX | REX_W;
    if reg.is_some_and(Reg::is_extended) {
        rex |= REX_R;
    }
    if rm.is_some_and(Reg::is_extended) {
        rex |= REX_B;
    }
    rex
}

/// `op r/m64, r64` or `op r64, r/m64` with a register-direct operand.
fn emit_rr(buf: &mut CodeBuffer, opcode: &[u8], reg: Reg, rm: Reg) {
    buf.emit_u8(rex_w(Some(reg), Some(rm)));
    buf.emit_bytes(opcode);
    buf.emit_u8(modrm(MOD_DIRECT, reg.low_bits(), rm.low_bits()));
}

/// Single-operand group instruction: `op /ext r64`.
fn emit_group(buf: &mut CodeBuffer, opcode: u8, ext: u8, rm: Reg) {
    buf.emit_u8(rex_w(None, Some(rm)));
    buf.emit_u8(opcode);
    buf.emit_u8(modrm(MOD_DIRECT, ext, rm.low_bits()));
}

/// ModR/M + SIB + disp32 for an absolute address.
fn emit_abs32(buf: &mut CodeBuffer, reg_field: u8, addr: u32) {
    buf.emit_u8(modrm(MOD_INDIRECT, reg_field, RM_SIB));
    buf.emit_u8(SIB_ABS32);
    buf.emit_u32(addr);
}

/// ModR/M (+SIB, +disp8) for `[base]`.
fn emit_base_indirect(buf: &mut CodeBuffer, reg_field: u8, base: Reg) {
    match base.low_bits() {
        // rsp/r12 need a SIB byte.
        0b100 => {
            buf.emit_u8(modrm(MOD_INDIRECT, reg_field, RM_SIB));
            buf.emit_u8(SIB_BASE_ONLY);
        }
        // rbp/r13 with mod=00 mean rip-relative/disp32; use a zero disp8.
        0b101 => {
            buf.emit_u8(modrm(MOD_DISP8, reg_field, base.low_bits()));
            buf.emit_u8(0);
        }
        low => buf.emit_u8(modrm(MOD_INDIRECT, reg_field, low)),
    }
}

/// `mov dst, src`
pub fn mov_reg_reg(buf: &mut CodeBuffer, dst: Reg, src: Reg) {
    emit_rr(buf, &[0x89], src, dst);
}

/// `mov dst, imm64`
pub fn mov_reg_imm64(buf: &mut CodeBuffer, dst: Reg, imm: i64) {
    buf.emit_u8(rex_w(None, Some(dst)));
    buf.emit_u8(0xB8 + dst.low_bits());
    buf.emit_u64(imm as u64);
}

/// `mov dst, qword [addr]`
pub fn mov_reg_abs(buf: &mut CodeBuffer, dst: Reg, addr: u32) {
    buf.emit_u8(rex_w(Some(dst), None));
    buf.emit_u8(0x8B);
    emit_abs32(buf, dst.low_bits(), addr);
}

/// `mov qword [addr], src`
pub fn mov_abs_reg(buf: &mut CodeBuffer, addr: u32, src: Reg) {
    buf.emit_u8(rex_w(Some(src), None));
    buf.emit_u8(0x89);
    emit_abs32(buf, src.low_bits(), addr);
}

/// `movzx dst, byte [addr]`
pub fn movzx_reg_abs8(buf: &mut CodeBuffer, dst: Reg, addr: u32) {
    buf.emit_u8(rex_w(Some(dst), None));
    buf.emit_bytes(&[0x0F, 0xB6]);
    emit_abs32(buf, dst.low_bits(), addr);
}

/// `mov byte [base], imm8`
pub fn mov_mem8_imm8(buf: &mut CodeBuffer, base: Reg, imm: u8) {
    if base.is_extended() {
        buf.emit_u8(REX | REX_B);
    }
    buf.emit_u8(0xC6);
    emit_base_indirect(buf, 0, base);
    buf.emit_u8(imm);
}

/// `mov byte [base], src8` (low byte of `src`)
pub fn mov_mem8_reg8(buf: &mut CodeBuffer, base: Reg, src: Reg) {
    let mut rex = 0;
    if src.is_extended() {
        rex |= REX_R;
    }
    if base.is_extended() {
        rex |= REX_B;
    }
    // spl/bpl/sil/dil are only reachable with a REX prefix.
    if rex != 0 || (4..8).contains(&src.index()) {
        buf.emit_u8(REX | rex);
    }
    buf.emit_u8(0x88);
    emit_base_indirect(buf, src.low_bits(), base);
}

/// `add dst, src`
pub fn add_reg_reg(buf: &mut CodeBuffer, dst: Reg, src: Reg) {
    emit_rr(buf, &[0x01], src, dst);
}

/// `sub dst, src`
pub fn sub_reg_reg(buf: &mut CodeBuffer, dst: Reg, src: Reg) {
    emit_rr(buf, &[0x29], src, dst);
}

/// `imul dst, src`
pub fn imul_reg_reg(buf: &mut CodeBuffer, dst: Reg, src: Reg) {
    emit_rr(buf, &[0x0F, 0xAF], dst, src);
}

/// `imul dst, src, imm32`
pub fn imul_reg_reg_imm32(buf: &mut CodeBuffer, dst: Reg, src: Reg, imm: i32) {
    emit_rr(buf, &[0x69], dst, src);
    buf.emit_i32(imm);
}

/// `xor dst, src`
pub fn xor_reg_reg(buf: &mut CodeBuffer, dst: Reg, src: Reg) {
    emit_rr(buf, &[0x31], src, dst);
}

/// `add dst, imm8` (sign-extended)
pub fn add_reg_imm8(buf: &mut CodeBuffer, dst: Reg, imm: i8) {
    emit_group(buf, 0x83, 0, dst);
    buf.emit_u8(imm as u8);
}

/// `sub dst, imm8` (sign-extended)
pub fn sub_reg_imm8(buf: &mut CodeBuffer, dst: Reg, imm: i8) {
    emit_group(buf, 0x83, 5, dst);
    buf.emit_u8(imm as u8);
}

/// `cqo`: sign-extend rax into rdx:rax.
pub fn cqo(buf: &mut CodeBuffer) {
    buf.emit_bytes(&[REX | REX_W, 0x99]);
}

/// `idiv divisor`: signed rdx:rax / divisor.
pub fn idiv_reg(buf: &mut CodeBuffer, divisor: Reg) {
    emit_group(buf, 0xF7, 7, divisor);
}

/// `div divisor`: unsigned rdx:rax / divisor.
pub fn div_reg(buf: &mut CodeBuffer, divisor: Reg) {
    emit_group(buf, 0xF7, 6, divisor);
}

/// `inc reg`
pub fn inc_reg(buf: &mut CodeBuffer, reg: Reg) {
    emit_group(buf, 0xFF, 0, reg);
}

/// `dec reg`
pub fn dec_reg(buf: &mut CodeBuffer, reg: Reg) {
    emit_group(buf, 0xFF, 1, reg);
}

/// `neg reg`
pub fn neg_reg(buf: &mut CodeBuffer, reg: Reg) {
    emit_group(buf, 0xF7, 3, reg);
}

/// `cmp lhs, imm32` (sign-extended)
pub fn cmp_reg_imm32(buf: &mut CodeBuffer, lhs: Reg, imm: i32) {
    emit_group(buf, 0x81, 7, lhs);
    buf.emit_i32(imm);
}

/// `cmp lhs, rhs`
pub fn cmp_reg_reg(buf: &mut CodeBuffer, lhs: Reg, rhs: Reg) {
    emit_rr(buf, &[0x3B], lhs, rhs);
}

/// `test lhs, rhs`
pub fn test_reg_reg(buf: &mut CodeBuffer, lhs: Reg, rhs: Reg) {
    emit_rr(buf, &[0x85], rhs, lhs);
}

/// `jcc rel32`. Returns the offset of the displacement field.
pub fn jcc_rel32(buf: &mut CodeBuffer, cond: JumpCondition, disp: i32) -> usize {
    buf.emit_bytes(&[0x0F, 0x80 | cond.code()]);
    let field = buf.position();
    buf.emit_i32(disp);
    field
}

/// `jmp rel32`. Returns the offset of the displacement field.
pub fn jmp_rel32(buf: &mut CodeBuffer, disp: i32) -> usize {
    buf.emit_u8(0xE9);
    let field = buf.position();
    buf.emit_i32(disp);
    field
}

/// `call rel32`. Returns the offset of the displacement field.
pub fn call_rel32(buf: &mut CodeBuffer, disp: i32) -> usize {
    buf.emit_u8(0xE8);
    let field = buf.position();
    buf.emit_i32(disp);
    field
}

pub fn ret(buf: &mut CodeBuffer) {
    buf.emit_u8(0xC3);
}

pub fn push_reg(buf: &mut CodeBuffer, reg: Reg) {
    if reg.is_extended() {
        buf.emit_u8(REX | REX_B);
    }
    buf.emit_u8(0x50 + reg.low_bits());
}

pub fn pop_reg(buf: &mut CodeBuffer, reg: Reg) {
    if reg.is_extended() {
        buf.emit_u8(REX | REX_B);
    }
    buf.emit_u8(0x58 + reg.low_bits());
}

pub fn syscall(buf: &mut CodeBuffer) {
    buf.emit_bytes(&[0x0F, 0x05]);
}

/// `cvtsi2sd xmm, src`
pub fn cvtsi2sd(buf: &mut CodeBuffer, xmm: u8, src: Reg) {
    buf.emit_u8(0xF2);
    let mut rex = REX | REX_W;
    if xmm >= 8 {
        rex |= REX_R;
    }
    if src.is_extended() {
        rex |= REX_B;
    }
    buf.emit_u8(rex);
    buf.emit_bytes(&[0x0F, 0x2A]);
    buf.emit_u8(modrm(MOD_DIRECT, xmm, src.low_bits()));
}

/// `sqrtsd dst, src`
pub fn sqrtsd(buf: &mut CodeBuffer, dst: u8, src: u8) {
    buf.emit_u8(0xF2);
    let mut rex = 0;
    if dst >= 8 {
        rex |= REX_R;
    }
    if src >= 8 {
        rex |= REX_B;
    }
    if rex != 0 {
        buf.emit_u8(REX | rex);
    }
    buf.emit_bytes(&[0x0F, 0x51]);
    buf.emit_u8(modrm(MOD_DIRECT, dst, src));
}

/// `cvttsd2si dst, xmm` (truncating)
pub fn cvttsd2si(buf: &mut CodeBuffer, dst: Reg, xmm: u8) {
    buf.emit_u8(0xF2);
    let mut rex = REX | REX_W;
    if dst.is_extended() {
        rex |= REX_R;
    }
    if xmm >= 8 {
        rex |= REX_B;
    }
    buf.emit_u8(rex);
    buf.emit_bytes(&[0x0F, 0x2C]);
    buf.emit_u8(modrm(MOD_DIRECT, dst.low_bits(), xmm));
}

/// Frame setup: `push rbp; mov rbp, rsp`.
pub fn emit_prologue(buf: &mut CodeBuffer) {
    push_reg(buf, Reg::Rbp);
    mov_reg_reg(buf, Reg::Rbp, Reg::Rsp);
}

/// Frame teardown and return: `mov rsp, rbp; pop rbp; ret`.
pub fn emit_epilogue(buf: &mut CodeBuffer) {
    mov_reg_reg(buf, Reg::Rsp, Reg::Rbp);
    pop_reg(buf, Reg::Rbp);
    ret(buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(f: impl FnOnce(&mut CodeBuffer)) -> Vec<u8> {
        let mut buf = CodeBuffer::new();
        f(&mut buf);
        buf.into_bytes()
    }

    #[test]
    fn test_basic_instructions() {
        assert_eq!(encode(|b| mov_reg_reg(b, Reg::Rax, Reg::Rbx)), [0x48, 0x89, 0xD8]);
        assert_eq!(encode(|b| mov_reg_reg(b, Reg::R12, Reg::Rax)), [0x49, 0x89, 0xC4]);
        assert_eq!(encode(|b| add_reg_reg(b, Reg::Rax, Reg::Rcx)), [0x48, 0x01, 0xC8]);
        assert_eq!(encode(|b| sub_reg_reg(b, Reg::Rbx, Reg::Rax)), [0x48, 0x29, 0xC3]);
        assert_eq!(encode(|b| imul_reg_reg(b, Reg::Rax, Reg::Rbx)), [0x48, 0x0F, 0xAF, 0xC3]);
        assert_eq!(encode(|b| xor_reg_reg(b, Reg::Rbp, Reg::Rbp)), [0x48, 0x31, 0xED]);
        assert_eq!(encode(|b| cmp_reg_reg(b, Reg::Rax, Reg::Rbx)), [0x48, 0x3B, 0xC3]);
        assert_eq!(encode(cqo), [0x48, 0x99]);
        assert_eq!(encode(ret), [0xC3]);
        assert_eq!(encode(syscall), [0x0F, 0x05]);
    }

    #[test]
    fn test_mov_imm64() {
        assert_eq!(
            encode(|b| mov_reg_imm64(b, Reg::Rax, 42)),
            [0x48, 0xB8, 42, 0, 0, 0, 0, 0, 0, 0]
        );
        let bytes = encode(|b| mov_reg_imm64(b, Reg::R11, -1));
        assert_eq!(&bytes[..2], &[0x49, 0xBB]);
        assert!(bytes[2..].iter().all(|&byte| byte == 0xFF));
    }

    #[test]
    fn test_absolute_memory() {
        assert_eq!(
            encode(|b| mov_reg_abs(b, Reg::Rax, 0x0060_0010)),
            [0x48, 0x8B, 0x04, 0x25, 0x10, 0x00, 0x60, 0x00]
        );
        assert_eq!(
            encode(|b| mov_abs_reg(b, 0x0060_0010, Reg::R9)),
            [0x4C, 0x89, 0x0C, 0x25, 0x10, 0x00, 0x60, 0x00]
        );
        assert_eq!(
            encode(|b| movzx_reg_abs8(b, Reg::Rdx, 0x0060_0000)),
            [0x48, 0x0F, 0xB6, 0x14, 0x25, 0x00, 0x00, 0x60, 0x00]
        );
    }

    #[test]
    fn test_group_instructions() {
        assert_eq!(encode(|b| idiv_reg(b, Reg::R11)), [0x49, 0xF7, 0xFB]);
        assert_eq!(encode(|b| div_reg(b, Reg::Rbx)), [0x48, 0xF7, 0xF3]);
        assert_eq!(encode(|b| inc_reg(b, Reg::Rcx)), [0x48, 0xFF, 0xC1]);
        assert_eq!(encode(|b| dec_reg(b, Reg::R11)), [0x49, 0xFF, 0xCB]);
        assert_eq!(encode(|b| neg_reg(b, Reg::Rax)), [0x48, 0xF7, 0xD8]);
        assert_eq!(encode(|b| sub_reg_imm8(b, Reg::Rdx, 0x30)), [0x48, 0x83, 0xEA, 0x30]);
        assert_eq!(
            encode(|b| cmp_reg_imm32(b, Reg::Rbx, 9)),
            [0x48, 0x81, 0xFB, 9, 0, 0, 0]
        );
        assert_eq!(
            encode(|b| imul_reg_reg_imm32(b, Reg::Rbx, Reg::Rbx, 10)),
            [0x48, 0x69, 0xDB, 10, 0, 0, 0]
        );
    }

    #[test]
    fn test_push_pop_extended() {
        assert_eq!(encode(|b| push_reg(b, Reg::Rbx)), [0x53]);
        assert_eq!(encode(|b| push_reg(b, Reg::R12)), [0x41, 0x54]);
        assert_eq!(encode(|b| pop_reg(b, Reg::R15)), [0x41, 0x5F]);
    }

    #[test]
    fn test_branches_return_field_offset() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0x90);
        let field = jcc_rel32(&mut buf, JumpCondition::LessEqual, -6);
        assert_eq!(field, 3);
        assert_eq!(buf.as_bytes(), &[0x90, 0x0F, 0x8E, 0xFA, 0xFF, 0xFF, 0xFF]);
        assert_eq!(buf.len(), 1 + JCC_REL32_LEN);

        let field = jmp_rel32(&mut buf, 0);
        assert_eq!(field, 1 + JCC_REL32_LEN + 1);
        let field = call_rel32(&mut buf, 0);
        assert_eq!(field + 4, buf.len());
    }

    #[test]
    fn test_byte_stores_through_base() {
        assert_eq!(encode(|b| mov_mem8_imm8(b, Reg::Rsi, b'\n')), [0xC6, 0x06, 0x0A]);
        assert_eq!(encode(|b| mov_mem8_imm8(b, Reg::Rsp, 1)), [0xC6, 0x04, 0x24, 0x01]);
        assert_eq!(encode(|b| mov_mem8_imm8(b, Reg::R13, 1)), [0x41, 0xC6, 0x45, 0x00, 0x01]);
        assert_eq!(encode(|b| mov_mem8_reg8(b, Reg::Rsi, Reg::Rdx)), [0x88, 0x16]);
        assert_eq!(encode(|b| mov_mem8_reg8(b, Reg::Rax, Reg::Rsi)), [0x40, 0x88, 0x30]);
    }

    #[test]
    fn test_sqrt_triad() {
        assert_eq!(encode(|b| cvtsi2sd(b, 0, Reg::Rax)), [0xF2, 0x48, 0x0F, 0x2A, 0xC0]);
        assert_eq!(encode(|b| sqrtsd(b, 0, 0)), [0xF2, 0x0F, 0x51, 0xC0]);
        assert_eq!(encode(|b| cvttsd2si(b, Reg::Rax, 0)), [0xF2, 0x48, 0x0F, 0x2C, 0xC0]);
        assert_eq!(encode(|b| cvttsd2si(b, Reg::R12, 0)), [0xF2, 0x4C, 0x0F, 0x2C, 0xE0]);
    }

    #[test]
    fn test_prologue_epilogue() {
        assert_eq!(encode(emit_prologue), [0x55, 0x48, 0x89, 0xE5]);
        assert_eq!(encode(emit_epilogue), [0x48, 0x89, 0xEC, 0x5D, 0xC3]);
    }

    #[test]
    fn test_condition_negation_is_involution() {
        use JumpCondition::*;
        for cond in [
            Below, AboveEqual, Equal, NotEqual, BelowEqual, Above, Sign, NotSign, Less,
            GreaterEqual, LessEqual, Greater,
        ] {
            assert_eq!(cond.negate().negate(), cond);
            // x86 pairs conditions by flipping the low bit.
            assert_eq!(cond.negate().code(), cond.code() ^ 1);
        }
    }
}
