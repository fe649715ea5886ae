// This module emits the three runtime primitives every dslc executable carries, placed at
// the very start of .text before any user code. __read_int reads stdin one byte per read(2)
// into a scratch byte in .data, accumulates decimal digits and stops at newline, NUL or EOF;
// a non-digit yields -1. __write_int converts rdi to decimal right-to-left in a 32-byte
// scratch buffer in .data (leading '-' for negative values), appends a newline and issues a
// single write(2). __exit zeroes the status and falls through into __exit_with, which calls
// exit(2) with rdi. All routines preserve every register except rax. Their branches are
// local, so they are resolved here with the same displacement rule the label table uses.

//! Syscall-based runtime primitives.

use super::encoder::{self as enc, JumpCondition};
use super::registers::Reg;
use crate::codegen::labels::displacement;
use crate::core::CodeBuffer;
use crate::elf::DATA_VADDR;

pub const READ_INT: &str = "__read_int";
pub const WRITE_INT: &str = "__write_int";
pub const EXIT: &str = "__exit";
pub const EXIT_WITH: &str = "__exit_with";

/// Size of the reader's scratch slot in `.data`.
pub const INPUT_BUFFER_SIZE: usize = 8;
/// Size of the writer's scratch buffer in `.data`.
pub const OUTPUT_BUFFER_SIZE: usize = 32;

const SYS_READ: i64 = 0;
const SYS_WRITE: i64 = 1;
const SYS_EXIT: i64 = 60;
const STDIN: i64 = 0;
const STDOUT: i64 = 1;

const SAVED: [Reg; 5] = [Reg::Rbx, Reg::Rcx, Reg::Rdx, Reg::Rsi, Reg::Rdi];

/// Where the runtime ended up in `.text` and `.data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeLayout {
    pub read_int: usize,
    pub write_int: usize,
    pub exit: usize,
    pub exit_with: usize,
    /// Absolute address of the reader's scratch byte.
    pub input_buffer: u32,
    /// Absolute address of the writer's scratch buffer.
    pub output_buffer: u32,
}

impl RuntimeLayout {
    /// Label name and `.text` offset of each routine.
    pub fn routines(&self) -> [(&'static str, usize); 4] {
        [
            (READ_INT, self.read_int),
            (WRITE_INT, self.write_int),
            (EXIT, self.exit),
            (EXIT_WITH, self.exit_with),
        ]
    }
}

fn data_address(data: &CodeBuffer) -> u32 {
    (DATA_VADDR + data.position() as u64) as u32
}

fn bind(text: &mut CodeBuffer, field: usize, target: usize) {
    text.patch_i32(field, displacement(field, target));
}

fn jcc_back(text: &mut CodeBuffer, cond: JumpCondition, target: usize) {
    let field = enc::jcc_rel32(text, cond, 0);
    bind(text, field, target);
}

fn jmp_back(text: &mut CodeBuffer, target: usize) {
    let field = enc::jmp_rel32(text, 0);
    bind(text, field, target);
}

fn save_registers(text: &mut CodeBuffer) {
    for reg in SAVED {
        enc::push_reg(text, reg);
    }
}

fn restore_registers(text: &mut CodeBuffer) {
    for reg in SAVED.iter().rev() {
        enc::pop_reg(text, *reg);
    }
}

/// Emit all primitives and allocate their scratch buffers.
pub fn emit_runtime(text: &mut CodeBuffer, data: &mut CodeBuffer) -> RuntimeLayout {
    let input_buffer = data_address(data);
    data.emit_bytes(&[0; INPUT_BUFFER_SIZE]);
    let output_buffer = data_address(data);
    data.emit_bytes(&[0; OUTPUT_BUFFER_SIZE]);

    let read_int = emit_read_int(text, input_buffer);
    let write_int = emit_write_int(text, output_buffer);
    let (exit, exit_with) = emit_exit(text);

    RuntimeLayout {
        read_int,
        write_int,
        exit,
        exit_with,
        input_buffer,
        output_buffer,
    }
}

fn emit_read_int(text: &mut CodeBuffer, input_buffer: u32) -> usize {
    let start = text.position();
    save_registers(text);
    enc::xor_reg_reg(text, Reg::Rbx, Reg::Rbx);

    let next_byte = text.position();
    enc::mov_reg_imm64(text, Reg::Rax, SYS_READ);
    enc::mov_reg_imm64(text, Reg::Rdi, STDIN);
    enc::mov_reg_imm64(text, Reg::Rsi, input_buffer as i64);
    enc::mov_reg_imm64(text, Reg::Rdx, 1);
    enc::syscall(text);

    let mut to_done = Vec::with_capacity(3);
    enc::test_reg_reg(text, Reg::Rax, Reg::Rax);
    to_done.push(enc::jcc_rel32(text, JumpCondition::LessEqual, 0));

    enc::movzx_reg_abs8(text, Reg::Rdx, input_buffer);
    enc::cmp_reg_imm32(text, Reg::Rdx, b'\n' as i32);
    to_done.push(enc::jcc_rel32(text, JumpCondition::Equal, 0));
    enc::cmp_reg_imm32(text, Reg::Rdx, 0);
    to_done.push(enc::jcc_rel32(text, JumpCondition::Equal, 0));

    enc::sub_reg_imm8(text, Reg::Rdx, b'0' as i8);
    enc::cmp_reg_imm32(text, Reg::Rdx, 9);
    // Unsigned compare also catches bytes below '0'.
    let to_error = enc::jcc_rel32(text, JumpCondition::Above, 0);

    enc::imul_reg_reg_imm32(text, Reg::Rbx, Reg::Rbx, 10);
    enc::add_reg_reg(text, Reg::Rbx, Reg::Rdx);
    jmp_back(text, next_byte);

    let error = text.position();
    bind(text, to_error, error);
    enc::mov_reg_imm64(text, Reg::Rbx, -1);

    let done = text.position();
    for field in to_done {
        bind(text, field, done);
    }
    enc::mov_reg_reg(text, Reg::Rax, Reg::Rbx);
    restore_registers(text);
    enc::ret(text);

    start
}

fn emit_write_int(text: &mut CodeBuffer, output_buffer: u32) -> usize {
    let start = text.position();
    save_registers(text);

    enc::mov_reg_reg(text, Reg::Rax, Reg::Rdi);
    enc::mov_reg_imm64(
        text,
        Reg::Rsi,
        output_buffer as i64 + OUTPUT_BUFFER_SIZE as i64 - 1,
    );
    enc::mov_mem8_imm8(text, Reg::Rsi, b'\n');
    enc::mov_reg_imm64(text, Reg::Rcx, 1);

    // rdi = 1 when the value is negative.
    enc::xor_reg_reg(text, Reg::Rdi, Reg::Rdi);
    enc::test_reg_reg(text, Reg::Rax, Reg::Rax);
    let to_digits = enc::jcc_rel32(text, JumpCondition::NotSign, 0);
    enc::neg_reg(text, Reg::Rax);
    enc::inc_reg(text, Reg::Rdi);

    let digits = text.position();
    bind(text, to_digits, digits);
    enc::mov_reg_imm64(text, Reg::Rbx, 10);

    let next_digit = text.position();
    enc::dec_reg(text, Reg::Rsi);
    enc::xor_reg_reg(text, Reg::Rdx, Reg::Rdx);
    enc::div_reg(text, Reg::Rbx);
    enc::add_reg_imm8(text, Reg::Rdx, b'0' as i8);
    enc::mov_mem8_reg8(text, Reg::Rsi, Reg::Rdx);
    enc::inc_reg(text, Reg::Rcx);
    enc::test_reg_reg(text, Reg::Rax, Reg::Rax);
    jcc_back(text, JumpCondition::NotEqual, next_digit);

    enc::test_reg_reg(text, Reg::Rdi, Reg::Rdi);
    let to_write = enc::jcc_rel32(text, JumpCondition::Equal, 0);
    enc::dec_reg(text, Reg::Rsi);
    enc::mov_mem8_imm8(text, Reg::Rsi, b'-');
    enc::inc_reg(text, Reg::Rcx);

    let write = text.position();
    bind(text, to_write, write);
    enc::mov_reg_imm64(text, Reg::Rax, SYS_WRITE);
    enc::mov_reg_imm64(text, Reg::Rdi, STDOUT);
    enc::mov_reg_reg(text, Reg::Rdx, Reg::Rcx);
    enc::syscall(text);

    restore_registers(text);
    enc::ret(text);

    start
}

fn emit_exit(text: &mut CodeBuffer) -> (usize, usize) {
    let exit = text.position();
    enc::xor_reg_reg(text, Reg::Rdi, Reg::Rdi);

    let exit_with = text.position();
    enc::mov_reg_imm64(text, Reg::Rax, SYS_EXIT);
    enc::syscall(text);

    (exit, exit_with)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitted() -> (CodeBuffer, CodeBuffer, RuntimeLayout) {
        let mut text = CodeBuffer::new();
        let mut data = CodeBuffer::new();
        let layout = emit_runtime(&mut text, &mut data);
        (text, data, layout)
    }

    #[test]
    fn test_routines_are_ordered_and_distinct() {
        let (text, _, layout) = emitted();
        assert_eq!(layout.read_int, 0);
        assert!(layout.read_int < layout.write_int);
        assert!(layout.write_int < layout.exit);
        assert!(layout.exit < layout.exit_with);
        assert!(layout.exit_with < text.len());
    }

    #[test]
    fn test_scratch_buffers_live_in_data() {
        let (_, data, layout) = emitted();
        assert_eq!(layout.input_buffer as u64, DATA_VADDR);
        assert_eq!(layout.output_buffer as u64, DATA_VADDR + INPUT_BUFFER_SIZE as u64);
        assert_eq!(data.len(), INPUT_BUFFER_SIZE + OUTPUT_BUFFER_SIZE);
        assert!(data.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_exit_falls_through_to_exit_with() {
        let (text, _, layout) = emitted();
        let bytes = text.as_bytes();
        // xor rdi, rdi
        assert_eq!(&bytes[layout.exit..layout.exit_with], &[0x48, 0x31, 0xFF]);
        // mov rax, 60; syscall
        let tail = &bytes[layout.exit_with..];
        assert_eq!(&tail[..2], &[0x48, 0xB8]);
        assert_eq!(tail[2], 60);
        assert_eq!(&tail[10..], &[0x0F, 0x05]);
    }

    #[test]
    fn test_routines_start_by_saving_registers() {
        let (text, _, layout) = emitted();
        let bytes = text.as_bytes();
        let pushes = [0x53, 0x51, 0x52, 0x56, 0x57];
        assert_eq!(&bytes[layout.read_int..layout.read_int + 5], &pushes);
        assert_eq!(&bytes[layout.write_int..layout.write_int + 5], &pushes);
    }

    #[test]
    fn test_emission_is_deterministic() {
        let (a, _, _) = emitted();
        let (b, _, _) = emitted();
        assert_eq!(a, b);
    }
}
