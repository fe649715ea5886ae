//! NASM-syntax listing of generated code.
//!
//! Decodes `.text` with `iced-x86` and interleaves label names, so the
//! hand-encoded bytes can be read back as assembly.

use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, NasmFormatter};
use std::fmt::Write;

/// Render `code`, loaded at `base`, as a listing.
///
/// `labels` holds `(name, offset)` pairs relative to the start of `code`;
/// they need not be sorted.
pub fn disassemble(code: &[u8], base: u64, labels: &[(String, usize)]) -> String {
    let mut labels: Vec<(usize, &str)> = labels
        .iter()
        .map(|(name, offset)| (*offset, name.as_str()))
        .collect();
    labels.sort();

    let mut decoder = Decoder::with_ip(64, code, base, DecoderOptions::NONE);
    let mut formatter = NasmFormatter::new();
    formatter.options_mut().set_first_operand_char_index(8);

    let mut out = String::new();
    let mut text = String::new();
    let mut instruction = Instruction::default();
    let mut next_label = 0;

    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        let offset = (instruction.ip() - base) as usize;

        while next_label < labels.len() && labels[next_label].0 <= offset {
            let (label_offset, name) = labels[next_label];
            if label_offset == offset {
                let _ = writeln!(out, "{name}:");
            }
            next_label += 1;
        }

        text.clear();
        formatter.format(&instruction, &mut text);

        let start = offset;
        let end = start + instruction.len();
        let mut hex = String::new();
        for byte in &code[start..end] {
            let _ = write!(hex, "{byte:02X}");
        }
        let _ = writeln!(out, "  {:016X} {:<24} {}", instruction.ip(), hex, text);
    }

    out
}
