//! dslc - the back half of a small-language compiler.
//!
//! dslc lowers a parsed program to a linear IR, encodes x86-64 machine code
//! by hand and writes a statically linked ELF64 executable. No assembler,
//! linker or libc is involved; integer I/O and exit go through raw syscalls
//! in a small runtime emitted into every executable.
//!
//! # Primary Usage
//!
//! ```ignore
//! use dslc::core::CompilationSession;
//! use bumpalo::Bump;
//!
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//!
//! let ir = dslc::ir::parse_ir(&source, &session);
//! let program = dslc::compile_ir(&session, &ir)?;
//! program.image.write_to(Path::new("a.out"))?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Shared infrastructure (byte emitter, errors, session)
//! - [`ast`] - Syntax tree and symbol table consumed from the front end
//! - [`lower`] - AST to IR lowering
//! - [`ir`] - IR data model and textual format
//! - [`codegen`] - IR to machine code, labels and patching
//! - [`x64`] - x86-64 specific code (registers, encoder, runtime, listing)
//! - [`elf`] - Executable writer

pub mod ast;
pub mod codegen;
pub mod core;
pub mod elf;
pub mod ir;
pub mod lower;
pub mod x64;

pub use crate::core::{
    CodeBuffer, CompilationSession, CompileError, CompileOptions, CompileResult, Diagnostic,
    SessionStats,
};
pub use codegen::{CodeGenerator, CompiledProgram};
pub use elf::ElfImage;
pub use ir::{Instruction, Opcode, Operand, VirtualRegister};

/// Generate an executable image from an IR stream.
pub fn compile_ir(
    session: &CompilationSession<'_>,
    program: &[Instruction],
) -> CompileResult<CompiledProgram> {
    let mut codegen = CodeGenerator::new(session)?;
    codegen.compile(program)?;
    codegen.finish()
}

/// Lower a syntax tree and generate an executable image from it.
pub fn compile_ast(
    session: &CompilationSession<'_>,
    symbols: &ast::SymbolTable,
    program: ast::Block<'_>,
) -> CompileResult<CompiledProgram> {
    let ir = lower::lower_program(session, symbols, program)?;
    log::debug!("lowered IR:\n{}", ir::print_program(&ir));
    compile_ir(session, &ir)
}
