// This module serves as the central hub for dslc's shared infrastructure, the pieces every
// stage of the pipeline relies on regardless of target: the byte emitter backing the .text
// and .data sections, the error taxonomy (fatal CompileError versus locally reported
// Diagnostic), and the compilation session that owns options, the AST arena, diagnostics
// and statistics for the duration of one compile.

//! Core dslc infrastructure.
//!
//! # Key Components
//!
//! ## Byte Emitter (`buffer`)
//! - Append-only section buffer with little-endian helpers
//! - In-place patching of reserved 4-byte fields
//!
//! ## Errors (`error`)
//! - `CompileError` for fatal structural and I/O failures
//! - `Diagnostic` for local, skip-and-continue problems
//!
//! ## Session Management (`session`)
//! - Arena allocation of AST nodes using `bumpalo`
//! - Options, diagnostics and statistics for one compile

pub mod buffer;
pub mod error;
pub mod session;

pub use buffer::CodeBuffer;

pub use error::{
    CompileError,
    CompileResult,
    Diagnostic,
};

pub use session::{
    CompilationSession,
    CompileOptions,
    SessionStats,
};
