// This module defines the error types for the dslc compiler using the thiserror crate for
// idiomatic Rust error handling. CompileError covers the fatal classes: structural
// violations of the IR stream (unmatched or unclosed block markers, duplicate labels,
// references to functions that never get defined, a missing entry function), table and
// nesting limits being exceeded, segment layout conflicts, and I/O failures carrying the
// underlying OS error. Diagnostic covers the local class: problems confined to a single IR
// instruction or AST node that are reported and skipped while compilation continues.
// CompileResult<T> is the convenience alias used throughout the crate.

//! Error types for the dslc compiler.
//!
//! Fatal errors abort the compile; diagnostics are collected by the session.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal compilation error.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("`{marker}` at IR instruction {index} has no matching opening instruction")]
    UnmatchedEnd {
        marker: &'static str,
        index: usize,
    },

    #[error("{construct} `{label}` is still open at {at}")]
    UnclosedConstruct {
        construct: &'static str,
        label: String,
        at: &'static str,
    },

    #[error("label table overflow: more than {limit} labels")]
    LabelTableOverflow { limit: usize },

    #[error("variable table overflow: more than {limit} data variables")]
    VariableTableOverflow { limit: usize },

    #[error("nesting deeper than {limit} levels")]
    NestingTooDeep { limit: usize },

    #[error("label `{name}` is defined more than once")]
    DuplicateLabel { name: String },

    #[error("call to undefined function `{name}`")]
    UndefinedFunction { name: String },

    #[error("entry function `{name}` is never defined")]
    MissingEntry { name: String },

    #[error(".text ({text_size} bytes) overlaps the data segment at {data_vaddr:#x}")]
    SegmentOverlap { text_size: usize, data_vaddr: u64 },

    #[error("failed to write ELF image: {0}")]
    Elf(#[from] object::write::Error),

    #[error("cannot write `{}`", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;

/// Local error: reported, the offending instruction or node is skipped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    #[error("line {line}: unknown IR instruction `{opcode}`")]
    UnknownOpcode { line: usize, opcode: String },

    #[error("line {line}: cannot parse `{text}`: {reason}")]
    Malformed {
        line: usize,
        text: String,
        reason: String,
    },

    #[error("`{opcode}` expects {expected} operand(s), found {found}")]
    WrongArity {
        opcode: &'static str,
        expected: &'static str,
        found: usize,
    },

    #[error("invalid operand `{operand}` for `{opcode}`")]
    InvalidOperand {
        opcode: &'static str,
        operand: String,
    },

    #[error("variable `{0}` is read before any store")]
    UnknownVariable(String),

    #[error("unsupported call to `{name}`: {reason}")]
    UnsupportedCall { name: String, reason: String },

    #[error("{0} cannot be used as a value")]
    UnsupportedExpression(String),

    #[error("`{0}` is not inside a function and was skipped")]
    OutsideFunction(String),
}
