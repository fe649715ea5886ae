//! x86-64 architecture-specific components.
//!
//! This module contains all x86-64 specific code:
//! - The register file and virtual register homes
//! - Hand-built instruction encoding
//! - Syscall runtime primitives emitted into every executable
//! - Disassembly listings using iced-x86

pub mod encoder;
pub mod listing;
pub mod registers;
pub mod runtime;

pub use encoder::JumpCondition;
pub use registers::{Reg, SCRATCH, VREG_HOMES};
pub use runtime::RuntimeLayout;
