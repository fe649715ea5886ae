// This module provides arena-based compilation session management using the bumpalo crate.
// CompilationSession is the single owned "compiler state" context threaded by reference
// through every stage of one compile: it owns the arena the AST is built in, the
// CompileOptions (entry function, table limits, nesting bound), the list of local
// diagnostics reported so far, and the SessionStats gathered while lowering and generating
// code. Nothing here is process-wide; a session lives for exactly one compilation and is
// dropped with everything it owns. SessionStats has a Display impl used by the driver's
// --stats flag.

//! Arena-based compilation session management.
//!
//! All per-compile state lives here instead of in globals; stages borrow the
//! session and record diagnostics and statistics through shared references.

use super::error::Diagnostic;
use bumpalo::Bump;
use std::cell::{Ref, RefCell};
use std::collections::HashMap;
use std::fmt;

/// Tunables for one compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    /// Function the synthesized process entry calls.
    pub entry_function: String,
    /// Label table capacity; overflow is fatal.
    pub max_labels: usize,
    /// Data variable table capacity; overflow is fatal.
    pub max_variables: usize,
    /// Bound on AST recursion and on open loops/conditionals.
    pub max_nesting: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            entry_function: "main".to_string(),
            max_labels: 1024,
            max_variables: 1024,
            max_nesting: 256,
        }
    }
}

/// Arena-based compilation session.
pub struct CompilationSession<'arena> {
    /// Arena allocator for AST nodes.
    arena: &'arena Bump,

    options: CompileOptions,

    /// Local errors reported so far, in order.
    diagnostics: RefCell<Vec<Diagnostic>>,

    stats: RefCell<SessionStats>,
}

impl<'arena> CompilationSession<'arena> {
    /// Create a new compilation session with default options.
    pub fn new(arena: &'arena Bump) -> Self {
        Self::with_options(arena, CompileOptions::default())
    }

    pub fn with_options(arena: &'arena Bump, options: CompileOptions) -> Self {
        Self {
            arena,
            options,
            diagnostics: RefCell::new(Vec::new()),
            stats: RefCell::new(SessionStats::default()),
        }
    }

    /// Get access to the arena allocator.
    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Allocate an object in the session arena.
    pub fn alloc<T>(&self, value: T) -> &'arena T {
        self.arena.alloc(value)
    }

    /// Allocate a slice in the session arena from an iterator.
    pub fn alloc_slice<T, I>(&self, items: I) -> &'arena [T]
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: ExactSizeIterator,
    {
        self.arena.alloc_slice_fill_iter(items)
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Report a local error. Compilation continues.
    pub fn report(&self, diagnostic: Diagnostic) {
        log::warn!("{diagnostic}");
        self.diagnostics.borrow_mut().push(diagnostic);
    }

    pub fn diagnostics(&self) -> Ref<'_, Vec<Diagnostic>> {
        self.diagnostics.borrow()
    }

    pub fn has_diagnostics(&self) -> bool {
        !self.diagnostics.borrow().is_empty()
    }

    /// Record that a function body was opened in the IR stream.
    pub fn record_function_compiled(&self) {
        self.stats.borrow_mut().functions_compiled += 1;
    }

    /// Record an IR instruction compilation.
    pub fn record_instruction_compiled(&self, opcode: &str) {
        let mut stats = self.stats.borrow_mut();
        stats.instructions_compiled += 1;
        *stats
            .instruction_counts
            .entry(opcode.to_string())
            .or_insert(0) += 1;
    }

    /// Record a virtual register handed out by lowering.
    pub fn record_register_allocated(&self) {
        self.stats.borrow_mut().registers_allocated += 1;
    }

    pub fn record_patch_applied(&self) {
        self.stats.borrow_mut().patches_applied += 1;
    }

    /// Record final section sizes.
    pub fn record_sections(&self, text_size: usize, data_size: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.text_size = text_size;
        stats.data_size = data_size;
    }

    /// Get compilation statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Number of functions compiled.
    pub functions_compiled: usize,

    /// Number of IR instructions compiled.
    pub instructions_compiled: usize,

    /// Count of each IR opcode compiled.
    pub instruction_counts: HashMap<String, usize>,

    /// Virtual registers allocated during lowering.
    pub registers_allocated: usize,

    /// Forward references patched.
    pub patches_applied: usize,

    pub text_size: usize,
    pub data_size: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  Functions compiled: {}", self.functions_compiled)?;
        writeln!(f, "  IR instructions compiled: {}", self.instructions_compiled)?;
        writeln!(f, "  Virtual registers allocated: {}", self.registers_allocated)?;
        writeln!(f, "  Forward references patched: {}", self.patches_applied)?;
        writeln!(f, "  .text size: {} bytes", self.text_size)?;
        writeln!(f, "  .data size: {} bytes", self.data_size)?;

        if !self.instruction_counts.is_empty() {
            writeln!(f, "  Instruction breakdown:")?;
            let mut sorted: Vec<_> = self.instruction_counts.iter().collect();
            sorted.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

            for (opcode, count) in sorted.into_iter().take(10) {
                writeln!(f, "    {}: {}", opcode, count)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_collects_diagnostics() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        assert!(!session.has_diagnostics());

        session.report(Diagnostic::UnknownVariable("x".to_string()));
        session.report(Diagnostic::OutsideFunction("set r1, 1".to_string()));

        let diagnostics = session.diagnostics();
        assert_eq!(diagnostics.len(), 2);
        assert_eq!(diagnostics[0], Diagnostic::UnknownVariable("x".to_string()));
    }

    #[test]
    fn test_stats_report() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        session.record_function_compiled();
        session.record_instruction_compiled("set");
        session.record_instruction_compiled("set");
        session.record_instruction_compiled("add");
        session.record_sections(120, 288);

        let stats = session.stats();
        assert_eq!(stats.instructions_compiled, 3);
        assert_eq!(stats.instruction_counts["set"], 2);

        let report = stats.to_string();
        assert!(report.contains("Functions compiled: 1"));
        assert!(report.contains("set: 2"));
        assert!(report.contains(".data size: 288 bytes"));
    }

    #[test]
    fn test_default_options() {
        let options = CompileOptions::default();
        assert_eq!(options.entry_function, "main");
        assert!(options.max_labels > 0 && options.max_nesting > 0);
    }
}
