//! Label table and forward-reference patching.
//!
//! A label is created by whichever comes first, a reference or its
//! definition, and is resolved exactly once. A reference to an unresolved
//! label reserves a zero rel32 field and records a [`PendingPatch`]; defining
//! the label patches every pending field that targets it, whatever the
//! label's kind (function, loop end, conditional end). Anything still pending
//! when the stream ends is an undefined function.

use crate::core::{CodeBuffer, CompileError, CompileResult};
use hashbrown::HashMap;

/// rel32 displacement from a field at `field` to `target`.
///
/// Branch fields are always the last four bytes of their instruction, so
/// the next instruction starts at `field + 4`.
pub fn displacement(field: usize, target: usize) -> i32 {
    (target as i64 - (field as i64 + 4)) as i32
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub name: String,
    /// `.text` offset once resolved.
    pub offset: Option<usize>,
}

impl Label {
    pub fn is_resolved(&self) -> bool {
        self.offset.is_some()
    }
}

/// A reserved rel32 field waiting for its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPatch {
    pub field: usize,
    pub target: String,
}

#[derive(Debug)]
pub struct LabelTable {
    labels: Vec<Label>,
    index: HashMap<String, usize>,
    pending: Vec<PendingPatch>,
    limit: usize,
}

impl LabelTable {
    pub fn new(limit: usize) -> Self {
        Self {
            labels: Vec::new(),
            index: HashMap::new(),
            pending: Vec::new(),
            limit,
        }
    }

    fn intern(&mut self, name: &str) -> CompileResult<usize> {
        if let Some(&slot) = self.index.get(name) {
            return Ok(slot);
        }
        if self.labels.len() >= self.limit {
            return Err(CompileError::LabelTableOverflow { limit: self.limit });
        }
        let slot = self.labels.len();
        self.labels.push(Label {
            name: name.to_string(),
            offset: None,
        });
        self.index.insert(name.to_string(), slot);
        Ok(slot)
    }

    pub fn get(&self, name: &str) -> Option<&Label> {
        self.index.get(name).map(|&slot| &self.labels[slot])
    }

    pub fn offset_of(&self, name: &str) -> Option<usize> {
        self.get(name).and_then(|label| label.offset)
    }

    /// Resolve `name` at `offset` and patch every pending reference to it.
    /// Returns the number of fields patched.
    pub fn define(
        &mut self,
        name: &str,
        offset: usize,
        text: &mut CodeBuffer,
    ) -> CompileResult<usize> {
        let slot = self.intern(name)?;
        let label = &mut self.labels[slot];
        if label.is_resolved() {
            return Err(CompileError::DuplicateLabel {
                name: name.to_string(),
            });
        }
        label.offset = Some(offset);

        let mut patched = 0;
        self.pending.retain(|patch| {
            if patch.target != name {
                return true;
            }
            let disp = displacement(patch.field, offset);
            log::trace!("patch {:#x} -> {name} ({disp:+})", patch.field);
            text.patch_i32(patch.field, disp);
            patched += 1;
            false
        });
        Ok(patched)
    }

    /// Point the rel32 field at `field` to `name`, now or once it is defined.
    /// Returns whether the field was patched immediately.
    pub fn reference(
        &mut self,
        name: &str,
        field: usize,
        text: &mut CodeBuffer,
    ) -> CompileResult<bool> {
        let slot = self.intern(name)?;
        match self.labels[slot].offset {
            Some(target) => {
                text.patch_i32(field, displacement(field, target));
                Ok(true)
            }
            None => {
                self.pending.push(PendingPatch {
                    field,
                    target: name.to_string(),
                });
                Ok(false)
            }
        }
    }

    pub fn pending(&self) -> &[PendingPatch] {
        &self.pending
    }

    /// Fail on the first reference that never got a definition.
    pub fn check_resolved(&self) -> CompileResult<()> {
        match self.pending.first() {
            Some(patch) => Err(CompileError::UndefinedFunction {
                name: patch.target.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Resolved labels as `(name, offset)`, in definition order.
    pub fn resolved(&self) -> Vec<(String, usize)> {
        self.labels
            .iter()
            .filter_map(|label| label.offset.map(|offset| (label.name.clone(), offset)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}
