//! Skip connection lists shared between encoders and decoders.

use core::{iter::Rev, slice};

use crate::error::{VitUNetError, VitUNetResult};

/// Activations captured by an encoder, stored shallow to deep.
///
/// Decoders walk the list deep to shallow through [`SkipConnections::decoder_order`],
/// so the first decoder stage is paired with the last captured activation.
#[derive(Debug, Clone)]
pub struct SkipConnections<T> {
    entries: Vec<T>,
}

impl<T> Default for SkipConnections<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> SkipConnections<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Append the activation of the next, deeper encoder stage.
    pub fn capture(&mut self, entry: T) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in capture order, shallow to deep.
    pub fn iter(&self) -> slice::Iter<'_, T> {
        self.entries.iter()
    }

    /// Entries in decoder order, deep to shallow.
    pub fn decoder_order(&self) -> Rev<slice::Iter<'_, T>> {
        self.entries.iter().rev()
    }

    /// Check that the list feeds exactly `expected` decoder stages.
    ///
    /// # Errors
    ///
    /// Returns `SkipCountMismatch` naming `list` when the length differs.
    pub fn ensure_len(&self, list: &str, expected: usize) -> VitUNetResult<()> {
        if self.entries.len() == expected {
            Ok(())
        } else {
            Err(VitUNetError::SkipCountMismatch {
                list: list.to_owned(),
                expected,
                actual: self.entries.len(),
            })
        }
    }
}

impl<T> From<Vec<T>> for SkipConnections<T> {
    fn from(entries: Vec<T>) -> Self {
        Self { entries }
    }
}

impl<T> FromIterator<T> for SkipConnections<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
