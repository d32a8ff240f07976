//! Error types for the heap subsystem.
//!
//! Only two conditions are recoverable: allocation failure that survives a
//! collection cycle, and asking the printer to render something it has no
//! syntax for. Everything else (tag-mismatched dereference, stale address,
//! root-stack overflow) indicates a corrupted heap and panics.

use thiserror::Error;

use crate::value::Tag;

/// Allocation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
    /// Checked allocation failed even after one collection cycle.
    #[error("out of memory: {requested} words still unavailable after collection")]
    OutOfMemory { requested: usize },
}

/// Result alias for allocating operations.
pub type HeapResult<T> = Result<T, HeapError>;

/// Printer errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PrintError {
    /// The value's tag/subtype combination has no printed representation.
    #[error("cannot render value with tag {tag:?}, subtype {subtype}")]
    UnsupportedValue { tag: Tag, subtype: i64 },
}

/// Result alias for the printer.
pub type PrintResult<T> = Result<T, PrintError>;
