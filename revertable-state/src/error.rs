//! Reasons a speculative update can be rejected.
//!
//! A rejection is ordinary control flow: the caller resolves the conflict
//! (drop or re-order the transaction). Broken invariants panic instead.

use crate::types::ObjectType;
use thiserror::Error;

/// Why a delta or base-slot write was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("object type {found:?} does not match required type {required:?}")]
    TypeMismatch {
        required: ObjectType,
        found: ObjectType,
    },

    #[error("a different speculative value is already in place")]
    ValueMismatch,

    #[error("in-flight writer count is saturated")]
    WriterLimit,

    #[error("subtraction would drive the value below zero")]
    Negative,

    #[error("arithmetic overflow")]
    Overflow,

    #[error("hash is already present in the set")]
    DuplicateHash,

    #[error("hash set capacity exceeded")]
    CapacityExceeded,
}
