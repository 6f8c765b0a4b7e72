//! Domain error model.

use thiserror::Error;

use crate::chunk::WorkChunkStatus;
use crate::transition::ChunkEvent;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic failures only (validation, illegal state changes). Storage
/// and transport failures belong to the infrastructure crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed creation request).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The transition table has no entry for this status/event pair.
    #[error("illegal transition: {event:?} is not allowed from {from}")]
    IllegalTransition {
        from: WorkChunkStatus,
        event: ChunkEvent,
    },

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn illegal_transition(from: WorkChunkStatus, event: ChunkEvent) -> Self {
        Self::IllegalTransition { from, event }
    }
}
