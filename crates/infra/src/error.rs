//! Error type shared by the engine, dispatcher, maintenance and workers.

use thiserror::Error;

use batchflow_core::{ChunkEvent, DomainError, WorkChunkStatus};

use crate::store::ChunkStoreError;

/// Errors surfaced by batch orchestration operations.
///
/// A lost race (the chunk was no longer in the expected status) is **not** an error:
/// operations report it as a zero row count.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("illegal transition: {event:?} from {from}")]
    IllegalTransition {
        from: WorkChunkStatus,
        event: ChunkEvent,
    },

    /// Storage is unreachable. Not retried internally; the next maintenance pass
    /// or message redelivery retries.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// The work notification could not be published.
    #[error("notification failed: {0}")]
    Notify(String),
}

pub type BatchResult<T> = Result<T, BatchError>;

impl BatchError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Whether this error should abort a whole maintenance pass.
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }
}

impl From<ChunkStoreError> for BatchError {
    fn from(err: ChunkStoreError) -> Self {
        match err {
            ChunkStoreError::NotFound(msg) => BatchError::NotFound(msg),
            ChunkStoreError::AlreadyExists(msg) => BatchError::Validation(msg),
            ChunkStoreError::Unavailable(msg) => BatchError::StorageUnavailable(msg),
            ChunkStoreError::Storage(msg) => BatchError::Storage(msg),
        }
    }
}

impl From<DomainError> for BatchError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                BatchError::Validation(msg)
            }
            DomainError::IllegalTransition { from, event } => {
                BatchError::IllegalTransition { from, event }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_storage_is_flagged() {
        let err: BatchError = ChunkStoreError::Unavailable("down".into()).into();
        assert!(err.is_storage_unavailable());
        let err: BatchError = ChunkStoreError::Storage("corrupt".into()).into();
        assert!(!err.is_storage_unavailable());
    }

    #[test]
    fn domain_transition_errors_are_preserved() {
        let err: BatchError =
            DomainError::illegal_transition(WorkChunkStatus::Completed, ChunkEvent::Dispatch).into();
        assert!(matches!(
            err,
            BatchError::IllegalTransition {
                from: WorkChunkStatus::Completed,
                event: ChunkEvent::Dispatch
            }
        ));
    }
}
