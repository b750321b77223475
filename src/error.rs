//! Error types for pkbp.
//!
//! Errors are strongly typed using thiserror and grouped by how the
//! control loop reacts to them: collaborator failures are recovered
//! locally, invariant violations abort the current commit.

use thiserror::Error;

use crate::collab::{DocumentId, SentenceRef};
use crate::entity::EntityId;
use crate::mention::MentionKey;
use crate::situation::SituationId;

/// Validation errors that occur during input validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field '{field}' is empty")]
    EmptyField {
        field: String,
    },

    #[error("Invalid character span: begin ({begin}) must be before end ({end})")]
    InvalidSpan {
        begin: usize,
        end: usize,
    },

    #[error("Seed [{begin}, {end}) does not cover any token of document {document}")]
    SeedNotResolved {
        document: DocumentId,
        begin: usize,
        end: usize,
    },

    #[error("Value {value} for '{field}' is out of range: {reason}")]
    OutOfRange {
        field: String,
        value: f64,
        reason: String,
    },

    #[error("Sketch shape {rows}x2^{log_width} is not supported")]
    InvalidSketchShape {
        rows: usize,
        log_width: u32,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },

    #[error("Malformed token '{token}': {reason}")]
    InvalidToken {
        token: String,
        reason: String,
    },
}

/// Failures of an external collaborator (document store, feature index).
///
/// These are recovered locally: the affected mention or sentence is
/// skipped and the loop continues.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("Document not found: {document}")]
    DocumentNotFound {
        document: DocumentId,
    },

    #[error("Sentence not found: {sentence}")]
    SentenceNotFound {
        sentence: SentenceRef,
    },

    #[error("Collaborator call timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Feature index error: {message}")]
    Index {
        message: String,
    },

    #[error("Collaborator disconnected: {what}")]
    Disconnected {
        what: String,
    },
}

/// Internal-consistency failures of the knowledge base.
///
/// The single-writer commit path is supposed to preclude these; seeing
/// one aborts the commit that produced it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("Mention {mention} is already owned by {owner}")]
    MentionAlreadyOwned {
        mention: MentionKey,
        owner: String,
    },

    #[error("Core arguments {arguments:?} already belong to situation {existing}")]
    DuplicateCoreArguments {
        arguments: Vec<EntityId>,
        existing: SituationId,
    },

    #[error("Unknown entity: {id}")]
    UnknownEntity {
        id: EntityId,
    },

    #[error("Unknown situation: {id}")]
    UnknownSituation {
        id: SituationId,
    },

    #[error("Situation {id} core arguments disagree with the membership graph")]
    CoreArgumentsChanged {
        id: SituationId,
    },

    #[error("Situation has no core arguments")]
    EmptyCoreArguments,

    #[error("Pending entity slot {slot} does not create an entity")]
    DanglingPendingEntity {
        slot: usize,
    },
}

/// Errors raised while persisting or restoring state.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
    },

    #[error("Data corrupted: {message}")]
    Corrupted {
        message: String,
    },

    #[error("Snapshot directory {path} is locked by another process ({holder})")]
    Locked {
        path: String,
        holder: String,
    },
}

/// Top-level error type for pkbp.
#[derive(Debug, Error)]
pub enum PkbError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("Invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl PkbError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a collaborator failure.
    #[must_use]
    pub const fn is_collaborator(&self) -> bool {
        matches!(self, Self::Collaborator(_))
    }

    /// Returns true if this is an invariant violation.
    #[must_use]
    pub const fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }

    /// Returns true if the loop must stop rather than skip and continue.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !self.is_collaborator()
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Collaborator(e) => matches!(
                e,
                CollaboratorError::Timeout { .. } | CollaboratorError::Disconnected { .. }
            ),
            Self::Storage(StorageError::Locked { .. }) => true,
            _ => false,
        }
    }
}

/// Result type alias for pkbp operations.
pub type PkbResult<T> = Result<T, PkbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ValidationError::InvalidSpan { begin: 7, end: 3 };
        assert!(err.to_string().contains("begin (7)"));

        let err = CollaboratorError::DocumentNotFound {
            document: DocumentId::new("NYT_001"),
        };
        assert!(err.to_string().contains("NYT_001"));
    }

    #[test]
    fn test_error_conversion() {
        let err: PkbError = CollaboratorError::Timeout { duration_ms: 10 }.into();
        assert!(err.is_collaborator());
        assert!(!err.is_fatal());
        assert!(err.is_retryable());

        let err: PkbError = InvariantViolation::EmptyCoreArguments.into();
        assert!(err.is_invariant_violation());
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_internal_error() {
        let err = PkbError::internal("worker vanished");
        assert!(matches!(err, PkbError::Internal { .. }));
        assert!(err.is_fatal());
    }
}
