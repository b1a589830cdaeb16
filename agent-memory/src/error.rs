//! Error types for agent-memory.

use thiserror::Error;

use crate::memory::RecordId;

/// Result type alias using agent-memory's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during memory engine operations.
#[derive(Error, Debug)]
pub enum Error {
    /// No record with the given id exists in the searched tier(s)
    #[error("Record not found: {id}")]
    NotFound { id: RecordId },

    /// Caller supplied an argument that is rejected before any mutation
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A store was configured without room for a single record
    #[error("Capacity exhausted: {tier} store has capacity {capacity}")]
    CapacityExhausted { tier: String, capacity: usize },

    /// Persisted state could not be decoded
    #[error("Corrupt state: {0}")]
    CorruptState(String),

    /// Decoded state breaks a store invariant
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// The external summarizer failed for a consolidation group
    #[error("Summarization failed for group '{group}': {message}")]
    SummarizationFailed { group: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem error while saving or loading
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a not-found error.
    pub fn not_found(id: &RecordId) -> Self {
        Self::NotFound { id: id.clone() }
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Create a capacity exhausted error.
    pub fn capacity_exhausted(tier: impl std::fmt::Display, capacity: usize) -> Self {
        Self::CapacityExhausted {
            tier: tier.to_string(),
            capacity,
        }
    }

    /// Create a summarization failure for a group.
    pub fn summarization_failed(group: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SummarizationFailed {
            group: group.into(),
            message: message.into(),
        }
    }

    /// Whether this is a `NotFound` error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
