//! Error types shared by the dispatch bus, state store and overlap manager.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for every fallible engine operation.
pub type CanvasResult<T> = Result<T, CanvasError>;

/// Errors that can occur in engine operations.
#[derive(Debug, Error)]
pub enum CanvasError {
    /// A namespace validator rejected a value.
    #[error("Validation failed for namespace {namespace}: {reason}")]
    Validation {
        /// Namespace the write targeted.
        namespace: String,
        /// Validator message.
        reason: String,
    },

    /// Operation is not valid for the current value or state.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Snapshot, subscription, edge or node lookup failed.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The component was destroyed and no longer accepts calls.
    #[error("{0} has been destroyed")]
    Destroyed(&'static str),

    /// A bus handler reported a failure.
    #[error("Handler failed: {0}")]
    Handler(String),

    /// A persistence backend failed to save, load or remove a key.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The sync sink rejected a flush.
    #[error("Sync error: {0}")]
    Sync(String),

    /// The graph refused a geometry or style write.
    #[error("Geometry error on edge {edge}: {reason}")]
    Geometry {
        /// Edge the write targeted.
        edge: String,
        /// Graph message.
        reason: String,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error from a file-backed collaborator.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CanvasError {
    /// Stable machine-readable code for this error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_FAILED",
            Self::InvalidOperation(_) => "INVALID_OPERATION",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Destroyed(_) => "DESTROYED",
            Self::Handler(_) => "HANDLER_FAILED",
            Self::Persistence(_) => "PERSISTENCE_FAILED",
            Self::Sync(_) => "SYNC_FAILED",
            Self::Geometry { .. } => "GEOMETRY_FAILED",
            Self::Serialization(_) => "SERIALIZATION_FAILED",
            Self::Io(_) => "IO_FAILED",
        }
    }

    /// Serializable `{message, code}` pair for JS-facing consumers.
    #[must_use]
    pub fn info(&self) -> ErrorInfo {
        ErrorInfo {
            message: self.to_string(),
            code: self.code().to_string(),
        }
    }
}

/// Flattened error description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Human-readable message.
    pub message: String,
    /// Stable code from [`CanvasError::code`].
    pub code: String,
}
