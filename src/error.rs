//! Error taxonomy for the smart node core.
//!
//! Only two conditions ever leave a component: a rejected input and a failed
//! store. Unknown sensors are answered with empty results and subscriber
//! transport failures are absorbed by the broadcast hub, so neither has a
//! variant here.

use thiserror::Error;

// ---

/// Errors surfaced by the ingestion, storage and analytics components.
#[derive(Debug, Error)]
pub enum NodeError {
    // ---
    /// Malformed or incomplete input, rejected before anything is persisted.
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// Durable storage I/O failed; the caller may retry.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),
}

impl NodeError {
    // ---
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        NodeError::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Name of the offending field for validation failures.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            NodeError::Validation { field, .. } => Some(*field),
            NodeError::StoreUnavailable(_) => None,
        }
    }
}

pub type NodeResult<T> = Result<T, NodeError>;
