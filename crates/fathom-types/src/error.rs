//! Shared error types for the Fathom system.

use thiserror::Error;

/// Top-level error type for the Fathom system.
#[derive(Error, Debug)]
pub enum FathomError {
    /// The request was malformed and was rejected before doing any work.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// A concurrency limit was saturated beyond its wait timeout.
    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    /// The operation ran past its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// A storage error occurred (connection loss, write conflict, ...).
    #[error("Store error: {0}")]
    Store(String),

    /// A referenced record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What kind of record was looked up.
        kind: &'static str,
        /// The id that was looked up.
        id: String,
    },

    /// An external provider (embedding, extraction, classification) failed.
    #[error("Provider error: {0}")]
    Provider(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FathomError {
    /// Whether retrying the same operation may succeed.
    ///
    /// Only transient storage and provider failures qualify; validation,
    /// capacity and cancellation are final for the request that hit them.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FathomError::Store(_) | FathomError::Provider(_))
    }

    /// Shorthand for a [`FathomError::NotFound`] on a fact.
    pub fn unit_not_found(id: impl ToString) -> Self {
        FathomError::NotFound {
            kind: "Memory unit",
            id: id.to_string(),
        }
    }

    /// Shorthand for a [`FathomError::NotFound`] on an entity.
    pub fn entity_not_found(id: impl ToString) -> Self {
        FathomError::NotFound {
            kind: "Entity",
            id: id.to_string(),
        }
    }
}

/// Alias for Result with FathomError.
pub type FathomResult<T> = Result<T, FathomError>;
