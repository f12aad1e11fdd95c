//! Error types for fathom-core.
//!
//! Every fallible operation in the engine returns [`Error`]. Each variant
//! maps to a stable numeric code so the HTTP layer (out of scope here) can
//! surface the right status without inspecting messages.

use thiserror::Error;

/// Errors produced by the search engine.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Malformed filter/sort/facet syntax, bad pagination, out-of-range
    /// parameters, sort-type mismatch across a union.
    #[error("{0}")]
    InvalidArgument(String),

    /// Unknown field, collection, override, or referenced document.
    #[error("{0}")]
    NotFound(String),

    /// `create` on an already existing document id.
    #[error("{0}")]
    Conflict(String),

    /// Analytics per-IP rate limit exceeded.
    #[error("{0}")]
    RateLimited(String),

    /// Search deadline exceeded with nothing to return, or a remote
    /// embedder that did not answer within its budget.
    #[error("{0}")]
    Timeout(String),

    /// A schema alteration would reject already-stored documents.
    #[error("{0}")]
    IncompatibleStoredData(String),

    /// Store I/O, JSON parse failures, unexpected invariant violations.
    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Numeric code for the HTTP layer.
    pub fn code(&self) -> u16 {
        match self {
            Error::InvalidArgument(_) => 400,
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            // Semantically 429, kept at 500 for wire compatibility.
            Error::RateLimited(_) => 500,
            Error::Timeout(_) => 408,
            Error::IncompatibleStoredData(_) => 400,
            Error::Internal(_) => 500,
        }
    }

    /// Shorthand constructor used on hot paths.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Shorthand constructor used on hot paths.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Shorthand constructor used on hot paths.
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("JSON error: {}", e))
    }
}

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, Error>;
