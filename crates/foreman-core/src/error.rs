//! Typed error kinds surfaced to callers of the managers.
//!
//! The query layer reports failures as `anyhow` errors with context; this
//! layer classifies them. Anything not classified is `Internal` and is never
//! shown to API clients verbatim.

use thiserror::Error;

/// Error kinds for manager operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Schema or required-field violation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Entity invisible under the current tenant context.
    #[error("{0} not found")]
    NotFound(String),

    /// Terminal-to-non-terminal update attempt.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// Concurrent update produced an inconsistent precondition.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Missing or malformed credentials.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// The caller holds valid credentials but may not perform the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Unexpected failure; details stay server-side.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Convenience constructor for a missing entity.
    pub fn not_found(entity: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{entity} {id}"))
    }

    /// Stable snake_case name of the kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::Conflict(_) => "conflict",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::Forbidden(_) => "forbidden",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Internal(anyhow::Error::new(err).context("database error"))
    }
}
