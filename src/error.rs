//! Service-level error taxonomy.
//!
//! Module errors convert into [`AppError`] at the service boundary; the wire
//! layer maps each variant onto a SQLSTATE.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    /// Soft failure: shown to the caller as a message, not an error.
    #[error("{0}")]
    Throttled(String),

    #[error("upstream failure: {0}")]
    Upstream(String),
}

impl AppError {
    pub fn is_soft(&self) -> bool {
        matches!(self, AppError::Throttled(_))
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::Unauthenticated(_) => "unauthenticated",
            AppError::Forbidden(_) => "forbidden",
            AppError::Invalid(_) => "invalid",
            AppError::Throttled(_) => "throttled",
            AppError::Upstream(_) => "upstream",
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
