use thiserror::Error;
use ulid::Ulid;

use crate::error::AppError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("room not found: {0}")]
    RoomNotFound(Ulid),
    #[error("booking not found: {0}")]
    BookingNotFound(Ulid),
    #[error("account not found: {0}")]
    AccountNotFound(String),
    #[error("role not found: {0}")]
    RoleNotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("conflict with booking: {0}")]
    Conflict(Ulid),
    #[error("account is frozen: {0}")]
    AccountFrozen(Ulid),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::RoomNotFound(_)
            | EngineError::BookingNotFound(_)
            | EngineError::AccountNotFound(_)
            | EngineError::RoleNotFound(_) => AppError::NotFound(err.to_string()),
            EngineError::AlreadyExists(_) | EngineError::Conflict(_) => {
                AppError::Conflict(err.to_string())
            }
            EngineError::AccountFrozen(_) => AppError::Forbidden(err.to_string()),
            EngineError::Invalid(_) | EngineError::LimitExceeded(_) => {
                AppError::Invalid(err.to_string())
            }
            EngineError::WalError(_) => AppError::Upstream(err.to_string()),
        }
    }
}
