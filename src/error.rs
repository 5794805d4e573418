//! Application error handling.

use axum::http::StatusCode;
use thiserror::Error;

/// Applications errors, typed for classification at the HTTP boundary.
#[derive(Debug, Error)]
pub enum AppError {
    /// A training session is already active.
    #[error("a training session is already active")]
    AlreadyRunning,
    /// No stoppable training session is active.
    #[error("no stoppable training session is active")]
    NotRunning,
    /// The proposed broker config conflicts with the active one.
    #[error("broker config conflict: {0}")]
    ConfigConflict(String),
    /// No broker config has been established yet.
    #[error("no active broker config, call training/start or provide an inline config")]
    NoActiveConfig,
    /// The request itself was malformed.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The broker could not be reached; the request may be retried.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),
    /// Internal server error.
    #[error("internal error: {0}")]
    Ise(#[from] anyhow::Error),
}

impl AppError {
    /// The HTTP status code for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::AlreadyRunning | AppError::NotRunning => StatusCode::CONFLICT,
            AppError::ConfigConflict(_) => StatusCode::CONFLICT,
            AppError::NoActiveConfig => StatusCode::PRECONDITION_REQUIRED,
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::BrokerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Ise(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether retrying the same request may succeed on its own.
    pub fn is_retriable(&self) -> bool {
        matches!(self, AppError::BrokerUnavailable(_))
    }

    /// Recover the typed error from an `anyhow` chain, else classify as `Ise`.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        match err.downcast::<AppError>() {
            Ok(app_err) => app_err,
            Err(err) => AppError::Ise(err),
        }
    }
}
