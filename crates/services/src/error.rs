//! Shared error types for the services crate.

use thiserror::Error;

use exam_core::model::{AttemptError, AttemptId, AttemptStatus, SettingsError};
use storage::repository::StorageError;
use storage::sqlite::SqliteInitError;

/// Errors emitted by `AttemptApi` implementations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ApiError {
    #[error("attempt {0} not found")]
    NotFound(AttemptId),
    #[error("request rejected by backend: {0}")]
    Conflict(String),
    #[error("backend unavailable")]
    Unavailable,
    #[error("attempt api request failed with status {0}")]
    HttpStatus(reqwest::StatusCode),
    #[error("attempt api returned an invalid payload: {0}")]
    Decode(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl ApiError {
    /// True when retrying later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Unavailable => true,
            ApiError::Http(err) => err.is_connect() || err.is_timeout(),
            ApiError::HttpStatus(status) => status.is_server_error(),
            _ => false,
        }
    }
}

impl From<AttemptError> for ApiError {
    fn from(err: AttemptError) -> Self {
        ApiError::Decode(err.to_string())
    }
}

/// Errors emitted while building the API configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("invalid api base url {raw:?}: {reason}")]
    InvalidBaseUrl { raw: String, reason: String },
    #[error("api base url must use http or https, got {0}")]
    UnsupportedScheme(String),
    #[error("invalid value for {name}: {raw:?}")]
    InvalidEnv { name: &'static str, raw: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Errors emitted by the session timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum TimerError {
    #[error("timer is stopped")]
    Stopped,
}

/// Errors emitted by `ResumptionRegistry`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("attempt {attempt_id} cannot be resumed (status {status})")]
    NotResumable {
        attempt_id: AttemptId,
        status: AttemptStatus,
    },
    #[error("attempt {attempt_id} cannot {action} while {status}")]
    InvalidTransition {
        attempt_id: AttemptId,
        status: AttemptStatus,
        action: &'static str,
    },
    #[error("attempt {0} was abandoned")]
    Abandoned(AttemptId),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Attempt(#[from] AttemptError),
}

/// Errors emitted by `SessionCoordinator`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoordinatorError {
    #[error("attempt {attempt_id} cannot be resumed (status {status})")]
    NotResumable {
        attempt_id: AttemptId,
        status: AttemptStatus,
    },
    #[error(transparent)]
    Attempt(#[from] AttemptError),
    #[error(transparent)]
    Timer(#[from] TimerError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted while bootstrapping app services.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AppServicesError {
    #[error(transparent)]
    Sqlite(#[from] SqliteInitError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}
