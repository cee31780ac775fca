//! Error types for Wheelhouse core

use thiserror::Error;
use uuid::Uuid;
use wheelhouse_types::JobStatus;

/// Errors that can occur in Wheelhouse core
#[derive(Debug, Error)]
pub enum WheelhouseError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Package not found: {0}")]
    PackageNotFound(String),

    #[error("No version of {name} matches {specifier}")]
    NoMatchingVersion { name: String, specifier: String },

    #[error("Invalid requirement '{input}': {reason}")]
    InvalidRequirement { input: String, reason: String },

    #[error("Invalid marker '{input}': {reason}")]
    InvalidMarker { input: String, reason: String },

    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    #[error("Download job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Cannot move job {id} from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Package index unreachable: {0}")]
    IndexUnreachable(String),

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl WheelhouseError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            WheelhouseError::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            WheelhouseError::IndexUnreachable(_) | WheelhouseError::Timeout(_) => true,
            WheelhouseError::ServerError { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// The index (not just one package) is out of reach
    pub fn is_unreachable(&self) -> bool {
        matches!(self, WheelhouseError::IndexUnreachable(_))
    }
}

impl From<serde_json::Error> for WheelhouseError {
    fn from(error: serde_json::Error) -> Self {
        WheelhouseError::Serialization(error.to_string())
    }
}

pub type WheelhouseResult<T> = Result<T, WheelhouseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(WheelhouseError::ServerError {
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(!WheelhouseError::ServerError {
            status: 404,
            message: "missing".into()
        }
        .is_retryable());
        assert!(WheelhouseError::IndexUnreachable("refused".into()).is_retryable());
        assert!(!WheelhouseError::PackageNotFound("foo".into()).is_retryable());
    }
}
