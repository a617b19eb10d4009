//! Error types for the controller.
//!
//! Defines custom error types with classification for retry behavior.
//! Requeue signals are not errors; see `SyncOutcome` in the member manager.

use std::time::Duration;
use thiserror::Error;

use crate::client::PdClientError;

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Missing required field in resource
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Validation error in resource spec
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transient error that should be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Permanent error that should not be retried
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// PD health endpoint query failed
    #[error("PD API error: {0}")]
    PdApi(#[from] PdClientError),

    /// The PD query failed and the service has endpoints but none are ready
    #[error("{source}, service {namespace}/{service} has no endpoints")]
    NoReadyBackends {
        namespace: String,
        service: String,
        source: PdClientError,
    },

    /// The stored object changed since it was read
    #[error("Conflict updating {kind} {name}: {message}")]
    Conflict {
        kind: &'static str,
        name: String,
        message: String,
    },

    /// Member matching pattern failed to compile
    #[error("Invalid member pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// Malformed version string
    #[error("Invalid version {version:?}: {source}")]
    Version {
        version: String,
        source: semver::Error,
    },

    /// A strategy collaborator failed
    #[error("{strategy} failed: {message}")]
    Strategy {
        strategy: &'static str,
        message: String,
    },
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on network errors, rate limiting, and server errors
                matches!(
                    e,
                    kube::Error::Api(api_err) if api_err.code >= 500 || api_err.code == 429
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::Transient(_)
            | Error::PdApi(_)
            | Error::NoReadyBackends { .. }
            | Error::Conflict { .. }
            | Error::Strategy { .. } => true,
            Error::Validation(_)
            | Error::Permanent(_)
            | Error::MissingField(_)
            | Error::Pattern(_)
            | Error::Version { .. } => false,
            Error::Serialization(_) => false,
        }
    }

    /// Get the recommended requeue duration for this error
    pub fn requeue_after(&self) -> Duration {
        match self {
            // The next read picks up the fresh resourceVersion
            Error::Conflict { .. } => Duration::from_secs(5),
            _ if self.is_retryable() => Duration::from_secs(30),
            // Configuration errors wait for the spec to change
            _ => Duration::from_secs(3600),
        }
    }

    /// Build a strategy error from any displayable failure.
    pub fn strategy(strategy: &'static str, message: impl std::fmt::Display) -> Self {
        Error::Strategy {
            strategy,
            message: message.to_string(),
        }
    }

    /// Map a Kubernetes 409 into `Error::Conflict`, passing other errors through.
    pub fn from_update(kind: &'static str, name: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ref api_err) if api_err.code == 409 => Error::Conflict {
                kind,
                name: name.to_string(),
                message: api_err.message.clone(),
            },
            other => Error::Kube(other),
        }
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;
