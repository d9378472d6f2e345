//! Error types for distributed lock operations.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during lock operations.
#[derive(Error, Debug)]
pub enum LockError {
    /// The lock was configured with an unusable key or endpoint list.
    #[error("invalid lock configuration: {0}")]
    Configuration(String),

    /// The local environment could not produce a holder identity.
    #[error("cannot derive holder identity: {0}")]
    Environment(#[source] std::io::Error),

    /// The client handle for the coordination service could not be built.
    #[error("connectivity error: {0}")]
    Connectivity(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A call to the coordination service failed.
    ///
    /// The source is the backend's own error type and can be downcast to
    /// inspect the remote condition.
    #[error("coordination error: {0}")]
    Coordination(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Lock acquisition timed out.
    #[error("lock acquisition timed out after {0:?}")]
    Timeout(Duration),
}

impl LockError {
    /// Returns the coordination-service error behind this error, if any.
    pub fn coordination_source(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            LockError::Coordination(source) => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;
