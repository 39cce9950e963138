//! Error types surfaced by the pool registry.

use std::time::Duration;

use thiserror::Error;

use crate::primitive::BackendError;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors surfaced synchronously to the caller of a registry operation.
///
/// Teardown problems never appear here: closing a pool never fails
/// from the caller's point of view, see [`crate::CloseOutcome`].
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The request is missing a username, secret or target.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The target rejected the credentials or could not be reached.
    /// Never retried automatically.
    #[error("authentication against backend failed for {username}: {source}")]
    AuthBackend {
        username: String,
        #[source]
        source: BackendError,
    },

    /// No live pool exists for the principal.
    #[error("no live pool for principal {0}")]
    NoSuchPrincipal(String),

    /// Waiting for a free connection exceeded the queue timeout. Safe to retry.
    #[error("timed out after {timeout:?} waiting for a connection for {username}")]
    AcquireTimeout { username: String, timeout: Duration },

    /// The pool exists but could not hand out a connection.
    #[error("failed to acquire a connection for {username}: {source}")]
    AcquireFailed {
        username: String,
        #[source]
        source: BackendError,
    },
}

impl RegistryError {
    /// Whether the caller may retry the same operation unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, RegistryError::AcquireTimeout { .. })
    }
}
