//! The pooling primitive the registry is built on.
//!
//! A [`PoolPrimitive`] turns `(principal, secret, sizing)` into a
//! [`PoolHandle`] that hands out reusable physical connections. The registry
//! never talks to the database directly; everything goes through these two
//! traits, which keeps it testable against an in-memory implementation.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use warden_core::{Principal, Secret};

use crate::config::PoolConfig;

/// Coarse classification of backend failures, used to pick a user-facing
/// message without leaking driver internals.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Wrong username or password.
    InvalidCredentials,
    /// The role exists but may not log in (locked, expired, no LOGIN).
    LoginNotPermitted,
    /// Network-level failure reaching the target.
    Unreachable,
    /// The target descriptor could not be parsed.
    InvalidTarget,
    /// The backend did not answer in time.
    Timeout,
    Other,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendErrorKind::InvalidCredentials => write!(f, "invalid credentials"),
            BackendErrorKind::LoginNotPermitted => write!(f, "login not permitted"),
            BackendErrorKind::Unreachable => write!(f, "target unreachable"),
            BackendErrorKind::InvalidTarget => write!(f, "invalid target"),
            BackendErrorKind::Timeout => write!(f, "timeout"),
            BackendErrorKind::Other => write!(f, "backend error"),
        }
    }
}

/// A failure reported by the pooling primitive.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Why a handle could not hand out a connection.
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("timed out waiting for a free connection")]
    Timeout,
    /// The pool was drained or force-closed underneath the caller.
    #[error("pool is closed")]
    Closed,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Why a graceful drain did not complete.
#[derive(Debug, Error)]
pub enum DrainError {
    #[error("drain timed out with connections still checked out")]
    Timeout,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Point-in-time counters reported by a handle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HandleStats {
    /// Connections currently checked out.
    pub in_use: u32,
    /// Connections open (checked out + idle).
    pub open: u32,
}

/// Factory for per-principal pools, injected into the registry.
pub trait PoolPrimitive: Send + Sync + 'static {
    type Handle: PoolHandle;

    /// Create a pool for `principal`. May connect eagerly or lazily; the
    /// registry probes one connection before trusting the handle.
    fn open(
        &self,
        principal: &Principal,
        secret: &Secret,
        config: &PoolConfig,
    ) -> impl Future<Output = Result<Self::Handle, BackendError>> + Send;
}

/// An opaque pool owned exclusively by the registry.
pub trait PoolHandle: Send + Sync + 'static {
    type Conn: Send + 'static;

    /// Check out a connection, waiting at most `timeout`.
    fn acquire(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Self::Conn, AcquireError>> + Send;

    /// Return a connection previously handed out by this handle.
    fn release(&self, conn: Self::Conn) -> Result<(), BackendError>;

    /// Stop handing out connections and wait up to `timeout` for checked-out
    /// ones to come back before closing everything.
    fn drain(&self, timeout: Duration) -> impl Future<Output = Result<(), DrainError>> + Send;

    /// Close without waiting. Must not block.
    fn force_close(&self);

    fn stats(&self) -> HandleStats;
}
