//! warden-pool — one connection pool per authenticated principal.
//!
//! The [`PoolRegistry`] is the single authority over which pools exist. It
//! sits on top of a [`PoolPrimitive`] (in production, `sqlx`'s Postgres
//! pool) and adds per-principal multiplexing, replacement on re-login and
//! bounded teardown.
//!
//! # Architecture
//!
//! ```text
//! login(principal, secret)
//!   → PoolRegistry::create_or_replace
//!     → principal gate locked (other principals unaffected)
//!       → live entry exists → detach, drain (bounded), force on timeout
//!       → PoolPrimitive::open → probe one connection
//!         → ok  → install entry with a fresh generation
//!         → err → discard, AuthBackend
//!
//! request(principal)
//!   → PoolRegistry::acquire → PooledConnection (released on drop)
//!
//! logout / expiry
//!   → PoolRegistry::close_generation(principal, bound generation)
//!     → generation still live → detach, drain, force on timeout
//!     → newer generation live → stale, no-op
//! ```

pub mod config;
pub mod error;
pub mod postgres;
pub mod primitive;
pub mod registry;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use config::PoolConfig;
pub use error::{RegistryError, RegistryResult};
pub use postgres::{PgHandle, PgPrimitive};
pub use primitive::{
    AcquireError, BackendError, BackendErrorKind, DrainError, HandleStats, PoolHandle,
    PoolPrimitive,
};
pub use registry::{
    CloseOutcome, CloseSummary, Generation, PoolRegistry, PoolStats, PooledConnection,
};
