//! warden-session — login sessions and their binding to per-user pools.
//!
//! The [`SessionStore`] issues opaque tokens, tracks idle time and fires
//! end hooks when a session is destroyed or expires. The [`SessionBinder`]
//! subscribes to those hooks and closes exactly the pool generation a
//! session was created against, so an old session ending can never close
//! the pool of a newer login.

pub mod binder;
pub mod error;
pub mod store;

pub use binder::SessionBinder;
pub use error::{SessionError, SessionResult};
pub use store::{EndReason, SessionEndHook, SessionRecord, SessionStore, SessionToken};
