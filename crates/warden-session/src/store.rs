//! In-memory login session store.
//!
//! Sessions expire after `idle_timeout` without a `get`. Expiry is enforced
//! both lazily (on `get`) and by a periodic sweep, and every removal other
//! than [`SessionStore::clear`] fires the subscribed end hooks.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{RwLock, watch};
use tokio::time::Instant;
use tracing::{debug, info};
use warden_core::{Principal, UserInfo};

use crate::error::{SessionError, SessionResult};

const TOKEN_BYTES: usize = 32;

/// Opaque session identifier carried in the session cookie.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    /// 256 random bits, hex encoded.
    pub fn generate() -> SessionResult<Self> {
        let mut buf = [0u8; TOKEN_BYTES];
        getrandom::getrandom(&mut buf).map_err(|e| SessionError::TokenGeneration(e.to_string()))?;
        Ok(Self(hex::encode(buf)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading characters only, for logs.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl From<&str> for SessionToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({}…)", self.short())
    }
}

/// Why a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Logout,
    Expired,
    /// Removed because its pool generation was replaced or closed.
    Invalidated,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::Logout => write!(f, "logout"),
            EndReason::Expired => write!(f, "expired"),
            EndReason::Invalidated => write!(f, "invalidated"),
        }
    }
}

/// Callback invoked after a session is removed.
pub type SessionEndHook = Arc<dyn Fn(SessionToken, EndReason) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct SessionRecord {
    pub token: SessionToken,
    pub principal: Principal,
    pub login_time: DateTime<Utc>,
    pub last_access: Instant,
    /// Role attributes read at login.
    pub user_info: UserInfo,
}

impl SessionRecord {
    fn is_expired(&self, idle_timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_access) > idle_timeout
    }
}

struct Inner {
    idle_timeout: Duration,
    sessions: RwLock<HashMap<SessionToken, SessionRecord>>,
    hooks: RwLock<Vec<SessionEndHook>>,
}

/// Shared handle to the session table. Clones share state.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Inner>,
}

impl SessionStore {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                idle_timeout,
                sessions: RwLock::new(HashMap::new()),
                hooks: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.inner.idle_timeout
    }

    /// Register a hook fired for every destroyed or expired session.
    pub async fn subscribe(&self, hook: SessionEndHook) {
        self.inner.hooks.write().await.push(hook);
    }

    pub async fn create(
        &self,
        principal: Principal,
        user_info: UserInfo,
    ) -> SessionResult<SessionToken> {
        let token = SessionToken::generate()?;
        let record = SessionRecord {
            token: token.clone(),
            principal,
            login_time: Utc::now(),
            last_access: Instant::now(),
            user_info,
        };
        info!(
            username = %record.principal.username,
            token = token.short(),
            "session created"
        );
        self.inner
            .sessions
            .write()
            .await
            .insert(token.clone(), record);
        Ok(token)
    }

    /// Look up a session and refresh its idle timer.
    ///
    /// An expired session is removed (firing `Expired` hooks) and `None` is
    /// returned.
    pub async fn get(&self, token: &SessionToken) -> Option<SessionRecord> {
        let now = Instant::now();
        let expired = {
            let mut sessions = self.inner.sessions.write().await;
            let record = sessions.get_mut(token)?;
            if record.is_expired(self.inner.idle_timeout, now) {
                sessions.remove(token)
            } else {
                record.last_access = now;
                return Some(record.clone());
            }
        };

        if let Some(record) = expired {
            debug!(username = %record.principal.username, token = token.short(), "session expired on access");
            self.fire(token, EndReason::Expired).await;
        }
        None
    }

    /// Remove a session. Returns whether it existed.
    pub async fn destroy(&self, token: &SessionToken, reason: EndReason) -> bool {
        let removed = self.inner.sessions.write().await.remove(token);
        match removed {
            Some(record) => {
                info!(
                    username = %record.principal.username,
                    token = token.short(),
                    %reason,
                    "session ended"
                );
                self.fire(token, reason).await;
                true
            }
            None => false,
        }
    }

    /// Remove every session idle longer than the idle timeout.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<SessionRecord> = {
            let mut sessions = self.inner.sessions.write().await;
            let tokens: Vec<SessionToken> = sessions
                .values()
                .filter(|record| record.is_expired(self.inner.idle_timeout, now))
                .map(|record| record.token.clone())
                .collect();
            tokens
                .iter()
                .filter_map(|token| sessions.remove(token))
                .collect()
        };

        for record in &expired {
            debug!(username = %record.principal.username, token = record.token.short(), "session expired");
            self.fire(&record.token, EndReason::Expired).await;
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired sessions swept");
        }
        expired.len()
    }

    /// Sweep expired sessions every `interval` until `shutdown` flips.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        debug!(?interval, "session sweep starting");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.sweep_expired().await;
                }
                _ = shutdown.changed() => {
                    debug!("session sweep shutting down");
                    break;
                }
            }
        }
    }

    /// Drop all sessions without firing hooks.
    pub async fn clear(&self) {
        self.inner.sessions.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn fire(&self, token: &SessionToken, reason: EndReason) {
        let hooks = self.inner.hooks.read().await.clone();
        for hook in hooks {
            hook(token.clone(), reason).await;
        }
    }
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("idle_timeout", &self.inner.idle_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn alice() -> Principal {
        Principal::new("alice", "db.local:5432/postgres")
    }

    fn recording_hook() -> (SessionEndHook, Arc<Mutex<Vec<(SessionToken, EndReason)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let hook: SessionEndHook = Arc::new(move |token, reason| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                sink.lock().unwrap().push((token, reason));
            })
        });
        (hook, seen)
    }

    #[test]
    fn tokens_are_random_hex() {
        let a = SessionToken::generate().unwrap();
        let b = SessionToken::generate().unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), TOKEN_BYTES * 2);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a.short().len(), 8);
    }

    #[tokio::test]
    async fn create_and_get() {
        let store = SessionStore::new(Duration::from_secs(60));
        let token = store
            .create(alice(), UserInfo::basic("alice"))
            .await
            .unwrap();

        let record = store.get(&token).await.unwrap();
        assert_eq!(record.principal.username, "alice");
        assert_eq!(record.user_info.username, "alice");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn unknown_token_is_none() {
        let store = SessionStore::new(Duration::from_secs(60));
        assert!(store.get(&SessionToken::from("nope")).await.is_none());
    }

    #[tokio::test]
    async fn destroy_fires_hooks_once() {
        let store = SessionStore::new(Duration::from_secs(60));
        let (hook, seen) = recording_hook();
        store.subscribe(hook).await;

        let token = store.create(alice(), UserInfo::basic("alice")).await.unwrap();
        assert!(store.destroy(&token, EndReason::Logout).await);
        assert!(!store.destroy(&token, EndReason::Logout).await);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[(token, EndReason::Logout)]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_expires_on_get() {
        let store = SessionStore::new(Duration::from_secs(30));
        assert_eq!(store.idle_timeout(), Duration::from_secs(30));
        let (hook, seen) = recording_hook();
        store.subscribe(hook).await;
        let token = store.create(alice(), UserInfo::basic("alice")).await.unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(store.get(&token).await.is_some(), "access refreshes idle timer");

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(store.get(&token).await.is_some());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(store.get(&token).await.is_none());
        assert!(store.is_empty().await);
        assert_eq!(seen.lock().unwrap()[0].1, EndReason::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_idle_sessions() {
        let store = SessionStore::new(Duration::from_secs(30));
        let (hook, seen) = recording_hook();
        store.subscribe(hook).await;

        let stale = store.create(alice(), UserInfo::basic("alice")).await.unwrap();
        tokio::time::advance(Duration::from_secs(25)).await;
        let fresh = store
            .create(Principal::new("bob", "db"), UserInfo::basic("bob"))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;

        assert_eq!(store.sweep_expired().await, 1);
        assert!(store.get(&fresh).await.is_some());
        assert_eq!(seen.lock().unwrap().as_slice(), &[(stale, EndReason::Expired)]);
    }

    #[tokio::test(start_paused = true)]
    async fn run_sweeps_until_shutdown() {
        let store = SessionStore::new(Duration::from_secs(5));
        store.create(alice(), UserInfo::basic("alice")).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = store.clone();
        let task = tokio::spawn(async move {
            sweeper.run(Duration::from_secs(1), shutdown_rx).await;
        });

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(store.is_empty().await);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn clear_does_not_fire_hooks() {
        let store = SessionStore::new(Duration::from_secs(60));
        let (hook, seen) = recording_hook();
        store.subscribe(hook).await;
        store.create(alice(), UserInfo::basic("alice")).await.unwrap();

        store.clear().await;
        assert!(store.is_empty().await);
        assert!(seen.lock().unwrap().is_empty());
    }
}
