//! In-memory pooling primitive for tests.
//!
//! Behaves like a bounded pool: a semaphore caps checked-out connections at
//! `max_connections`, drains wait for outstanding connections, and every
//! pool ever opened is kept so tests can inspect what happened to it.
//! Failure modes are switched on per primitive and captured by each pool at
//! open time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use warden_core::{Principal, Secret};

use crate::config::PoolConfig;
use crate::primitive::{
    AcquireError, BackendError, BackendErrorKind, DrainError, HandleStats, PoolHandle,
    PoolPrimitive,
};

#[derive(Default)]
struct MockState {
    opens: AtomicU64,
    fail_probe: AtomicBool,
    hang_drain: AtomicBool,
    rejected: Mutex<Option<String>>,
    open_delays: Mutex<HashMap<String, Duration>>,
    pools: Mutex<Vec<Arc<MockPool>>>,
}

/// Cloneable test primitive; clones share state.
#[derive(Clone, Default)]
pub struct MockPrimitive {
    state: Arc<MockState>,
}

impl MockPrimitive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject pools opened with this password as invalid credentials.
    pub fn reject_password(&self, password: &str) {
        *self.state.rejected.lock().unwrap() = Some(password.to_string());
    }

    /// Pools opened from now on fail every acquire, including the probe.
    pub fn fail_probe(&self, fail: bool) {
        self.state.fail_probe.store(fail, Ordering::SeqCst);
    }

    /// Pools opened from now on never finish draining.
    pub fn hang_drain(&self, hang: bool) {
        self.state.hang_drain.store(hang, Ordering::SeqCst);
    }

    /// Delay `open` for one username.
    pub fn delay_open(&self, username: &str, delay: Duration) {
        self.state
            .open_delays
            .lock()
            .unwrap()
            .insert(username.to_string(), delay);
    }

    /// Number of successful `open` calls.
    pub fn opens(&self) -> u64 {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// Every pool opened so far, oldest first.
    pub fn pools(&self) -> Vec<Arc<MockPool>> {
        self.state.pools.lock().unwrap().clone()
    }

    pub fn pools_for(&self, username: &str) -> Vec<Arc<MockPool>> {
        self.pools()
            .into_iter()
            .filter(|pool| pool.username == username)
            .collect()
    }

    fn is_rejected(&self, secret: &Secret) -> bool {
        self.state.rejected.lock().unwrap().as_deref() == Some(secret.expose())
    }

    fn open_delay(&self, username: &str) -> Option<Duration> {
        self.state.open_delays.lock().unwrap().get(username).copied()
    }
}

impl PoolPrimitive for MockPrimitive {
    type Handle = MockHandle;

    async fn open(
        &self,
        principal: &Principal,
        secret: &Secret,
        config: &PoolConfig,
    ) -> Result<MockHandle, BackendError> {
        if let Some(delay) = self.open_delay(&principal.username) {
            tokio::time::sleep(delay).await;
        }
        if self.is_rejected(secret) {
            return Err(BackendError::new(
                BackendErrorKind::InvalidCredentials,
                format!("password authentication failed for user \"{}\"", principal.username),
            ));
        }

        let id = self.state.opens.fetch_add(1, Ordering::SeqCst) + 1;
        let pool = Arc::new(MockPool {
            id,
            username: principal.username.clone(),
            target: principal.target.clone(),
            max: config.max_connections,
            semaphore: Arc::new(Semaphore::new(config.max_connections as usize)),
            fail_acquire: self.state.fail_probe.load(Ordering::SeqCst),
            hang_drain: self.state.hang_drain.load(Ordering::SeqCst),
            acquires: AtomicU64::new(0),
            in_use: AtomicU32::new(0),
            peak_in_use: AtomicU32::new(0),
            open: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            drained: AtomicBool::new(false),
            forced: AtomicBool::new(false),
        });
        self.state.pools.lock().unwrap().push(Arc::clone(&pool));
        Ok(MockHandle(pool))
    }
}

/// Observable state of one mock pool.
pub struct MockPool {
    pub id: u64,
    pub username: String,
    pub target: String,
    pub max: u32,
    semaphore: Arc<Semaphore>,
    fail_acquire: bool,
    hang_drain: bool,
    acquires: AtomicU64,
    in_use: AtomicU32,
    peak_in_use: AtomicU32,
    open: AtomicU32,
    closed: AtomicBool,
    drained: AtomicBool,
    forced: AtomicBool,
}

impl MockPool {
    /// Successful checkouts, probe included.
    pub fn acquires(&self) -> u64 {
        self.acquires.load(Ordering::SeqCst)
    }

    pub fn in_use(&self) -> u32 {
        self.in_use.load(Ordering::SeqCst)
    }

    pub fn peak_in_use(&self) -> u32 {
        self.peak_in_use.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn was_drained(&self) -> bool {
        self.drained.load(Ordering::SeqCst)
    }

    pub fn was_forced(&self) -> bool {
        self.forced.load(Ordering::SeqCst)
    }

    fn shut(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.semaphore.close();
    }
}

pub struct MockHandle(Arc<MockPool>);

impl MockHandle {
    pub fn pool(&self) -> &Arc<MockPool> {
        &self.0
    }
}

/// A checked-out mock connection. Counts as in use until dropped.
pub struct MockConn {
    pub pool_id: u64,
    /// 1-based checkout number within the pool.
    pub serial: u64,
    pool: Arc<MockPool>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for MockConn {
    fn drop(&mut self) {
        self.pool.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PoolHandle for MockHandle {
    type Conn = MockConn;

    async fn acquire(&self, timeout: Duration) -> Result<MockConn, AcquireError> {
        let pool = &self.0;
        if pool.is_closed() {
            return Err(AcquireError::Closed);
        }
        if pool.fail_acquire {
            return Err(AcquireError::Backend(BackendError::new(
                BackendErrorKind::Unreachable,
                "connection refused",
            )));
        }

        let permit =
            match tokio::time::timeout(timeout, Arc::clone(&pool.semaphore).acquire_owned()).await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(AcquireError::Closed),
                Err(_) => return Err(AcquireError::Timeout),
            };

        let serial = pool.acquires.fetch_add(1, Ordering::SeqCst) + 1;
        let now = pool.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        pool.peak_in_use.fetch_max(now, Ordering::SeqCst);
        pool.open.fetch_max(now, Ordering::SeqCst);
        Ok(MockConn {
            pool_id: pool.id,
            serial,
            pool: Arc::clone(pool),
            _permit: permit,
        })
    }

    fn release(&self, conn: MockConn) -> Result<(), BackendError> {
        if conn.pool_id != self.0.id {
            return Err(BackendError::new(
                BackendErrorKind::Other,
                "connection does not belong to this pool",
            ));
        }
        drop(conn);
        Ok(())
    }

    async fn drain(&self, timeout: Duration) -> Result<(), DrainError> {
        let pool = &self.0;
        pool.shut();
        if pool.hang_drain {
            std::future::pending::<()>().await;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        while pool.in_use() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return Err(DrainError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        pool.drained.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn force_close(&self) {
        self.0.forced.store(true, Ordering::SeqCst);
        self.0.shut();
    }

    fn stats(&self) -> HandleStats {
        HandleStats {
            in_use: self.0.in_use(),
            open: self.0.open.load(Ordering::SeqCst),
        }
    }
}
