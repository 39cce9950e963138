//! Principal-scoped pool registry.
//!
//! Maps a username to at most one live pool. Lifecycle operations
//! (`create_or_replace`, `close_*`) are serialized per principal through a
//! gate owned by that principal's slot, so a slow login for one user never
//! stalls another. Lookups (`acquire`, statistics) only take short read
//! locks and never wait on a gate.
//!
//! Every installed pool carries a registry-wide, monotonically increasing
//! generation. Closes name the generation they observed and are re-checked
//! under the gate at teardown time, so a close scheduled against an old pool
//! can never tear down the pool that replaced it.

use std::collections::{BTreeMap, HashMap};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use futures_util::future::{BoxFuture, join_all};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use warden_core::{Principal, Secret};

use crate::config::PoolConfig;
use crate::error::{RegistryError, RegistryResult};
use crate::primitive::{
    AcquireError, BackendError, BackendErrorKind, DrainError, PoolHandle, PoolPrimitive,
};

/// Tag distinguishing successive pools installed for the same principal.
pub type Generation = u64;

/// A live pool and its bookkeeping.
struct Entry<H: PoolHandle> {
    principal: Principal,
    generation: Generation,
    created_at: Instant,
    handle: H,
    /// Set once teardown starts; lookups treat a closing entry as absent.
    closing: AtomicBool,
}

impl<H: PoolHandle> Entry<H> {
    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn give_back(&self, conn: H::Conn) {
        if let Err(e) = self.handle.release(conn) {
            warn!(
                username = %self.principal.username,
                generation = self.generation,
                error = %e,
                "failed to return connection to pool"
            );
        }
    }
}

/// Per-principal state: the lifecycle gate and the live entry, if any.
struct Slot<H: PoolHandle> {
    gate: Mutex<()>,
    live: RwLock<Option<Arc<Entry<H>>>>,
}

impl<H: PoolHandle> Slot<H> {
    fn new() -> Self {
        Self {
            gate: Mutex::new(()),
            live: RwLock::new(None),
        }
    }
}

/// Result of a close request. Closing never fails from the caller's side;
/// this only records which path was taken.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Nothing was live for the principal.
    Absent,
    /// A newer generation is live; the request was ignored.
    Stale,
    /// All connections came back within the drain timeout.
    Drained,
    /// The drain timed out or failed and the pool was force-closed.
    Forced,
}

/// Aggregate of a `close_all` pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CloseSummary {
    pub drained: usize,
    pub forced: usize,
    pub skipped: usize,
}

/// Statistics for one live pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Connections checked out right now.
    pub in_use: u32,
    /// Connections open (checked out + idle).
    pub open: u32,
    pub min: u32,
    pub max: u32,
    pub generation: Generation,
    /// Seconds since the pool was installed.
    pub age_secs: u64,
}

/// A connection checked out of a principal's pool.
///
/// Owned exclusively by the holder. Returned to the pool it came from on
/// [`PooledConnection::release`] or on drop, whichever happens first, so
/// early returns, panics and cancelled futures all give it back.
pub struct PooledConnection<H: PoolHandle> {
    conn: Option<H::Conn>,
    entry: Arc<Entry<H>>,
}

impl<H: PoolHandle> PooledConnection<H> {
    pub fn username(&self) -> &str {
        &self.entry.principal.username
    }

    pub fn generation(&self) -> Generation {
        self.entry.generation
    }

    /// Return the connection to its pool. Errors are logged, never surfaced.
    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.entry.give_back(conn);
        }
    }
}

impl<H: PoolHandle> Deref for PooledConnection<H> {
    type Target = H::Conn;

    fn deref(&self) -> &H::Conn {
        self.conn
            .as_ref()
            .expect("connection is present until released")
    }
}

impl<H: PoolHandle> DerefMut for PooledConnection<H> {
    fn deref_mut(&mut self) -> &mut H::Conn {
        self.conn
            .as_mut()
            .expect("connection is present until released")
    }
}

impl<H: PoolHandle> Drop for PooledConnection<H> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.entry.give_back(conn);
        }
    }
}

impl<H: PoolHandle> std::fmt::Debug for PooledConnection<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("username", &self.entry.principal.username)
            .field("generation", &self.entry.generation)
            .finish_non_exhaustive()
    }
}

/// Single authority over which per-principal pools exist.
pub struct PoolRegistry<P: PoolPrimitive> {
    primitive: P,
    config: PoolConfig,
    /// username → slot. Held only for lookup, insert and removal.
    slots: RwLock<HashMap<String, Arc<Slot<P::Handle>>>>,
    next_generation: AtomicU64,
}

impl<P: PoolPrimitive> PoolRegistry<P> {
    pub fn new(primitive: P, config: PoolConfig) -> Self {
        Self {
            primitive,
            config,
            slots: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    // ── Slots ────────────────────────────────────────────────────────

    async fn slot(&self, username: &str) -> Arc<Slot<P::Handle>> {
        if let Some(slot) = self.slots.read().await.get(username) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().await;
        Arc::clone(
            slots
                .entry(username.to_string())
                .or_insert_with(|| Arc::new(Slot::new())),
        )
    }

    async fn existing_slot(&self, username: &str) -> Option<Arc<Slot<P::Handle>>> {
        self.slots.read().await.get(username).map(Arc::clone)
    }

    /// Drop an empty slot nobody else is holding.
    async fn retire_slot(&self, username: &str, slot: &Arc<Slot<P::Handle>>) {
        let mut slots = self.slots.write().await;
        match slots.get(username) {
            Some(current) if Arc::ptr_eq(current, slot) => {}
            _ => return,
        }
        // Slots are only cloned under the map lock, so two references (the
        // map's and ours) means no task is waiting on the gate.
        if Arc::strong_count(slot) != 2 {
            return;
        }
        let vacant = slot
            .live
            .try_read()
            .map(|live| live.is_none())
            .unwrap_or(false);
        if vacant {
            slots.remove(username);
        }
    }

    async fn live_entry(&self, username: &str) -> Option<Arc<Entry<P::Handle>>> {
        let slot = self.existing_slot(username).await?;
        let live = slot.live.read().await;
        live.as_ref()
            .filter(|entry| !entry.is_closing())
            .map(Arc::clone)
    }

    async fn live_generations(&self) -> Vec<(String, Generation)> {
        let slots: Vec<(String, Arc<Slot<P::Handle>>)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(username, slot)| (username.clone(), Arc::clone(slot)))
            .collect();

        let mut live = Vec::with_capacity(slots.len());
        for (username, slot) in slots {
            if let Some(entry) = slot.live.read().await.as_ref() {
                live.push((username, entry.generation));
            }
        }
        live
    }

    // ── Creation ─────────────────────────────────────────────────────

    /// Install a pool for `principal`, closing any pool it already has.
    ///
    /// On failure nothing is installed: a pool that opened but failed its
    /// probe is discarded before the error is returned.
    pub async fn create_or_replace(
        &self,
        principal: &Principal,
        secret: &Secret,
    ) -> RegistryResult<Generation> {
        validate(principal, secret)?;
        let username = principal.username.as_str();
        let slot = self.slot(username).await;

        let result = {
            let _gate = slot.gate.lock().await;

            let previous = slot.live.write().await.take();
            if let Some(old) = previous {
                info!(
                    username,
                    generation = old.generation,
                    "replacing existing pool"
                );
                self.teardown(&old).await;
            }

            match self.open_handle(principal, secret).await {
                Ok(handle) => {
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    let entry = Entry {
                        principal: principal.clone(),
                        generation,
                        created_at: Instant::now(),
                        handle,
                        closing: AtomicBool::new(false),
                    };
                    *slot.live.write().await = Some(Arc::new(entry));
                    info!(
                        username,
                        target = %principal.target,
                        generation,
                        min = self.config.min_connections,
                        max = self.config.max_connections,
                        "pool created"
                    );
                    Ok(generation)
                }
                Err(e) => Err(e),
            }
        };

        if result.is_err() {
            self.retire_slot(username, &slot).await;
        }
        result
    }

    async fn open_handle(&self, principal: &Principal, secret: &Secret) -> RegistryResult<P::Handle> {
        let username = principal.username.as_str();
        let timeout = self.config.connect_timeout;

        let handle = match tokio::time::timeout(
            timeout,
            self.primitive.open(principal, secret, &self.config),
        )
        .await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(source)) => {
                warn!(username, kind = %source.kind, "backend rejected pool creation");
                return Err(auth_backend(username, source));
            }
            Err(_) => {
                warn!(username, ?timeout, "pool creation timed out");
                return Err(auth_backend(
                    username,
                    BackendError::new(
                        BackendErrorKind::Timeout,
                        format!("opening pool took longer than {timeout:?}"),
                    ),
                ));
            }
        };

        // The credentials are only proven once a connection is established.
        let failure = match tokio::time::timeout(timeout, handle.acquire(timeout)).await {
            Ok(Ok(conn)) => {
                if let Err(e) = handle.release(conn) {
                    warn!(username, error = %e, "failed to return probe connection");
                }
                debug!(username, "probe connection succeeded");
                return Ok(handle);
            }
            Ok(Err(AcquireError::Backend(source))) => source,
            Ok(Err(AcquireError::Timeout)) | Err(_) => BackendError::new(
                BackendErrorKind::Timeout,
                format!("probe connection took longer than {timeout:?}"),
            ),
            Ok(Err(AcquireError::Closed)) => {
                BackendError::new(BackendErrorKind::Other, "pool closed during probe")
            }
        };

        warn!(username, kind = %failure.kind, "probe connection failed, discarding pool");
        self.discard(username, &handle).await;
        Err(auth_backend(username, failure))
    }

    /// Close a handle that was never installed.
    async fn discard(&self, username: &str, handle: &P::Handle) {
        let timeout = self.config.drain_timeout;
        match tokio::time::timeout(timeout, handle.drain(timeout)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(username, error = %e, "discarded pool did not drain, forcing");
                handle.force_close();
            }
            Err(_) => {
                debug!(username, "discarded pool drain timed out, forcing");
                handle.force_close();
            }
        }
    }

    // ── Connections ──────────────────────────────────────────────────

    /// Check out a connection from the principal's live pool.
    ///
    /// Waits at most the configured queue timeout for a free connection.
    pub async fn acquire(&self, username: &str) -> RegistryResult<PooledConnection<P::Handle>> {
        let entry = self
            .live_entry(username)
            .await
            .ok_or_else(|| RegistryError::NoSuchPrincipal(username.to_string()))?;

        let timeout = self.config.queue_timeout;
        match tokio::time::timeout(timeout, entry.handle.acquire(timeout)).await {
            Ok(Ok(conn)) => Ok(PooledConnection {
                conn: Some(conn),
                entry,
            }),
            Ok(Err(AcquireError::Timeout)) | Err(_) => {
                debug!(username, ?timeout, "connection queue wait timed out");
                Err(RegistryError::AcquireTimeout {
                    username: username.to_string(),
                    timeout,
                })
            }
            // Closed between lookup and checkout: the pool is gone.
            Ok(Err(AcquireError::Closed)) => {
                Err(RegistryError::NoSuchPrincipal(username.to_string()))
            }
            Ok(Err(AcquireError::Backend(source))) => Err(RegistryError::AcquireFailed {
                username: username.to_string(),
                source,
            }),
        }
    }

    /// Return a connection to the pool it came from.
    pub fn release(&self, conn: PooledConnection<P::Handle>) {
        conn.release();
    }

    /// Run `f` with a connection from the principal's pool.
    ///
    /// The connection goes back to its pool on every exit path, including
    /// cancellation of the returned future.
    pub async fn with_connection<T, E, F>(&self, username: &str, f: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut <P::Handle as PoolHandle>::Conn) -> BoxFuture<'c, Result<T, E>>
            + Send,
        E: From<RegistryError>,
    {
        let mut conn = self.acquire(username).await?;
        let result = f(&mut *conn).await;
        conn.release();
        result
    }

    // ── Teardown ─────────────────────────────────────────────────────

    /// Close whatever generation is live for `username` right now.
    pub async fn close_one(&self, username: &str) -> CloseOutcome {
        match self.generation_of(username).await {
            Some(generation) => self.close_generation(username, generation).await,
            None => CloseOutcome::Absent,
        }
    }

    /// Close `generation` of the principal's pool if it is still the live one.
    ///
    /// The generation is compared under the principal's gate, so a close that
    /// races with a re-login is a no-op rather than closing the new pool.
    pub async fn close_generation(&self, username: &str, generation: Generation) -> CloseOutcome {
        let Some(slot) = self.existing_slot(username).await else {
            return CloseOutcome::Absent;
        };

        let outcome = {
            let _gate = slot.gate.lock().await;
            let mut live = slot.live.write().await;
            let current = live.as_ref().map(|entry| entry.generation);
            match current {
                None => CloseOutcome::Absent,
                Some(current) if current != generation => {
                    debug!(
                        username,
                        requested = generation,
                        current,
                        "ignoring close for replaced generation"
                    );
                    CloseOutcome::Stale
                }
                Some(_) => {
                    let detached = live.take();
                    drop(live);
                    match detached {
                        Some(entry) => self.teardown(&entry).await,
                        None => CloseOutcome::Absent,
                    }
                }
            }
        };

        self.retire_slot(username, &slot).await;
        outcome
    }

    /// Drain a detached entry, escalating to a forced close.
    async fn teardown(&self, entry: &Entry<P::Handle>) -> CloseOutcome {
        entry.closing.store(true, Ordering::Release);
        let username = entry.principal.username.as_str();
        let generation = entry.generation;
        let timeout = self.config.drain_timeout;

        // The outer timeout bounds handles whose drain ignores its own.
        let failure = match tokio::time::timeout(timeout, entry.handle.drain(timeout)).await {
            Ok(Ok(())) => {
                info!(username, generation, "pool drained and closed");
                return CloseOutcome::Drained;
            }
            Ok(Err(e)) => e,
            Err(_) => DrainError::Timeout,
        };

        warn!(
            username,
            generation,
            in_use = entry.handle.stats().in_use,
            reason = %failure,
            "drain incomplete, force-closing pool"
        );
        entry.handle.force_close();
        CloseOutcome::Forced
    }

    /// Close every live pool concurrently. Used at process shutdown.
    pub async fn close_all(&self) -> CloseSummary {
        let targets = self.live_generations().await;
        if targets.is_empty() {
            return CloseSummary::default();
        }

        info!(pools = targets.len(), "closing all pools");
        let outcomes = join_all(
            targets
                .iter()
                .map(|(username, generation)| self.close_generation(username, *generation)),
        )
        .await;

        let mut summary = CloseSummary::default();
        for outcome in outcomes {
            match outcome {
                CloseOutcome::Drained => summary.drained += 1,
                CloseOutcome::Forced => summary.forced += 1,
                CloseOutcome::Absent | CloseOutcome::Stale => summary.skipped += 1,
            }
        }
        info!(
            drained = summary.drained,
            forced = summary.forced,
            skipped = summary.skipped,
            "all pools closed"
        );
        summary
    }

    // ── Observability ────────────────────────────────────────────────

    /// Best-effort statistics for every live pool.
    ///
    /// Never waits on a lifecycle gate; principals being created or closed
    /// concurrently may or may not appear.
    pub async fn statistics_snapshot(&self) -> BTreeMap<String, PoolStats> {
        let slots: Vec<(String, Arc<Slot<P::Handle>>)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(username, slot)| (username.clone(), Arc::clone(slot)))
            .collect();

        let mut snapshot = BTreeMap::new();
        for (username, slot) in slots {
            let live = slot.live.read().await;
            let Some(entry) = live.as_ref().filter(|entry| !entry.is_closing()) else {
                continue;
            };
            let stats = entry.handle.stats();
            snapshot.insert(
                username,
                PoolStats {
                    in_use: stats.in_use,
                    open: stats.open,
                    min: self.config.min_connections,
                    max: self.config.max_connections,
                    generation: entry.generation,
                    age_secs: entry.created_at.elapsed().as_secs(),
                },
            );
        }
        snapshot
    }

    /// Generation of the principal's live pool, if any.
    pub async fn generation_of(&self, username: &str) -> Option<Generation> {
        self.live_entry(username).await.map(|entry| entry.generation)
    }

    pub async fn contains(&self, username: &str) -> bool {
        self.live_entry(username).await.is_some()
    }

    /// Number of live pools.
    pub async fn len(&self) -> usize {
        self.live_generations().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Log statistics for all pools at `tracing::info` level.
    pub async fn log_stats(&self) {
        for (username, stats) in self.statistics_snapshot().await {
            info!(
                username = %username,
                in_use = stats.in_use,
                open = stats.open,
                max = stats.max,
                generation = stats.generation,
                "pool statistics"
            );
        }
    }
}

impl<P: PoolPrimitive> std::fmt::Debug for PoolRegistry<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn validate(principal: &Principal, secret: &Secret) -> RegistryResult<()> {
    if principal.username.trim().is_empty() {
        return Err(RegistryError::InvalidRequest("username is required".to_string()));
    }
    if secret.is_empty() {
        return Err(RegistryError::InvalidRequest("password is required".to_string()));
    }
    if principal.target.trim().is_empty() {
        return Err(RegistryError::InvalidRequest(
            "connection target is required".to_string(),
        ));
    }
    Ok(())
}

fn auth_backend(username: &str, source: BackendError) -> RegistryError {
    RegistryError::AuthBackend {
        username: username.to_string(),
        source,
    }
}
