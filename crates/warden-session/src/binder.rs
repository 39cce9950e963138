//! Binds login sessions to the pool generation they authenticated.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};
use warden_core::Principal;
use warden_pool::{CloseOutcome, CloseSummary, Generation, PoolPrimitive, PoolRegistry};

use crate::store::{EndReason, SessionEndHook, SessionToken};

/// The pool generation a session was created against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    pub username: String,
    pub generation: Generation,
}

/// Translates session lifecycle events into registry operations.
pub struct SessionBinder<P: PoolPrimitive> {
    registry: Arc<PoolRegistry<P>>,
    bindings: RwLock<HashMap<SessionToken, Binding>>,
}

impl<P: PoolPrimitive> SessionBinder<P> {
    pub fn new(registry: Arc<PoolRegistry<P>>) -> Self {
        Self {
            registry,
            bindings: RwLock::new(HashMap::new()),
        }
    }

    /// Record a session created after `create_or_replace` returned `generation`.
    pub async fn on_authenticate_success(
        &self,
        token: &SessionToken,
        principal: &Principal,
        generation: Generation,
    ) {
        debug!(
            username = %principal.username,
            token = token.short(),
            generation,
            "session bound to pool"
        );
        self.bindings.write().await.insert(
            token.clone(),
            Binding {
                username: principal.username.clone(),
                generation,
            },
        );
    }

    /// Close the pool generation bound to an ended session.
    ///
    /// The binding is forgotten whatever the close outcome. Returns `None`
    /// when the token was never bound.
    pub async fn on_session_end(
        &self,
        token: &SessionToken,
        reason: EndReason,
    ) -> Option<CloseOutcome> {
        let binding = self.bindings.write().await.remove(token)?;
        let outcome = self
            .registry
            .close_generation(&binding.username, binding.generation)
            .await;
        info!(
            username = %binding.username,
            generation = binding.generation,
            %reason,
            ?outcome,
            "session ended, pool released"
        );
        Some(outcome)
    }

    /// Close every pool and forget every binding.
    pub async fn on_shutdown(&self) -> CloseSummary {
        let summary = self.registry.close_all().await;
        self.bindings.write().await.clear();
        summary
    }

    /// Whether the session is bound and its generation is still live.
    pub async fn is_valid(&self, token: &SessionToken) -> bool {
        let Some(binding) = self.binding(token).await else {
            return false;
        };
        self.registry.generation_of(&binding.username).await == Some(binding.generation)
    }

    pub async fn binding(&self, token: &SessionToken) -> Option<Binding> {
        self.bindings.read().await.get(token).cloned()
    }

    pub async fn principal_of(&self, token: &SessionToken) -> Option<String> {
        self.binding(token).await.map(|binding| binding.username)
    }

    pub async fn len(&self) -> usize {
        self.bindings.read().await.len()
    }

    /// Hook to subscribe on the session store.
    pub fn end_hook(self: &Arc<Self>) -> SessionEndHook {
        let binder = Arc::clone(self);
        Arc::new(move |token, reason| {
            let binder = Arc::clone(&binder);
            Box::pin(async move {
                binder.on_session_end(&token, reason).await;
            })
        })
    }
}

impl<P: PoolPrimitive> std::fmt::Debug for SessionBinder<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBinder").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SessionStore;
    use std::time::Duration;
    use warden_core::{Secret, UserInfo};
    use warden_pool::mock::MockPrimitive;
    use warden_pool::{PoolConfig, RegistryError};

    struct Harness {
        registry: Arc<PoolRegistry<MockPrimitive>>,
        binder: Arc<SessionBinder<MockPrimitive>>,
        store: SessionStore,
        primitive: MockPrimitive,
    }

    async fn harness() -> Harness {
        let primitive = MockPrimitive::new();
        let config = PoolConfig {
            drain_timeout: Duration::from_millis(100),
            queue_timeout: Duration::from_millis(100),
            ..PoolConfig::default()
        };
        let registry = Arc::new(PoolRegistry::new(primitive.clone(), config));
        let binder = Arc::new(SessionBinder::new(Arc::clone(&registry)));
        let store = SessionStore::new(Duration::from_secs(60));
        store.subscribe(binder.end_hook()).await;
        Harness {
            registry,
            binder,
            store,
            primitive,
        }
    }

    fn alice() -> Principal {
        Principal::new("alice", "db.local:5432/postgres")
    }

    async fn login(h: &Harness, principal: &Principal) -> (SessionToken, Generation) {
        let generation = h
            .registry
            .create_or_replace(principal, &Secret::new("pw"))
            .await
            .unwrap();
        let token = h
            .store
            .create(principal.clone(), UserInfo::basic(&principal.username))
            .await
            .unwrap();
        h.binder
            .on_authenticate_success(&token, principal, generation)
            .await;
        (token, generation)
    }

    #[tokio::test]
    async fn logout_closes_pool() {
        let h = harness().await;
        let (token, _) = login(&h, &alice()).await;
        assert!(h.binder.is_valid(&token).await);
        assert_eq!(h.binder.principal_of(&token).await.as_deref(), Some("alice"));

        h.store.destroy(&token, EndReason::Logout).await;

        assert!(matches!(
            h.registry.acquire("alice").await,
            Err(RegistryError::NoSuchPrincipal(_))
        ));
        assert!(h.primitive.pools_for("alice")[0].is_closed());
        assert_eq!(h.binder.len().await, 0);
    }

    #[tokio::test]
    async fn old_session_end_does_not_close_new_login() {
        let h = harness().await;
        let (first, gen1) = login(&h, &alice()).await;
        let (second, gen2) = login(&h, &alice()).await;
        assert!(gen2 > gen1);

        assert!(!h.binder.is_valid(&first).await, "replaced generation is invalid");
        assert!(h.binder.is_valid(&second).await);

        let outcome = h.binder.on_session_end(&first, EndReason::Invalidated).await;
        assert_eq!(outcome, Some(CloseOutcome::Stale));
        assert_eq!(h.registry.generation_of("alice").await, Some(gen2));
        assert!(h.registry.acquire("alice").await.is_ok());
    }

    #[tokio::test]
    async fn unbound_session_end_is_ignored() {
        let h = harness().await;
        let outcome = h
            .binder
            .on_session_end(&SessionToken::from("unknown"), EndReason::Logout)
            .await;
        assert_eq!(outcome, None);
    }

    #[tokio::test]
    async fn expiry_sweep_closes_pool() {
        let primitive = MockPrimitive::new();
        let registry = Arc::new(PoolRegistry::new(primitive.clone(), PoolConfig::default()));
        let binder = Arc::new(SessionBinder::new(Arc::clone(&registry)));
        let store = SessionStore::new(Duration::from_millis(10));
        store.subscribe(binder.end_hook()).await;

        let generation = registry
            .create_or_replace(&alice(), &Secret::new("pw"))
            .await
            .unwrap();
        let token = store.create(alice(), UserInfo::basic("alice")).await.unwrap();
        binder.on_authenticate_success(&token, &alice(), generation).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.sweep_expired().await, 1);
        assert!(!registry.contains("alice").await);
        assert!(!binder.is_valid(&token).await);
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let h = harness().await;
        login(&h, &alice()).await;
        login(&h, &Principal::new("bob", "db.local:5432/postgres")).await;

        let summary = h.binder.on_shutdown().await;
        assert_eq!(summary.drained + summary.forced, 2);
        assert!(h.registry.is_empty().await);
        assert_eq!(h.binder.len().await, 0);
        assert!(h.primitive.pools().iter().all(|pool| pool.is_closed()));
    }
}
