//! Server assembly: registry, sessions, monitor and the HTTP API.
//!
//! Shutdown order matters. The HTTP server stops taking requests first, then
//! background loops stop, then every pool is closed within the shutdown
//! timeout, and finally the session store is cleared without firing hooks
//! (their pools are already gone).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};
use warden_api::{ApiSettings, AppState};
use warden_core::WardenConfig;
use warden_monitor::PgMonitor;
use warden_pool::{PgPrimitive, PoolConfig, PoolRegistry};
use warden_session::{SessionBinder, SessionStore};

pub async fn run(config: WardenConfig) -> anyhow::Result<()> {
    info!("dbwarden daemon starting");

    // ── Pools and sessions ───────────────────────────────────────

    let registry = Arc::new(PoolRegistry::new(
        PgPrimitive::new(),
        PoolConfig::from(&config.pool),
    ));
    let sizing = registry.config();
    info!(
        min = sizing.min_connections,
        max = sizing.max_connections,
        increment = sizing.growth_increment,
        drain_timeout = ?sizing.drain_timeout,
        "pool registry initialized"
    );

    let binder = Arc::new(SessionBinder::new(Arc::clone(&registry)));
    let sessions = SessionStore::new(Duration::from_secs(config.session.idle_timeout_secs));
    sessions.subscribe(binder.end_hook()).await;
    info!(
        idle_timeout = ?sessions.idle_timeout(),
        "session store initialized"
    );

    let monitor = Arc::new(PgMonitor::new(
        Arc::clone(&registry),
        config.database.excluded_roles.clone(),
    ));

    // ── Background tasks ─────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep_interval = Duration::from_secs(config.session.sweep_interval_secs.max(1));

    let sweeper = sessions.clone();
    let sweep_shutdown = shutdown_rx.clone();
    let sweep_handle = tokio::spawn(async move {
        sweeper.run(sweep_interval, sweep_shutdown).await;
    });

    let stats_registry = Arc::clone(&registry);
    let mut stats_shutdown = shutdown_rx.clone();
    let stats_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => stats_registry.log_stats().await,
                _ = stats_shutdown.changed() => break,
            }
        }
    });

    // ── REST API server ──────────────────────────────────────────

    let state = AppState {
        registry: Arc::clone(&registry),
        binder: Arc::clone(&binder),
        sessions: sessions.clone(),
        monitor,
        settings: Arc::new(ApiSettings {
            cookie_name: config.session.cookie_name.clone(),
            secure_cookie: config.session.secure_cookie,
            default_target: config.database.default_target.clone(),
        }),
    };
    let router = warden_api::build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.listen, config.server.port).parse()?;
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = sweep_handle.await;
    let _ = stats_handle.await;

    // ── Close every pool ─────────────────────────────────────────

    let timeout = Duration::from_secs(config.shutdown.timeout_secs);
    match tokio::time::timeout(timeout, binder.on_shutdown()).await {
        Ok(summary) => info!(
            drained = summary.drained,
            forced = summary.forced,
            skipped = summary.skipped,
            "pools closed"
        ),
        Err(_) => warn!(
            timeout_secs = config.shutdown.timeout_secs,
            remaining = registry.len().await,
            "timed out closing pools"
        ),
    }
    sessions.clear().await;

    info!("dbwarden daemon stopped");
    Ok(())
}

/// Resolve on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
