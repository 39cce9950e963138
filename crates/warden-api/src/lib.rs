//! warden-api — REST API for dbwarden.
//!
//! Authenticates users against the database itself (one pool per user),
//! keeps a cookie session per login and exposes the monitor over JSON.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/login` | Create the user's pool and a session |
//! | POST | `/api/logout` | End the session and close its pool |
//! | GET | `/api/check` | Whether the cookie carries a valid session |
//! | GET | `/api/user` | Current user |
//! | GET | `/api/sessions` | List database sessions |
//! | GET | `/api/sessions/by-user` | Session counts per role |
//! | GET | `/api/sessions/user/{username}` | One role's sessions |
//! | GET | `/api/sessions/blocking` | Sessions waiting on locks |
//! | POST | `/api/sessions/disconnect` | Terminate one backend |
//! | POST | `/api/sessions/disconnect-all` | Terminate a role's backends |
//! | POST | `/api/sessions/change-password` | `ALTER ROLE … PASSWORD` |
//! | POST | `/api/sessions/unlock-account` | `ALTER ROLE … LOGIN` |
//! | GET | `/api/statistics` | Session statistics |
//! | GET | `/api/monitor/metrics` | Server metrics |
//! | GET | `/api/monitor/users` | Per-role metrics |
//! | GET | `/api/pool-stats` | Per-user pool statistics |
//! | GET | `/healthz` | Liveness |

pub mod error;
pub mod extract;
pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use warden_monitor::Monitor;
use warden_pool::{PoolPrimitive, PoolRegistry};
use warden_session::{SessionBinder, SessionStore};

pub use error::{ApiError, ApiResponse};

/// HTTP-facing settings.
#[derive(Clone, Debug)]
pub struct ApiSettings {
    pub cookie_name: String,
    /// Adds `Secure` to the session cookie.
    pub secure_cookie: bool,
    /// Used when a login request names no target.
    pub default_target: Option<String>,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            cookie_name: "warden_session".to_string(),
            secure_cookie: false,
            default_target: None,
        }
    }
}

/// Shared state for API handlers.
pub struct AppState<P: PoolPrimitive> {
    pub registry: Arc<PoolRegistry<P>>,
    pub binder: Arc<SessionBinder<P>>,
    pub sessions: SessionStore,
    pub monitor: Arc<dyn Monitor>,
    pub settings: Arc<ApiSettings>,
}

// Manual impl: a derive would require `P: Clone`.
impl<P: PoolPrimitive> Clone for AppState<P> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            binder: Arc::clone(&self.binder),
            sessions: self.sessions.clone(),
            monitor: Arc::clone(&self.monitor),
            settings: Arc::clone(&self.settings),
        }
    }
}

/// Build the complete API router.
pub fn build_router<P: PoolPrimitive>(state: AppState<P>) -> Router {
    let auth_routes = Router::new()
        .route("/login", post(handlers::login::<P>))
        .route("/logout", post(handlers::logout::<P>))
        .route("/check", get(handlers::check::<P>))
        .route("/user", get(handlers::current_user::<P>));

    let session_routes = Router::new()
        .route("/sessions", get(handlers::list_sessions::<P>))
        .route("/sessions/by-user", get(handlers::sessions_by_user::<P>))
        .route("/sessions/user/{username}", get(handlers::user_sessions::<P>))
        .route("/sessions/blocking", get(handlers::blocking_sessions::<P>))
        .route("/sessions/disconnect", post(handlers::disconnect_session::<P>))
        .route("/sessions/disconnect-all", post(handlers::disconnect_all::<P>))
        .route("/sessions/change-password", post(handlers::change_password::<P>))
        .route("/sessions/unlock-account", post(handlers::unlock_account::<P>))
        .route("/statistics", get(handlers::statistics::<P>));

    let monitor_routes = Router::new()
        .route("/monitor/metrics", get(handlers::server_metrics::<P>))
        .route("/monitor/users", get(handlers::user_metrics::<P>))
        .route("/pool-stats", get(handlers::pool_stats::<P>));

    let api = auth_routes.merge(session_routes).merge(monitor_routes);

    Router::new()
        .nest("/api", api)
        .route("/healthz", get(handlers::healthz::<P>))
        .with_state(state)
}
