//! REST API handlers.
//!
//! Monitor handlers run their queries on the caller's own pool. When that
//! pool is gone the session is destroyed and the caller gets 401.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::http::header::SET_COOKIE;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use warden_core::{Principal, Secret, UserInfo};
use warden_monitor::{
    MonitorError, MonitorResult, ServerMetrics, SessionBrief, SessionRow,
    SessionStatistics, TerminateAllReport, UserMetricsReport, UserSessionCount,
};
use warden_pool::{Generation, PoolPrimitive, PoolStats, RegistryError};
use warden_session::EndReason;

use crate::AppState;
use crate::error::{ApiError, ApiResponse};
use crate::extract::{CurrentSession, removal_cookie, session_cookie, session_token};

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Wrap a monitor result, dropping the session if its pool is gone.
async fn respond<P, T>(
    state: &AppState<P>,
    session: &CurrentSession,
    result: MonitorResult<T>,
) -> ApiResult<T>
where
    P: PoolPrimitive,
    T: Serialize + Send,
{
    match result {
        Ok(data) => Ok(ApiResponse::ok(data)),
        Err(MonitorError::Registry(RegistryError::NoSuchPrincipal(_))) => {
            warn!(username = %session.username(), "pool missing for live session, ending it");
            state
                .sessions
                .destroy(&session.token, EndReason::Invalidated)
                .await;
            Err(ApiError::Unauthorized(
                "database session is gone, please log in again".to_string(),
            ))
        }
        Err(e) => Err(e.into()),
    }
}

#[derive(Serialize)]
pub struct Message {
    pub message: String,
}

impl Message {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

// ── Authentication ─────────────────────────────────────────────

/// Login request body.
#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub target: Option<String>,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub user: UserInfo,
    pub target: String,
    pub generation: Generation,
}

/// POST /api/login
pub async fn login<P: PoolPrimitive>(
    State(state): State<AppState<P>>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    let username = req.username.trim();
    if username.is_empty() || req.password.is_empty() {
        return Err(ApiError::BadRequest(
            "username and password are required".to_string(),
        ));
    }
    let target = req
        .target
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .or_else(|| state.settings.default_target.clone())
        .ok_or_else(|| ApiError::BadRequest("connection target is required".to_string()))?;

    // A browser logging in again ends its previous session first.
    if let Some(previous) = session_token(&headers, &state.settings.cookie_name) {
        state.sessions.destroy(&previous, EndReason::Logout).await;
    }

    let principal = Principal::new(username, &target);
    let secret = Secret::new(req.password);
    let generation = match state.registry.create_or_replace(&principal, &secret).await {
        Ok(generation) => generation,
        Err(e) => {
            warn!(username, target = %target, error = %e, "login failed");
            return Err(e.into());
        }
    };

    let user_info = match state.monitor.user_info(username).await {
        Ok(info) => info,
        Err(e) => {
            warn!(username, error = %e, "could not read role attributes, using defaults");
            UserInfo::basic(username)
        }
    };

    let token = match state.sessions.create(principal.clone(), user_info.clone()).await {
        Ok(token) => token,
        Err(e) => {
            state.registry.close_generation(username, generation).await;
            return Err(ApiError::Internal(e.to_string()));
        }
    };
    state
        .binder
        .on_authenticate_success(&token, &principal, generation)
        .await;

    info!(username, target = %target, generation, "login succeeded");
    let cookie = session_cookie(&state.settings, &token);
    let body = LoginResponse {
        user: user_info,
        target,
        generation,
    };
    Ok(([(SET_COOKIE, cookie)], ApiResponse::ok(body)).into_response())
}

/// POST /api/logout
pub async fn logout<P: PoolPrimitive>(
    State(state): State<AppState<P>>,
    headers: HeaderMap,
) -> Response {
    if let Some(token) = session_token(&headers, &state.settings.cookie_name) {
        state.sessions.destroy(&token, EndReason::Logout).await;
    }
    let cookie = removal_cookie(&state.settings);
    ([(SET_COOKIE, cookie)], ApiResponse::ok(Message::new("logged out"))).into_response()
}

#[derive(Serialize)]
pub struct CheckResponse {
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
}

/// GET /api/check
pub async fn check<P: PoolPrimitive>(
    State(state): State<AppState<P>>,
    headers: HeaderMap,
) -> Json<ApiResponse<CheckResponse>> {
    let mut user = None;
    if let Some(token) = session_token(&headers, &state.settings.cookie_name) {
        if let Some(record) = state.sessions.get(&token).await {
            if state.binder.is_valid(&token).await {
                user = Some(record.user_info);
            } else {
                state.sessions.destroy(&token, EndReason::Invalidated).await;
            }
        }
    }
    ApiResponse::ok(CheckResponse {
        authenticated: user.is_some(),
        user,
    })
}

#[derive(Serialize)]
pub struct CurrentUser {
    pub user: UserInfo,
    pub target: String,
    pub login_time: DateTime<Utc>,
}

/// GET /api/user
pub async fn current_user<P: PoolPrimitive>(session: CurrentSession) -> ApiResult<CurrentUser> {
    let record = session.record;
    Ok(ApiResponse::ok(CurrentUser {
        user: record.user_info,
        target: record.principal.target,
        login_time: record.login_time,
    }))
}

// ── Sessions ───────────────────────────────────────────────────

#[derive(Serialize)]
pub struct SessionList {
    pub count: usize,
    pub sessions: Vec<SessionRow>,
}

impl From<Vec<SessionRow>> for SessionList {
    fn from(sessions: Vec<SessionRow>) -> Self {
        Self {
            count: sessions.len(),
            sessions,
        }
    }
}

/// GET /api/sessions
pub async fn list_sessions<P: PoolPrimitive>(
    State(state): State<AppState<P>>,
    session: CurrentSession,
) -> ApiResult<SessionList> {
    let result = state.monitor.list_sessions(session.username()).await;
    respond(&state, &session, result.map(SessionList::from)).await
}

/// GET /api/sessions/by-user
pub async fn sessions_by_user<P: PoolPrimitive>(
    State(state): State<AppState<P>>,
    session: CurrentSession,
) -> ApiResult<Vec<UserSessionCount>> {
    let result = state.monitor.sessions_by_user(session.username()).await;
    respond(&state, &session, result).await
}

/// GET /api/sessions/user/{username}
pub async fn user_sessions<P: PoolPrimitive>(
    State(state): State<AppState<P>>,
    session: CurrentSession,
    Path(username): Path<String>,
) -> ApiResult<SessionList> {
    let result = state
        .monitor
        .user_sessions(session.username(), &username)
        .await;
    respond(&state, &session, result.map(SessionList::from)).await
}

/// GET /api/sessions/blocking
pub async fn blocking_sessions<P: PoolPrimitive>(
    State(state): State<AppState<P>>,
    session: CurrentSession,
) -> ApiResult<SessionList> {
    let result = state.monitor.blocking_sessions(session.username()).await;
    respond(&state, &session, result.map(SessionList::from)).await
}

#[derive(Deserialize)]
pub struct DisconnectRequest {
    pub pid: i32,
}

#[derive(Serialize)]
pub struct Disconnected {
    pub message: String,
    pub session: SessionBrief,
}

/// POST /api/sessions/disconnect
pub async fn disconnect_session<P: PoolPrimitive>(
    State(state): State<AppState<P>>,
    session: CurrentSession,
    Json(req): Json<DisconnectRequest>,
) -> ApiResult<Disconnected> {
    if req.pid <= 0 {
        return Err(ApiError::BadRequest("pid must be positive".to_string()));
    }
    let result = state
        .monitor
        .terminate(session.username(), req.pid)
        .await
        .map(|terminated| Disconnected {
            message: format!("session {} terminated", req.pid),
            session: terminated,
        });
    respond(&state, &session, result).await
}

#[derive(Deserialize)]
pub struct UsernameRequest {
    pub username: String,
}

/// POST /api/sessions/disconnect-all
pub async fn disconnect_all<P: PoolPrimitive>(
    State(state): State<AppState<P>>,
    session: CurrentSession,
    Json(req): Json<UsernameRequest>,
) -> ApiResult<TerminateAllReport> {
    let result = state
        .monitor
        .terminate_all_for_user(session.username(), &req.username)
        .await;
    respond(&state, &session, result).await
}

#[derive(Deserialize)]
pub struct ChangePasswordRequest {
    pub username: String,
    pub new_password: String,
}

/// POST /api/sessions/change-password
pub async fn change_password<P: PoolPrimitive>(
    State(state): State<AppState<P>>,
    session: CurrentSession,
    Json(req): Json<ChangePasswordRequest>,
) -> ApiResult<Message> {
    let result = state
        .monitor
        .change_password(
            session.username(),
            &req.username,
            &Secret::new(req.new_password),
        )
        .await
        .map(|()| Message::new(format!("password changed for {}", req.username)));
    respond(&state, &session, result).await
}

/// POST /api/sessions/unlock-account
pub async fn unlock_account<P: PoolPrimitive>(
    State(state): State<AppState<P>>,
    session: CurrentSession,
    Json(req): Json<UsernameRequest>,
) -> ApiResult<Message> {
    let result = state
        .monitor
        .unlock_account(session.username(), &req.username)
        .await
        .map(|()| Message::new(format!("account {} unlocked", req.username)));
    respond(&state, &session, result).await
}

/// GET /api/statistics
pub async fn statistics<P: PoolPrimitive>(
    State(state): State<AppState<P>>,
    session: CurrentSession,
) -> ApiResult<SessionStatistics> {
    let result = state.monitor.statistics(session.username()).await;
    respond(&state, &session, result).await
}

// ── Monitoring ─────────────────────────────────────────────────

/// GET /api/monitor/metrics
pub async fn server_metrics<P: PoolPrimitive>(
    State(state): State<AppState<P>>,
    session: CurrentSession,
) -> ApiResult<ServerMetrics> {
    let result = state.monitor.server_metrics(session.username()).await;
    respond(&state, &session, result).await
}

/// GET /api/monitor/users
pub async fn user_metrics<P: PoolPrimitive>(
    State(state): State<AppState<P>>,
    session: CurrentSession,
) -> ApiResult<UserMetricsReport> {
    let result = state.monitor.user_metrics(session.username()).await;
    respond(&state, &session, result).await
}

/// GET /api/pool-stats
pub async fn pool_stats<P: PoolPrimitive>(
    State(state): State<AppState<P>>,
    _session: CurrentSession,
) -> Json<ApiResponse<BTreeMap<String, PoolStats>>> {
    ApiResponse::ok(state.registry.statistics_snapshot().await)
}

#[derive(Serialize)]
pub struct Health {
    pub status: &'static str,
    pub pools: usize,
    pub sessions: usize,
}

/// GET /healthz
pub async fn healthz<P: PoolPrimitive>(
    State(state): State<AppState<P>>,
) -> Json<ApiResponse<Health>> {
    ApiResponse::ok(Health {
        status: "ok",
        pools: state.registry.len().await,
        sessions: state.sessions.len().await,
    })
}
