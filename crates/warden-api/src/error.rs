//! Response envelope and error → status mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use warden_monitor::MonitorError;
use warden_pool::{BackendError, BackendErrorKind, RegistryError};

/// Response wrapper for consistent API format.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Unavailable(String),
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ApiError::BadRequest(msg)
            | ApiError::Unauthorized(msg)
            | ApiError::NotFound(msg)
            | ApiError::Unavailable(msg)
            | ApiError::Internal(msg) => msg,
        }
    }

    pub fn not_authenticated() -> Self {
        ApiError::Unauthorized("not authenticated".to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.message().to_string()),
        };
        (status, Json(body)).into_response()
    }
}

/// User-facing wording for a failed login.
pub fn login_failure_message(source: &BackendError) -> String {
    match source.kind {
        BackendErrorKind::InvalidCredentials => "invalid username or password".to_string(),
        BackendErrorKind::LoginNotPermitted => {
            "this role is not permitted to log in (locked, expired or NOLOGIN)".to_string()
        }
        BackendErrorKind::Unreachable => {
            "cannot reach the database server, check the connection target".to_string()
        }
        BackendErrorKind::Timeout => "the database server did not respond in time".to_string(),
        BackendErrorKind::InvalidTarget => {
            format!("invalid connection target: {}", source.message)
        }
        BackendErrorKind::Other => format!("connection error: {}", source.message),
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::InvalidRequest(msg) => ApiError::BadRequest(msg),
            RegistryError::AuthBackend { source, .. } => {
                ApiError::Unauthorized(login_failure_message(&source))
            }
            RegistryError::NoSuchPrincipal(_) => ApiError::Unauthorized(
                "database session is gone, please log in again".to_string(),
            ),
            e @ RegistryError::AcquireTimeout { .. } => ApiError::Unavailable(e.to_string()),
            e @ RegistryError::AcquireFailed { .. } => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<MonitorError> for ApiError {
    fn from(e: MonitorError) -> Self {
        match e {
            MonitorError::Registry(e) => e.into(),
            MonitorError::NotFound(what) => ApiError::NotFound(format!("{what} not found")),
            MonitorError::InvalidRequest(msg) => ApiError::BadRequest(msg),
            e @ MonitorError::Query(_) => ApiError::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn registry_errors_map_to_statuses() {
        let cases = [
            (RegistryError::InvalidRequest("x".into()), StatusCode::BAD_REQUEST),
            (RegistryError::NoSuchPrincipal("a".into()), StatusCode::UNAUTHORIZED),
            (
                RegistryError::AcquireTimeout {
                    username: "a".into(),
                    timeout: Duration::from_secs(1),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                RegistryError::AcquireFailed {
                    username: "a".into(),
                    source: BackendError::new(BackendErrorKind::Other, "boom"),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn login_failures_are_friendly() {
        let err = ApiError::from(RegistryError::AuthBackend {
            username: "a".into(),
            source: BackendError::new(
                BackendErrorKind::InvalidCredentials,
                "password authentication failed for user \"a\"",
            ),
        });
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.message(), "invalid username or password");

        let unreachable = BackendError::new(BackendErrorKind::Unreachable, "refused");
        assert!(login_failure_message(&unreachable).contains("cannot reach"));
    }

    #[test]
    fn monitor_not_found_is_404() {
        let err = ApiError::from(MonitorError::NotFound("session 42".into()));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.message(), "session 42 not found");
    }
}
