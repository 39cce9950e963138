//! Session cookie handling and the authenticated-session extractor.

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::header::COOKIE;
use axum::http::request::Parts;
use cookie::{Cookie, SameSite};
use tracing::debug;
use warden_pool::PoolPrimitive;
use warden_session::{EndReason, SessionRecord, SessionToken};

use crate::error::ApiError;
use crate::{ApiSettings, AppState};

/// Read the session token from the request cookies.
pub fn session_token(headers: &HeaderMap, cookie_name: &str) -> Option<SessionToken> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| Cookie::split_parse(value))
        .filter_map(Result::ok)
        .find(|cookie| cookie.name() == cookie_name && !cookie.value().is_empty())
        .map(|cookie| SessionToken::from(cookie.value()))
}

/// `Set-Cookie` value carrying a new session token.
pub fn session_cookie(settings: &ApiSettings, token: &SessionToken) -> String {
    Cookie::build((settings.cookie_name.clone(), token.as_str().to_string()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(settings.secure_cookie)
        .build()
        .to_string()
}

/// `Set-Cookie` value that clears the session cookie.
pub fn removal_cookie(settings: &ApiSettings) -> String {
    let mut cookie = Cookie::build((settings.cookie_name.clone(), ""))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(settings.secure_cookie)
        .build();
    cookie.make_removal();
    cookie.to_string()
}

/// A request carrying a live session whose pool generation is still current.
///
/// Sessions bound to a replaced or closed generation are destroyed here and
/// the request is rejected with 401.
#[derive(Clone, Debug)]
pub struct CurrentSession {
    pub token: SessionToken,
    pub record: SessionRecord,
}

impl CurrentSession {
    pub fn username(&self) -> &str {
        &self.record.principal.username
    }
}

impl<P: PoolPrimitive> FromRequestParts<AppState<P>> for CurrentSession {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState<P>,
    ) -> Result<Self, Self::Rejection> {
        let token = session_token(&parts.headers, &state.settings.cookie_name)
            .ok_or_else(ApiError::not_authenticated)?;
        let record = state
            .sessions
            .get(&token)
            .await
            .ok_or_else(ApiError::not_authenticated)?;

        if !state.binder.is_valid(&token).await {
            debug!(
                username = %record.principal.username,
                token = token.short(),
                "session bound to a stale pool generation"
            );
            state.sessions.destroy(&token, EndReason::Invalidated).await;
            return Err(ApiError::Unauthorized(
                "session is no longer valid, please log in again".to_string(),
            ));
        }

        Ok(CurrentSession { token, record })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn token_found_among_other_cookies() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; warden_session=abc123; lang=en"),
        );
        let token = session_token(&headers, "warden_session").unwrap();
        assert_eq!(token.as_str(), "abc123");
        assert!(session_token(&headers, "other").is_none());
    }

    #[test]
    fn empty_cookie_value_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("warden_session="));
        assert!(session_token(&headers, "warden_session").is_none());
    }

    #[test]
    fn session_cookie_attributes() {
        let settings = ApiSettings::default();
        let token = SessionToken::from("abc");
        let cookie = session_cookie(&settings, &token);
        assert!(cookie.starts_with("warden_session=abc"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(cookie.contains("Path=/"));
        assert!(!cookie.contains("Secure"));
    }

    #[test]
    fn removal_cookie_expires() {
        let cookie = removal_cookie(&ApiSettings::default());
        assert!(cookie.starts_with("warden_session=;"));
        assert!(cookie.contains("Max-Age=0"));
    }
}
