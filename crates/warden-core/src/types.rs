//! Identity types shared by the pool, session and monitor crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An authenticated database identity together with the target its pool
/// connects to.
///
/// Role names are compared case-sensitively, the way PostgreSQL treats
/// quoted identifiers.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub username: String,
    /// `host[:port][/database]` or a `postgres://` URL without credentials.
    pub target: String,
}

impl Principal {
    pub fn new(username: &str, target: &str) -> Self {
        Self {
            username: username.to_string(),
            target: target.to_string(),
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.username, self.target)
    }
}

/// A database password. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Role attributes captured at login and shown on the dashboard.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub username: String,
    pub superuser: bool,
    pub can_login: bool,
    /// `-1` means unlimited.
    pub connection_limit: i32,
    pub valid_until: Option<String>,
}

impl UserInfo {
    /// Minimal info used when the role catalog cannot be read.
    pub fn basic(username: &str) -> Self {
        Self {
            username: username.to_string(),
            superuser: false,
            can_login: true,
            connection_limit: -1,
            valid_until: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_debug_is_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{secret:?}"), "Secret(***)");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn principal_display() {
        let p = Principal::new("monitor", "db.local:5432/postgres");
        assert_eq!(p.to_string(), "monitor@db.local:5432/postgres");
    }

    #[test]
    fn principal_usernames_are_case_sensitive() {
        let a = Principal::new("Admin", "db");
        let b = Principal::new("admin", "db");
        assert_ne!(a, b);
    }
}
