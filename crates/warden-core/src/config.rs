//! warden.toml configuration parser.
//!
//! Every section is optional; missing keys fall back to the defaults below,
//! so an empty file (or no file at all) is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub server: ServerConfig,
    pub pool: PoolSection,
    pub session: SessionSection,
    pub database: DatabaseSection,
    pub shutdown: ShutdownSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

/// Sizing applied to every per-user pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub min_connections: u32,
    pub max_connections: u32,
    pub growth_increment: u32,
    pub idle_timeout_secs: u64,
    pub queue_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub drain_timeout_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
            growth_increment: 2,
            idle_timeout_secs: 60,
            queue_timeout_ms: 60_000,
            connect_timeout_ms: 10_000,
            drain_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Sessions idle longer than this are expired and their pool closed.
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub cookie_name: String,
    pub secure_cookie: bool,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30 * 60,
            sweep_interval_secs: 60,
            cookie_name: "warden_session".to_string(),
            secure_cookie: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    /// Target used when a login request does not name one.
    pub default_target: Option<String>,
    /// Roles hidden from session listings.
    pub excluded_roles: Vec<String>,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            default_target: None,
            excluded_roles: vec!["postgres".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownSection {
    /// Upper bound on closing every pool after the server stops.
    pub timeout_secs: u64,
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self { timeout_secs: 15 }
    }
}

impl WardenConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WardenConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from `path` if given, otherwise start from defaults, then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `WARDEN_*` overrides through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("WARDEN_POOL_MIN") {
            self.pool.min_connections = v.parse()?;
        }
        if let Some(v) = lookup("WARDEN_POOL_MAX") {
            self.pool.max_connections = v.parse()?;
        }
        if let Some(v) = lookup("WARDEN_POOL_INCREMENT") {
            self.pool.growth_increment = v.parse()?;
        }
        if let Some(v) = lookup("WARDEN_DB_TARGET") {
            self.database.default_target = Some(v);
        }
        if let Some(v) = lookup("WARDEN_PORT") {
            self.server.port = v.parse()?;
        }
        Ok(())
    }

    /// Reject sizing that would make every pool unusable.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pool.max_connections == 0 {
            anyhow::bail!("pool.max_connections must be at least 1");
        }
        if self.pool.min_connections > self.pool.max_connections {
            anyhow::bail!(
                "pool.min_connections ({}) exceeds pool.max_connections ({})",
                self.pool.min_connections,
                self.pool.max_connections
            );
        }
        if self.session.cookie_name.is_empty() {
            anyhow::bail!("session.cookie_name must not be empty");
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_empty() {
        let config: WardenConfig = toml::from_str("").unwrap();
        assert_eq!(config, WardenConfig::default());
        assert_eq!(config.pool.max_connections, 10);
        assert_eq!(config.session.cookie_name, "warden_session");
    }

    #[test]
    fn test_parse_partial_section() {
        let toml_str = r#"
[pool]
max_connections = 4
drain_timeout_secs = 3

[database]
default_target = "db.internal:5432/postgres"
"#;
        let config: WardenConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.pool.max_connections, 4);
        assert_eq!(config.pool.drain_timeout_secs, 3);
        // Unspecified keys keep their defaults.
        assert_eq!(config.pool.min_connections, 2);
        assert_eq!(
            config.database.default_target.as_deref(),
            Some("db.internal:5432/postgres")
        );
        assert_eq!(config.server.port, 3000);
    }

    #[test]
    fn test_example_file_parses() {
        let config: WardenConfig =
            toml::from_str(include_str!("../../../warden.example.toml")).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.session.idle_timeout_secs, 1800);
        assert_eq!(config.database.excluded_roles, vec!["postgres".to_string()]);
    }

    #[test]
    fn test_env_overrides() {
        let env = HashMap::from([
            ("WARDEN_POOL_MIN", "1"),
            ("WARDEN_POOL_MAX", "20"),
            ("WARDEN_DB_TARGET", "pg:5433/app"),
        ]);
        let mut config = WardenConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.pool.min_connections, 1);
        assert_eq!(config.pool.max_connections, 20);
        assert_eq!(config.database.default_target.as_deref(), Some("pg:5433/app"));
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = WardenConfig::default();
        let result = config.apply_env(|k| (k == "WARDEN_POOL_MAX").then(|| "lots".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_min_above_max() {
        let mut config = WardenConfig::default();
        config.pool.min_connections = 11;
        assert!(config.validate().is_err());
        config.pool.min_connections = 2;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_roundtrip_keeps_values() {
        let mut config = WardenConfig::default();
        config.session.idle_timeout_secs = 90;
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("idle_timeout_secs = 90"));
    }
}
