//! PostgreSQL pooling primitive backed by `sqlx`.
//!
//! Each principal gets its own [`PgPool`] authenticated with that
//! principal's credentials. `open` makes one direct connection first so a
//! refused target or a bad password is reported as it happened, rather than
//! as a pool timeout after sqlx has retried in the background. The pool
//! itself is then built lazily.

use std::str::FromStr;
use std::time::Duration;

use sqlx::{ConnectOptions, Connection};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, Postgres};
use tracing::debug;
use warden_core::{Principal, Secret};

use crate::config::PoolConfig;
use crate::primitive::{
    AcquireError, BackendError, BackendErrorKind, DrainError, HandleStats, PoolHandle,
    PoolPrimitive,
};

pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_DATABASE: &str = "postgres";
pub const APPLICATION_NAME: &str = "dbwarden";

/// Opens one `sqlx` pool per principal.
#[derive(Clone, Debug)]
pub struct PgPrimitive {
    application_name: String,
}

impl PgPrimitive {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for PgPrimitive {
    fn default() -> Self {
        Self {
            application_name: APPLICATION_NAME.to_string(),
        }
    }
}

impl PoolPrimitive for PgPrimitive {
    type Handle = PgHandle;

    async fn open(
        &self,
        principal: &Principal,
        secret: &Secret,
        config: &PoolConfig,
    ) -> Result<PgHandle, BackendError> {
        let options = connect_options(principal, secret)?.application_name(&self.application_name);

        let conn = options.connect().await.map_err(|e| classify(&e))?;
        if let Err(e) = conn.close().await {
            debug!(username = %principal.username, error = %e, "closing login check connection failed");
        }

        // growth_increment has no sqlx equivalent: sqlx grows one connection
        // per waiting acquirer up to max_connections.
        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .idle_timeout(config.idle_timeout)
            .acquire_timeout(config.queue_timeout)
            .connect_lazy_with(options);

        debug!(
            username = %principal.username,
            target = %principal.target,
            min = config.min_connections,
            max = config.max_connections,
            "postgres pool opened"
        );
        Ok(PgHandle { pool })
    }
}

/// A principal's `sqlx` pool.
#[derive(Debug)]
pub struct PgHandle {
    pool: PgPool,
}

impl PoolHandle for PgHandle {
    type Conn = PoolConnection<Postgres>;

    async fn acquire(&self, timeout: Duration) -> Result<PoolConnection<Postgres>, AcquireError> {
        match tokio::time::timeout(timeout, self.pool.acquire()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(sqlx::Error::PoolTimedOut)) | Err(_) => Err(AcquireError::Timeout),
            Ok(Err(sqlx::Error::PoolClosed)) => Err(AcquireError::Closed),
            Ok(Err(e)) => Err(AcquireError::Backend(classify(&e))),
        }
    }

    fn release(&self, conn: PoolConnection<Postgres>) -> Result<(), BackendError> {
        // sqlx returns the connection to its pool on drop.
        drop(conn);
        Ok(())
    }

    async fn drain(&self, timeout: Duration) -> Result<(), DrainError> {
        // `close` marks the pool closed immediately, then waits for every
        // checked-out connection to come back.
        tokio::time::timeout(timeout, self.pool.close())
            .await
            .map_err(|_| DrainError::Timeout)
    }

    /// Marks the pool closed without waiting. sqlx cannot reclaim connections
    /// that are still checked out; they are closed when their holders drop
    /// them, and the registry has already removed the entry by then.
    fn force_close(&self) {
        // `close` marks the pool closed before its future is first polled.
        drop(self.pool.close());
    }

    fn stats(&self) -> HandleStats {
        let open = self.pool.size();
        let idle = u32::try_from(self.pool.num_idle()).unwrap_or(u32::MAX);
        HandleStats {
            in_use: open.saturating_sub(idle),
            open,
        }
    }
}

/// Build connect options for a principal.
///
/// `target` is either a `postgres://` / `postgresql://` URL (credentials in
/// it are overridden) or `host[:port][/database]`.
pub fn connect_options(
    principal: &Principal,
    secret: &Secret,
) -> Result<PgConnectOptions, BackendError> {
    let target = principal.target.trim();
    let options = if target.starts_with("postgres://") || target.starts_with("postgresql://") {
        PgConnectOptions::from_str(target)
            .map_err(|e| BackendError::new(BackendErrorKind::InvalidTarget, e.to_string()))?
    } else {
        let (host, port, database) = parse_target(target)?;
        PgConnectOptions::new_without_pgpass()
            .host(host)
            .port(port)
            .database(database)
    };

    // Statement logging would echo `ALTER ROLE ... PASSWORD` into the logs.
    Ok(options
        .username(&principal.username)
        .password(secret.expose())
        .disable_statement_logging())
}

/// Split `host[:port][/database]`.
fn parse_target(target: &str) -> Result<(&str, u16, &str), BackendError> {
    let invalid = |reason: &str| {
        BackendError::new(
            BackendErrorKind::InvalidTarget,
            format!("invalid target '{target}': {reason}"),
        )
    };

    let (host_port, database) = match target.split_once('/') {
        Some((host_port, database)) if !database.is_empty() => (host_port, database),
        Some((host_port, _)) => (host_port, DEFAULT_DATABASE),
        None => (target, DEFAULT_DATABASE),
    };
    let (host, port) = match host_port.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| invalid("port is not a number"))?;
            (host, port)
        }
        None => (host_port, DEFAULT_PORT),
    };
    if host.is_empty() {
        return Err(invalid("host is empty"));
    }
    Ok((host, port, database))
}

/// Map a driver error onto the coarse kinds the API reports.
pub fn classify(err: &sqlx::Error) -> BackendError {
    let kind = match err {
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| classify_sqlstate(&code))
            .unwrap_or(BackendErrorKind::Other),
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) => BackendErrorKind::Unreachable,
        sqlx::Error::Configuration(_) => BackendErrorKind::InvalidTarget,
        sqlx::Error::PoolTimedOut => BackendErrorKind::Timeout,
        _ => BackendErrorKind::Other,
    };
    BackendError::new(kind, err.to_string())
}

fn classify_sqlstate(code: &str) -> BackendErrorKind {
    match code {
        // invalid_password
        "28P01" => BackendErrorKind::InvalidCredentials,
        // invalid_authorization_specification: no LOGIN, expired, pg_hba reject
        "28000" => BackendErrorKind::LoginNotPermitted,
        // invalid_catalog_name
        "3D000" => BackendErrorKind::InvalidTarget,
        // cannot_connect_now, admin_shutdown
        "57P03" | "57P01" => BackendErrorKind::Unreachable,
        _ => BackendErrorKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PoolRegistry, RegistryError};

    fn principal(target: &str) -> Principal {
        Principal::new("monitor", target)
    }

    #[test]
    fn parse_host_port_database() {
        assert_eq!(
            parse_target("db.local:6543/ops").unwrap(),
            ("db.local", 6543, "ops")
        );
    }

    #[test]
    fn parse_defaults_port_and_database() {
        assert_eq!(
            parse_target("db.local").unwrap(),
            ("db.local", DEFAULT_PORT, DEFAULT_DATABASE)
        );
        assert_eq!(
            parse_target("db.local/").unwrap(),
            ("db.local", DEFAULT_PORT, DEFAULT_DATABASE)
        );
    }

    #[test]
    fn parse_rejects_bad_port() {
        let err = parse_target("db.local:abc/ops").unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::InvalidTarget);
    }

    #[test]
    fn parse_rejects_empty_host() {
        let err = parse_target(":5432/ops").unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::InvalidTarget);
    }

    #[test]
    fn connect_options_from_host_form() {
        let options = connect_options(&principal("db.local:6543/ops"), &Secret::new("pw")).unwrap();
        assert_eq!(options.get_host(), "db.local");
        assert_eq!(options.get_port(), 6543);
        assert_eq!(options.get_database(), Some("ops"));
        assert_eq!(options.get_username(), "monitor");
    }

    #[test]
    fn connect_options_from_url_override_user() {
        let options = connect_options(
            &principal("postgres://someone@db.local:5433/ops"),
            &Secret::new("pw"),
        )
        .unwrap();
        assert_eq!(options.get_host(), "db.local");
        assert_eq!(options.get_port(), 5433);
        assert_eq!(options.get_username(), "monitor");
    }

    #[test]
    fn classify_driver_errors() {
        assert_eq!(
            classify(&sqlx::Error::PoolTimedOut).kind,
            BackendErrorKind::Timeout
        );
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(
            classify(&sqlx::Error::Io(io)).kind,
            BackendErrorKind::Unreachable
        );
        assert_eq!(
            classify(&sqlx::Error::Protocol("garbage".to_string())).kind,
            BackendErrorKind::Other
        );
    }

    #[tokio::test]
    async fn refused_target_is_unreachable() {
        let err = PgPrimitive::new()
            .open(
                &principal("127.0.0.1:1/postgres"),
                &Secret::new("pw"),
                &PoolConfig::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::Unreachable);
    }

    #[tokio::test]
    async fn refused_login_fails_fast_without_installing() {
        let config = PoolConfig {
            connect_timeout: Duration::from_secs(5),
            ..PoolConfig::default()
        };
        let registry = PoolRegistry::new(PgPrimitive::new(), config);
        let started = std::time::Instant::now();

        let result = registry
            .create_or_replace(&principal("127.0.0.1:1/postgres"), &Secret::new("pw"))
            .await;
        match result {
            Err(RegistryError::AuthBackend { source, .. }) => {
                assert_eq!(source.kind, BackendErrorKind::Unreachable);
            }
            other => panic!("expected AuthBackend, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!registry.contains("monitor").await);
    }

    #[test]
    fn classify_sqlstates() {
        assert_eq!(classify_sqlstate("28P01"), BackendErrorKind::InvalidCredentials);
        assert_eq!(classify_sqlstate("28000"), BackendErrorKind::LoginNotPermitted);
        assert_eq!(classify_sqlstate("3D000"), BackendErrorKind::InvalidTarget);
        assert_eq!(classify_sqlstate("42601"), BackendErrorKind::Other);
    }
}
