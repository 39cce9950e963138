//! PostgreSQL monitor backed by `pg_stat_activity` and friends.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::BoxFuture;
use sqlx::Postgres;
use sqlx::pool::PoolConnection;
use tracing::{debug, info, warn};
use warden_core::{Secret, UserInfo};
use warden_pool::{PgPrimitive, PoolRegistry};

use crate::Monitor;
use crate::error::{MonitorError, MonitorResult};
use crate::quote::{quote_ident, quote_literal};
use crate::types::*;

type PgConn = PoolConnection<Postgres>;

macro_rules! session_columns {
    () => {
        "a.pid, \
         a.usename::text AS username, \
         a.application_name, \
         host(a.client_addr) AS client_addr, \
         a.client_hostname, \
         a.state, \
         a.backend_start, \
         a.state_change, \
         COALESCE(EXTRACT(EPOCH FROM (now() - a.state_change)), 0)::bigint AS idle_seconds, \
         a.wait_event_type, \
         a.wait_event, \
         pg_blocking_pids(a.pid) AS blocking_pids, \
         LEFT(a.query, 200) AS query_preview, \
         a.query"
    };
}

macro_rules! client_backends {
    () => {
        " FROM pg_stat_activity a \
          WHERE a.backend_type = 'client backend' \
            AND a.usename IS NOT NULL"
    };
}

macro_rules! session_order {
    () => {
        " ORDER BY COALESCE(a.state = 'active', false) DESC, idle_seconds DESC, username, a.pid"
    };
}

const LIST_SESSIONS: &str = concat!(
    "SELECT ",
    session_columns!(),
    client_backends!(),
    " AND a.usename::text <> ALL($1)",
    session_order!()
);

const USER_SESSIONS: &str = concat!(
    "SELECT ",
    session_columns!(),
    client_backends!(),
    " AND a.usename::text = $1",
    session_order!()
);

const BLOCKING_SESSIONS: &str = concat!(
    "SELECT ",
    session_columns!(),
    client_backends!(),
    " AND cardinality(pg_blocking_pids(a.pid)) > 0",
    session_order!()
);

const SESSIONS_BY_USER: &str = concat!(
    "SELECT a.usename::text AS username, \
            COUNT(*) AS session_count, \
            MIN(a.backend_start) AS first_logon, \
            COALESCE(MAX(EXTRACT(EPOCH FROM (now() - a.state_change))), 0)::bigint AS max_idle_seconds",
    client_backends!(),
    " AND a.usename::text <> ALL($1) \
      GROUP BY a.usename \
      ORDER BY session_count DESC, username"
);

const FIND_BACKEND: &str = concat!(
    "SELECT a.pid, a.usename::text AS username, a.state, a.application_name, \
            host(a.client_addr) AS client_addr",
    client_backends!(),
    " AND a.pid = $1"
);

const USER_BACKENDS: &str = concat!(
    "SELECT a.pid, a.usename::text AS username, a.state, a.application_name, \
            host(a.client_addr) AS client_addr",
    client_backends!(),
    " AND a.usename::text = $1 AND a.pid <> $2 \
      ORDER BY a.pid"
);

const STATISTICS: &str = "SELECT COUNT(*) AS total_sessions, \
            COUNT(*) FILTER (WHERE state = 'active') AS active_sessions, \
            COUNT(*) FILTER (WHERE state LIKE 'idle%') AS idle_sessions, \
            COUNT(DISTINCT usename) AS unique_users, \
            COUNT(*) FILTER (WHERE cardinality(pg_blocking_pids(pid)) > 0) AS blocked_sessions \
     FROM pg_stat_activity \
     WHERE backend_type = 'client backend'";

const CONNECTION_USAGE: &str = "SELECT current_setting('max_connections')::int AS max_connections, \
            (SELECT COUNT(*) FROM pg_stat_activity \
              WHERE backend_type = 'client backend')::int AS current_connections";

const STATE_COUNTS: &str = "SELECT COALESCE(state, 'unknown') AS state, COUNT(*) AS count \
     FROM pg_stat_activity \
     WHERE backend_type = 'client backend' \
     GROUP BY 1 \
     ORDER BY 2 DESC, 1";

const DATABASE_SIZES: &str = "SELECT datname::text AS name, pg_database_size(datname) AS size_bytes \
     FROM pg_database \
     WHERE datallowconn AND has_database_privilege(datname, 'CONNECT') \
     ORDER BY size_bytes DESC";

const TOP_WAIT_EVENTS: &str = "SELECT wait_event_type, wait_event, COUNT(*) AS sessions \
     FROM pg_stat_activity \
     WHERE backend_type = 'client backend' AND wait_event IS NOT NULL \
     GROUP BY wait_event_type, wait_event \
     ORDER BY sessions DESC, wait_event \
     LIMIT 5";

const TRANSACTION_ACTIVITY: &str = "SELECT COALESCE(SUM(xact_commit), 0)::bigint AS commits, \
            COALESCE(SUM(xact_rollback), 0)::bigint AS rollbacks, \
            COALESCE(SUM(blks_hit), 0)::bigint AS blocks_hit, \
            COALESCE(SUM(blks_read), 0)::bigint AS blocks_read \
     FROM pg_stat_database";

const USER_METRICS: &str = concat!(
    "SELECT a.usename::text AS username, \
            COUNT(*) AS total_sessions, \
            COUNT(*) FILTER (WHERE a.state = 'active') AS active_sessions, \
            COUNT(*) FILTER (WHERE a.state = 'idle in transaction') AS idle_in_transaction, \
            COUNT(*) FILTER (WHERE a.state = 'active' AND a.wait_event IS NOT NULL) AS waiting_sessions, \
            COALESCE(MAX(EXTRACT(EPOCH FROM (now() - a.xact_start))), 0)::bigint AS longest_transaction_seconds",
    client_backends!(),
    " GROUP BY a.usename \
      ORDER BY total_sessions DESC, username"
);

const CURRENT_ROLE: &str = "SELECT rolname::text AS username, \
            rolsuper AS superuser, \
            rolcanlogin AS can_login, \
            rolconnlimit AS connection_limit, \
            rolvaliduntil::text AS valid_until \
     FROM pg_roles \
     WHERE rolname = current_user";

const OWN_PID: &str = "SELECT pg_backend_pid()";
const TERMINATE: &str = "SELECT pg_terminate_backend($1)";

#[derive(sqlx::FromRow)]
struct RoleRow {
    username: String,
    superuser: bool,
    can_login: bool,
    connection_limit: i32,
    valid_until: Option<String>,
}

impl From<RoleRow> for UserInfo {
    fn from(row: RoleRow) -> Self {
        UserInfo {
            username: row.username,
            superuser: row.superuser,
            can_login: row.can_login,
            connection_limit: row.connection_limit,
            valid_until: row.valid_until,
        }
    }
}

/// Runs monitor queries on the actor's own pool.
pub struct PgMonitor {
    registry: Arc<PoolRegistry<PgPrimitive>>,
    /// Roles hidden from session listings (e.g. `postgres`).
    excluded_roles: Vec<String>,
}

impl PgMonitor {
    pub fn new(registry: Arc<PoolRegistry<PgPrimitive>>, excluded_roles: Vec<String>) -> Self {
        Self {
            registry,
            excluded_roles,
        }
    }

    async fn run<T, F>(&self, actor: &str, f: F) -> MonitorResult<T>
    where
        F: for<'c> FnOnce(&'c mut PgConn) -> BoxFuture<'c, MonitorResult<T>> + Send,
    {
        self.registry.with_connection(actor, f).await
    }

    async fn fetch_sessions(
        &self,
        actor: &str,
        sql: &'static str,
        bind: SessionFilter,
    ) -> MonitorResult<Vec<SessionRow>> {
        let rows = self
            .run(actor, move |conn| {
                Box::pin(async move {
                    let query = sqlx::query_as::<_, SessionRow>(sql);
                    let query = match bind {
                        SessionFilter::None => query,
                        SessionFilter::ExcludeRoles(roles) => query.bind(roles),
                        SessionFilter::Role(role) => query.bind(role),
                    };
                    Ok(query.fetch_all(&mut **conn).await?)
                })
            })
            .await?;
        Ok(rows.into_iter().map(SessionRow::finish).collect())
    }
}

enum SessionFilter {
    None,
    ExcludeRoles(Vec<String>),
    Role(String),
}

fn require(value: &str, what: &str) -> MonitorResult<()> {
    if value.trim().is_empty() {
        return Err(MonitorError::InvalidRequest(format!("{what} is required")));
    }
    Ok(())
}

/// `ALTER ROLE` is a utility statement and takes no bind parameters.
fn change_password_sql(username: &str, new_password: &Secret) -> MonitorResult<String> {
    Ok(format!(
        "ALTER ROLE {} WITH PASSWORD {}",
        quote_ident(username)?,
        quote_literal(new_password.expose())?
    ))
}

fn unlock_account_sql(username: &str) -> MonitorResult<String> {
    Ok(format!("ALTER ROLE {} WITH LOGIN", quote_ident(username)?))
}

#[async_trait]
impl Monitor for PgMonitor {
    async fn user_info(&self, actor: &str) -> MonitorResult<UserInfo> {
        let row = self
            .run(actor, |conn| {
                Box::pin(async move {
                    Ok(sqlx::query_as::<_, RoleRow>(CURRENT_ROLE)
                        .fetch_optional(&mut **conn)
                        .await?)
                })
            })
            .await?;
        row.map(UserInfo::from)
            .ok_or_else(|| MonitorError::NotFound(format!("role {actor}")))
    }

    async fn list_sessions(&self, actor: &str) -> MonitorResult<Vec<SessionRow>> {
        let filter = SessionFilter::ExcludeRoles(self.excluded_roles.clone());
        self.fetch_sessions(actor, LIST_SESSIONS, filter).await
    }

    async fn sessions_by_user(&self, actor: &str) -> MonitorResult<Vec<UserSessionCount>> {
        let roles = self.excluded_roles.clone();
        self.run(actor, move |conn| {
            Box::pin(async move {
                Ok(sqlx::query_as::<_, UserSessionCount>(SESSIONS_BY_USER)
                    .bind(roles)
                    .fetch_all(&mut **conn)
                    .await?)
            })
        })
        .await
    }

    async fn user_sessions(&self, actor: &str, username: &str) -> MonitorResult<Vec<SessionRow>> {
        require(username, "username")?;
        let filter = SessionFilter::Role(username.to_string());
        self.fetch_sessions(actor, USER_SESSIONS, filter).await
    }

    async fn blocking_sessions(&self, actor: &str) -> MonitorResult<Vec<SessionRow>> {
        self.fetch_sessions(actor, BLOCKING_SESSIONS, SessionFilter::None)
            .await
    }

    async fn terminate(&self, actor: &str, pid: i32) -> MonitorResult<SessionBrief> {
        let session = self
            .run(actor, move |conn| {
                Box::pin(async move {
                    let own = sqlx::query_scalar::<_, i32>(OWN_PID)
                        .fetch_one(&mut **conn)
                        .await?;
                    if own == pid {
                        return Err(MonitorError::InvalidRequest(
                            "refusing to terminate the dashboard's own connection".to_string(),
                        ));
                    }

                    let session = sqlx::query_as::<_, SessionBrief>(FIND_BACKEND)
                        .bind(pid)
                        .fetch_optional(&mut **conn)
                        .await?
                        .ok_or_else(|| MonitorError::NotFound(format!("session {pid}")))?;

                    let terminated = sqlx::query_scalar::<_, bool>(TERMINATE)
                        .bind(pid)
                        .fetch_one(&mut **conn)
                        .await?;
                    if !terminated {
                        return Err(MonitorError::NotFound(format!("session {pid}")));
                    }
                    Ok(session)
                })
            })
            .await?;

        info!(
            actor,
            pid,
            username = session.username.as_deref().unwrap_or(""),
            "session terminated"
        );
        Ok(session)
    }

    async fn terminate_all_for_user(
        &self,
        actor: &str,
        username: &str,
    ) -> MonitorResult<TerminateAllReport> {
        require(username, "username")?;
        let target = username.to_string();
        let details = self
            .run(actor, move |conn| {
                Box::pin(async move {
                    let own = sqlx::query_scalar::<_, i32>(OWN_PID)
                        .fetch_one(&mut **conn)
                        .await?;
                    let sessions = sqlx::query_as::<_, SessionBrief>(USER_BACKENDS)
                        .bind(&target)
                        .bind(own)
                        .fetch_all(&mut **conn)
                        .await?;

                    let mut details = Vec::with_capacity(sessions.len());
                    for session in sessions {
                        let outcome = sqlx::query_scalar::<_, bool>(TERMINATE)
                            .bind(session.pid)
                            .fetch_one(&mut **conn)
                            .await;
                        let (result, message) = match outcome {
                            Ok(true) => (TerminateStatus::Success, "terminated".to_string()),
                            Ok(false) => (
                                TerminateStatus::Error,
                                "backend no longer exists".to_string(),
                            ),
                            Err(e) => {
                                warn!(pid = session.pid, error = %e, "failed to terminate backend");
                                (TerminateStatus::Error, e.to_string())
                            }
                        };
                        details.push(TerminateResult {
                            session,
                            result,
                            message,
                        });
                    }
                    Ok(details)
                })
            })
            .await?;

        let report = TerminateAllReport::new(username, details);
        info!(
            actor,
            username,
            terminated = report.terminated,
            failed = report.failed,
            "bulk termination finished"
        );
        Ok(report)
    }

    async fn change_password(
        &self,
        actor: &str,
        username: &str,
        new_password: &Secret,
    ) -> MonitorResult<()> {
        require(username, "username")?;
        if new_password.is_empty() {
            return Err(MonitorError::InvalidRequest(
                "new password is required".to_string(),
            ));
        }
        let sql = change_password_sql(username, new_password)?;
        self.run(actor, move |conn| {
            Box::pin(async move {
                // No bind arguments, so this goes over the simple-query protocol.
                sqlx::Executor::execute(&mut **conn, sql.as_str()).await?;
                Ok(())
            })
        })
        .await?;
        info!(actor, username, "role password changed");
        Ok(())
    }

    async fn unlock_account(&self, actor: &str, username: &str) -> MonitorResult<()> {
        require(username, "username")?;
        let sql = unlock_account_sql(username)?;
        self.run(actor, move |conn| {
            Box::pin(async move {
                sqlx::Executor::execute(&mut **conn, sql.as_str()).await?;
                Ok(())
            })
        })
        .await?;
        info!(actor, username, "role login re-enabled");
        Ok(())
    }

    async fn statistics(&self, actor: &str) -> MonitorResult<SessionStatistics> {
        self.run(actor, |conn| {
            Box::pin(async move {
                Ok(sqlx::query_as::<_, SessionStatistics>(STATISTICS)
                    .fetch_one(&mut **conn)
                    .await?)
            })
        })
        .await
    }

    async fn server_metrics(&self, actor: &str) -> MonitorResult<ServerMetrics> {
        let metrics = self
            .run(actor, |conn| {
                Box::pin(async move {
                    let connections = sqlx::query_as::<_, ConnectionUsage>(CONNECTION_USAGE)
                        .fetch_one(&mut **conn)
                        .await?
                        .finish();
                    let states = sqlx::query_as::<_, StateCount>(STATE_COUNTS)
                        .fetch_all(&mut **conn)
                        .await?;
                    let databases = sqlx::query_as::<_, DatabaseSize>(DATABASE_SIZES)
                        .fetch_all(&mut **conn)
                        .await?
                        .into_iter()
                        .map(DatabaseSize::finish)
                        .collect();
                    let wait_events = sqlx::query_as::<_, WaitEvent>(TOP_WAIT_EVENTS)
                        .fetch_all(&mut **conn)
                        .await?;
                    let activity = sqlx::query_as::<_, TransactionActivity>(TRANSACTION_ACTIVITY)
                        .fetch_one(&mut **conn)
                        .await?
                        .finish();
                    Ok(ServerMetrics {
                        connections,
                        states,
                        databases,
                        wait_events,
                        activity,
                        collected_at: Utc::now(),
                    })
                })
            })
            .await?;
        debug!(actor, "server metrics collected");
        Ok(metrics)
    }

    async fn user_metrics(&self, actor: &str) -> MonitorResult<UserMetricsReport> {
        let users = self
            .run(actor, |conn| {
                Box::pin(async move {
                    Ok(sqlx::query_as::<_, UserMetrics>(USER_METRICS)
                        .fetch_all(&mut **conn)
                        .await?)
                })
            })
            .await?;
        Ok(UserMetricsReport::new(users))
    }
}

impl std::fmt::Debug for PgMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgMonitor")
            .field("excluded_roles", &self.excluded_roles)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_queries_filter_client_backends() {
        for sql in [LIST_SESSIONS, USER_SESSIONS, BLOCKING_SESSIONS] {
            assert!(sql.starts_with("SELECT a.pid,"));
            assert!(sql.contains("backend_type = 'client backend'"));
            assert!(sql.contains("ORDER BY COALESCE(a.state = 'active', false) DESC"));
        }
        assert!(LIST_SESSIONS.contains("<> ALL($1)"));
        assert!(USER_SESSIONS.contains("a.usename::text = $1"));
    }

    #[test]
    fn bulk_termination_skips_own_backend() {
        assert!(USER_BACKENDS.contains("a.pid <> $2"));
    }

    #[test]
    fn alter_role_statements_are_quoted() {
        assert_eq!(
            change_password_sql("app", &Secret::new("n3w")).unwrap(),
            "ALTER ROLE \"app\" WITH PASSWORD 'n3w'"
        );
        assert_eq!(
            change_password_sql("Ops \"x\"", &Secret::new("it's")).unwrap(),
            "ALTER ROLE \"Ops \"\"x\"\"\" WITH PASSWORD 'it''s'"
        );
        assert_eq!(
            unlock_account_sql("report").unwrap(),
            "ALTER ROLE \"report\" WITH LOGIN"
        );
        assert!(unlock_account_sql("").is_err());
        assert!(change_password_sql("app", &Secret::new("a\0b")).is_err());
    }

    #[test]
    fn require_rejects_blank() {
        assert!(require("  ", "username").is_err());
        assert!(require("app", "username").is_ok());
    }
}
