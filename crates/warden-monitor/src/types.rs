//! Rows and reports returned by the monitor.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One client backend from `pg_stat_activity`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, sqlx::FromRow)]
pub struct SessionRow {
    pub pid: i32,
    pub username: Option<String>,
    pub application_name: Option<String>,
    pub client_addr: Option<String>,
    pub client_hostname: Option<String>,
    pub state: Option<String>,
    pub backend_start: Option<DateTime<Utc>>,
    pub state_change: Option<DateTime<Utc>>,
    /// Seconds since the last state change.
    pub idle_seconds: i64,
    pub wait_event_type: Option<String>,
    pub wait_event: Option<String>,
    pub blocking_pids: Vec<i32>,
    /// First 200 characters of `query`.
    pub query_preview: Option<String>,
    pub query: Option<String>,
    #[sqlx(skip)]
    pub formatted_idle: String,
    #[sqlx(skip)]
    pub terminate_command: String,
}

impl SessionRow {
    /// Fill the fields computed client-side.
    pub fn finish(mut self) -> Self {
        self.formatted_idle = format_idle(self.idle_seconds);
        self.terminate_command = terminate_command(self.pid);
        self
    }
}

/// Session count per role.
#[derive(Clone, Debug, Default, PartialEq, Serialize, sqlx::FromRow)]
pub struct UserSessionCount {
    pub username: String,
    pub session_count: i64,
    pub first_logon: Option<DateTime<Utc>>,
    pub max_idle_seconds: i64,
}

/// Minimal identification of a backend about to be terminated.
#[derive(Clone, Debug, Default, PartialEq, Serialize, sqlx::FromRow)]
pub struct SessionBrief {
    pub pid: i32,
    pub username: Option<String>,
    pub state: Option<String>,
    pub application_name: Option<String>,
    pub client_addr: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminateStatus {
    Success,
    Error,
}

/// Per-backend result of a bulk termination.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TerminateResult {
    #[serde(flatten)]
    pub session: SessionBrief,
    pub result: TerminateStatus,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TerminateAllReport {
    pub username: String,
    pub total_sessions: usize,
    pub terminated: usize,
    pub failed: usize,
    pub details: Vec<TerminateResult>,
}

impl TerminateAllReport {
    pub fn new(username: &str, details: Vec<TerminateResult>) -> Self {
        let terminated = details
            .iter()
            .filter(|d| d.result == TerminateStatus::Success)
            .count();
        Self {
            username: username.to_string(),
            total_sessions: details.len(),
            terminated,
            failed: details.len() - terminated,
            details,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct SessionStatistics {
    pub total_sessions: i64,
    pub active_sessions: i64,
    pub idle_sessions: i64,
    pub unique_users: i64,
    pub blocked_sessions: i64,
}

// ── Server metrics ──────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Serialize, sqlx::FromRow)]
pub struct ConnectionUsage {
    pub max_connections: i32,
    pub current_connections: i32,
    #[sqlx(skip)]
    pub used_percent: f64,
}

impl ConnectionUsage {
    pub fn finish(mut self) -> Self {
        self.used_percent = percent(
            i64::from(self.current_connections),
            i64::from(self.max_connections),
        );
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct StateCount {
    pub state: String,
    pub count: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, sqlx::FromRow)]
pub struct DatabaseSize {
    pub name: String,
    pub size_bytes: i64,
    #[sqlx(skip)]
    pub size_mb: f64,
}

impl DatabaseSize {
    pub fn finish(mut self) -> Self {
        self.size_mb = round2(self.size_bytes as f64 / (1024.0 * 1024.0));
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct WaitEvent {
    pub wait_event_type: String,
    pub wait_event: String,
    pub sessions: i64,
}

/// Cumulative counters from `pg_stat_database`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, sqlx::FromRow)]
pub struct TransactionActivity {
    pub commits: i64,
    pub rollbacks: i64,
    pub blocks_hit: i64,
    pub blocks_read: i64,
    #[sqlx(skip)]
    pub cache_hit_percent: f64,
}

impl TransactionActivity {
    pub fn finish(mut self) -> Self {
        self.cache_hit_percent = percent(self.blocks_hit, self.blocks_hit + self.blocks_read);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServerMetrics {
    pub connections: ConnectionUsage,
    pub states: Vec<StateCount>,
    pub databases: Vec<DatabaseSize>,
    pub wait_events: Vec<WaitEvent>,
    pub activity: TransactionActivity,
    pub collected_at: DateTime<Utc>,
}

// ── User metrics ────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct UserMetrics {
    pub username: String,
    pub total_sessions: i64,
    pub active_sessions: i64,
    pub idle_in_transaction: i64,
    pub waiting_sessions: i64,
    pub longest_transaction_seconds: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UserMetricsSummary {
    pub total_users: usize,
    pub active_users: usize,
    pub total_sessions: i64,
    pub total_active_sessions: i64,
    pub total_inactive_sessions: i64,
}

impl UserMetricsSummary {
    pub fn from_users(users: &[UserMetrics]) -> Self {
        let total_sessions: i64 = users.iter().map(|u| u.total_sessions).sum();
        let total_active_sessions: i64 = users.iter().map(|u| u.active_sessions).sum();
        Self {
            total_users: users.len(),
            active_users: users.iter().filter(|u| u.active_sessions > 0).count(),
            total_sessions,
            total_active_sessions,
            total_inactive_sessions: total_sessions - total_active_sessions,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UserMetricsReport {
    pub summary: UserMetricsSummary,
    pub users: Vec<UserMetrics>,
    pub collected_at: DateTime<Utc>,
}

impl UserMetricsReport {
    pub fn new(users: Vec<UserMetrics>) -> Self {
        Self {
            summary: UserMetricsSummary::from_users(&users),
            users,
            collected_at: Utc::now(),
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// `HH:MM:SS`; hours are not capped at 24.
pub fn format_idle(seconds: i64) -> String {
    let seconds = seconds.max(0);
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

pub fn terminate_command(pid: i32) -> String {
    format!("SELECT pg_terminate_backend({pid});")
}

fn percent(part: i64, whole: i64) -> f64 {
    if whole <= 0 {
        return 0.0;
    }
    round2(part as f64 * 100.0 / whole as f64)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_formatting() {
        assert_eq!(format_idle(0), "00:00:00");
        assert_eq!(format_idle(59), "00:00:59");
        assert_eq!(format_idle(3_661), "01:01:01");
        assert_eq!(format_idle(100 * 3600), "100:00:00");
        assert_eq!(format_idle(-5), "00:00:00");
    }

    #[test]
    fn session_row_finish_fills_computed_fields() {
        let row = SessionRow {
            pid: 4242,
            idle_seconds: 75,
            ..SessionRow::default()
        }
        .finish();
        assert_eq!(row.formatted_idle, "00:01:15");
        assert_eq!(row.terminate_command, "SELECT pg_terminate_backend(4242);");
    }

    #[test]
    fn connection_usage_percent() {
        let usage = ConnectionUsage {
            max_connections: 200,
            current_connections: 50,
            used_percent: 0.0,
        }
        .finish();
        assert_eq!(usage.used_percent, 25.0);
    }

    #[test]
    fn cache_hit_ratio_handles_zero_reads() {
        let idle = TransactionActivity::default().finish();
        assert_eq!(idle.cache_hit_percent, 0.0);

        let busy = TransactionActivity {
            blocks_hit: 990,
            blocks_read: 10,
            ..TransactionActivity::default()
        }
        .finish();
        assert_eq!(busy.cache_hit_percent, 99.0);
    }

    #[test]
    fn user_summary_totals() {
        let users = vec![
            UserMetrics {
                username: "app".into(),
                total_sessions: 5,
                active_sessions: 2,
                ..UserMetrics::default()
            },
            UserMetrics {
                username: "report".into(),
                total_sessions: 3,
                active_sessions: 0,
                ..UserMetrics::default()
            },
        ];
        let summary = UserMetricsSummary::from_users(&users);
        assert_eq!(summary.total_users, 2);
        assert_eq!(summary.active_users, 1);
        assert_eq!(summary.total_sessions, 8);
        assert_eq!(summary.total_active_sessions, 2);
        assert_eq!(summary.total_inactive_sessions, 6);
    }

    #[test]
    fn terminate_report_counts() {
        let ok = TerminateResult {
            session: SessionBrief {
                pid: 1,
                ..SessionBrief::default()
            },
            result: TerminateStatus::Success,
            message: "terminated".into(),
        };
        let failed = TerminateResult {
            result: TerminateStatus::Error,
            message: "permission denied".into(),
            ..ok.clone()
        };
        let report = TerminateAllReport::new("app", vec![ok, failed]);
        assert_eq!(report.total_sessions, 2);
        assert_eq!(report.terminated, 1);
        assert_eq!(report.failed, 1);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["details"][0]["pid"], 1);
        assert_eq!(json["details"][1]["result"], "error");
    }
}
