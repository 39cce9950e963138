//! warden-monitor — what the dashboard shows and the actions it offers.
//!
//! Every query runs on the *calling user's* pool via
//! [`PoolRegistry::with_connection`](warden_pool::PoolRegistry::with_connection),
//! so results and permissions are exactly those of the logged-in role.
//! The [`Monitor`] trait is the seam the HTTP layer depends on; [`PgMonitor`]
//! is the PostgreSQL implementation.

pub mod error;
pub mod postgres;
pub mod quote;
pub mod types;

use async_trait::async_trait;
use warden_core::{Secret, UserInfo};

pub use error::{MonitorError, MonitorResult};
pub use postgres::PgMonitor;
pub use types::*;

/// Session and metrics operations, each run as `actor`.
#[async_trait]
pub trait Monitor: Send + Sync {
    /// Role attributes of `actor` itself.
    async fn user_info(&self, actor: &str) -> MonitorResult<UserInfo>;

    /// Client sessions, active first then longest idle.
    async fn list_sessions(&self, actor: &str) -> MonitorResult<Vec<SessionRow>>;

    async fn sessions_by_user(&self, actor: &str) -> MonitorResult<Vec<UserSessionCount>>;

    async fn user_sessions(&self, actor: &str, username: &str) -> MonitorResult<Vec<SessionRow>>;

    /// Sessions waiting on another backend's lock.
    async fn blocking_sessions(&self, actor: &str) -> MonitorResult<Vec<SessionRow>>;

    /// Terminate one backend. `NotFound` if no client backend has this pid.
    async fn terminate(&self, actor: &str, pid: i32) -> MonitorResult<SessionBrief>;

    async fn terminate_all_for_user(
        &self,
        actor: &str,
        username: &str,
    ) -> MonitorResult<TerminateAllReport>;

    async fn change_password(
        &self,
        actor: &str,
        username: &str,
        new_password: &Secret,
    ) -> MonitorResult<()>;

    async fn unlock_account(&self, actor: &str, username: &str) -> MonitorResult<()>;

    async fn statistics(&self, actor: &str) -> MonitorResult<SessionStatistics>;

    async fn server_metrics(&self, actor: &str) -> MonitorResult<ServerMetrics>;

    async fn user_metrics(&self, actor: &str) -> MonitorResult<UserMetricsReport>;
}
