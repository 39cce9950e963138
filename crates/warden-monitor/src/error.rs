use thiserror::Error;
use warden_pool::RegistryError;

pub type MonitorResult<T> = Result<T, MonitorError>;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}
