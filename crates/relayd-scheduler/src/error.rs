//! Error types for scheduling.

use thiserror::Error;

use relayd_storage::StorageError;

pub type Result<T> = std::result::Result<T, ScheduleError>;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Invalid enforcement window: {0}")]
    InvalidWindow(String),

    #[error("Invalid schedule: {0}")]
    Validation(String),

    #[error("Schedule not found: {0}")]
    NotFound(u64),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<ScheduleError> for relayd_core::Error {
    fn from(e: ScheduleError) -> Self {
        match e {
            ScheduleError::Storage(e) => e.into(),
            ScheduleError::NotFound(id) => relayd_core::Error::NotFound(format!("schedule {}", id)),
            other => relayd_core::Error::Schedule(other.to_string()),
        }
    }
}
