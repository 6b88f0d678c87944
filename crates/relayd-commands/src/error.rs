//! Error types for command dispatch.

use thiserror::Error;

use relayd_mqtt::MqttError;
use relayd_storage::StorageError;

pub type Result<T> = std::result::Result<T, CommandError>;

#[derive(Debug, Error)]
pub enum CommandError {
    /// Every publish path failed; carries the last path's error.
    #[error(transparent)]
    Publish(#[from] MqttError),

    #[error("No command publisher configured")]
    NoPublisher,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl From<CommandError> for relayd_core::Error {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::Publish(e) => e.into(),
            CommandError::NoPublisher => {
                relayd_core::Error::Mqtt("No command publisher configured".into())
            }
            CommandError::Storage(e) => e.into(),
            CommandError::Validation(s) => relayd_core::Error::Validation(s),
        }
    }
}
