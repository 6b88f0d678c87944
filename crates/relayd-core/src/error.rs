//! Unified error handling for relayd.
//!
//! Each crate keeps its own error enum for the failures it owns and
//! converts into this type at the crate boundary.

/// Unified error type for relayd.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation errors.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Storage/database errors.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Broker transport or protocol errors.
    #[error("MQTT error: {0}")]
    Mqtt(String),

    /// Scheduling errors.
    #[error("Schedule error: {0}")]
    Schedule(String),

    /// Serialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Not found errors.
    #[error("Not found: {0}")]
    NotFound(String),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

/// Result type alias for relayd operations.
pub type Result<T> = std::result::Result<T, Error>;
