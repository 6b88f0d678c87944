//! Error types for the MQTT client.

use thiserror::Error;

use crate::codec::CodecError;

/// Result type for MQTT operations.
pub type Result<T> = std::result::Result<T, MqttError>;

#[derive(Debug, Error)]
pub enum MqttError {
    /// Frame could not be encoded or decoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    /// Broker refused the CONNECT.
    #[error("MQTT CONNACK rejected with code {0}")]
    ConnectionRejected(u8),

    /// Socket-level failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// No live session was available in time.
    #[error("Realtime MQTT connection unavailable: {0}")]
    ConnectionUnavailable(String),

    /// Session dropped while the operation was in flight.
    #[error("Realtime MQTT connection closed")]
    ConnectionClosed,

    #[error("Timed out waiting MQTT PUBACK for {topic}")]
    PublishTimeout { topic: String },

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// Every target of a multi-topic publish failed.
    #[error("Failed to publish command on all MQTT topic profiles ({details})")]
    AllTargetsFailed { details: String },

    /// Connect-publish-disconnect attempt failed.
    #[error("Failed to publish MQTT command ({topic}: {source})")]
    OneShotFailed {
        topic: String,
        #[source]
        source: Box<MqttError>,
    },

    #[error("No MQTT publish target for device '{0}'")]
    NoPublishTarget(String),

    #[error("Realtime MQTT proxy stopped")]
    Stopped,
}

impl MqttError {
    /// True when the shared session could not serve the request at all, so a
    /// fresh connection may still succeed.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            MqttError::ConnectionUnavailable(_) | MqttError::Stopped
        )
    }
}

impl From<MqttError> for relayd_core::Error {
    fn from(e: MqttError) -> Self {
        relayd_core::Error::Mqtt(e.to_string())
    }
}
