//! Switch commands addressed to a single device.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Desired switch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandAction {
    On,
    Off,
}

impl CommandAction {
    /// Wire form used both as MQTT payload and in persisted records.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandAction::On => "ON",
            CommandAction::Off => "OFF",
        }
    }
}

impl fmt::Display for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ON" => Ok(CommandAction::On),
            "OFF" => Ok(CommandAction::Off),
            other => Err(Error::Validation(format!(
                "unknown command action '{}', expected ON or OFF",
                other
            ))),
        }
    }
}

/// A single command ready for publishing.
///
/// Envelopes are built once and never mutated; publishers only read them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    device_id: String,
    action: CommandAction,
    request_id: String,
    command_channel: Option<String>,
}

impl CommandEnvelope {
    /// Create an envelope for `device_id` (surrounding whitespace is dropped).
    pub fn new(
        device_id: impl AsRef<str>,
        action: CommandAction,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.as_ref().trim().to_string(),
            action,
            request_id: request_id.into(),
            command_channel: None,
        }
    }

    /// Target a specific relay channel such as `POWER2`.
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.command_channel = Some(channel.into());
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn action(&self) -> CommandAction {
        self.action
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn command_channel(&self) -> Option<&str> {
        self.command_channel.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_parse_is_case_insensitive() {
        assert_eq!(" on ".parse::<CommandAction>().unwrap(), CommandAction::On);
        assert_eq!("Off".parse::<CommandAction>().unwrap(), CommandAction::Off);
        assert!("toggle".parse::<CommandAction>().is_err());
    }

    #[test]
    fn test_action_serializes_uppercase() {
        let json = serde_json::to_string(&CommandAction::Off).unwrap();
        assert_eq!(json, "\"OFF\"");
    }

    #[test]
    fn test_envelope_trims_device_id() {
        let envelope = CommandEnvelope::new("  plug-1 ", CommandAction::On, "req-1")
            .with_channel("POWER2");
        assert_eq!(envelope.device_id(), "plug-1");
        assert_eq!(envelope.command_channel(), Some("POWER2"));
        assert_eq!(envelope.request_id(), "req-1");
    }
}
