//! Realtime device observations decoded from broker traffic.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reported relay state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PowerState {
    On,
    Off,
}

impl PowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerState::On => "ON",
            PowerState::Off => "OFF",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device availability as announced through the last-will topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Presence {
    Online,
    Offline,
}

impl Presence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Presence::Online => "ONLINE",
            Presence::Offline => "OFFLINE",
        }
    }
}

impl fmt::Display for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which topic family a status came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StatusSource {
    #[serde(rename = "tasmota_stat_power")]
    StatPower,
    #[serde(rename = "tasmota_stat_result")]
    StatResult,
    #[serde(rename = "tasmota_tele_state")]
    TeleState,
}

impl StatusSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusSource::StatPower => "tasmota_stat_power",
            StatusSource::StatResult => "tasmota_stat_result",
            StatusSource::TeleState => "tasmota_tele_state",
        }
    }
}

/// A decoded power report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Normalized relay state
    pub power: PowerState,
    /// Relay channel the state belongs to (`POWER`, `POWER2`, ...)
    pub channel: String,
    /// Topic family the report arrived on
    pub source: StatusSource,
    /// Original JSON document for RESULT/STATE reports
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

/// A broker message recognised as device state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RealtimeMessage {
    Status {
        device_id: String,
        status: DeviceStatus,
    },
    Lwt {
        device_id: String,
        presence: Presence,
    },
}

impl RealtimeMessage {
    pub fn device_id(&self) -> &str {
        match self {
            RealtimeMessage::Status { device_id, .. } | RealtimeMessage::Lwt { device_id, .. } => {
                device_id
            }
        }
    }
}

/// A realtime message stamped with its receive time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    #[serde(flatten)]
    pub message: RealtimeMessage,
    pub ts: DateTime<Utc>,
}

impl RealtimeEvent {
    pub fn new(message: RealtimeMessage, ts: DateTime<Utc>) -> Self {
        Self { message, ts }
    }

    pub fn device_id(&self) -> &str {
        self.message.device_id()
    }
}

/// Most recent status and presence seen for one device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub status: Option<RealtimeEvent>,
    pub presence: Option<RealtimeEvent>,
}

impl DeviceSnapshot {
    /// Fold an event into the snapshot.
    pub fn apply(&mut self, event: &RealtimeEvent) {
        match event.message {
            RealtimeMessage::Status { .. } => self.status = Some(event.clone()),
            RealtimeMessage::Lwt { .. } => self.presence = Some(event.clone()),
        }
    }

    /// Cached events in replay order: status first, then presence.
    pub fn events(&self) -> impl Iterator<Item = &RealtimeEvent> {
        self.status.iter().chain(self.presence.iter())
    }
}
