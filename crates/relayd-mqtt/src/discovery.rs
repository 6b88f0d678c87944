//! Passive device discovery from observed broker traffic.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use relayd_core::{PowerState, Presence, RealtimeMessage};

use crate::compat::{
    extract_command_channels, merge_channels, parse_realtime_message, suggest_command_channel,
};

/// Tag recorded for devices seen through their last-will topic.
pub const LWT_SOURCE: &str = "tasmota_lwt";

/// Observed power, `Unknown` until a status report arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ObservedPower {
    On,
    Off,
    Unknown,
}

impl From<PowerState> for ObservedPower {
    fn from(power: PowerState) -> Self {
        match power {
            PowerState::On => ObservedPower::On,
            PowerState::Off => ObservedPower::Off,
        }
    }
}

/// A device seen during a discovery window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub device_id: String,
    /// From the LWT topic; `None` if no LWT was seen
    pub online: Option<bool>,
    pub power: ObservedPower,
    /// Relay channels seen in status traffic, lowest index first
    pub available_command_channels: Vec<String>,
    pub suggested_command_channel: String,
    /// Topic families the device was seen on
    pub sources: Vec<String>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Observation {
    online: Option<bool>,
    power: ObservedPower,
    channels: Vec<String>,
    sources: BTreeSet<String>,
    last_seen_at: DateTime<Utc>,
}

/// Folds broker messages into per-device discovery results.
#[derive(Debug, Default)]
pub struct DiscoveryCollector {
    devices: BTreeMap<String, Observation>,
}

impl DiscoveryCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one message. Returns false if it was not device traffic.
    pub fn observe(&mut self, topic: &str, payload: &str, at: DateTime<Utc>) -> bool {
        let Some(message) = parse_realtime_message(topic, payload) else {
            return false;
        };
        let entry = self
            .devices
            .entry(message.device_id().to_string())
            .or_insert_with(|| Observation {
                online: None,
                power: ObservedPower::Unknown,
                channels: Vec::new(),
                sources: BTreeSet::new(),
                last_seen_at: at,
            });
        entry.last_seen_at = entry.last_seen_at.max(at);

        match message {
            RealtimeMessage::Lwt { presence, .. } => {
                entry.online = Some(presence == Presence::Online);
                entry.sources.insert(LWT_SOURCE.to_string());
            }
            RealtimeMessage::Status { status, .. } => {
                entry.power = status.power.into();
                entry.sources.insert(status.source.as_str().to_string());
                let mut seen = vec![status.channel.clone()];
                if let Some(raw) = &status.raw {
                    seen.extend(extract_command_channels(raw));
                }
                merge_channels(&mut entry.channels, seen);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Devices ordered by id.
    pub fn finish(self) -> Vec<DiscoveredDevice> {
        self.devices
            .into_iter()
            .map(|(device_id, obs)| DiscoveredDevice {
                suggested_command_channel: suggest_command_channel(&obs.channels),
                device_id,
                online: obs.online,
                power: obs.power,
                available_command_channels: obs.channels,
                sources: obs.sources.into_iter().collect(),
                last_seen_at: obs.last_seen_at,
            })
            .collect()
    }
}
