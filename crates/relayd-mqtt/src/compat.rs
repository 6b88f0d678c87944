//! Tasmota topic conventions.
//!
//! Commands go to `cmnd/<device>/<channel>`. State comes back on
//! `stat/<device>/POWER<n>`, `stat/<device>/RESULT`, `tele/<device>/STATE`
//! and availability on `tele/<device>/LWT`. Both the default
//! `<prefix>/<device>/...` full-topic layout and the swapped
//! `<device>/<prefix>/...` layout are recognised.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use relayd_core::{
    CommandAction, DeviceStatus, PowerState, Presence, RealtimeMessage, StatusSource,
};

pub const DEFAULT_COMMAND_CHANNEL: &str = "POWER";
const MAX_CHANNEL_INDEX: u32 = 99;
/// Indexed POWER topics included in the realtime subscription.
const SUBSCRIBED_POWER_CHANNELS: u32 = 8;

/// One topic/payload pair to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTarget {
    pub topic: String,
    pub payload: String,
}

/// Canonicalise a channel name to `POWER` or `POWER<n>` (n = 1..=99).
///
/// Bare numbers are accepted (`"2"` becomes `POWER2`); anything else falls
/// back to `POWER`.
pub fn normalize_command_channel(channel: Option<&str>) -> String {
    let Some(raw) = channel.map(str::trim).filter(|c| !c.is_empty()) else {
        return DEFAULT_COMMAND_CHANNEL.to_string();
    };
    let upper = raw.to_ascii_uppercase();
    let index = upper.strip_prefix(DEFAULT_COMMAND_CHANNEL).unwrap_or(&upper);
    if index.is_empty() {
        return DEFAULT_COMMAND_CHANNEL.to_string();
    }
    match parse_channel_index(index) {
        Some(n) => format!("{}{}", DEFAULT_COMMAND_CHANNEL, n),
        None => DEFAULT_COMMAND_CHANNEL.to_string(),
    }
}

fn parse_channel_index(index: &str) -> Option<u32> {
    if !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    index
        .parse::<u32>()
        .ok()
        .filter(|n| (1..=MAX_CHANNEL_INDEX).contains(n))
}

/// Index of a channel name: `POWER` is 0, `POWER<n>` is n.
fn channel_index(channel: &str) -> Option<u32> {
    let index = channel.strip_prefix(DEFAULT_COMMAND_CHANNEL)?;
    if index.is_empty() {
        Some(0)
    } else {
        parse_channel_index(index)
    }
}

/// Topics a command should be published to, in preference order.
///
/// Returns an empty list for a blank device id.
pub fn build_command_publish_targets(
    device_id: &str,
    action: CommandAction,
    channel: Option<&str>,
) -> Vec<PublishTarget> {
    let device_id = device_id.trim();
    if device_id.is_empty() {
        return Vec::new();
    }
    let channel = normalize_command_channel(channel);
    vec![PublishTarget {
        topic: format!("cmnd/{}/{}", device_id, channel),
        payload: action.as_str().to_string(),
    }]
}

/// Topic filters the realtime session subscribes to.
pub fn realtime_subscribe_topics() -> Vec<String> {
    let mut topics = Vec::new();
    topics.push("stat/+/POWER".to_string());
    topics.push("+/stat/POWER".to_string());
    for n in 1..=SUBSCRIBED_POWER_CHANNELS {
        topics.push(format!("stat/+/POWER{}", n));
        topics.push(format!("+/stat/POWER{}", n));
    }
    for topic in [
        "stat/+/RESULT",
        "+/stat/RESULT",
        "tele/+/STATE",
        "+/tele/STATE",
        "tele/+/LWT",
        "+/tele/LWT",
    ] {
        topics.push(topic.to_string());
    }
    dedupe(topics)
}

/// LWT topics for a presence snapshot. Without device ids, wildcards are used.
pub fn lwt_snapshot_subscribe_topics(device_ids: &[String]) -> Vec<String> {
    let ids: Vec<&str> = device_ids
        .iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .collect();
    if ids.is_empty() {
        return vec!["tele/+/LWT".to_string(), "+/tele/LWT".to_string()];
    }
    dedupe(
        ids.into_iter()
            .flat_map(|id| [format!("tele/{}/LWT", id), format!("{}/tele/LWT", id)])
            .collect(),
    )
}

/// Device id of an LWT topic in either layout.
pub fn extract_lwt_device_id(topic: &str) -> Option<String> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 3 || !parts[2].eq_ignore_ascii_case("LWT") {
        return None;
    }
    tasmota_device_id(&parts, "tele")
}

fn tasmota_device_id(parts: &[&str], prefix: &str) -> Option<String> {
    let id = if parts[0].eq_ignore_ascii_case(prefix) {
        parts[1]
    } else if parts[1].eq_ignore_ascii_case(prefix) {
        parts[0]
    } else {
        return None;
    };
    let id = id.trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// Decode a broker message into a status or presence update.
///
/// Topic segments match in any case; the reported channel is canonical
/// (`stat/plug/power2` reports `POWER2`). Anything that does not look like
/// Tasmota state yields `None`.
pub fn parse_realtime_message(topic: &str, payload: &str) -> Option<RealtimeMessage> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 3 {
        return None;
    }
    let leaf = parts[2].to_ascii_uppercase();
    let leaf = leaf.as_str();

    if leaf == "LWT" {
        let device_id = tasmota_device_id(&parts, "tele")?;
        let presence = decode_presence(payload)?;
        return Some(RealtimeMessage::Lwt {
            device_id,
            presence,
        });
    }

    if leaf == "STATE" {
        let device_id = tasmota_device_id(&parts, "tele")?;
        let doc = parse_object(payload)?;
        let (channel, power) = power_from_object(&doc, None)?;
        return Some(status(device_id, channel, power, StatusSource::TeleState, Some(doc)));
    }

    let device_id = tasmota_device_id(&parts, "stat")?;
    if leaf == "RESULT" {
        let doc = parse_object(payload)?;
        let (channel, power) = power_from_object(&doc, None)?;
        return Some(status(device_id, channel, power, StatusSource::StatResult, Some(doc)));
    }

    if channel_index(leaf).is_some() {
        let channel = normalize_command_channel(Some(leaf));
        // Plain token, or a JSON object when SetOption4 is enabled.
        if let Some(power) = decode_power_token(payload) {
            return Some(status(
                device_id,
                channel,
                power,
                StatusSource::StatPower,
                None,
            ));
        }
        let doc = parse_object(payload)?;
        let (channel, power) = power_from_object(&doc, Some(&channel))?;
        return Some(status(device_id, channel, power, StatusSource::StatPower, Some(doc)));
    }

    None
}

fn status(
    device_id: String,
    channel: String,
    power: PowerState,
    source: StatusSource,
    raw: Option<Value>,
) -> RealtimeMessage {
    RealtimeMessage::Status {
        device_id,
        status: DeviceStatus {
            power,
            channel,
            source,
            raw,
        },
    }
}

fn parse_object(payload: &str) -> Option<Value> {
    serde_json::from_str::<Value>(payload.trim())
        .ok()
        .filter(Value::is_object)
}

/// `ON`/`OFF`/`1`/`0`/`true`/`false`, any case.
pub fn decode_power_token(token: &str) -> Option<PowerState> {
    match token.trim().to_ascii_uppercase().as_str() {
        "ON" | "1" | "TRUE" => Some(PowerState::On),
        "OFF" | "0" | "FALSE" => Some(PowerState::Off),
        _ => None,
    }
}

fn decode_power_value(value: &Value) -> Option<PowerState> {
    match value {
        Value::String(s) => decode_power_token(s),
        Value::Bool(b) => Some(if *b { PowerState::On } else { PowerState::Off }),
        Value::Number(n) => n
            .as_f64()
            .map(|v| if v == 0.0 { PowerState::Off } else { PowerState::On }),
        _ => None,
    }
}

fn decode_presence(payload: &str) -> Option<Presence> {
    match payload.trim().to_ascii_uppercase().as_str() {
        "ONLINE" => Some(Presence::Online),
        "OFFLINE" => Some(Presence::Offline),
        _ => None,
    }
}

/// Pick the power value out of a RESULT/STATE document.
///
/// Preference: the `preferred` key, then `POWER`, then the lowest `POWER<n>`.
fn power_from_object(doc: &Value, preferred: Option<&str>) -> Option<(String, PowerState)> {
    let object = doc.as_object()?;
    let mut candidates: Vec<&str> = Vec::new();
    if let Some(key) = preferred {
        candidates.push(key);
    }
    candidates.push(DEFAULT_COMMAND_CHANNEL);
    let indexed = indexed_power_keys(object);
    candidates.extend(indexed.iter().map(|(_, key)| key.as_str()));

    candidates.into_iter().find_map(|key| {
        object
            .get(key)
            .and_then(decode_power_value)
            .map(|power| (key.to_string(), power))
    })
}

fn indexed_power_keys(object: &Map<String, Value>) -> Vec<(u32, String)> {
    let mut keys: Vec<(u32, String)> = object
        .keys()
        .filter_map(|key| {
            let index = key.strip_prefix(DEFAULT_COMMAND_CHANNEL)?;
            parse_channel_index(index).map(|n| (n, key.clone()))
        })
        .collect();
    keys.sort();
    keys
}

/// Relay channels a status document advertises, lowest index first.
///
/// Handles a single `POWER` key, indexed `POWER<n>` keys, and the compact
/// bitstring form (`"POWER": "0101"`) some firmwares report for multi-relay
/// boards.
pub fn extract_command_channels(status: &Value) -> Vec<String> {
    let Some(object) = status.as_object() else {
        return Vec::new();
    };

    let indexed = indexed_power_keys(object);
    if !indexed.is_empty() {
        return indexed
            .into_iter()
            .map(|(n, _)| format!("{}{}", DEFAULT_COMMAND_CHANNEL, n))
            .collect();
    }

    match object.get(DEFAULT_COMMAND_CHANNEL) {
        Some(Value::String(bits))
            if bits.len() > 1 && bits.bytes().all(|b| b == b'0' || b == b'1') =>
        {
            let count = (bits.len() as u32).min(MAX_CHANNEL_INDEX);
            (1..=count)
                .map(|n| format!("{}{}", DEFAULT_COMMAND_CHANNEL, n))
                .collect()
        }
        Some(_) => vec![DEFAULT_COMMAND_CHANNEL.to_string()],
        None => Vec::new(),
    }
}

/// Default channel for a device: the lowest-numbered advertised one.
pub fn suggest_command_channel(channels: &[String]) -> String {
    channels
        .iter()
        .filter_map(|c| channel_index(c).map(|n| (n, c)))
        .min_by_key(|(n, _)| *n)
        .map(|(_, c)| c.clone())
        .unwrap_or_else(|| DEFAULT_COMMAND_CHANNEL.to_string())
}

/// Merge a channel list without duplicates, keeping index order.
pub(crate) fn merge_channels(existing: &mut Vec<String>, more: impl IntoIterator<Item = String>) {
    let mut set: BTreeSet<(u32, String)> = existing
        .drain(..)
        .filter_map(|c| channel_index(&c).map(|n| (n, c)))
        .collect();
    set.extend(more.into_iter().filter_map(|c| channel_index(&c).map(|n| (n, c))));
    existing.extend(set.into_iter().map(|(_, c)| c));
}

fn dedupe(topics: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    topics
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}
