//! Persisted record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use relayd_core::CommandAction;

pub type ScheduleId = u64;

/// Channel used when a device has none configured.
pub const DEFAULT_COMMAND_CHANNEL: &str = "POWER";

/// A recurring ON/OFF schedule for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub id: ScheduleId,
    pub device_id: String,
    pub action: CommandAction,
    /// Cron expression as entered (5, 6 or 7 fields)
    pub cron_expr: String,
    /// IANA timezone name
    pub timezone: String,
    pub enabled: bool,
    /// Next planned slot; only ever moves forward
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    /// Local minute of day, 0..=1439
    pub window_start_minute: Option<u16>,
    pub window_end_minute: Option<u16>,
    /// Enforcement interval in minutes inside the window
    pub enforce_every_minute: Option<u16>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduleRecord {
    /// Enabled, cursor reached, and `now` inside `[start_at, end_at]`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && self.next_run_at <= now
            && self.start_at.map_or(true, |start| start <= now)
            && self.end_at.map_or(true, |end| now <= end)
    }
}

/// Schedule fields supplied at creation; id and timestamps are assigned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSchedule {
    pub device_id: String,
    pub action: CommandAction,
    pub cron_expr: String,
    pub timezone: String,
    pub enabled: bool,
    pub next_run_at: DateTime<Utc>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub window_start_minute: Option<u16>,
    pub window_end_minute: Option<u16>,
    pub enforce_every_minute: Option<u16>,
}

impl NewSchedule {
    pub fn into_record(self, id: ScheduleId, now: DateTime<Utc>) -> ScheduleRecord {
        ScheduleRecord {
            id,
            device_id: self.device_id,
            action: self.action,
            cron_expr: self.cron_expr,
            timezone: self.timezone,
            enabled: self.enabled,
            next_run_at: self.next_run_at,
            last_run_at: None,
            start_at: self.start_at,
            end_at: self.end_at,
            window_start_minute: self.window_start_minute,
            window_end_minute: self.window_end_minute,
            enforce_every_minute: self.enforce_every_minute,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    /// Claimed but not (yet) dispatched
    Skipped,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Skipped => "SKIPPED",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
        }
    }
}

/// One claimed slot of a schedule. Unique per `(schedule_id, planned_at)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRun {
    pub schedule_id: ScheduleId,
    pub planned_at: DateTime<Utc>,
    pub status: RunStatus,
    pub executed_at: Option<DateTime<Utc>>,
    pub request_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ScheduleRun {
    pub fn claimed(schedule_id: ScheduleId, planned_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            schedule_id,
            planned_at,
            status: RunStatus::Skipped,
            executed_at: None,
            request_id: None,
            error_message: None,
            created_at: now,
        }
    }

    pub fn apply(&mut self, outcome: RunOutcome) {
        self.status = outcome.status;
        self.executed_at = Some(outcome.executed_at);
        self.request_id = Some(outcome.request_id);
        self.error_message = outcome.error_message;
    }
}

/// Final state written to a claimed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub executed_at: DateTime<Utc>,
    pub request_id: String,
    pub error_message: Option<String>,
}

impl RunOutcome {
    pub fn success(request_id: impl Into<String>, executed_at: DateTime<Utc>) -> Self {
        Self {
            status: RunStatus::Success,
            executed_at,
            request_id: request_id.into(),
            error_message: None,
        }
    }

    pub fn failed(
        request_id: impl Into<String>,
        executed_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            status: RunStatus::Failed,
            executed_at,
            request_id: request_id.into(),
            error_message: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandResult {
    Published,
    Failed,
    ScheduledSuccess,
}

impl CommandResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandResult::Published => "PUBLISHED",
            CommandResult::Failed => "FAILED",
            CommandResult::ScheduledSuccess => "SCHEDULED_SUCCESS",
        }
    }
}

/// Audit entry for one command, keyed by request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandLogEntry {
    pub request_id: String,
    pub device_id: String,
    pub action: CommandAction,
    pub result: CommandResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CommandLogEntry {
    pub fn new(
        request_id: impl Into<String>,
        device_id: impl Into<String>,
        action: CommandAction,
        result: CommandResult,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            device_id: device_id.into(),
            action,
            result,
            error_message: None,
            issued_at: at,
            updated_at: at,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }

    /// Fold a newer entry for the same request id into this one.
    pub(crate) fn merge(&mut self, newer: CommandLogEntry) {
        self.device_id = newer.device_id;
        self.action = newer.action;
        self.result = newer.result;
        self.error_message = newer.error_message;
        self.updated_at = newer.updated_at;
    }
}

/// A known relay device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Canonical channel (`POWER`, `POWER2`, ...)
    pub command_channel: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeviceRecord {
    pub fn new(device_id: impl Into<String>, command_channel: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            device_id: device_id.into(),
            name: None,
            command_channel: command_channel.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Configured channel, `POWER` when blank.
    pub fn effective_channel(&self) -> &str {
        let channel = self.command_channel.trim();
        if channel.is_empty() {
            DEFAULT_COMMAND_CHANNEL
        } else {
            channel
        }
    }
}

/// Sort and cap due schedules: oldest cursor first, then by id.
pub(crate) fn order_due(mut due: Vec<ScheduleRecord>, limit: usize) -> Vec<ScheduleRecord> {
    due.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at).then(a.id.cmp(&b.id)));
    due.truncate(limit);
    due
}

/// Newest first, capped.
pub(crate) fn order_recent(mut entries: Vec<CommandLogEntry>, limit: usize) -> Vec<CommandLogEntry> {
    entries.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));
    entries.truncate(limit);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn schedule(now: DateTime<Utc>) -> ScheduleRecord {
        NewSchedule {
            device_id: "plug".into(),
            action: CommandAction::On,
            cron_expr: "* * * * *".into(),
            timezone: "UTC".into(),
            enabled: true,
            next_run_at: now,
            start_at: None,
            end_at: None,
            window_start_minute: None,
            window_end_minute: None,
            enforce_every_minute: None,
        }
        .into_record(1, now)
    }

    #[test]
    fn test_is_due_respects_bounds() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let mut record = schedule(now);
        assert!(record.is_due(now));
        assert!(!record.is_due(now - Duration::seconds(1)));

        record.start_at = Some(now + Duration::minutes(1));
        assert!(!record.is_due(now));

        record.start_at = None;
        record.end_at = Some(now - Duration::minutes(1));
        assert!(!record.is_due(now));

        record.end_at = Some(now);
        assert!(record.is_due(now));

        record.enabled = false;
        assert!(!record.is_due(now));
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_string(&RunStatus::Failed).unwrap(), "\"FAILED\"");
        assert_eq!(
            serde_json::to_string(&CommandResult::ScheduledSuccess).unwrap(),
            "\"SCHEDULED_SUCCESS\""
        );
    }

    #[test]
    fn test_blank_channel_falls_back() {
        let device = DeviceRecord::new("plug", "  ");
        assert_eq!(device.effective_channel(), DEFAULT_COMMAND_CHANNEL);
        let device = DeviceRecord::new("strip", "POWER2");
        assert_eq!(device.effective_channel(), "POWER2");
    }
}
