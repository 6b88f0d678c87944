//! Schedule creation and enable/disable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use relayd_core::CommandAction;
use relayd_storage::{NewSchedule, ScheduleId, ScheduleRecord, ScheduleStore};

use crate::error::{Result, ScheduleError};
use crate::recurrence::{compute_next_run_at, parse_cron, parse_timezone};
use crate::window::EnforcementWindow;

fn default_enabled() -> bool {
    true
}

/// A schedule as submitted by an operator, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDraft {
    pub device_id: String,
    pub action: CommandAction,
    pub cron_expr: String,
    pub timezone: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub window_start_minute: Option<u16>,
    #[serde(default)]
    pub window_end_minute: Option<u16>,
    #[serde(default)]
    pub enforce_every_minute: Option<u16>,
}

impl ScheduleDraft {
    pub fn new(
        device_id: impl Into<String>,
        action: CommandAction,
        cron_expr: impl Into<String>,
        timezone: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            action,
            cron_expr: cron_expr.into(),
            timezone: timezone.into(),
            enabled: true,
            start_at: None,
            end_at: None,
            window_start_minute: None,
            window_end_minute: None,
            enforce_every_minute: None,
        }
    }

    pub fn with_window(mut self, start_minute: u16, end_minute: u16, every_minutes: u16) -> Self {
        self.window_start_minute = Some(start_minute);
        self.window_end_minute = Some(end_minute);
        self.enforce_every_minute = Some(every_minutes);
        self
    }

    pub fn with_active_range(
        mut self,
        start_at: Option<DateTime<Utc>>,
        end_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.start_at = start_at;
        self.end_at = end_at;
        self
    }

    /// Check every field and compute the first `next_run_at`.
    ///
    /// The first occurrence is searched from `start_at` when that lies in
    /// the future, otherwise from `now`.
    pub fn validate(self, now: DateTime<Utc>) -> Result<NewSchedule> {
        let device_id = self.device_id.trim().to_string();
        if device_id.is_empty() {
            return Err(ScheduleError::Validation("device id is required".into()));
        }
        let timezone = self.timezone.trim().to_string();
        parse_timezone(&timezone)?;
        let cron_expr = self.cron_expr.split_whitespace().collect::<Vec<_>>().join(" ");
        parse_cron(&cron_expr)?;

        if let (Some(start), Some(end)) = (self.start_at, self.end_at) {
            if start > end {
                return Err(ScheduleError::Validation(
                    "start_at must not be after end_at".into(),
                ));
            }
        }

        let window = match (
            self.window_start_minute,
            self.window_end_minute,
            self.enforce_every_minute,
        ) {
            (Some(start), Some(end), Some(every)) => Some(EnforcementWindow::new(start, end, every)),
            (None, None, None) => None,
            _ => {
                return Err(ScheduleError::InvalidWindow(
                    "window start, window end and interval must be set together".into(),
                ))
            }
        };

        let seed = self.start_at.map_or(now, |start| start.max(now));
        let next_run_at = compute_next_run_at(&cron_expr, &timezone, seed)?;

        Ok(NewSchedule {
            device_id,
            action: self.action,
            cron_expr,
            timezone,
            enabled: self.enabled,
            next_run_at,
            start_at: self.start_at,
            end_at: self.end_at,
            window_start_minute: window.map(|w| w.start_minute),
            window_end_minute: window.map(|w| w.end_minute),
            enforce_every_minute: window.map(|w| w.every_minutes),
        })
    }
}

/// Validate and store a draft.
pub async fn create_schedule<S>(
    store: &S,
    draft: ScheduleDraft,
    now: DateTime<Utc>,
) -> Result<ScheduleRecord>
where
    S: ScheduleStore + ?Sized,
{
    let schedule = draft.validate(now)?;
    let record = store.insert_schedule(schedule).await?;
    info!(
        schedule_id = record.id,
        device_id = %record.device_id,
        cron = %record.cron_expr,
        next_run_at = %record.next_run_at,
        "Schedule created"
    );
    Ok(record)
}

/// Enable or disable a schedule.
///
/// Enabling recomputes `next_run_at` from `now`, so slots missed while
/// disabled are not replayed.
pub async fn set_schedule_enabled<S>(
    store: &S,
    id: ScheduleId,
    enabled: bool,
    now: DateTime<Utc>,
) -> Result<ScheduleRecord>
where
    S: ScheduleStore + ?Sized,
{
    let mut record = store
        .get_schedule(id)
        .await?
        .ok_or(ScheduleError::NotFound(id))?;
    if enabled {
        record.next_run_at = compute_next_run_at(&record.cron_expr, &record.timezone, now)?;
    }
    record.enabled = enabled;
    record.updated_at = now;
    store.update_schedule(&record).await?;
    info!(schedule_id = id, enabled, "Schedule updated");
    Ok(record)
}
