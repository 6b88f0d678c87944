//! Persistence contracts used by the command layer and the scheduler.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::records::{
    CommandLogEntry, DeviceRecord, NewSchedule, RunOutcome, ScheduleId, ScheduleRecord,
    ScheduleRun,
};

/// Schedule records with a conditional cursor.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn insert_schedule(&self, schedule: NewSchedule) -> Result<ScheduleRecord>;

    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<ScheduleRecord>>;

    /// All schedules ordered by id.
    async fn list_schedules(&self) -> Result<Vec<ScheduleRecord>>;

    /// Replace a stored schedule. `NotFound` if it does not exist.
    async fn update_schedule(&self, schedule: &ScheduleRecord) -> Result<()>;

    async fn delete_schedule(&self, id: ScheduleId) -> Result<bool>;

    /// Up to `limit` schedules for which [`ScheduleRecord::is_due`] holds,
    /// oldest `next_run_at` first.
    async fn due_schedules(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduleRecord>>;

    /// Move the cursor to `next_run_at`, only if it still is `<= planned_at`.
    ///
    /// Returns false when a concurrent tick already moved it further.
    async fn advance_cursor(
        &self,
        id: ScheduleId,
        planned_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
        last_run_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;
}

/// Per-slot run ledger.
#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Insert a `SKIPPED` run for the slot if none exists.
    ///
    /// Returns false if the slot was already claimed.
    async fn claim_slot(&self, schedule_id: ScheduleId, planned_at: DateTime<Utc>) -> Result<bool>;

    async fn complete_run(
        &self,
        schedule_id: ScheduleId,
        planned_at: DateTime<Utc>,
        outcome: RunOutcome,
    ) -> Result<()>;

    /// Newest slots first.
    async fn list_runs(&self, schedule_id: ScheduleId, limit: usize) -> Result<Vec<ScheduleRun>>;
}

/// Command audit trail.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Insert, or update the entry with the same request id.
    async fn record_command(&self, entry: CommandLogEntry) -> Result<()>;

    /// Newest first, optionally for one device.
    async fn recent_commands(
        &self,
        device_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CommandLogEntry>>;
}

/// Device id to command channel lookup.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Configured channel, `POWER` for unknown devices.
    async fn command_channel(&self, device_id: &str) -> Result<String>;

    async fn upsert_device(&self, device: DeviceRecord) -> Result<()>;

    async fn get_device(&self, device_id: &str) -> Result<Option<DeviceRecord>>;

    async fn list_devices(&self) -> Result<Vec<DeviceRecord>>;
}

/// Everything the daemon needs from one backend.
pub trait RelaydStore: ScheduleStore + RunLedger + AuditLog + DeviceDirectory {}

impl<T> RelaydStore for T where T: ScheduleStore + RunLedger + AuditLog + DeviceDirectory {}
