//! In-memory store for tests and ephemeral runs.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::{Result, StorageError};
use crate::records::{
    order_due, order_recent, CommandLogEntry, DeviceRecord, NewSchedule, RunOutcome, ScheduleId,
    ScheduleRecord, ScheduleRun, DEFAULT_COMMAND_CHANNEL,
};
use crate::store::{AuditLog, DeviceDirectory, RunLedger, ScheduleStore};

#[derive(Default)]
struct State {
    next_schedule_id: ScheduleId,
    schedules: BTreeMap<ScheduleId, ScheduleRecord>,
    runs: BTreeMap<(ScheduleId, i64), ScheduleRun>,
    commands: HashMap<String, CommandLogEntry>,
    devices: BTreeMap<String, DeviceRecord>,
}

/// All records behind one lock, so every operation is atomic.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn insert_schedule(&self, schedule: NewSchedule) -> Result<ScheduleRecord> {
        let mut state = self.state.lock();
        state.next_schedule_id += 1;
        let record = schedule.into_record(state.next_schedule_id, Utc::now());
        state.schedules.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<ScheduleRecord>> {
        Ok(self.state.lock().schedules.get(&id).cloned())
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduleRecord>> {
        Ok(self.state.lock().schedules.values().cloned().collect())
    }

    async fn update_schedule(&self, schedule: &ScheduleRecord) -> Result<()> {
        let mut state = self.state.lock();
        match state.schedules.get_mut(&schedule.id) {
            Some(stored) => {
                *stored = schedule.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound(format!("schedule {}", schedule.id))),
        }
    }

    async fn delete_schedule(&self, id: ScheduleId) -> Result<bool> {
        Ok(self.state.lock().schedules.remove(&id).is_some())
    }

    async fn due_schedules(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduleRecord>> {
        let due = self
            .state
            .lock()
            .schedules
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();
        Ok(order_due(due, limit))
    }

    async fn advance_cursor(
        &self,
        id: ScheduleId,
        planned_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
        last_run_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        let Some(schedule) = state.schedules.get_mut(&id) else {
            return Ok(false);
        };
        if schedule.next_run_at > planned_at {
            return Ok(false);
        }
        schedule.next_run_at = next_run_at;
        if last_run_at.is_some() {
            schedule.last_run_at = last_run_at;
        }
        schedule.updated_at = Utc::now();
        Ok(true)
    }
}

#[async_trait]
impl RunLedger for MemoryStore {
    async fn claim_slot(&self, schedule_id: ScheduleId, planned_at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock();
        let key = (schedule_id, planned_at.timestamp_millis());
        if state.runs.contains_key(&key) {
            return Ok(false);
        }
        state
            .runs
            .insert(key, ScheduleRun::claimed(schedule_id, planned_at, Utc::now()));
        Ok(true)
    }

    async fn complete_run(
        &self,
        schedule_id: ScheduleId,
        planned_at: DateTime<Utc>,
        outcome: RunOutcome,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let key = (schedule_id, planned_at.timestamp_millis());
        match state.runs.get_mut(&key) {
            Some(run) => {
                run.apply(outcome);
                Ok(())
            }
            None => Err(StorageError::NotFound(format!(
                "run {} at {}",
                schedule_id, planned_at
            ))),
        }
    }

    async fn list_runs(&self, schedule_id: ScheduleId, limit: usize) -> Result<Vec<ScheduleRun>> {
        Ok(self
            .state
            .lock()
            .runs
            .range((schedule_id, i64::MIN)..=(schedule_id, i64::MAX))
            .rev()
            .take(limit)
            .map(|(_, run)| run.clone())
            .collect())
    }
}

#[async_trait]
impl AuditLog for MemoryStore {
    async fn record_command(&self, entry: CommandLogEntry) -> Result<()> {
        let mut state = self.state.lock();
        match state.commands.get_mut(&entry.request_id) {
            Some(existing) => existing.merge(entry),
            None => {
                state.commands.insert(entry.request_id.clone(), entry);
            }
        }
        Ok(())
    }

    async fn recent_commands(
        &self,
        device_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CommandLogEntry>> {
        let entries = self
            .state
            .lock()
            .commands
            .values()
            .filter(|e| device_id.map_or(true, |id| e.device_id == id))
            .cloned()
            .collect();
        Ok(order_recent(entries, limit))
    }
}

#[async_trait]
impl DeviceDirectory for MemoryStore {
    async fn command_channel(&self, device_id: &str) -> Result<String> {
        Ok(self
            .state
            .lock()
            .devices
            .get(device_id.trim())
            .map(|d| d.effective_channel().to_string())
            .unwrap_or_else(|| DEFAULT_COMMAND_CHANNEL.to_string()))
    }

    async fn upsert_device(&self, mut device: DeviceRecord) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(existing) = state.devices.get(&device.device_id) {
            device.created_at = existing.created_at;
        }
        state.devices.insert(device.device_id.clone(), device);
        Ok(())
    }

    async fn get_device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        Ok(self.state.lock().devices.get(device_id.trim()).cloned())
    }

    async fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        Ok(self.state.lock().devices.values().cloned().collect())
    }
}
