//! Durable store backed by a single redb file.
//!
//! Records are stored as JSON. Runs are keyed by `(schedule_id, planned_at_ms)`
//! so the slot claim is a plain insert-if-absent inside one write
//! transaction. redb serializes write transactions, which makes claims and
//! conditional cursor updates atomic across concurrent ticks.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::error::{Result, StorageError};
use crate::records::{
    order_due, order_recent, CommandLogEntry, DeviceRecord, NewSchedule, RunOutcome, ScheduleId,
    ScheduleRecord, ScheduleRun, DEFAULT_COMMAND_CHANNEL,
};
use crate::store::{AuditLog, DeviceDirectory, RunLedger, ScheduleStore};

// Schedules: key = schedule id, value = ScheduleRecord (JSON)
const SCHEDULES_TABLE: TableDefinition<u64, &str> = TableDefinition::new("schedules");

// Runs: key = (schedule id, planned_at millis), value = ScheduleRun (JSON)
const RUNS_TABLE: TableDefinition<(u64, i64), &str> = TableDefinition::new("schedule_runs");

// Audit log: key = request id, value = CommandLogEntry (JSON)
const COMMANDS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("command_logs");

// Devices: key = device id, value = DeviceRecord (JSON)
const DEVICES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("devices");

// Counters: key = name, value = last issued id
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");

const SCHEDULE_SEQ_KEY: &str = "schedule_seq";

/// redb-backed implementation of every store contract.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
    path: PathBuf,
}

impl RedbStore {
    /// Open or create the database, creating parent directories and tables.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Database::create(path)?;
        let write_txn = db.begin_write()?;
        {
            let _schedules = write_txn.open_table(SCHEDULES_TABLE)?;
            let _runs = write_txn.open_table(RUNS_TABLE)?;
            let _commands = write_txn.open_table(COMMANDS_TABLE)?;
            let _devices = write_txn.open_table(DEVICES_TABLE)?;
            let _meta = write_txn.open_table(META_TABLE)?;
        }
        write_txn.commit()?;

        info!(path = %path.display(), "Opened redb store");
        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a blocking database closure off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }
}

fn decode<T: DeserializeOwned>(json: &str) -> Result<T> {
    Ok(serde_json::from_str(json)?)
}

/// Decode every value, skipping corrupt rows with a warning.
fn decode_lenient<T: DeserializeOwned>(table: &str, json: &str) -> Option<T> {
    match serde_json::from_str(json) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(table, error = %e, "Skipping undecodable row");
            None
        }
    }
}

fn read_schedules(db: &Database) -> Result<Vec<ScheduleRecord>> {
    let read_txn = db.begin_read()?;
    let table = read_txn.open_table(SCHEDULES_TABLE)?;
    let mut schedules = Vec::new();
    for row in table.iter()? {
        let (_id, value) = row?;
        if let Some(schedule) = decode_lenient("schedules", value.value()) {
            schedules.push(schedule);
        }
    }
    Ok(schedules)
}

#[async_trait]
impl ScheduleStore for RedbStore {
    async fn insert_schedule(&self, schedule: NewSchedule) -> Result<ScheduleRecord> {
        self.blocking(move |db| {
            let write_txn = db.begin_write()?;
            let record = {
                let mut meta = write_txn.open_table(META_TABLE)?;
                let last = meta.get(SCHEDULE_SEQ_KEY)?.map(|v| v.value()).unwrap_or(0);
                let id = last + 1;
                meta.insert(SCHEDULE_SEQ_KEY, id)?;

                let record = schedule.into_record(id, Utc::now());
                let json = serde_json::to_string(&record)?;
                let mut table = write_txn.open_table(SCHEDULES_TABLE)?;
                table.insert(id, json.as_str())?;
                record
            };
            write_txn.commit()?;
            Ok(record)
        })
        .await
    }

    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<ScheduleRecord>> {
        self.blocking(move |db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(SCHEDULES_TABLE)?;
            match table.get(id)? {
                Some(value) => Ok(Some(decode(value.value())?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduleRecord>> {
        self.blocking(read_schedules).await
    }

    async fn update_schedule(&self, schedule: &ScheduleRecord) -> Result<()> {
        let schedule = schedule.clone();
        self.blocking(move |db| {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(SCHEDULES_TABLE)?;
                if table.get(schedule.id)?.is_none() {
                    return Err(StorageError::NotFound(format!("schedule {}", schedule.id)));
                }
                let json = serde_json::to_string(&schedule)?;
                table.insert(schedule.id, json.as_str())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn delete_schedule(&self, id: ScheduleId) -> Result<bool> {
        self.blocking(move |db| {
            let write_txn = db.begin_write()?;
            let deleted = {
                let mut table = write_txn.open_table(SCHEDULES_TABLE)?;
                let removed = table.remove(id)?.is_some();
                removed
            };
            write_txn.commit()?;
            Ok(deleted)
        })
        .await
    }

    async fn due_schedules(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduleRecord>> {
        self.blocking(move |db| {
            let due = read_schedules(db)?
                .into_iter()
                .filter(|s| s.is_due(now))
                .collect();
            Ok(order_due(due, limit))
        })
        .await
    }

    async fn advance_cursor(
        &self,
        id: ScheduleId,
        planned_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
        last_run_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        self.blocking(move |db| {
            let write_txn = db.begin_write()?;
            let advanced = {
                let mut table = write_txn.open_table(SCHEDULES_TABLE)?;
                let stored = table.get(id)?.map(|v| v.value().to_string());
                match stored {
                    None => false,
                    Some(json) => {
                        let mut schedule: ScheduleRecord = decode(&json)?;
                        if schedule.next_run_at > planned_at {
                            false
                        } else {
                            schedule.next_run_at = next_run_at;
                            if last_run_at.is_some() {
                                schedule.last_run_at = last_run_at;
                            }
                            schedule.updated_at = Utc::now();
                            let json = serde_json::to_string(&schedule)?;
                            table.insert(id, json.as_str())?;
                            true
                        }
                    }
                }
            };
            write_txn.commit()?;
            Ok(advanced)
        })
        .await
    }
}

#[async_trait]
impl RunLedger for RedbStore {
    async fn claim_slot(&self, schedule_id: ScheduleId, planned_at: DateTime<Utc>) -> Result<bool> {
        self.blocking(move |db| {
            let key = (schedule_id, planned_at.timestamp_millis());
            let write_txn = db.begin_write()?;
            let claimed = {
                let mut table = write_txn.open_table(RUNS_TABLE)?;
                if table.get(key)?.is_some() {
                    false
                } else {
                    let run = ScheduleRun::claimed(schedule_id, planned_at, Utc::now());
                    let json = serde_json::to_string(&run)?;
                    table.insert(key, json.as_str())?;
                    true
                }
            };
            write_txn.commit()?;
            Ok(claimed)
        })
        .await
    }

    async fn complete_run(
        &self,
        schedule_id: ScheduleId,
        planned_at: DateTime<Utc>,
        outcome: RunOutcome,
    ) -> Result<()> {
        self.blocking(move |db| {
            let key = (schedule_id, planned_at.timestamp_millis());
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(RUNS_TABLE)?;
                let stored = table.get(key)?.map(|v| v.value().to_string());
                let Some(json) = stored else {
                    return Err(StorageError::NotFound(format!(
                        "run {} at {}",
                        schedule_id, planned_at
                    )));
                };
                let mut run: ScheduleRun = decode(&json)?;
                run.apply(outcome);
                let json = serde_json::to_string(&run)?;
                table.insert(key, json.as_str())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn list_runs(&self, schedule_id: ScheduleId, limit: usize) -> Result<Vec<ScheduleRun>> {
        self.blocking(move |db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(RUNS_TABLE)?;
            let mut runs = Vec::new();
            for row in table
                .range((schedule_id, i64::MIN)..=(schedule_id, i64::MAX))?
                .rev()
            {
                if runs.len() >= limit {
                    break;
                }
                let (_key, value) = row?;
                if let Some(run) = decode_lenient("schedule_runs", value.value()) {
                    runs.push(run);
                }
            }
            Ok(runs)
        })
        .await
    }
}

#[async_trait]
impl AuditLog for RedbStore {
    async fn record_command(&self, entry: CommandLogEntry) -> Result<()> {
        self.blocking(move |db| {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(COMMANDS_TABLE)?;
                let stored = table
                    .get(entry.request_id.as_str())?
                    .map(|v| v.value().to_string());
                let merged = match stored {
                    Some(json) => {
                        let mut existing: CommandLogEntry = decode(&json)?;
                        existing.merge(entry);
                        existing
                    }
                    None => entry,
                };
                let json = serde_json::to_string(&merged)?;
                table.insert(merged.request_id.as_str(), json.as_str())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn recent_commands(
        &self,
        device_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CommandLogEntry>> {
        let device_id = device_id.map(str::to_string);
        self.blocking(move |db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(COMMANDS_TABLE)?;
            let mut entries = Vec::new();
            for row in table.iter()? {
                let (_key, value) = row?;
                let Some(entry) = decode_lenient::<CommandLogEntry>("command_logs", value.value())
                else {
                    continue;
                };
                if device_id.as_deref().map_or(true, |id| entry.device_id == id) {
                    entries.push(entry);
                }
            }
            Ok(order_recent(entries, limit))
        })
        .await
    }
}

#[async_trait]
impl DeviceDirectory for RedbStore {
    async fn command_channel(&self, device_id: &str) -> Result<String> {
        Ok(self
            .get_device(device_id)
            .await?
            .map(|d| d.effective_channel().to_string())
            .unwrap_or_else(|| DEFAULT_COMMAND_CHANNEL.to_string()))
    }

    async fn upsert_device(&self, mut device: DeviceRecord) -> Result<()> {
        self.blocking(move |db| {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(DEVICES_TABLE)?;
                let stored = table
                    .get(device.device_id.as_str())?
                    .map(|v| v.value().to_string());
                if let Some(json) = stored {
                    let existing: DeviceRecord = decode(&json)?;
                    device.created_at = existing.created_at;
                }
                let json = serde_json::to_string(&device)?;
                table.insert(device.device_id.as_str(), json.as_str())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        let device_id = device_id.trim().to_string();
        self.blocking(move |db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(DEVICES_TABLE)?;
            match table.get(device_id.as_str())? {
                Some(value) => Ok(Some(decode(value.value())?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        self.blocking(|db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(DEVICES_TABLE)?;
            let mut devices = Vec::new();
            for row in table.iter()? {
                let (_key, value) = row?;
                if let Some(device) = decode_lenient("devices", value.value()) {
                    devices.push(device);
                }
            }
            Ok(devices)
        })
        .await
    }
}
