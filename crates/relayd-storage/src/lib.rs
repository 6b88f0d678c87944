//! Persistence for relayd.
//!
//! The scheduler and the command layer only see the traits in [`store`].
//! Two backends implement all of them:
//!
//! - [`MemoryStore`]: process-local, for tests and dry runs
//! - [`RedbStore`]: a single redb file

pub mod error;
pub mod memory;
pub mod records;
pub mod redb_store;
pub mod store;

pub use error::{Result, StorageError};
pub use memory::MemoryStore;
pub use records::{
    CommandLogEntry, CommandResult, DeviceRecord, NewSchedule, RunOutcome, RunStatus,
    ScheduleId, ScheduleRecord, ScheduleRun, DEFAULT_COMMAND_CHANNEL,
};
pub use redb_store::RedbStore;
pub use store::{AuditLog, DeviceDirectory, RelaydStore, RunLedger, ScheduleStore};
