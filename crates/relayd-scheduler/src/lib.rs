//! Cron scheduling for relay commands.
//!
//! - [`recurrence`]: timezone-aware next-occurrence evaluation
//! - [`window`]: enforcement windows that repeat an action across a time range
//! - [`draft`]: schedule validation and creation
//! - [`runner`]: one tick (claim, dispatch, record, advance)
//! - [`service`]: the periodic loop around the runner

pub mod draft;
pub mod error;
pub mod recurrence;
pub mod runner;
pub mod service;
pub mod window;

pub use draft::{create_schedule, set_schedule_enabled, ScheduleDraft};
pub use error::{Result, ScheduleError};
pub use recurrence::{
    compute_next_run_at, normalize_cron_expression, parse_timezone, preview_next_runs,
};
pub use runner::{RunnerConfig, ScheduleRunner, SlotOutcome, TickSummary};
pub use service::SchedulerService;
pub use window::{EnforcementWindow, WindowDecision};
