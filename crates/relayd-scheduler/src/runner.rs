//! One scheduler tick.
//!
//! For every due schedule: window check, slot claim, dispatch, outcome
//! recording, cursor advance. Overlapping ticks are safe because a slot can
//! only be claimed once and the cursor only moves forward.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use relayd_commands::CommandDispatcher;
use relayd_core::{CommandEnvelope, SchedulerSettings};
use relayd_storage::{CommandLogEntry, CommandResult, RelaydStore, RunOutcome, ScheduleRecord};

use crate::recurrence::{next_slot_after, parse_timezone};
use crate::error::Result;
use crate::window::{local_minute_of_day, EnforcementWindow, WindowDecision};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Schedules loaded per tick
    pub due_limit: usize,
    /// Schedules handled concurrently
    pub concurrency: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        SchedulerSettings::default().into()
    }
}

impl From<SchedulerSettings> for RunnerConfig {
    fn from(settings: SchedulerSettings) -> Self {
        Self {
            due_limit: settings.due_limit.max(1),
            concurrency: settings.concurrency.max(1),
        }
    }
}

/// Counters for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    /// Slots dispatched successfully
    pub processed: usize,
    pub failed: usize,
    /// Window skips and slots already claimed by another tick
    pub skipped: usize,
}

impl TickSummary {
    pub fn total(&self) -> usize {
        self.processed + self.failed + self.skipped
    }
}

/// What happened to one due slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotOutcome {
    Dispatched,
    Failed(String),
    OutsideWindow,
    NotAligned,
    AlreadyClaimed,
}

pub struct ScheduleRunner {
    store: Arc<dyn RelaydStore>,
    dispatcher: CommandDispatcher,
    config: RunnerConfig,
}

impl ScheduleRunner {
    pub fn new(store: Arc<dyn RelaydStore>, dispatcher: CommandDispatcher) -> Self {
        Self {
            store,
            dispatcher,
            config: RunnerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Process every schedule due at `now`.
    ///
    /// A failing schedule is counted and logged; it never stops the others.
    pub async fn run_due_schedules(&self, now: DateTime<Utc>) -> Result<TickSummary> {
        let due = self.store.due_schedules(now, self.config.due_limit).await?;
        let mut summary = TickSummary::default();
        if due.is_empty() {
            return Ok(summary);
        }
        debug!(count = due.len(), "Due schedules loaded");

        for chunk in due.chunks(self.config.concurrency) {
            let results = join_all(chunk.iter().map(|schedule| self.run_slot(schedule))).await;
            for (schedule, result) in chunk.iter().zip(results) {
                match result {
                    Ok(SlotOutcome::Dispatched) => summary.processed += 1,
                    Ok(SlotOutcome::Failed(_)) => summary.failed += 1,
                    Ok(_) => summary.skipped += 1,
                    Err(e) => {
                        error!(
                            schedule_id = schedule.id,
                            planned_at = %schedule.next_run_at,
                            error = %e,
                            "Schedule slot could not be handled"
                        );
                        summary.failed += 1;
                    }
                }
            }
        }
        Ok(summary)
    }

    /// Handle the slot at `schedule.next_run_at`.
    pub async fn run_slot(&self, schedule: &ScheduleRecord) -> Result<SlotOutcome> {
        let planned_at = schedule.next_run_at;

        if let Some(window) = EnforcementWindow::from_schedule(schedule) {
            match parse_timezone(&schedule.timezone) {
                Ok(tz) => {
                    let minute = local_minute_of_day(planned_at, tz);
                    let decision = window.decide(minute);
                    if decision != WindowDecision::Execute {
                        debug!(
                            schedule_id = schedule.id,
                            planned_at = %planned_at,
                            local_minute = minute,
                            decision = %decision,
                            "Slot skipped by window"
                        );
                        self.advance(schedule, None).await?;
                        return Ok(match decision {
                            WindowDecision::OutsideWindow => SlotOutcome::OutsideWindow,
                            _ => SlotOutcome::NotAligned,
                        });
                    }
                }
                Err(e) => {
                    warn!(schedule_id = schedule.id, error = %e, "Window check skipped");
                }
            }
        }

        if !self.store.claim_slot(schedule.id, planned_at).await? {
            debug!(
                schedule_id = schedule.id,
                planned_at = %planned_at,
                "Slot already claimed"
            );
            self.advance(schedule, None).await?;
            return Ok(SlotOutcome::AlreadyClaimed);
        }

        let request_id = format!("sch-{}-{}", schedule.id, planned_at.timestamp_millis());
        let published = self.publish(schedule, &request_id).await;
        let executed_at = Utc::now();

        let outcome = match published {
            Ok(()) => {
                self.store
                    .complete_run(
                        schedule.id,
                        planned_at,
                        RunOutcome::success(&request_id, executed_at),
                    )
                    .await?;
                let entry = CommandLogEntry::new(
                    &request_id,
                    &schedule.device_id,
                    schedule.action,
                    CommandResult::ScheduledSuccess,
                    executed_at,
                );
                if let Err(e) = self.store.record_command(entry).await {
                    warn!(request_id = %request_id, error = %e, "Audit write failed");
                }
                info!(
                    schedule_id = schedule.id,
                    planned_at = %planned_at,
                    device_id = %schedule.device_id,
                    action = %schedule.action,
                    "Scheduled command published"
                );
                SlotOutcome::Dispatched
            }
            Err(message) => {
                self.store
                    .complete_run(
                        schedule.id,
                        planned_at,
                        RunOutcome::failed(&request_id, executed_at, &message),
                    )
                    .await?;
                warn!(
                    schedule_id = schedule.id,
                    planned_at = %planned_at,
                    device_id = %schedule.device_id,
                    error = %message,
                    "Scheduled command failed"
                );
                SlotOutcome::Failed(message)
            }
        };

        self.advance(schedule, Some(executed_at)).await?;
        Ok(outcome)
    }

    async fn publish(
        &self,
        schedule: &ScheduleRecord,
        request_id: &str,
    ) -> std::result::Result<(), String> {
        let channel = self
            .store
            .command_channel(&schedule.device_id)
            .await
            .map_err(|e| e.to_string())?;
        let envelope = CommandEnvelope::new(&schedule.device_id, schedule.action, request_id)
            .with_channel(channel);
        self.dispatcher
            .dispatch(&envelope)
            .await
            .map_err(|e| e.to_string())
    }

    /// Move the cursor past this slot unless another tick already did.
    async fn advance(
        &self,
        schedule: &ScheduleRecord,
        last_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let planned_at = schedule.next_run_at;
        let next_run_at = next_slot_after(&schedule.cron_expr, &schedule.timezone, planned_at)?;
        let moved = self
            .store
            .advance_cursor(schedule.id, planned_at, next_run_at, last_run_at)
            .await?;
        if !moved {
            debug!(schedule_id = schedule.id, "Cursor already advanced");
        }
        Ok(())
    }
}
