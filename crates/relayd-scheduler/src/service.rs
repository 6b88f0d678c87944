//! Periodic scheduler loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::runner::ScheduleRunner;

/// Triggers [`ScheduleRunner::run_due_schedules`] on a fixed interval.
///
/// Every tick runs in its own task, so a slow tick does not delay the next
/// one. The slot claim keeps overlapping ticks from dispatching twice.
pub struct SchedulerService {
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerService {
    /// Spawn the loop. The first tick fires immediately.
    pub fn start(runner: Arc<ScheduleRunner>, period: Duration) -> Self {
        let (shutdown, mut stopped) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut ticks = JoinSet::new();

            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = ticker.tick() => {
                        let runner = runner.clone();
                        ticks.spawn(async move {
                            match runner.run_due_schedules(Utc::now()).await {
                                Ok(summary) if summary.total() > 0 => info!(
                                    processed = summary.processed,
                                    failed = summary.failed,
                                    skipped = summary.skipped,
                                    "Scheduler tick finished"
                                ),
                                Ok(_) => debug!("Scheduler tick found nothing due"),
                                Err(e) => error!(error = %e, "Scheduler tick failed"),
                            }
                        });
                    }
                    Some(_) = ticks.join_next(), if !ticks.is_empty() => {}
                }
            }

            // Let running ticks record their outcomes.
            while ticks.join_next().await.is_some() {}
            info!("Scheduler stopped");
        });

        info!(interval_ms = period.as_millis() as u64, "Scheduler started");
        Self {
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stop ticking and wait for ticks in progress.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Scheduler task ended abnormally");
            }
        }
    }
}
