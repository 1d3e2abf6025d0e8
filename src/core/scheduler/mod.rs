//! Cron-driven task scheduler.
//!
//! Tasks live as JSON files and are re-read on every tick. A due task is
//! claimed by writing `lastRun` back to its file *before* its action is
//! spawned, so a crash or a concurrent tick can never run it twice in the
//! same minute.

pub mod action;
pub mod cron;
pub mod task;

pub use action::{ActionContext, ActionOutcome, SCHEDULER_CHANNEL, run_action};
pub use cron::{is_due, is_due_in, next_run_time, parse_schedule, parse_timezone};
pub use task::{LoadedTasks, ReplyTo, Task, TaskAction, load_tasks};

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// A spawned action, labelled with its task name.
pub struct ActionHandle {
    pub task: String,
    pub handle: JoinHandle<ActionOutcome>,
}

#[derive(Default)]
pub struct TickReport {
    pub executed: usize,
    pub skipped: usize,
    pub errors: usize,
    pub handles: Vec<ActionHandle>,
}

impl TickReport {
    /// Wait for every spawned action and log how it ended.
    pub async fn log_completions(handles: Vec<ActionHandle>) {
        for ActionHandle { task, handle } in handles {
            match handle.await {
                Ok(ActionOutcome::Failed { error }) => {
                    warn!("[scheduler] Task '{}' failed: {}", task, error)
                }
                Ok(outcome) => info!("[scheduler] Task '{}' {}", task, outcome),
                Err(e) => error!("[scheduler] Task '{}' panicked: {}", task, e),
            }
        }
    }
}

pub struct Scheduler {
    tasks_dir: PathBuf,
    ctx: ActionContext,
}

impl Scheduler {
    pub fn new(tasks_dir: impl Into<PathBuf>, ctx: ActionContext) -> Self {
        Self {
            tasks_dir: tasks_dir.into(),
            ctx,
        }
    }

    pub fn tasks_dir(&self) -> &Path {
        &self.tasks_dir
    }

    /// Claim and spawn every enabled task due at `now`. Does not wait for
    /// the actions themselves.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let loaded = match load_tasks(&self.tasks_dir).await {
            Ok(loaded) => loaded,
            Err(e) => {
                error!("[scheduler] Failed to load tasks: {}", e);
                report.errors += 1;
                return report;
            }
        };
        report.errors += loaded.error_count;

        for mut task in loaded.tasks {
            if !task.enabled {
                report.skipped += 1;
                continue;
            }
            match is_due_in(&task.schedule, task.tz(), task.last_run, now) {
                Ok(true) => {}
                Ok(false) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!("[scheduler] Task '{}': {}", task.name, e);
                    report.errors += 1;
                    continue;
                }
            }

            task.last_run = Some(now);
            if let Err(e) = task.persist().await {
                error!(
                    "[scheduler] Not running '{}', could not record lastRun: {}",
                    task.name, e
                );
                report.errors += 1;
                continue;
            }

            info!(
                "[scheduler] Running task '{}' ({})",
                task.name,
                task.action.kind()
            );
            let ctx = self.ctx.clone();
            let name = task.name.clone();
            let handle = tokio::spawn(async move { run_action(&task, &ctx).await });
            report.handles.push(ActionHandle { task: name, handle });
            report.executed += 1;
        }
        report
    }
}

#[cfg(test)]
mod tests;
