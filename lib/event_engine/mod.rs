//! Polling and batch-processing core shared by every event script and backfill.
//!
//! The poll loop tails a cursor-ordered events feed and commits a per-script checkpoint
//! only after a page has been fully handled (at-least-once). Backfill sweeps walk a finite
//! page-numbered collection once. Both push work through the sequential batch runner.

pub mod batch;
pub mod error;
pub mod poll_loop;
pub mod retry;
pub mod source;
pub mod sweep;
pub mod types;

#[cfg(test)]
mod test_support;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use batch::{run_in_batches, BatchFailure, BatchLabel, BatchRunReport};
pub use error::{Error, FailureKind, HandlerError, SourceError};
pub use poll_loop::{IterationOutcome, PollLoop, PollTask};
pub use retry::{retry_all, run_with_retry, RetryTerminal};
pub use source::{EventHandler, EventSource, PageContext, PageProcessor, PageResult, PageSource};
pub use sweep::{process_items_isolated, BackfillSweep, SweepConfig, SweepHalt, SweepReport};
pub use types::{
    BatchPolicy, Event, EventPage, EventQuery, ItemOutcome, PollConfig, RetryDelay, RetryPolicy,
    SweepStats,
};

/// Runs every registered poll loop as its own task under one cancellation token.
///
/// A script whose task panics or returns before shutdown is restarted after
/// `restart_delay`; it resumes from its checkpoint. Other scripts are unaffected.
pub struct EventScriptSupervisor {
    tasks: Vec<Arc<dyn PollTask>>,
    restart_delay: Duration,
}

impl Default for EventScriptSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl EventScriptSupervisor {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            restart_delay: Duration::from_secs(5),
        }
    }

    pub fn with_restart_delay(mut self, restart_delay: Duration) -> Self {
        self.restart_delay = restart_delay;
        self
    }

    pub fn register<S, H>(&mut self, poll_loop: PollLoop<S, H>)
    where
        S: EventSource + 'static,
        H: EventHandler + 'static,
    {
        self.tasks.push(Arc::new(poll_loop));
    }

    pub fn script_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|task| task.script_name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Supervises until `cancel` fires and every script has finished its current iteration.
    pub async fn run(self, cancel: CancellationToken) {
        let mut scripts = JoinSet::new();
        for (script_idx, task) in self.tasks.iter().enumerate() {
            scripts.spawn(run_script(script_idx, Arc::clone(task), cancel.clone()));
        }
        info!(
            event = "supervisor_started",
            scripts = ?self.script_names(),
            "event scripts started"
        );

        while let Some(joined) = scripts.join_next().await {
            let (script_idx, panicked) = match joined {
                Ok(exit) => exit,
                Err(err) => {
                    error!(
                        event = "script_join_failed",
                        error = %err,
                        "event script task was aborted"
                    );
                    continue;
                }
            };
            let task = &self.tasks[script_idx];

            if cancel.is_cancelled() {
                info!(
                    event = "script_stopped",
                    script = task.script_name(),
                    "event script stopped"
                );
                continue;
            }

            if panicked {
                error!(
                    event = "script_panicked",
                    script = task.script_name(),
                    restart_after_ms = self.restart_delay.as_millis() as u64,
                    "event script panicked; restarting from its checkpoint"
                );
            } else {
                warn!(
                    event = "script_exited",
                    script = task.script_name(),
                    restart_after_ms = self.restart_delay.as_millis() as u64,
                    "event script exited unexpectedly; restarting"
                );
            }

            tokio::select! {
                _ = cancel.cancelled() => continue,
                _ = tokio::time::sleep(self.restart_delay) => {}
            }
            scripts.spawn(run_script(script_idx, Arc::clone(task), cancel.clone()));
        }

        info!(event = "supervisor_stopped", "all event scripts stopped");
    }
}

async fn run_script(
    script_idx: usize,
    task: Arc<dyn PollTask>,
    cancel: CancellationToken,
) -> (usize, bool) {
    let panicked = AssertUnwindSafe(task.run_until_cancelled(cancel))
        .catch_unwind()
        .await
        .is_err();
    (script_idx, panicked)
}
