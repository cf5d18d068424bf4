use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::batch::run_in_batches;
use super::error::{Error, HandlerError};
use super::source::{EventHandler, EventSource};
use super::types::{EventQuery, PollConfig};
use crate::checkpoint::CheckpointStore;
use crate::server::monitoring::{ScriptLabels, POLL_METRICS};

/// Result of one successful query + process + checkpoint iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationOutcome {
    pub fetched: usize,
    pub page_was_full: bool,
    /// Cursor for the next query, when this page advanced it.
    pub cursor: Option<u64>,
    /// Whether `cursor` reached the checkpoint store.
    pub committed: bool,
    /// Batches given up on under `continue_on_error`.
    pub isolated_failures: usize,
}

/// Cursor-driven poller for one named script.
///
/// Lifecycle: resolve the starting query from the checkpoint (or the construction time on a
/// cold start), then repeat poll -> process -> commit -> wait until cancelled. Iteration
/// failures are logged and retried after the idle wait; the checkpoint only moves after the
/// whole page has been handled, which gives at-least-once delivery.
pub struct PollLoop<S, H> {
    script_name: String,
    source: S,
    handler: Arc<H>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: PollConfig,
    started_at: DateTime<Utc>,
}

impl<S, H> PollLoop<S, H>
where
    S: EventSource,
    H: EventHandler + 'static,
{
    pub fn new(
        script_name: impl Into<String>,
        source: S,
        handler: H,
        checkpoints: Arc<dyn CheckpointStore>,
        config: PollConfig,
    ) -> Self {
        Self {
            script_name: script_name.into(),
            source,
            handler: Arc::new(handler),
            checkpoints,
            config,
            started_at: Utc::now(),
        }
    }

    /// Overrides the cold-start instant captured at construction.
    pub fn with_start_time(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    pub fn script_name(&self) -> &str {
        &self.script_name
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Resolves the first query: resume after the checkpoint, or cold-start from construction time.
    pub async fn initial_query(&self) -> EventQuery {
        if !self.config.checkpoint_enabled {
            return EventQuery::CreatedAtStart(self.started_at);
        }

        let store = Arc::clone(&self.checkpoints);
        let script_name = self.script_name.clone();
        let loaded = tokio::task::spawn_blocking(move || store.load(&script_name))
            .await
            .unwrap_or_else(|err| {
                warn!(
                    event = "checkpoint_load_join_failed",
                    script = %self.script_name,
                    error = %err,
                    "checkpoint load task failed; treating as cold start"
                );
                None
            });

        match loaded {
            Some(sequence_id) => EventQuery::StartAfter(sequence_id),
            None => EventQuery::CreatedAtStart(self.started_at),
        }
    }

    /// Queries one page, drives it through the batch runner and commits the new cursor.
    ///
    /// `operation_timeout` bounds the query and each batch handler call separately, so the
    /// inter-batch delays of a large page never count against it.
    pub async fn run_iteration(&self, query: &EventQuery) -> Result<IterationOutcome, Error> {
        let page = match self.config.operation_timeout {
            Some(limit) => tokio::time::timeout(limit, self.source.query_events(query))
                .await
                .map_err(|_| Error::OperationTimeout {
                    operation: "events query",
                    limit,
                })??,
            None => self.source.query_events(query).await?,
        };
        let fetched = page.events.len();
        let page_was_full = page.is_full();
        let labels = ScriptLabels::new(&self.script_name);

        debug!(
            event = "poll_page_received",
            script = %self.script_name,
            query = %query,
            fetched,
            per_page = page.per_page,
            page_was_full,
            "received events page"
        );
        if let Some(metrics) = POLL_METRICS.get() {
            metrics.pages_total.get_or_create(&labels).inc();
            metrics.events_total.get_or_create(&labels).inc_by(fetched as u64);
        }

        if fetched > 0 && self.handler.handles_groups() {
            self.spawn_group_handler(page.events.clone());
        }

        let handler = &self.handler;
        let script_name = self.script_name.as_str();
        let batch_timeout = self.config.operation_timeout;
        let report = run_in_batches(&page.events, &self.config.batch, |batch, label| async move {
            debug!(
                event = "poll_batch_started",
                script = script_name,
                batch = %label,
                "processing batch"
            );
            match batch_timeout {
                Some(limit) => tokio::time::timeout(limit, handler.handle_batch(batch, &label))
                    .await
                    .unwrap_or_else(|_| {
                        Err(HandlerError::retryable(format!(
                            "batch handler exceeded {limit:?}"
                        )))
                    }),
                None => handler.handle_batch(batch, &label).await,
            }
        })
        .await
        .map_err(|failure| {
            if let Some(metrics) = POLL_METRICS.get() {
                metrics.batch_failures_total.get_or_create(&labels).inc();
            }
            Error::Batch {
                label: failure.label.to_string(),
                source: failure.error,
            }
        })?;

        if !report.is_clean() {
            if let Some(metrics) = POLL_METRICS.get() {
                metrics
                    .batch_failures_total
                    .get_or_create(&labels)
                    .inc_by(report.failures.len() as u64);
            }
        }

        let Some(last_sequence_id) = page.last_sequence_id() else {
            return Ok(IterationOutcome {
                fetched,
                page_was_full,
                cursor: None,
                committed: false,
                isolated_failures: report.failures.len(),
            });
        };

        // Never move the cursor backwards, even if the source misorders a page.
        let cursor = query
            .start_after()
            .map_or(last_sequence_id, |current| current.max(last_sequence_id));
        let committed = self.commit(cursor).await;

        Ok(IterationOutcome {
            fetched,
            page_was_full,
            cursor: Some(cursor),
            committed,
            isolated_failures: report.failures.len(),
        })
    }

    /// Polls until `cancel` fires. The token is checked before every reschedule; an
    /// in-flight iteration always runs to completion.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut query = self.initial_query().await;
        match query {
            EventQuery::StartAfter(sequence_id) => info!(
                event = "poll_resuming",
                script = %self.script_name,
                sequence_id,
                "resuming event polling after last processed sequence id"
            ),
            EventQuery::CreatedAtStart(start) => info!(
                event = "poll_cold_start",
                script = %self.script_name,
                created_at_start = %start.to_rfc3339(),
                "no checkpoint found; polling events created from now on"
            ),
        }

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let delay = match self.run_iteration(&query).await {
                Ok(outcome) => {
                    if let Some(cursor) = outcome.cursor {
                        query = EventQuery::StartAfter(cursor);
                    }
                    if outcome.fetched > 0 {
                        info!(
                            event = "poll_iteration_complete",
                            script = %self.script_name,
                            fetched = outcome.fetched,
                            cursor = ?outcome.cursor,
                            committed = outcome.committed,
                            isolated_failures = outcome.isolated_failures,
                            "processed events page"
                        );
                    }
                    self.config.next_delay(outcome.page_was_full)
                }
                Err(err) => {
                    error!(
                        event = "poll_iteration_failed",
                        script = %self.script_name,
                        query = %query,
                        error = %err,
                        retry_after_ms = self.config.idle_wait.as_millis() as u64,
                        "poll iteration failed; checkpoint not advanced"
                    );
                    if let Some(metrics) = POLL_METRICS.get() {
                        metrics
                            .iteration_failures_total
                            .get_or_create(&ScriptLabels::new(&self.script_name))
                            .inc();
                    }
                    self.config.idle_wait
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(
            event = "poll_stopped",
            script = %self.script_name,
            "event polling stopped"
        );
    }

    async fn commit(&self, sequence_id: u64) -> bool {
        if !self.config.checkpoint_enabled {
            return false;
        }

        let store = Arc::clone(&self.checkpoints);
        let script_name = self.script_name.clone();
        let result = tokio::task::spawn_blocking(move || store.save(&script_name, sequence_id))
            .await
            .map_err(Error::from)
            .and_then(|saved| saved.map_err(Error::from));

        match result {
            Ok(()) => {
                if let Some(metrics) = POLL_METRICS.get() {
                    let labels = ScriptLabels::new(&self.script_name);
                    metrics.checkpoint_saves_total.get_or_create(&labels).inc();
                    metrics
                        .last_sequence_id
                        .get_or_create(&labels)
                        .set(i64::try_from(sequence_id).unwrap_or(i64::MAX));
                }
                true
            }
            Err(err) => {
                // The page was handled; the durable cursor lags until the next successful save.
                warn!(
                    event = "checkpoint_save_failed",
                    script = %self.script_name,
                    sequence_id,
                    error = %err,
                    "failed to persist checkpoint; a restart will replay this page"
                );
                false
            }
        }
    }

    fn spawn_group_handler(&self, events: Vec<super::types::Event>) {
        let handler = Arc::clone(&self.handler);
        let script_name = self.script_name.clone();
        tokio::spawn(async move {
            if let Err(err) = handler.handle_group(&events).await {
                warn!(
                    event = "group_handler_failed",
                    script = %script_name,
                    events = events.len(),
                    error = %err,
                    "group handler failed"
                );
            }
        });
    }
}

/// Type-erased poll loop, so one supervisor can own scripts with different sources/handlers.
pub trait PollTask: Send + Sync {
    fn script_name(&self) -> &str;

    fn run_until_cancelled(self: Arc<Self>, cancel: CancellationToken) -> BoxFuture<'static, ()>;
}

impl<S, H> PollTask for PollLoop<S, H>
where
    S: EventSource + 'static,
    H: EventHandler + 'static,
{
    fn script_name(&self) -> &str {
        &self.script_name
    }

    fn run_until_cancelled(self: Arc<Self>, cancel: CancellationToken) -> BoxFuture<'static, ()> {
        Box::pin(async move { self.run(cancel).await })
    }
}
