use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use super::batch::BatchLabel;
use super::error::{HandlerError, SourceError};
use super::source::{EventHandler, EventSource};
use super::types::{BatchPolicy, Event, EventPage, EventQuery, PollConfig};
use crate::checkpoint::{CheckpointError, CheckpointStore};

pub(super) fn fixed_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0)
        .single()
        .expect("valid fixture timestamp")
}

pub(super) fn sample_event(sequence_id: u64) -> Event {
    Event {
        sequence_id,
        resource_type: "user".to_string(),
        event_type: "user/created".to_string(),
        resource_id: format!("user-{sequence_id}"),
        created_at: fixed_start(),
        resource: serde_json::json!({ "id": format!("user-{sequence_id}") }),
    }
}

pub(super) fn page_of(sequence_ids: impl IntoIterator<Item = u64>, per_page: usize) -> EventPage {
    EventPage {
        events: sequence_ids.into_iter().map(sample_event).collect(),
        per_page,
    }
}

pub(super) fn test_poll_config(batch_size: usize) -> PollConfig {
    PollConfig {
        active_wait: Duration::from_secs(180),
        idle_wait: Duration::from_secs(300),
        checkpoint_enabled: true,
        batch: BatchPolicy {
            batch_size,
            inter_batch_delay: Duration::ZERO,
            continue_on_error: false,
        },
        operation_timeout: None,
    }
}

/// Replays a fixed sequence of query results and records every query it sees. Once the
/// plan runs out it answers with empty pages.
#[derive(Default)]
pub(super) struct ScriptedEventSource {
    plan: Mutex<VecDeque<Result<EventPage, SourceError>>>,
    queries: Mutex<Vec<EventQuery>>,
    delay: Option<Duration>,
}

impl ScriptedEventSource {
    pub(super) fn with_plan(plan: Vec<Result<EventPage, SourceError>>) -> Self {
        Self {
            plan: Mutex::new(plan.into_iter().collect()),
            queries: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub(super) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(super) fn queries(&self) -> Vec<EventQuery> {
        self.queries
            .lock()
            .expect("queries mutex poisoned")
            .clone()
    }
}

impl EventSource for ScriptedEventSource {
    fn query_events<'a>(
        &'a self,
        query: &'a EventQuery,
    ) -> BoxFuture<'a, Result<EventPage, SourceError>> {
        Box::pin(async move {
            self.queries
                .lock()
                .expect("queries mutex poisoned")
                .push(*query);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.plan
                .lock()
                .expect("plan mutex poisoned")
                .pop_front()
                .unwrap_or_else(|| Ok(page_of(Vec::new(), 100)))
        })
    }
}

/// Records every delivered batch. Batches containing a sequence id listed in `fail_on`
/// fail, until `heal` is called.
#[derive(Default)]
pub(super) struct RecordingHandler {
    batches: Mutex<Vec<(BatchLabel, Vec<u64>)>>,
    fail_on: Mutex<Vec<u64>>,
    groups: Option<mpsc::UnboundedSender<Vec<u64>>>,
    fail_groups: bool,
    batch_delay: Option<Duration>,
}

impl RecordingHandler {
    pub(super) fn failing_on(sequence_ids: Vec<u64>) -> Self {
        Self {
            fail_on: Mutex::new(sequence_ids),
            ..Self::default()
        }
    }

    pub(super) fn with_groups(groups: mpsc::UnboundedSender<Vec<u64>>) -> Self {
        Self {
            groups: Some(groups),
            ..Self::default()
        }
    }

    /// Takes part in group handling but fails every group call.
    pub(super) fn with_failing_groups() -> Self {
        Self {
            fail_groups: true,
            ..Self::default()
        }
    }

    /// Every batch call sleeps for `delay` before it is recorded.
    pub(super) fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = Some(delay);
        self
    }

    pub(super) fn heal(&self) {
        self.fail_on.lock().expect("fail_on mutex poisoned").clear();
    }

    pub(super) fn delivered(&self) -> Vec<u64> {
        self.batches
            .lock()
            .expect("batches mutex poisoned")
            .iter()
            .flat_map(|(_, ids)| ids.clone())
            .collect()
    }

    pub(super) fn labels(&self) -> Vec<BatchLabel> {
        self.batches
            .lock()
            .expect("batches mutex poisoned")
            .iter()
            .map(|(label, _)| *label)
            .collect()
    }
}

impl EventHandler for RecordingHandler {
    fn handle_batch<'a>(
        &'a self,
        events: &'a [Event],
        label: &'a BatchLabel,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            if let Some(delay) = self.batch_delay {
                tokio::time::sleep(delay).await;
            }
            let ids: Vec<u64> = events.iter().map(|event| event.sequence_id).collect();
            let fail_on = self.fail_on.lock().expect("fail_on mutex poisoned").clone();
            if ids.iter().any(|id| fail_on.contains(id)) {
                return Err(HandlerError::retryable(format!("scripted failure for {ids:?}")));
            }
            self.batches
                .lock()
                .expect("batches mutex poisoned")
                .push((*label, ids));
            Ok(())
        })
    }

    fn handles_groups(&self) -> bool {
        self.groups.is_some() || self.fail_groups
    }

    fn handle_group<'a>(&'a self, events: &'a [Event]) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            if self.fail_groups {
                return Err(HandlerError::retryable("scripted group failure"));
            }
            if let Some(groups) = &self.groups {
                let ids = events.iter().map(|event| event.sequence_id).collect();
                groups
                    .send(ids)
                    .map_err(|err| HandlerError::fatal(err.to_string()))?;
            }
            Ok(())
        })
    }
}

/// Checkpoint store whose writes always fail.
pub(super) struct FailingCheckpointStore {
    pub(super) initial: Option<u64>,
}

impl CheckpointStore for FailingCheckpointStore {
    fn load(&self, _script_name: &str) -> Option<u64> {
        self.initial
    }

    fn save(&self, _script_name: &str, _sequence_id: u64) -> Result<(), CheckpointError> {
        Err(CheckpointError::Io {
            path: "/read-only/state".into(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
        })
    }
}
