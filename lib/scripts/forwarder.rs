use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::catalog::ScriptDefinition;
use crate::event_engine::{
    run_with_retry, BatchLabel, Event, EventHandler, HandlerError, RetryPolicy,
};

/// Page-level notification sent by scripts with `page_summary` set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageSummary {
    pub count: usize,
    pub first_sequence_id: u64,
    pub last_sequence_id: u64,
}

impl PageSummary {
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a Event>) -> Option<Self> {
        let mut summary: Option<Self> = None;
        for event in events {
            let current = summary.get_or_insert(Self {
                count: 0,
                first_sequence_id: event.sequence_id,
                last_sequence_id: event.sequence_id,
            });
            current.count += 1;
            current.first_sequence_id = current.first_sequence_id.min(event.sequence_id);
            current.last_sequence_id = current.last_sequence_id.max(event.sequence_id);
        }
        summary
    }
}

/// Downstream sink for script events. Deliveries must be idempotent: the poll loop may
/// replay a batch after a crash.
pub trait Forwarder: Send + Sync {
    fn forward_event<'a>(
        &'a self,
        script: &'a str,
        event: &'a Event,
    ) -> BoxFuture<'a, Result<(), HandlerError>>;

    fn forward_summary<'a>(
        &'a self,
        script: &'a str,
        summary: &'a PageSummary,
    ) -> BoxFuture<'a, Result<(), HandlerError>>;
}

impl<T> Forwarder for Arc<T>
where
    T: Forwarder + ?Sized,
{
    fn forward_event<'a>(
        &'a self,
        script: &'a str,
        event: &'a Event,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        (**self).forward_event(script, event)
    }

    fn forward_summary<'a>(
        &'a self,
        script: &'a str,
        summary: &'a PageSummary,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        (**self).forward_summary(script, summary)
    }
}

/// POSTs events to `{sink_url}/{script}` and summaries to `{sink_url}/{script}/summary`.
pub struct WebhookForwarder {
    http: reqwest::Client,
    sink_url: String,
}

impl WebhookForwarder {
    pub fn new(sink_url: &str, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(request_timeout).build()?,
            sink_url: sink_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<(), HandlerError> {
        let url = format!("{}/{path}", self.sink_url);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|err| {
                let message = format!("webhook request to {url} failed: {err}");
                if err.is_builder() {
                    HandlerError::fatal(message)
                } else {
                    HandlerError::retryable(message)
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let message = format!("webhook {url} answered {}", status.as_u16());
        if status.as_u16() == 429 || status.is_server_error() {
            Err(HandlerError::retryable(message))
        } else {
            Err(HandlerError::fatal(message))
        }
    }
}

impl Forwarder for WebhookForwarder {
    fn forward_event<'a>(
        &'a self,
        script: &'a str,
        event: &'a Event,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            self.post(script, &json!({ "script": script, "event": event }))
                .await
        })
    }

    fn forward_summary<'a>(
        &'a self,
        script: &'a str,
        summary: &'a PageSummary,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            self.post(
                &format!("{script}/summary"),
                &json!({ "script": script, "summary": summary }),
            )
            .await
        })
    }
}

/// Dry-run sink used when no webhook is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingForwarder;

impl Forwarder for LoggingForwarder {
    fn forward_event<'a>(
        &'a self,
        script: &'a str,
        event: &'a Event,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            info!(
                event = "script_event_dry_run",
                script,
                sequence_id = event.sequence_id,
                event_type = %event.event_type,
                resource_id = %event.resource_id,
                "event received (no sink configured)"
            );
            Ok(())
        })
    }

    fn forward_summary<'a>(
        &'a self,
        script: &'a str,
        summary: &'a PageSummary,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            info!(
                event = "script_summary_dry_run",
                script,
                count = summary.count,
                first_sequence_id = summary.first_sequence_id,
                last_sequence_id = summary.last_sequence_id,
                "page summary (no sink configured)"
            );
            Ok(())
        })
    }
}

/// Event handler for one catalog script: filters events and forwards each one, retrying
/// retryable delivery failures.
pub struct ScriptHandler<F> {
    definition: &'static ScriptDefinition,
    forwarder: F,
    retry_policy: RetryPolicy,
}

impl<F: Forwarder> ScriptHandler<F> {
    pub fn new(definition: &'static ScriptDefinition, forwarder: F, retry_policy: RetryPolicy) -> Self {
        Self {
            definition,
            forwarder,
            retry_policy,
        }
    }

    pub fn definition(&self) -> &'static ScriptDefinition {
        self.definition
    }

    fn relevant<'a>(&self, events: &'a [Event]) -> Vec<&'a Event> {
        events
            .iter()
            .filter(|event| self.definition.accepts(event))
            .collect()
    }

    async fn deliver(&self, event: &Event) -> Result<(), HandlerError> {
        let script = self.definition.name;
        run_with_retry(
            &self.retry_policy,
            |_| self.forwarder.forward_event(script, event),
            |err: &HandlerError| err.retryable,
        )
        .await
        .map(|_| ())
        .map_err(|terminal| {
            warn!(
                event = "script_delivery_failed",
                script,
                sequence_id = event.sequence_id,
                attempts = terminal.attempts,
                error = %terminal.error,
                "event delivery failed"
            );
            terminal.error
        })
    }
}

impl<F: Forwarder> EventHandler for ScriptHandler<F> {
    fn handle_batch<'a>(
        &'a self,
        events: &'a [Event],
        label: &'a BatchLabel,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            let relevant = self.relevant(events);
            if relevant.is_empty() {
                debug!(
                    event = "script_batch_filtered",
                    script = self.definition.name,
                    batch = %label,
                    "no matching events in batch"
                );
                return Ok(());
            }

            let results = join_all(relevant.iter().map(|event| self.deliver(event))).await;
            let failures: Vec<HandlerError> = results.into_iter().filter_map(Result::err).collect();
            if failures.is_empty() {
                return Ok(());
            }

            let message = format!(
                "{} of {} deliveries failed in {label}",
                failures.len(),
                relevant.len()
            );
            if failures.iter().any(|failure| failure.retryable) {
                Err(HandlerError::retryable(message))
            } else {
                Err(HandlerError::fatal(message))
            }
        })
    }

    fn handles_groups(&self) -> bool {
        self.definition.page_summary
    }

    fn handle_group<'a>(&'a self, events: &'a [Event]) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            let Some(summary) = PageSummary::from_events(self.relevant(events)) else {
                return Ok(());
            };
            let script = self.definition.name;
            run_with_retry(
                &self.retry_policy,
                |_| self.forwarder.forward_summary(script, &summary),
                |err: &HandlerError| err.retryable,
            )
            .await
            .map(|_| ())
            .map_err(|terminal| terminal.error)
        })
    }
}
