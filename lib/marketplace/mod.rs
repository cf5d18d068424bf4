//! Hosted marketplace Integration API: the events feed, listings and the token flow.

pub mod client;
pub mod error;
pub mod types;

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::warn;

pub use client::{
    GlobalRateLimiter, ListingQuery, MarketplaceClient, MarketplaceClientConfig, RateLimit,
    RateLimitConfig,
};
pub use error::MarketplaceError;
pub use types::ListingResource;

use crate::event_engine::{
    run_with_retry, EventPage, EventQuery, EventSource, RetryPolicy, SourceError,
};

/// Events feed for one script: the shared client plus the script's fixed event-type filter.
///
/// Retryable failures (throttling, 5xx, transport) are retried under `retry_policy` before
/// the poll loop sees them.
pub struct MarketplaceEventSource {
    client: Arc<MarketplaceClient>,
    event_types: Vec<String>,
    retry_policy: RetryPolicy,
}

impl MarketplaceEventSource {
    pub fn new(
        client: Arc<MarketplaceClient>,
        event_types: Vec<String>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            event_types,
            retry_policy,
        }
    }

    pub fn event_types(&self) -> &[String] {
        &self.event_types
    }
}

impl EventSource for MarketplaceEventSource {
    fn query_events<'a>(
        &'a self,
        query: &'a EventQuery,
    ) -> BoxFuture<'a, Result<EventPage, SourceError>> {
        Box::pin(async move {
            run_with_retry(
                &self.retry_policy,
                |attempt| async move {
                    self.client
                        .query_events(query, &self.event_types)
                        .await
                        .map_err(|err| {
                            warn!(
                                event = "events_query_failed",
                                attempt,
                                query = %query,
                                retryable = err.is_retryable(),
                                error = %err,
                                "events query failed"
                            );
                            err
                        })
                },
                MarketplaceError::is_retryable,
            )
            .await
            .map(|(page, _)| page)
            .map_err(|terminal| SourceError::from(terminal.error))
        })
    }
}
