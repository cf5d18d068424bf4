use std::sync::Arc;

use futures::future::BoxFuture;

use super::batch::BatchLabel;
use super::error::{HandlerError, SourceError};
use super::types::{Event, EventPage, EventQuery, SweepStats};

/// Queries the paginated events feed by cursor or by creation time.
///
/// Implemented by the marketplace client adapter in production and by scripted fakes in tests.
pub trait EventSource: Send + Sync {
    fn query_events<'a>(
        &'a self,
        query: &'a EventQuery,
    ) -> BoxFuture<'a, Result<EventPage, SourceError>>;
}

impl<T> EventSource for Arc<T>
where
    T: EventSource + ?Sized,
{
    fn query_events<'a>(
        &'a self,
        query: &'a EventQuery,
    ) -> BoxFuture<'a, Result<EventPage, SourceError>> {
        (**self).query_events(query)
    }
}

/// Per-script sink for polled events.
///
/// Handlers must tolerate duplicate delivery: a crash between a successful batch and the
/// checkpoint write replays that batch on restart.
pub trait EventHandler: Send + Sync {
    fn handle_batch<'a>(
        &'a self,
        events: &'a [Event],
        label: &'a BatchLabel,
    ) -> BoxFuture<'a, Result<(), HandlerError>>;

    /// Whether `handle_group` should be invoked once per non-empty page.
    fn handles_groups(&self) -> bool {
        false
    }

    /// Page-level notification. Runs detached from the poll loop; failures are only logged.
    fn handle_group<'a>(&'a self, _events: &'a [Event]) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async { Ok(()) })
    }
}

impl<T> EventHandler for Arc<T>
where
    T: EventHandler + ?Sized,
{
    fn handle_batch<'a>(
        &'a self,
        events: &'a [Event],
        label: &'a BatchLabel,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        (**self).handle_batch(events, label)
    }

    fn handles_groups(&self) -> bool {
        (**self).handles_groups()
    }

    fn handle_group<'a>(&'a self, events: &'a [Event]) -> BoxFuture<'a, Result<(), HandlerError>> {
        (**self).handle_group(events)
    }
}

/// One page of a finite, page-numbered collection.
#[derive(Debug, Clone, PartialEq)]
pub struct PageResult<T> {
    pub items: Vec<T>,
    pub total_pages: u32,
}

/// Page-numbered collection queried by backfill sweeps. Pages are 1-based.
pub trait PageSource<T>: Send + Sync {
    fn query_page<'a>(&'a self, page: u32) -> BoxFuture<'a, Result<PageResult<T>, SourceError>>;

    /// Looks up one item by id for targeted re-runs.
    fn fetch_one<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<T>, SourceError>>;
}

impl<T, S> PageSource<T> for Arc<S>
where
    S: PageSource<T> + ?Sized,
{
    fn query_page<'a>(&'a self, page: u32) -> BoxFuture<'a, Result<PageResult<T>, SourceError>> {
        (**self).query_page(page)
    }

    fn fetch_one<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<T>, SourceError>> {
        (**self).fetch_one(id)
    }
}

/// Position of a page within its sweep, for progress logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageContext {
    pub page: u32,
    pub total_pages: u32,
}

/// Processes one backfill page and reports what it did.
///
/// Item-level failures are counted in the returned stats rather than surfaced as errors.
pub trait PageProcessor<T>: Send + Sync {
    fn process_page<'a>(&'a self, items: &'a [T], context: PageContext) -> BoxFuture<'a, SweepStats>;
}

impl<T, P> PageProcessor<T> for Arc<P>
where
    P: PageProcessor<T> + ?Sized,
{
    fn process_page<'a>(&'a self, items: &'a [T], context: PageContext) -> BoxFuture<'a, SweepStats> {
        (**self).process_page(items, context)
    }
}
