use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::AddAssign;
use std::time::Duration;

/// One record from the marketplace events feed.
///
/// Only `sequence_id` is structural for the engine; everything else is passed through to
/// handlers untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub sequence_id: u64,
    pub resource_type: String,
    pub event_type: String,
    pub resource_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resource: serde_json::Value,
}

impl Event {
    pub fn matches(&self, resource_type: &str, event_type: &str) -> bool {
        self.resource_type == resource_type && self.event_type == event_type
    }
}

/// Where the next events query starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventQuery {
    /// Resume strictly after a previously processed sequence id.
    StartAfter(u64),
    /// Cold start: only events created at or after this instant.
    CreatedAtStart(DateTime<Utc>),
}

impl EventQuery {
    pub fn start_after(&self) -> Option<u64> {
        match self {
            Self::StartAfter(sequence_id) => Some(*sequence_id),
            Self::CreatedAtStart(_) => None,
        }
    }
}

impl fmt::Display for EventQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartAfter(sequence_id) => write!(f, "startAfterSequenceId={sequence_id}"),
            Self::CreatedAtStart(start) => write!(f, "createdAtStart={}", start.to_rfc3339()),
        }
    }
}

/// One query response worth of events, ordered ascending by `sequence_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPage {
    pub events: Vec<Event>,
    /// Page size the source was configured with, used for the full-page heuristic.
    pub per_page: usize,
}

impl EventPage {
    /// A full page is taken to mean more events are immediately available.
    ///
    /// This is an approximation: a final page that happens to be exactly `per_page` long
    /// causes one extra short-delay poll that comes back empty.
    pub fn is_full(&self) -> bool {
        self.per_page > 0 && self.events.len() >= self.per_page
    }

    pub fn last_sequence_id(&self) -> Option<u64> {
        self.events.last().map(|event| event.sequence_id)
    }
}

/// Chunking policy for the batch runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub batch_size: usize,
    /// Pause inserted between consecutive chunks, never after the last one.
    pub inter_batch_delay: Duration,
    /// `true` isolates chunk failures and keeps going; `false` aborts on the first failure.
    pub continue_on_error: bool,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            batch_size: 5,
            inter_batch_delay: Duration::from_secs(90),
            continue_on_error: false,
        }
    }
}

/// Delay schedule between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDelay {
    /// Same delay after every failed attempt.
    Fixed(Duration),
    /// `attempt * step` after the n-th failed attempt.
    Linear(Duration),
}

impl RetryDelay {
    pub fn after_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Linear(step) => step.saturating_mul(attempt),
        }
    }
}

/// Retry configuration. Not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub delay: RetryDelay,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay: RetryDelay::Fixed(delay),
        }
    }

    pub fn linear(max_attempts: u32, step: Duration) -> Self {
        Self {
            max_attempts,
            delay: RetryDelay::Linear(step),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear(3, Duration::from_millis(1500))
    }
}

/// Per-script poll loop settings, resolved once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Wait after a full page, when a backlog is likely.
    pub active_wait: Duration,
    /// Wait after a partial or empty page, or after a failed iteration.
    pub idle_wait: Duration,
    pub checkpoint_enabled: bool,
    pub batch: BatchPolicy,
    /// Upper bound on the events query and on each batch handler call. Inter-batch delays
    /// are not counted.
    pub operation_timeout: Option<Duration>,
}

impl PollConfig {
    /// Picks the delay before the next poll from the shape of the page just processed.
    pub fn next_delay(&self, page_was_full: bool) -> Duration {
        if page_was_full {
            self.active_wait
        } else {
            self.idle_wait
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            active_wait: Duration::from_secs(3 * 60),
            idle_wait: Duration::from_secs(5 * 60),
            checkpoint_enabled: true,
            batch: BatchPolicy::default(),
            operation_timeout: None,
        }
    }
}

/// Counters accumulated by backfill sweeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub pages: u32,
    pub processed: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl AddAssign for SweepStats {
    fn add_assign(&mut self, other: Self) {
        self.pages = self.pages.saturating_add(other.pages);
        self.processed = self.processed.saturating_add(other.processed);
        self.updated = self.updated.saturating_add(other.updated);
        self.skipped = self.skipped.saturating_add(other.skipped);
        self.failed = self.failed.saturating_add(other.failed);
    }
}

/// What happened to a single item inside a backfill page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Updated,
    Skipped,
}
