use crate::build_info;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use prometheus_client::registry::Registry;
use tokio::sync::OnceCell;

/// Registers immutable build metadata for `/metrics` scraping.
///
/// Encoded as a labeled gauge with value `1` so the build labels survive text exposition.
pub fn register_build_info_metric(registry: &mut Registry, prefix: &str) {
    let build_info_metric = Family::<BuildInfoLabels, Gauge>::default();
    build_info_metric
        .get_or_create(&BuildInfoLabels {
            service: "marketplace_event_worker",
            version: build_info::VERSION,
            commit: build_info::short_commit_hash(),
        })
        .set(1);
    let sub_registry = registry.sub_registry_with_prefix(prefix);
    sub_registry.register(
        "build_info",
        "Build identity labels for this process",
        build_info_metric,
    );
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct BuildInfoLabels {
    service: &'static str,
    version: &'static str,
    commit: &'static str,
}

/// Per-script label set shared by the poll and sweep metric families.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ScriptLabels {
    pub script: String,
}

impl ScriptLabels {
    pub fn new(script: &str) -> Self {
        Self {
            script: script.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct PollMetrics {
    /// Event pages returned by the source.
    pub pages_total: Family<ScriptLabels, Counter>,
    /// Events received across all pages.
    pub events_total: Family<ScriptLabels, Counter>,
    /// Batches whose handler failed, aborted or isolated.
    pub batch_failures_total: Family<ScriptLabels, Counter>,
    /// Iterations that ended in an error and were rescheduled on the idle wait.
    pub iteration_failures_total: Family<ScriptLabels, Counter>,
    /// Successful checkpoint writes.
    pub checkpoint_saves_total: Family<ScriptLabels, Counter>,
    /// Last sequence id durably checkpointed.
    pub last_sequence_id: Family<ScriptLabels, Gauge>,
}

impl PollMetrics {
    fn init() -> Self {
        Self {
            pages_total: Family::default(),
            events_total: Family::default(),
            batch_failures_total: Family::default(),
            iteration_failures_total: Family::default(),
            checkpoint_saves_total: Family::default(),
            last_sequence_id: Family::default(),
        }
    }

    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::init();
        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "pages",
            "Total number of event pages received per script",
            metrics.pages_total.clone(),
        );
        sub_registry.register(
            "events",
            "Total number of events received per script",
            metrics.events_total.clone(),
        );
        sub_registry.register(
            "batch_failures",
            "Total number of failed event batches per script",
            metrics.batch_failures_total.clone(),
        );
        sub_registry.register(
            "iteration_failures",
            "Total number of failed poll iterations per script",
            metrics.iteration_failures_total.clone(),
        );
        sub_registry.register(
            "checkpoint_saves",
            "Total number of checkpoint writes per script",
            metrics.checkpoint_saves_total.clone(),
        );
        sub_registry.register(
            "last_sequence_id",
            "Last event sequence id checkpointed per script",
            metrics.last_sequence_id.clone(),
        );
        metrics
    }
}

pub static POLL_METRICS: OnceCell<PollMetrics> = OnceCell::const_new();

#[derive(Clone)]
pub struct SweepMetrics {
    pub pages_total: Family<ScriptLabels, Counter>,
    pub items_updated_total: Family<ScriptLabels, Counter>,
    pub items_skipped_total: Family<ScriptLabels, Counter>,
    pub items_failed_total: Family<ScriptLabels, Counter>,
    /// Marker gauge: 1 while a sweep for the script is running, else 0.
    pub running: Family<ScriptLabels, Gauge>,
}

impl SweepMetrics {
    fn init() -> Self {
        Self {
            pages_total: Family::default(),
            items_updated_total: Family::default(),
            items_skipped_total: Family::default(),
            items_failed_total: Family::default(),
            running: Family::default(),
        }
    }

    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::init();
        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "pages",
            "Total number of backfill pages completed",
            metrics.pages_total.clone(),
        );
        sub_registry.register(
            "items_updated",
            "Total number of backfill items updated",
            metrics.items_updated_total.clone(),
        );
        sub_registry.register(
            "items_skipped",
            "Total number of backfill items left unchanged",
            metrics.items_skipped_total.clone(),
        );
        sub_registry.register(
            "items_failed",
            "Total number of backfill items that failed",
            metrics.items_failed_total.clone(),
        );
        sub_registry.register(
            "running",
            "Marker gauge: 1 while a backfill sweep is running, else 0",
            metrics.running.clone(),
        );
        metrics
    }
}

pub static SWEEP_METRICS: OnceCell<SweepMetrics> = OnceCell::const_new();

/// Registers every metric family on `registry`. Safe to call more than once; the statics
/// are only initialized by the first caller.
pub async fn register_all(registry: &mut Registry) {
    POLL_METRICS
        .get_or_init(|| async { PollMetrics::register(registry, "poll") })
        .await;
    SWEEP_METRICS
        .get_or_init(|| async { SweepMetrics::register(registry, "sweep") })
        .await;
    register_build_info_metric(registry, "worker");
}
