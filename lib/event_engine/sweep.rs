use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::batch::run_in_batches;
use super::error::{Error, FailureKind, HandlerError, SourceError};
use super::source::{PageContext, PageProcessor, PageSource};
use super::types::{BatchPolicy, ItemOutcome, SweepStats};
use crate::server::monitoring::{ScriptLabels, SWEEP_METRICS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepConfig {
    /// 1-based page to begin from; operators resume a halted sweep by raising it.
    pub start_page: u32,
    /// Last page the source will serve, if it caps deep pagination.
    pub max_page: Option<u32>,
    pub page_timeout: Option<Duration>,
    pub inter_page_delay: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            start_page: 1,
            max_page: None,
            page_timeout: None,
            inter_page_delay: Duration::ZERO,
        }
    }
}

/// Page whose query failed and stopped the sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepHalt {
    pub page: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub stats: SweepStats,
    pub last_completed_page: Option<u32>,
    pub halted: Option<SweepHalt>,
    pub cancelled: bool,
}

/// One-shot pass over a page-numbered collection.
///
/// Pages are fetched one after another; the sweep moves on while the current page is
/// non-empty and below `total_pages`. A page query failure halts the sweep and is reported
/// so the operator can restart from that page. Item failures are the processor's concern
/// and only show up in the stats.
pub struct BackfillSweep {
    name: String,
    config: SweepConfig,
    cancel: CancellationToken,
}

impl BackfillSweep {
    pub fn new(name: impl Into<String>, config: SweepConfig) -> Self {
        Self {
            name: name.into(),
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn run<T, S, P>(&self, source: &S, processor: &P) -> SweepReport
    where
        S: PageSource<T> + ?Sized,
        P: PageProcessor<T> + ?Sized,
    {
        let labels = ScriptLabels::new(&self.name);
        set_running(&labels, true);

        let mut report = SweepReport::default();
        let mut page = self.config.start_page.max(1);
        info!(
            event = "sweep_started",
            sweep = %self.name,
            start_page = page,
            max_page = ?self.config.max_page,
            "backfill sweep started"
        );

        loop {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if self.config.max_page.is_some_and(|max_page| page > max_page) {
                info!(
                    event = "sweep_max_page_reached",
                    sweep = %self.name,
                    page,
                    "stopping at the maximum page the source serves"
                );
                break;
            }

            let result = match self.query_page(source, page).await {
                Ok(result) => result,
                Err(err) => {
                    error!(
                        event = "sweep_page_query_failed",
                        sweep = %self.name,
                        page,
                        error = %err,
                        "page query failed; halting sweep"
                    );
                    report.halted = Some(SweepHalt {
                        page,
                        reason: err.to_string(),
                    });
                    break;
                }
            };

            if result.items.is_empty() {
                info!(
                    event = "sweep_empty_page",
                    sweep = %self.name,
                    page,
                    "empty page; sweep complete"
                );
                break;
            }

            let context = PageContext {
                page,
                total_pages: result.total_pages,
            };
            let mut stats = processor.process_page(&result.items, context).await;
            stats.pages = 1;
            record_page(&labels, &stats);
            report.stats += stats;
            report.last_completed_page = Some(page);

            info!(
                event = "sweep_page_complete",
                sweep = %self.name,
                page,
                total_pages = result.total_pages,
                processed = stats.processed,
                updated = stats.updated,
                skipped = stats.skipped,
                failed = stats.failed,
                "page processed"
            );

            if page >= result.total_pages {
                break;
            }
            page += 1;

            if !self.config.inter_page_delay.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        report.cancelled = true;
                        break;
                    }
                    _ = tokio::time::sleep(self.config.inter_page_delay) => {}
                }
            }
        }

        set_running(&labels, false);
        info!(
            event = "sweep_finished",
            sweep = %self.name,
            pages = report.stats.pages,
            processed = report.stats.processed,
            updated = report.stats.updated,
            skipped = report.stats.skipped,
            failed = report.stats.failed,
            last_completed_page = ?report.last_completed_page,
            halted_on_page = ?report.halted.as_ref().map(|halt| halt.page),
            cancelled = report.cancelled,
            "backfill sweep finished"
        );
        report
    }

    /// Processes the single item `id` through the same page processor, bypassing pagination.
    pub async fn run_single<T, S, P>(
        &self,
        source: &S,
        processor: &P,
        id: &str,
    ) -> Result<SweepStats, Error>
    where
        S: PageSource<T> + ?Sized,
        P: PageProcessor<T> + ?Sized,
    {
        let item = source
            .fetch_one(id)
            .await?
            .ok_or_else(|| Error::ItemNotFound(id.to_string()))?;

        let items = [item];
        let mut stats = processor
            .process_page(
                &items,
                PageContext {
                    page: 1,
                    total_pages: 1,
                },
            )
            .await;
        stats.pages = 1;
        record_page(&ScriptLabels::new(&self.name), &stats);

        info!(
            event = "sweep_single_complete",
            sweep = %self.name,
            id,
            updated = stats.updated,
            skipped = stats.skipped,
            failed = stats.failed,
            "single item processed"
        );
        Ok(stats)
    }

    async fn query_page<T, S>(
        &self,
        source: &S,
        page: u32,
    ) -> Result<super::source::PageResult<T>, SourceError>
    where
        S: PageSource<T> + ?Sized,
    {
        match self.config.page_timeout {
            Some(limit) => tokio::time::timeout(limit, source.query_page(page))
                .await
                .unwrap_or_else(|_| {
                    Err(SourceError::new(
                        FailureKind::Timeout,
                        format!("page {page} query exceeded {limit:?}"),
                    ))
                }),
            None => source.query_page(page).await,
        }
    }
}

/// Runs `process` for every item, concurrently within chunks of `batch_size` and one chunk
/// at a time. A failing item is logged and counted; it never affects its neighbours.
///
/// `pages` is left at zero for the caller to fill in.
pub async fn process_items_isolated<'a, T, F, Fut>(
    items: &'a [T],
    batch_size: usize,
    mut process: F,
) -> SweepStats
where
    F: FnMut(&'a T) -> Fut,
    Fut: Future<Output = Result<ItemOutcome, HandlerError>>,
{
    let policy = BatchPolicy {
        batch_size,
        inter_batch_delay: Duration::ZERO,
        continue_on_error: true,
    };

    let report = run_in_batches(items, &policy, |chunk, label| {
        let pending: Vec<Fut> = chunk.iter().map(&mut process).collect();
        async move {
            let mut stats = SweepStats::default();
            for (offset, result) in join_all(pending).await.into_iter().enumerate() {
                stats.processed += 1;
                match result {
                    Ok(ItemOutcome::Updated) => stats.updated += 1,
                    Ok(ItemOutcome::Skipped) => stats.skipped += 1,
                    Err(err) => {
                        warn!(
                            event = "sweep_item_failed",
                            batch = %label,
                            item_offset = offset,
                            error = %err,
                            "item failed; continuing with the rest of the page"
                        );
                        stats.failed += 1;
                    }
                }
            }
            Ok::<_, Infallible>(stats)
        }
    })
    .await;

    match report {
        Ok(report) => report
            .outputs
            .into_iter()
            .fold(SweepStats::default(), |mut total, stats| {
                total += stats;
                total
            }),
        Err(failure) => match failure.error {},
    }
}

fn set_running(labels: &ScriptLabels, running: bool) {
    if let Some(metrics) = SWEEP_METRICS.get() {
        metrics.running.get_or_create(labels).set(i64::from(running));
    }
}

fn record_page(labels: &ScriptLabels, stats: &SweepStats) {
    if let Some(metrics) = SWEEP_METRICS.get() {
        metrics.pages_total.get_or_create(labels).inc();
        metrics.items_updated_total.get_or_create(labels).inc_by(stats.updated);
        metrics.items_skipped_total.get_or_create(labels).inc_by(stats.skipped);
        metrics.items_failed_total.get_or_create(labels).inc_by(stats.failed);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use futures::future::BoxFuture;

    use super::{process_items_isolated, BackfillSweep, SweepConfig};
    use crate::event_engine::error::{Error, FailureKind, HandlerError, SourceError};
    use crate::event_engine::source::{PageContext, PageProcessor, PageResult, PageSource};
    use crate::event_engine::types::{ItemOutcome, SweepStats};

    #[derive(Default)]
    struct ScriptedPages {
        pages: HashMap<u32, Result<PageResult<u32>, SourceError>>,
        queried: Mutex<Vec<u32>>,
    }

    impl ScriptedPages {
        fn new(total_pages: u32, pages: Vec<(u32, Result<Vec<u32>, SourceError>)>) -> Self {
            Self {
                pages: pages
                    .into_iter()
                    .map(|(page, items)| {
                        (page, items.map(|items| PageResult { items, total_pages }))
                    })
                    .collect(),
                queried: Mutex::new(Vec::new()),
            }
        }

        fn queried(&self) -> Vec<u32> {
            self.queried.lock().expect("queried mutex poisoned").clone()
        }
    }

    impl PageSource<u32> for ScriptedPages {
        fn query_page<'a>(
            &'a self,
            page: u32,
        ) -> BoxFuture<'a, Result<PageResult<u32>, SourceError>> {
            Box::pin(async move {
                self.queried.lock().expect("queried mutex poisoned").push(page);
                self.pages.get(&page).cloned().unwrap_or(Ok(PageResult {
                    items: Vec::new(),
                    total_pages: 0,
                }))
            })
        }

        fn fetch_one<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<u32>, SourceError>> {
            Box::pin(async move {
                let wanted: u32 = id
                    .parse()
                    .map_err(|_| SourceError::new(FailureKind::Other, "bad id"))?;
                Ok(self
                    .pages
                    .values()
                    .filter_map(|page| page.as_ref().ok())
                    .flat_map(|page| page.items.iter().copied())
                    .find(|item| *item == wanted))
            })
        }
    }

    /// Even items are updated, odd items skipped, multiples of 7 fail.
    #[derive(Default)]
    struct ParityProcessor {
        contexts: Mutex<Vec<PageContext>>,
    }

    impl PageProcessor<u32> for ParityProcessor {
        fn process_page<'a>(
            &'a self,
            items: &'a [u32],
            context: PageContext,
        ) -> BoxFuture<'a, SweepStats> {
            Box::pin(async move {
                self.contexts
                    .lock()
                    .expect("contexts mutex poisoned")
                    .push(context);
                process_items_isolated(items, 2, |item| {
                    let item = *item;
                    async move {
                        if item % 7 == 0 {
                            Err(HandlerError::retryable(format!("item {item} failed")))
                        } else if item % 2 == 0 {
                            Ok(ItemOutcome::Updated)
                        } else {
                            Ok(ItemOutcome::Skipped)
                        }
                    }
                })
                .await
            })
        }
    }

    fn down() -> SourceError {
        SourceError::new(FailureKind::UpstreamUnavailable, "503")
    }

    #[tokio::test]
    async fn page_query_error_halts_after_accumulating_earlier_pages() {
        let source = ScriptedPages::new(3, vec![(1, Ok(vec![2, 3, 4])), (2, Err(down())), (3, Ok(vec![6]))]);
        let processor = ParityProcessor::default();

        let report = BackfillSweep::new("normalizeKeywords", SweepConfig::default())
            .run(&source, &processor)
            .await;

        assert_eq!(source.queried(), vec![1, 2]);
        assert_eq!(report.last_completed_page, Some(1));
        assert_eq!(report.halted.as_ref().map(|halt| halt.page), Some(2));
        assert_eq!(
            report.stats,
            SweepStats {
                pages: 1,
                processed: 3,
                updated: 2,
                skipped: 1,
                failed: 0,
            }
        );
    }

    #[tokio::test]
    async fn empty_page_terminates_without_error() {
        let source = ScriptedPages::new(5, vec![(1, Ok(vec![2])), (2, Ok(Vec::new()))]);
        let processor = ParityProcessor::default();

        let report = BackfillSweep::new("sweep", SweepConfig::default())
            .run(&source, &processor)
            .await;

        assert_eq!(source.queried(), vec![1, 2]);
        assert_eq!(report.halted, None);
        assert_eq!(report.last_completed_page, Some(1));
        assert_eq!(report.stats.pages, 1);
    }

    #[tokio::test]
    async fn stops_at_total_pages_and_reports_context() {
        let source = ScriptedPages::new(2, vec![(1, Ok(vec![1, 2])), (2, Ok(vec![7, 8])), (3, Ok(vec![10]))]);
        let processor = ParityProcessor::default();

        let report = BackfillSweep::new("sweep", SweepConfig::default())
            .run(&source, &processor)
            .await;

        assert_eq!(source.queried(), vec![1, 2]);
        assert_eq!(report.stats.processed, 4);
        assert_eq!(report.stats.failed, 1);
        assert_eq!(
            processor.contexts.lock().expect("contexts mutex poisoned")[1],
            PageContext {
                page: 2,
                total_pages: 2
            }
        );
    }

    #[tokio::test]
    async fn resumes_from_start_page_and_respects_max_page() {
        let source = ScriptedPages::new(
            10,
            vec![(3, Ok(vec![2])), (4, Ok(vec![4])), (5, Ok(vec![6]))],
        );
        let processor = ParityProcessor::default();
        let config = SweepConfig {
            start_page: 3,
            max_page: Some(4),
            ..SweepConfig::default()
        };

        let report = BackfillSweep::new("sweep", config).run(&source, &processor).await;

        assert_eq!(source.queried(), vec![3, 4]);
        assert_eq!(report.last_completed_page, Some(4));
        assert_eq!(report.stats.updated, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_between_pages_stops_the_sweep() {
        let source = ScriptedPages::new(3, vec![(1, Ok(vec![2])), (2, Ok(vec![4])), (3, Ok(vec![6]))]);
        let processor = ParityProcessor::default();
        let cancel = tokio_util::sync::CancellationToken::new();
        let config = SweepConfig {
            inter_page_delay: Duration::from_secs(60),
            ..SweepConfig::default()
        };
        let sweep = BackfillSweep::new("sweep", config).with_cancellation(cancel.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            cancel.cancel();
        });
        let report = sweep.run(&source, &processor).await;
        canceller.await.expect("canceller finished");

        assert!(report.cancelled);
        assert_eq!(source.queried(), vec![1]);
    }

    #[tokio::test]
    async fn single_item_mode_bypasses_pagination() {
        let source = ScriptedPages::new(2, vec![(1, Ok(vec![1, 2])), (2, Ok(vec![4]))]);
        let processor = ParityProcessor::default();
        let sweep = BackfillSweep::new("sweep", SweepConfig::default());

        let stats = sweep
            .run_single(&source, &processor, "4")
            .await
            .expect("item exists");
        assert_eq!(stats.updated, 1);
        assert_eq!(stats.pages, 1);
        assert!(source.queried().is_empty());

        let err = sweep
            .run_single(&source, &processor, "99")
            .await
            .expect_err("item is missing");
        assert!(matches!(err, Error::ItemNotFound(id) if id == "99"));
    }

    #[tokio::test]
    async fn isolated_items_run_in_bounded_chunks() {
        let items: Vec<u32> = (1..=7).collect();
        let started = AtomicUsize::new(0);

        let stats = process_items_isolated(&items, 3, |item| {
            started.fetch_add(1, Ordering::SeqCst);
            let item = *item;
            async move {
                if item == 2 {
                    Err(HandlerError::fatal("bad keywords"))
                } else {
                    Ok(ItemOutcome::Updated)
                }
            }
        })
        .await;

        assert_eq!(started.load(Ordering::SeqCst), 7);
        assert_eq!(stats.processed, 7);
        assert_eq!(stats.updated, 6);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pages, 0);
    }
}
