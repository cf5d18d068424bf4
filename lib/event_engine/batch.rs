use std::fmt;
use std::future::Future;

use tracing::warn;

use super::types::BatchPolicy;

/// Advisory progress label handed to each chunk handler. Never used for control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLabel {
    /// 1-based chunk index.
    pub index: usize,
    pub total_batches: usize,
    pub total_items: usize,
}

impl fmt::Display for BatchLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "totalEvents: {} | BATCH: {}/{}",
            self.total_items, self.index, self.total_batches
        )
    }
}

/// A chunk whose handler failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure<E> {
    pub label: BatchLabel,
    pub error: E,
}

/// Outputs of every successful chunk, in order, plus the isolated failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRunReport<R, E> {
    pub outputs: Vec<R>,
    pub failures: Vec<BatchFailure<E>>,
}

impl<R, E> BatchRunReport<R, E> {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Number of chunks `total_items` splits into.
pub fn batch_count(total_items: usize, batch_size: usize) -> usize {
    total_items.div_ceil(batch_size.max(1))
}

/// Runs `handler` over consecutive chunks of `items`, strictly one chunk at a time.
///
/// Sequential chunks are the backpressure against rate-limited downstream APIs; any
/// concurrency inside a chunk is up to the handler. `policy.inter_batch_delay` is awaited
/// between chunks but not after the last one.
///
/// With `continue_on_error` unset the first failing chunk ends the run and is returned as
/// `Err`. Otherwise failures are collected in the report and the remaining chunks still run.
pub async fn run_in_batches<'a, T, R, E, F, Fut>(
    items: &'a [T],
    policy: &BatchPolicy,
    mut handler: F,
) -> Result<BatchRunReport<R, E>, BatchFailure<E>>
where
    F: FnMut(&'a [T], BatchLabel) -> Fut,
    Fut: Future<Output = Result<R, E>>,
    E: fmt::Display,
{
    let batch_size = policy.batch_size.max(1);
    let total_batches = batch_count(items.len(), batch_size);
    let mut report = BatchRunReport {
        outputs: Vec::with_capacity(total_batches),
        failures: Vec::new(),
    };

    for (offset, chunk) in items.chunks(batch_size).enumerate() {
        let label = BatchLabel {
            index: offset + 1,
            total_batches,
            total_items: items.len(),
        };

        match handler(chunk, label).await {
            Ok(output) => report.outputs.push(output),
            Err(error) if policy.continue_on_error => {
                warn!(
                    event = "batch_failed_isolated",
                    batch = %label,
                    error = %error,
                    "batch failed; continuing with remaining batches"
                );
                report.failures.push(BatchFailure { label, error });
            }
            Err(error) => return Err(BatchFailure { label, error }),
        }

        if label.index < total_batches && !policy.inter_batch_delay.is_zero() {
            tokio::time::sleep(policy.inter_batch_delay).await;
        }
    }

    Ok(report)
}
