//! Concurrency spine: batching, bounded fan-out, progress, cancellation.
//!
//! Items are grouped by BOTH a count bound and an aggregate text-length
//! bound; a batch closes when either is hit. A semaphore caps in-flight
//! batches; results arrive in completion order (within a batch the worker
//! preserves item order). The first fatal error cancels sibling batches
//! and is surfaced; cancellation from any source coalesces into a single
//! error at runner exit. Partial commits are not rolled back; each batch
//! is its own transaction.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::progress::{PipelineStage, Progress, ProgressSink};

/// One unit of scheduled work: a slice of items with its submission index.
#[derive(Clone, Debug)]
pub struct Batch<T> {
    pub index: usize,
    pub items: Vec<T>,
}

/// Group `items` into batches bounded by `batch_size` items AND
/// `max_text_len` aggregate measured length. An item whose own measure
/// exceeds the bound forms a batch by itself.
pub fn plan_batches<T, M>(items: Vec<T>, measure: M, batch_size: usize, max_text_len: usize) -> Vec<Batch<T>>
where
    M: Fn(&T) -> usize,
{
    let batch_size = batch_size.max(1);
    let mut batches: Vec<Batch<T>> = Vec::new();
    let mut current: Vec<T> = Vec::new();
    let mut current_len = 0usize;

    for item in items {
        let size = measure(&item);
        if !current.is_empty() && (current.len() >= batch_size || current_len + size > max_text_len)
        {
            batches.push(Batch {
                index: batches.len(),
                items: std::mem::take(&mut current),
            });
            current_len = 0;
        }
        current_len += size;
        current.push(item);
    }
    if !current.is_empty() {
        batches.push(Batch {
            index: batches.len(),
            items: current,
        });
    }
    batches
}

/// A completed batch, tagged with its submission index.
#[derive(Debug)]
pub struct BatchOutcome<R> {
    pub index: usize,
    pub result: R,
}

/// Results of one run, in completion order.
#[derive(Debug, Default)]
pub struct RunReport<R> {
    pub outcomes: Vec<BatchOutcome<R>>,
}

impl<R> RunReport<R> {
    /// Results re-ordered by submission index.
    #[must_use]
    pub fn into_submission_order(mut self) -> Vec<R> {
        self.outcomes.sort_by_key(|o| o.index);
        self.outcomes.into_iter().map(|o| o.result).collect()
    }
}

/// Bounded-concurrency batch executor.
#[derive(Clone, Debug)]
pub struct PipelineRunner {
    semaphore_size: usize,
}

impl PipelineRunner {
    #[must_use]
    pub fn new(semaphore_size: usize) -> Self {
        Self {
            semaphore_size: semaphore_size.max(1),
        }
    }

    /// Run `worker` over every batch with at most `semaphore_size` in
    /// flight. The worker receives a child cancellation token; it must
    /// observe it at its suspension points.
    pub async fn run<T, R, F, Fut>(
        &self,
        batches: Vec<Batch<T>>,
        worker: F,
        stage: PipelineStage,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<RunReport<R>, PipelineError>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(Batch<T>, CancellationToken) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<R, PipelineError>> + Send + 'static,
    {
        let total = batches.len() as u64;
        let child = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(self.semaphore_size));
        let mut tasks: JoinSet<(usize, Result<R, PipelineError>)> = JoinSet::new();

        for batch in batches {
            let index = batch.index;
            let worker = worker.clone();
            let token = child.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (index, Err(PipelineError::Cancelled));
                };
                if token.is_cancelled() {
                    return (index, Err(PipelineError::Cancelled));
                }
                (index, worker(batch, token).await)
            });
        }

        let mut report = RunReport { outcomes: Vec::new() };
        let mut first_error: Option<PipelineError> = None;
        let mut completed = 0u64;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(result))) => {
                    completed += 1;
                    progress.publish(Progress::new(stage, completed, total));
                    report.outcomes.push(BatchOutcome { index, result });
                }
                Ok((index, Err(err))) => {
                    if err.is_cancelled() {
                        debug!(batch = index, "batch observed cancellation");
                    } else {
                        warn!(batch = index, error_kind = err.kind(), error = %err, "batch failed");
                        if first_error.is_none() {
                            first_error = Some(err);
                            // Fatal: stop the siblings at their next
                            // suspension point.
                            child.cancel();
                        }
                    }
                }
                Err(join_err) => {
                    if first_error.is_none() {
                        first_error = Some(PipelineError::Internal {
                            message: format!("batch task failed: {join_err}"),
                        });
                        child.cancel();
                    }
                }
            }
        }

        progress.publish_final(Progress::new(stage, completed, total));

        if let Some(err) = first_error {
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(report)
    }
}
