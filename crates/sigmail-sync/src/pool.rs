//! Bounded parallel map over a fallible async operation.
//!
//! Every job is queued up front, a fixed set of workers drains the queue, and one
//! aggregator counts results in arrival order. Failed jobs never stop their siblings.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::StagePool;

#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    pub label: &'static str,
    pub workers: usize,
    pub progress_every: usize,
    /// How many failure messages are kept verbatim.
    pub error_sample: usize,
}

impl PoolOptions {
    pub fn new(label: &'static str, pool: StagePool, error_sample: usize) -> Self {
        Self {
            label,
            workers: pool.workers,
            progress_every: pool.progress_every,
            error_sample,
        }
    }
}

#[derive(Debug)]
pub struct PoolResults<T> {
    pub total: usize,
    pub succeeded: Vec<T>,
    pub failed: usize,
    pub error_samples: Vec<String>,
}

impl<T> PoolResults<T> {
    fn empty() -> Self {
        Self {
            total: 0,
            succeeded: Vec::new(),
            failed: 0,
            error_samples: Vec::new(),
        }
    }
}

pub async fn run_pool<J, T, E, F, Fut>(jobs: Vec<J>, options: PoolOptions, op: F) -> PoolResults<T>
where
    J: Send + 'static,
    T: Send + 'static,
    E: Display + Send + 'static,
    F: Fn(J) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    let total = jobs.len();
    if total == 0 {
        info!(pool = options.label, "no jobs");
        return PoolResults::empty();
    }

    let (job_tx, job_rx) = mpsc::channel::<J>(total);
    for job in jobs {
        // Capacity equals the job count, so this never waits.
        if job_tx.send(job).await.is_err() {
            break;
        }
    }
    drop(job_tx);

    let job_rx = Arc::new(Mutex::new(job_rx));
    let (result_tx, mut result_rx) = mpsc::channel::<Result<T, String>>(total);
    let op = Arc::new(op);
    let workers = options.workers.clamp(1, total);
    info!(pool = options.label, total, workers, "pool started");

    let mut join_set = JoinSet::new();
    for _ in 0..workers {
        let job_rx = Arc::clone(&job_rx);
        let result_tx = result_tx.clone();
        let op = Arc::clone(&op);
        join_set.spawn(async move {
            loop {
                let next = job_rx.lock().await.recv().await;
                let Some(job) = next else { break };
                let result = (*op)(job).await.map_err(|e| e.to_string());
                if result_tx.send(result).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(result_tx);

    let mut results = PoolResults { total, ..PoolResults::empty() };
    let mut done = 0usize;
    while let Some(result) = result_rx.recv().await {
        done += 1;
        match result {
            Ok(value) => results.succeeded.push(value),
            Err(message) => {
                results.failed += 1;
                warn!(pool = options.label, error = %message, "job failed");
                if results.error_samples.len() < options.error_sample {
                    results.error_samples.push(message);
                }
            }
        }
        if options.progress_every > 0 && done % options.progress_every == 0 {
            info!(
                pool = options.label,
                done,
                total,
                succeeded = results.succeeded.len(),
                failed = results.failed,
                "pool progress"
            );
        }
    }

    while let Some(joined) = join_set.join_next().await {
        if let Err(err) = joined {
            warn!(pool = options.label, error = %err, "pool worker ended abnormally");
        }
    }

    // A panicking job never reports; count it as failed.
    let missing = total.saturating_sub(done);
    if missing > 0 {
        results.failed += missing;
        if results.error_samples.len() < options.error_sample {
            results
                .error_samples
                .push(format!("{missing} job(s) ended without a result"));
        }
    }

    info!(
        pool = options.label,
        total,
        succeeded = results.succeeded.len(),
        failed = results.failed,
        "pool drained"
    );
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn options(workers: usize, error_sample: usize) -> PoolOptions {
        PoolOptions {
            label: "test",
            workers,
            progress_every: 3,
            error_sample,
        }
    }

    #[tokio::test]
    async fn every_job_is_reported_once() {
        let results = run_pool((0..40u32).collect(), options(8, 5), |n| async move {
            tokio::time::sleep(Duration::from_millis(u64::from(n % 3))).await;
            Ok::<_, String>(n * 2)
        })
        .await;

        let mut values = results.succeeded;
        values.sort_unstable();
        assert_eq!(values, (0..40u32).map(|n| n * 2).collect::<Vec<_>>());
        assert_eq!(results.total, 40);
        assert_eq!(results.failed, 0);
    }

    #[tokio::test]
    async fn failures_are_counted_and_sampled() {
        let results = run_pool((0..20u32).collect(), options(4, 3), |n| async move {
            if n % 2 == 0 {
                Err(format!("job {n} broke"))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(results.succeeded.len(), 10);
        assert_eq!(results.failed, 10);
        assert_eq!(results.error_samples.len(), 3);
        assert!(results.error_samples.iter().all(|e| e.ends_with("broke")));
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_worker_count() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));

        let results = run_pool((0..30u32).collect(), options(4, 5), move |_| {
            let active = Arc::clone(&a);
            let peak = Arc::clone(&p);
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, String>(())
            }
        })
        .await;

        assert_eq!(results.succeeded.len(), 30);
        assert!(peak.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn empty_job_list_returns_immediately() {
        let results = run_pool(Vec::<u32>::new(), options(4, 5), |n| async move { Ok::<_, String>(n) }).await;
        assert_eq!(results.total, 0);
        assert!(results.succeeded.is_empty());
    }
}
