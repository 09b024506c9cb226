use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Result;

/// Upper bound on concurrent workers regardless of core count.
pub const MAX_WORKERS: usize = 16;

pub fn default_worker_count() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cores * 2).clamp(1, MAX_WORKERS)
}

/// Drain `jobs` with `workers` concurrent workers pulling from one shared
/// queue. Each job is taken by exactly one worker. The first job error
/// cancels `abort` so the rest of the pool stops cooperatively (workers
/// stop at the next step boundary; in-flight I/O is left to finish), and
/// the error is returned to the caller. External cancellation arrives
/// through the same token when the caller derives `abort` from it.
pub async fn drain_queue<J, F, Fut>(
    jobs: Vec<J>,
    workers: usize,
    abort: &CancellationToken,
    run_job: F,
) -> Result<()>
where
    F: Fn(J) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let queue = Mutex::new(VecDeque::from(jobs));
    let workers = workers.max(1);
    debug!(event = "pool.start", workers, "pool.start");

    let run_job = &run_job;
    let queue = &queue;
    let results = join_all((0..workers).map(|worker| async move {
        loop {
            if abort.is_cancelled() {
                return Ok(());
            }
            let job = queue.lock().expect("job queue poisoned").pop_front();
            let Some(job) = job else {
                return Ok(());
            };
            if let Err(e) = run_job(job).await {
                debug!(event = "pool.abort", worker, error = %e, "pool.abort");
                abort.cancel();
                return Err(e);
            }
        }
    }))
    .await;

    for result in results {
        result?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn every_job_runs_exactly_once() {
        let seen = AtomicUsize::new(0);
        let abort = CancellationToken::new();
        drain_queue((0..100).collect::<Vec<u32>>(), 4, &abort, |_job| async {
            seen.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 100);
    }

    #[tokio::test]
    async fn first_error_aborts_the_pool() {
        let started = AtomicUsize::new(0);
        let abort = CancellationToken::new();
        let err = drain_queue((0..1000).collect::<Vec<u32>>(), 2, &abort, |job| {
            let started = &started;
            async move {
                started.fetch_add(1, Ordering::Relaxed);
                tokio::task::yield_now().await;
                if job == 3 {
                    return Err(Error::Api {
                        message: "boom".to_string(),
                    });
                }
                Ok(())
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Api { .. }));
        assert!(started.load(Ordering::Relaxed) < 1000);
        assert!(abort.is_cancelled());
    }

    #[tokio::test]
    async fn pre_cancelled_pool_runs_nothing() {
        let abort = CancellationToken::new();
        abort.cancel();
        let seen = AtomicUsize::new(0);
        drain_queue(vec![1u32, 2, 3], 2, &abort, |_job| async {
            seen.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 0);
    }
}
