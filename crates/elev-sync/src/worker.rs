//! Bounded worker pool with per-attempt timeouts and classified retries.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use elev_core::Classify;
use elev_storage::{BackoffPolicy, RetryDisposition};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{error, info_span, warn, Instrument};

use crate::JobError;

#[derive(Debug)]
pub struct JobReport<J, T> {
    pub index: usize,
    pub job: J,
    pub attempts: usize,
    pub outcome: Result<T, JobError>,
}

/// `workers` tasks drain one shared queue. A job is retried while its error
/// disposition allows it and attempts remain; cancellation is only observed
/// between attempts.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: usize,
    backoff: BackoffPolicy,
    job_timeout: Duration,
    cancel: watch::Receiver<bool>,
}

impl WorkerPool {
    pub fn new(
        workers: usize,
        backoff: BackoffPolicy,
        job_timeout: Duration,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            workers: workers.clamp(1, 5),
            backoff,
            job_timeout,
            cancel,
        }
    }

    /// Run every job and return the reports in submission order.
    pub async fn run<J, T, F, Fut>(&self, jobs: Vec<J>, work: F) -> Vec<JobReport<J, T>>
    where
        J: Clone + Debug + Send + 'static,
        T: Send + 'static,
        F: Fn(J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, JobError>> + Send + 'static,
    {
        if jobs.is_empty() {
            return Vec::new();
        }
        let total = jobs.len();
        let queue = Arc::new(Mutex::new(jobs.into_iter().enumerate().collect::<VecDeque<_>>()));
        let work = Arc::new(work);

        let mut set = JoinSet::new();
        for worker in 0..self.workers.min(total) {
            let queue = Arc::clone(&queue);
            let work = Arc::clone(&work);
            let pool = self.clone();
            set.spawn(async move {
                let mut done = Vec::new();
                loop {
                    let next = queue.lock().await.pop_front();
                    let Some((index, job)) = next else { break };
                    let span = info_span!("job", worker, index, job = ?job);
                    let report = pool.attempt(index, job, work.as_ref()).instrument(span).await;
                    done.push(report);
                }
                done
            });
        }

        let mut reports = Vec::with_capacity(total);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(batch) => reports.extend(batch),
                Err(err) => error!(error = %err, "worker task panicked"),
            }
        }
        reports.sort_by_key(|r| r.index);
        reports
    }

    async fn attempt<J, T, F, Fut>(&self, index: usize, job: J, work: &F) -> JobReport<J, T>
    where
        J: Clone,
        F: Fn(J) -> Fut,
        Fut: Future<Output = Result<T, JobError>>,
    {
        let max_attempts = self.backoff.max_attempts();
        let mut attempts = 0;
        loop {
            if *self.cancel.borrow() {
                return JobReport {
                    index,
                    job,
                    attempts,
                    outcome: Err(JobError::Cancelled),
                };
            }
            attempts += 1;
            let outcome = match tokio::time::timeout(self.job_timeout, work(job.clone())).await {
                Ok(outcome) => outcome,
                Err(_) => Err(JobError::TimedOut(self.job_timeout)),
            };
            match outcome {
                Err(err)
                    if err.disposition() == RetryDisposition::Retryable && attempts < max_attempts =>
                {
                    let delay = self.backoff.delay_for_attempt(attempts - 1);
                    warn!(attempts, ?delay, class = %err.class(), error = %err, "job failed; retrying");
                    let mut cancel = self.cancel.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancelled(&mut cancel) => {}
                    }
                }
                outcome => {
                    if let Err(err) = &outcome {
                        warn!(attempts, class = %err.class(), error = %err, "job failed permanently");
                    }
                    return JobReport {
                        index,
                        job,
                        attempts,
                        outcome,
                    };
                }
            }
        }
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ParseError;
    use elev_source::SourceError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool(cancel: watch::Receiver<bool>) -> WorkerPool {
        WorkerPool::new(
            3,
            BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            Duration::from_millis(200),
            cancel,
        )
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let (_tx, rx) = watch::channel(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let reports = pool(rx)
            .run(vec![1u32], move |_job| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(JobError::Source(SourceError::Transient("flaky".into())))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(reports[0].attempts, 3);
        assert_eq!(reports[0].outcome.as_ref().unwrap(), &"done");
    }

    #[tokio::test]
    async fn validation_failures_are_not_retried() {
        let (_tx, rx) = watch::channel(false);
        let reports = pool(rx)
            .run(vec!["a", "b"], |job| async move {
                if job == "a" {
                    Err::<(), _>(JobError::Source(SourceError::Payload("bad".into())))
                } else {
                    Ok(())
                }
            })
            .await;
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].job, "a");
        assert_eq!(reports[0].attempts, 1);
        assert!(reports[0].outcome.is_err());
        assert!(reports[1].outcome.is_ok());
    }

    #[tokio::test]
    async fn parse_failures_run_once() {
        let (_tx, rx) = watch::channel(false);
        let reports = pool(rx)
            .run(vec![7i64], |_| async {
                Err::<(), _>(JobError::Parse(ParseError::Aborted("commit refused".into())))
            })
            .await;
        assert_eq!(reports[0].attempts, 1);
        assert!(matches!(reports[0].outcome, Err(JobError::Parse(_))));
    }

    #[tokio::test]
    async fn attempts_time_out_as_transient() {
        let (_tx, rx) = watch::channel(false);
        let reports = pool(rx)
            .run(vec![()], |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, JobError>(())
            })
            .await;
        assert_eq!(reports[0].attempts, 3);
        assert!(matches!(reports[0].outcome, Err(JobError::TimedOut(_))));
    }

    #[tokio::test]
    async fn cancellation_stops_before_the_next_attempt() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let reports = pool(rx)
            .run(vec![1, 2, 3], |_| async { Ok::<_, JobError>(()) })
            .await;
        assert!(reports
            .iter()
            .all(|r| r.attempts == 0 && matches!(r.outcome, Err(JobError::Cancelled))));
    }
}
