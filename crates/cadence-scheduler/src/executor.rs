//! Job execution under per-job concurrency ceilings.
//!
//! The executor runs job bodies uniformly: async bodies are awaited in
//! place, blocking bodies are moved onto the worker pool. When a job code
//! is supplied, the attempt counts against the job's in-flight ceiling;
//! a saturated job is rejected without running, which the scheduler
//! treats as a silent skip rather than a failure.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task;
use tracing::debug;

use crate::context::JobContext;
use crate::error::JobError;
use crate::job::Work;

/// Result of asking the executor to run one attempt.
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// The body ran to completion with this result.
    Completed(Value),
    /// The per-job concurrency ceiling was reached; nothing ran.
    Rejected,
}

/// Runs job bodies and tracks per-job in-flight counts.
pub struct Executor {
    running: DashMap<String, usize>,
    /// Bounds concurrently executing blocking bodies. Async bodies are
    /// not metered here.
    blocking_permits: Option<Arc<Semaphore>>,
}

impl Executor {
    /// `max_workers` bounds the blocking worker pool; `None` leaves it
    /// unbounded.
    pub fn new(max_workers: Option<usize>) -> Self {
        Self {
            running: DashMap::new(),
            blocking_permits: max_workers.map(|n| Arc::new(Semaphore::new(n))),
        }
    }

    /// Current in-flight count for a job code.
    pub fn running_count(&self, job_code: &str) -> usize {
        self.running
            .get(job_code)
            .map(|count| *count)
            .unwrap_or(0)
    }

    /// Execute one attempt.
    ///
    /// With `job_code` set, the attempt counts against `max_instances`:
    /// the count is incremented before the body runs and decremented when
    /// it finishes, whether it succeeded, failed, timed out, or panicked.
    /// Without `job_code` execution is unmetered. Errors from the body
    /// propagate to the caller; retry handling is the scheduler's job.
    pub async fn execute(
        &self,
        work: &Work,
        ctx: JobContext,
        job_code: Option<&str>,
        max_instances: usize,
        timeout_secs: Option<u64>,
    ) -> Result<ExecutionOutcome, JobError> {
        let _guard = match job_code {
            Some(code) => match self.checkout(code, max_instances) {
                Some(guard) => Some(guard),
                None => {
                    debug!(job_code = %code, max_instances, "concurrency ceiling reached, rejecting");
                    return Ok(ExecutionOutcome::Rejected);
                }
            },
            None => None,
        };

        let result = match timeout_secs {
            Some(secs) => {
                match tokio::time::timeout(Duration::from_secs(secs), self.invoke(work, ctx)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(JobError::Timeout(secs)),
                }
            }
            None => self.invoke(work, ctx).await,
        };

        result.map(ExecutionOutcome::Completed)
    }

    async fn invoke(&self, work: &Work, ctx: JobContext) -> Result<Value, JobError> {
        match work {
            Work::Async(f) => f(ctx).await,
            Work::Sync(f) => {
                let permit = match &self.blocking_permits {
                    Some(semaphore) => Some(
                        Arc::clone(semaphore)
                            .acquire_owned()
                            .await
                            .map_err(|_| JobError::failure("worker pool closed"))?,
                    ),
                    None => None,
                };
                let f = Arc::clone(f);
                let handle = task::spawn_blocking(move || {
                    let _permit = permit;
                    f(ctx)
                });
                match handle.await {
                    Ok(result) => result,
                    Err(join_error) if join_error.is_panic() => {
                        Err(JobError::Panic(panic_message(join_error)))
                    }
                    Err(_) => Err(JobError::failure("job task was cancelled")),
                }
            }
        }
    }

    /// Reserve an execution slot for `code`, or `None` at the ceiling.
    fn checkout(&self, code: &str, max_instances: usize) -> Option<RunningGuard<'_>> {
        let mut entry = self.running.entry(code.to_string()).or_insert(0);
        if *entry >= max_instances {
            return None;
        }
        *entry += 1;
        drop(entry);
        Some(RunningGuard {
            running: &self.running,
            code: code.to_string(),
        })
    }
}

/// Decrements the in-flight count on drop, so the counter cannot leak on
/// any exit path.
struct RunningGuard<'a> {
    running: &'a DashMap<String, usize>,
    code: String,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut count) = self.running.get_mut(&self.code) {
            *count = count.saturating_sub(1);
        }
    }
}

fn panic_message(join_error: task::JoinError) -> String {
    match join_error.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string()),
        Err(e) => e.to_string(),
    }
}
