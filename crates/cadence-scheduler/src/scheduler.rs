//! The scheduler control loop.
//!
//! One [`Scheduler`] owns the schedule state for a registry of jobs:
//! it tracks each schedulable definition's next fire time, wakes up
//! when something is due, and dispatches runs onto the executor. Runs
//! are gated by the distributed lock when one is configured, recorded
//! to the run store, and retried per the definition's retry policy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::{RwLock, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::context::TriggerType;
use crate::error::SchedulerError;
use crate::executor::{ExecutionOutcome, Executor};
use crate::job::JobDefinition;
use crate::lock::{DistributedLock, NoopLock};
use crate::registry::JobRegistry;
use crate::store::{JobRun, MemoryRunStore, RunStatus, RunStore, SkipReason};

/// Floor for the control-loop sleep, so a tight schedule cannot spin.
const MIN_SLEEP_SECS: u64 = 1;

/// Ceiling for the control-loop sleep, so newly due work is never more
/// than a minute away from being noticed.
const MAX_SLEEP_SECS: u64 = 60;

/// How often the loop prunes expired run history.
const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

/// Per-job schedule state.
#[derive(Debug, Clone)]
struct ScheduleEntry {
    next_fire: DateTime<Utc>,
    run_count: u64,
}

/// A fire time that is due now.
struct Occurrence {
    def: Arc<JobDefinition>,
    scheduled_time: DateTime<Utc>,
    run_count: u64,
}

/// A fire time that was missed beyond the grace period.
struct Missed {
    def: Arc<JobDefinition>,
    scheduled_time: DateTime<Utc>,
}

/// Drives registered jobs: computes fire times, dispatches due runs,
/// applies retry policies, and records history.
pub struct Scheduler {
    registry: Arc<JobRegistry>,
    executor: Arc<Executor>,
    lock: Arc<dyn DistributedLock>,
    store: Arc<dyn RunStore>,
    config: SchedulerConfig,
    default_tz: Tz,
    state: Arc<RwLock<HashMap<String, ScheduleEntry>>>,
}

impl Scheduler {
    /// Build a scheduler over `registry`. Fails if the configured
    /// timezone is not a valid IANA name.
    pub fn new(
        registry: Arc<JobRegistry>,
        config: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        let default_tz: Tz = config
            .timezone
            .parse()
            .map_err(|_| SchedulerError::InvalidTimezone(config.timezone.clone()))?;

        Ok(Self {
            registry,
            executor: Arc::new(Executor::new(Some(config.max_workers))),
            lock: Arc::new(NoopLock),
            store: Arc::new(MemoryRunStore::new()),
            config,
            default_tz,
            state: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Use a distributed lock backend instead of the default no-op lock.
    pub fn with_lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = lock;
        self
    }

    /// Use a run-history store instead of the default in-memory one.
    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = store;
        self
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// All registered job codes, sub-jobs included.
    pub fn job_codes(&self) -> Vec<String> {
        self.registry.codes()
    }

    /// Register a definition and prime its schedule.
    pub async fn add_job(&self, definition: JobDefinition) -> Result<String, SchedulerError> {
        let code = self.registry.register(definition)?;
        self.prime(Utc::now()).await;
        Ok(code)
    }

    /// Unregister a job and drop its schedule state, sub-jobs included.
    pub async fn remove_job(&self, code: &str) -> Result<(), SchedulerError> {
        self.registry.remove(code)?;
        let sub_prefix = format!("{code}#");
        let mut state = self.state.write().await;
        state.remove(code);
        state.retain(|key, _| !key.starts_with(&sub_prefix));
        Ok(())
    }

    /// Next scheduled fire time for a job code, if it has one.
    pub async fn next_run_time(&self, code: &str) -> Option<DateTime<Utc>> {
        self.state
            .read()
            .await
            .get(code)
            .map(|entry| entry.next_fire)
    }

    /// How many scheduled runs this code has dispatched so far.
    pub async fn run_count(&self, code: &str) -> u64 {
        self.state
            .read()
            .await
            .get(code)
            .map(|entry| entry.run_count)
            .unwrap_or(0)
    }

    /// Dispatch a run of `code` immediately, outside its schedule.
    pub async fn trigger_job(&self, code: &str) -> Result<(), SchedulerError> {
        let def = self.registry.get(code)?;
        let run_count = self.run_count(code).await;
        info!(job_code = %code, "manual trigger");
        self.dispatch(def, TriggerType::Manual, Utc::now(), run_count);
        Ok(())
    }

    /// Run the control loop until `shutdown_rx` observes `true` or its
    /// sender is dropped. In-flight runs are not interrupted.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("scheduler disabled, not starting");
            return;
        }

        let now = Utc::now();
        self.prime(now).await;
        info!(
            jobs = self.registry.schedulable().len(),
            timezone = %self.config.timezone,
            "scheduler started"
        );

        let mut last_prune = Instant::now();
        loop {
            let now = Utc::now();
            let (due, missed) = self.collect_due(now).await;
            self.skip_missed(missed).await;

            for occ in due {
                self.dispatch(
                    occ.def,
                    TriggerType::Scheduled,
                    occ.scheduled_time,
                    occ.run_count,
                );
            }

            if self.config.enable_history && last_prune.elapsed() >= PRUNE_INTERVAL {
                last_prune = Instant::now();
                let cutoff =
                    now - chrono::Duration::days(self.config.history_retention_days as i64);
                match self.store.prune(cutoff).await {
                    Ok(0) => {}
                    Ok(removed) => debug!(removed, "pruned run history"),
                    Err(e) => error!(error = %e, "failed to prune run history"),
                }
            }

            let sleep_secs = self.next_wakeup(now).await;
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("scheduler shutting down");
                        break;
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(sleep_secs)) => {}
            }
        }
    }

    /// Insert schedule entries for schedulable definitions that have
    /// none yet.
    async fn prime(&self, now: DateTime<Utc>) {
        let mut state = self.state.write().await;
        for def in self.registry.schedulable() {
            let code = def.code().to_string();
            if state.contains_key(&code) {
                continue;
            }
            match def.triggers()[0].next_fire_time_in(now, self.default_tz) {
                Some(next_fire) => {
                    debug!(job_code = %code, %next_fire, "scheduled");
                    state.insert(
                        code,
                        ScheduleEntry {
                            next_fire,
                            run_count: 0,
                        },
                    );
                }
                None => {
                    warn!(job_code = %code, "trigger will never fire, not scheduling");
                }
            }
        }
    }

    /// Collect every due fire time and advance the schedule.
    ///
    /// Fire times later than the misfire grace period are skipped; with
    /// coalescing enabled a backlog collapses into a single run carrying
    /// the earliest missed fire time.
    async fn collect_due(&self, now: DateTime<Utc>) -> (Vec<Occurrence>, Vec<Missed>) {
        let mut due = Vec::new();
        let mut missed = Vec::new();
        let mut exhausted = Vec::new();
        let grace = chrono::Duration::seconds(self.config.misfire_grace_time as i64);

        let mut state = self.state.write().await;
        for (code, entry) in state.iter_mut() {
            if entry.next_fire > now {
                continue;
            }
            let def = match self.registry.get(code) {
                Ok(def) => def,
                Err(_) => {
                    exhausted.push(code.clone());
                    continue;
                }
            };
            let trigger = &def.triggers()[0];

            // Every fire time at or before now.
            let mut fires = vec![entry.next_fire];
            let mut cursor = entry.next_fire;
            loop {
                match trigger.next_fire_time_in(cursor, self.default_tz) {
                    Some(next) if next <= now => {
                        fires.push(next);
                        cursor = next;
                    }
                    Some(next) => {
                        entry.next_fire = next;
                        break;
                    }
                    None => {
                        exhausted.push(code.clone());
                        break;
                    }
                }
            }

            if self.config.coalesce {
                // One run for the whole backlog, stamped with the
                // earliest fire time.
                entry.run_count += 1;
                due.push(Occurrence {
                    def,
                    scheduled_time: fires[0],
                    run_count: entry.run_count,
                });
            } else {
                for fire in fires {
                    if now - fire > grace {
                        missed.push(Missed {
                            def: Arc::clone(&def),
                            scheduled_time: fire,
                        });
                    } else {
                        entry.run_count += 1;
                        due.push(Occurrence {
                            def: Arc::clone(&def),
                            scheduled_time: fire,
                            run_count: entry.run_count,
                        });
                    }
                }
            }
        }

        for code in exhausted {
            debug!(job_code = %code, "trigger exhausted, unscheduling");
            state.remove(&code);
        }

        (due, missed)
    }

    /// Record misfired occurrences as terminal skipped runs.
    async fn skip_missed(&self, missed: Vec<Missed>) {
        for miss in missed {
            warn!(
                job_code = %miss.def.code(),
                scheduled_time = %miss.scheduled_time,
                "fire time missed beyond grace period, skipping"
            );
            Self::record_skip(
                self.store.as_ref(),
                &self.config,
                &miss.def,
                TriggerType::Scheduled,
                miss.scheduled_time,
                SkipReason::Misfired,
            )
            .await;
        }
    }

    /// Seconds until the next fire time, clamped to the loop's bounds.
    async fn next_wakeup(&self, now: DateTime<Utc>) -> u64 {
        let state = self.state.read().await;
        let until_next = state
            .values()
            .map(|entry| (entry.next_fire - now).num_seconds().max(0) as u64)
            .min()
            .unwrap_or(MAX_SLEEP_SECS);
        until_next.clamp(MIN_SLEEP_SECS, MAX_SLEEP_SECS)
    }

    /// Spawn one occurrence onto the runtime.
    fn dispatch(
        &self,
        def: Arc<JobDefinition>,
        trigger_type: TriggerType,
        scheduled_time: DateTime<Utc>,
        run_count: u64,
    ) {
        let executor = Arc::clone(&self.executor);
        let lock = Arc::clone(&self.lock);
        let store = Arc::clone(&self.store);
        let config = self.config.clone();
        tokio::spawn(async move {
            Self::run_occurrence(
                def,
                trigger_type,
                scheduled_time,
                run_count,
                executor,
                lock,
                store,
                config,
            )
            .await;
        });
    }

    /// Run one occurrence to a terminal state: lock gate, execute,
    /// retry per policy, record history, release the lock.
    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(skip_all, fields(job_code = %def.code(), ?trigger_type))]
    async fn run_occurrence(
        def: Arc<JobDefinition>,
        trigger_type: TriggerType,
        scheduled_time: DateTime<Utc>,
        run_count: u64,
        executor: Arc<Executor>,
        lock: Arc<dyn DistributedLock>,
        store: Arc<dyn RunStore>,
        config: SchedulerConfig,
    ) {
        let code = def.code().to_string();
        let lock_ttl = Duration::from_secs(config.lock_timeout);

        let mut lock_held = false;
        if config.distributed_lock {
            match lock.acquire(&code, lock_ttl).await {
                Ok(true) => lock_held = true,
                Ok(false) => {
                    debug!(job_code = %code, "lock held by another instance, skipping run");
                    Self::record_skip(
                        store.as_ref(),
                        &config,
                        &def,
                        trigger_type,
                        scheduled_time,
                        SkipReason::LockHeld,
                    )
                    .await;
                    return;
                }
                Err(e) => {
                    error!(job_code = %code, error = %e, "lock backend failed, skipping run");
                    return;
                }
            }
        }

        let mut ctx = def.context(trigger_type, scheduled_time, run_count);
        loop {
            let run_id = Uuid::new_v4().to_string();
            ctx.run_id = Some(run_id.clone());
            ctx.start_time = Some(Utc::now());

            if config.enable_history {
                let run = JobRun {
                    run_id: run_id.clone(),
                    job_code: code.clone(),
                    attempt: ctx.attempt,
                    trigger_type: ctx.trigger_type,
                    status: RunStatus::Running,
                    scheduled_time,
                    started_at: ctx.start_time,
                    finished_at: None,
                    error: None,
                };
                if let Err(e) = store.record_start(&run).await {
                    error!(job_code = %code, error = %e, "failed to record run start");
                }
            }

            let outcome = executor
                .execute(
                    def.work(),
                    ctx.clone(),
                    Some(&code),
                    def.instance_limit(),
                    def.timeout(),
                )
                .await;

            match outcome {
                Ok(ExecutionOutcome::Rejected) => {
                    debug!(
                        job_code = %code,
                        max_instances = def.instance_limit(),
                        "max instances reached, skipping run"
                    );
                    Self::finalize(
                        store.as_ref(),
                        &config,
                        &run_id,
                        RunStatus::Skipped(SkipReason::Saturated),
                        None,
                    )
                    .await;
                    break;
                }
                Ok(ExecutionOutcome::Completed(value)) => {
                    info!(job_code = %code, run_id = %run_id, attempt = ctx.attempt, "job completed");
                    Self::finalize(store.as_ref(), &config, &run_id, RunStatus::Succeeded, None)
                        .await;
                    if let Some(cb) = def.on_success() {
                        (cb.as_ref())(&ctx, &value);
                    }
                    break;
                }
                Err(e) => {
                    Self::finalize(
                        store.as_ref(),
                        &config,
                        &run_id,
                        RunStatus::Failed,
                        Some(e.to_string()),
                    )
                    .await;
                    if let Some(cb) = def.on_error() {
                        (cb.as_ref())(&ctx, &e);
                    }

                    let policy = def.retry();
                    if policy.should_retry(e.kind(), ctx.attempt) {
                        let delay = policy.get_delay(ctx.attempt).max(0.0);
                        warn!(
                            job_code = %code,
                            attempt = ctx.attempt,
                            error = %e,
                            delay_secs = delay,
                            "attempt failed, retrying"
                        );
                        if lock_held {
                            let extended_ttl = lock_ttl + Duration::from_secs_f64(delay);
                            match lock.extend(&code, extended_ttl).await {
                                Ok(true) => {}
                                Ok(false) => {
                                    warn!(job_code = %code, "lost lock grant before retry")
                                }
                                Err(e) => {
                                    warn!(job_code = %code, error = %e, "failed to extend lock")
                                }
                            }
                        }
                        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                        ctx = ctx.for_retry();
                        continue;
                    }

                    error!(
                        job_code = %code,
                        attempt = ctx.attempt,
                        error = %e,
                        "job failed"
                    );
                    break;
                }
            }
        }

        if lock_held {
            if let Err(e) = lock.release(&code).await {
                warn!(job_code = %code, error = %e, "failed to release lock");
            }
        }
    }

    /// Record a skipped occurrence as an already-terminal run row.
    async fn record_skip(
        store: &dyn RunStore,
        config: &SchedulerConfig,
        def: &JobDefinition,
        trigger_type: TriggerType,
        scheduled_time: DateTime<Utc>,
        reason: SkipReason,
    ) {
        if !config.enable_history {
            return;
        }
        let run = JobRun {
            run_id: Uuid::new_v4().to_string(),
            job_code: def.code().to_string(),
            attempt: 1,
            trigger_type,
            status: RunStatus::Skipped(reason),
            scheduled_time,
            started_at: None,
            finished_at: Some(Utc::now()),
            error: None,
        };
        if let Err(e) = store.record_start(&run).await {
            error!(job_code = %def.code(), error = %e, "failed to record skipped run");
        }
    }

    /// Finalize a run row, logging store failures rather than surfacing
    /// them into the run path.
    async fn finalize(
        store: &dyn RunStore,
        config: &SchedulerConfig,
        run_id: &str,
        status: RunStatus,
        error_text: Option<String>,
    ) {
        if !config.enable_history {
            return;
        }
        if let Err(e) = store.record_complete(run_id, status, error_text).await {
            error!(run_id = %run_id, error = %e, "failed to finalize run");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobError;
    use crate::job::Work;
    use crate::lock::MemoryLock;
    use crate::retry::RetryPolicy;
    use crate::trigger::{IntervalSpec, Trigger};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            timezone: "UTC".to_string(),
            ..Default::default()
        }
    }

    fn scheduler_with(config: SchedulerConfig) -> Scheduler {
        Scheduler::new(Arc::new(JobRegistry::new()), config).unwrap()
    }

    fn interval_secs(secs: i64) -> Trigger {
        Trigger::interval(IntervalSpec {
            seconds: secs,
            ..Default::default()
        })
        .unwrap()
    }

    fn counting_job(code: &str, trigger: Trigger, counter: Arc<AtomicU32>) -> JobDefinition {
        JobDefinition::builder(code)
            .trigger(trigger)
            .async_work(move |_ctx| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            })
            .build()
            .unwrap()
    }

    async fn wait_for(counter: &AtomicU32, target: u32) {
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) >= target {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "counter stuck at {} waiting for {target}",
            counter.load(Ordering::SeqCst)
        );
    }

    #[test]
    fn test_new_rejects_bad_timezone() {
        let config = SchedulerConfig {
            timezone: "Mars/Olympus_Mons".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            Scheduler::new(Arc::new(JobRegistry::new()), config),
            Err(SchedulerError::InvalidTimezone(_))
        ));
    }

    #[tokio::test]
    async fn test_add_job_primes_schedule() {
        let scheduler = scheduler_with(test_config());
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .add_job(counting_job("tick", interval_secs(60), counter))
            .await
            .unwrap();

        let next = scheduler.next_run_time("tick").await.unwrap();
        let until = next - Utc::now();
        assert!(until > chrono::Duration::seconds(50));
        assert!(until <= chrono::Duration::seconds(60));
        assert_eq!(scheduler.run_count("tick").await, 0);
    }

    #[tokio::test]
    async fn test_remove_job_clears_state() {
        let scheduler = scheduler_with(test_config());
        let counter = Arc::new(AtomicU32::new(0));
        let def = JobDefinition::builder("multi")
            .trigger(interval_secs(60))
            .trigger(interval_secs(120))
            .async_work(move |_ctx| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            })
            .build()
            .unwrap();
        scheduler.add_job(def).await.unwrap();
        assert!(scheduler.next_run_time("multi#1").await.is_some());

        scheduler.remove_job("multi").await.unwrap();
        assert!(scheduler.next_run_time("multi#1").await.is_none());
        assert!(scheduler.next_run_time("multi#2").await.is_none());
        assert!(scheduler.registry().is_empty());
    }

    #[tokio::test]
    async fn test_trigger_job_unknown_code() {
        let scheduler = scheduler_with(test_config());
        let err = scheduler.trigger_job("ghost").await.unwrap_err();
        assert!(matches!(err, SchedulerError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_trigger_job_dispatches_manual_run() {
        let store = Arc::new(MemoryRunStore::new());
        let scheduler =
            scheduler_with(test_config()).with_store(Arc::clone(&store) as Arc<dyn RunStore>);
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .add_job(counting_job("manual", interval_secs(3600), Arc::clone(&counter)))
            .await
            .unwrap();

        scheduler.trigger_job("manual").await.unwrap();
        wait_for(&counter, 1).await;

        // The run settles in the store shortly after the body finishes.
        for _ in 0..200 {
            let runs = store.runs_for("manual").await.unwrap();
            if runs
                .iter()
                .any(|run| run.status == RunStatus::Succeeded)
            {
                assert_eq!(runs[0].trigger_type, TriggerType::Manual);
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("manual run never recorded as succeeded");
    }

    #[tokio::test]
    async fn test_run_occurrence_retries_until_success() {
        let store = Arc::new(MemoryRunStore::new());
        let attempts = Arc::new(AtomicU32::new(0));
        let succeeded = Arc::new(AtomicU32::new(0));

        let attempts_in_work = Arc::clone(&attempts);
        let succeeded_in_cb = Arc::clone(&succeeded);
        let def = JobDefinition::builder("flaky")
            .trigger(interval_secs(60))
            .retry_policy(RetryPolicy::fixed(5, 0.01))
            .async_work(move |_ctx| {
                let attempts = Arc::clone(&attempts_in_work);
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(JobError::failure("not yet"))
                    } else {
                        Ok(json!("finally"))
                    }
                }
            })
            .on_success(move |ctx, value| {
                assert_eq!(ctx.attempt, 3);
                assert_eq!(*value, json!("finally"));
                succeeded_in_cb.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap();

        Scheduler::run_occurrence(
            Arc::new(def),
            TriggerType::Scheduled,
            Utc::now(),
            1,
            Arc::new(Executor::new(None)),
            Arc::new(NoopLock),
            Arc::clone(&store) as Arc<dyn RunStore>,
            test_config(),
        )
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(succeeded.load(Ordering::SeqCst), 1);

        let runs = store.runs_for("flaky").await.unwrap();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[1].status, RunStatus::Failed);
        assert_eq!(runs[2].status, RunStatus::Succeeded);
        assert_eq!(runs[1].trigger_type, TriggerType::Retry);
        assert_eq!(runs[2].attempt, 3);
    }

    #[tokio::test]
    async fn test_run_occurrence_exhausts_retries() {
        let store = Arc::new(MemoryRunStore::new());
        let errors_seen = Arc::new(AtomicU32::new(0));

        let errors_in_cb = Arc::clone(&errors_seen);
        let def = JobDefinition::builder("doomed")
            .trigger(interval_secs(60))
            .retry_policy(RetryPolicy::fixed(2, 0.01))
            .async_work(|_ctx| async { Err(JobError::failure("always")) })
            .on_error(move |_ctx, _err| {
                errors_in_cb.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap();

        Scheduler::run_occurrence(
            Arc::new(def),
            TriggerType::Scheduled,
            Utc::now(),
            1,
            Arc::new(Executor::new(None)),
            Arc::new(NoopLock),
            Arc::clone(&store) as Arc<dyn RunStore>,
            test_config(),
        )
        .await;

        // on_error fires on every attempt, the final one included.
        assert_eq!(errors_seen.load(Ordering::SeqCst), 2);

        let runs = store.runs_for("doomed").await.unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|run| run.status == RunStatus::Failed));
        assert_eq!(runs[1].error.as_deref(), Some("always"));
    }

    #[tokio::test]
    async fn test_run_occurrence_skips_when_lock_held() {
        let store = Arc::new(MemoryRunStore::new());
        let counter = Arc::new(AtomicU32::new(0));
        let def = counting_job("locked", interval_secs(60), Arc::clone(&counter));

        let ours = MemoryLock::new();
        let theirs = ours.sibling();
        assert!(
            theirs
                .acquire("locked", Duration::from_secs(60))
                .await
                .unwrap()
        );

        let config = SchedulerConfig {
            distributed_lock: true,
            ..test_config()
        };
        Scheduler::run_occurrence(
            Arc::new(def),
            TriggerType::Scheduled,
            Utc::now(),
            1,
            Arc::new(Executor::new(None)),
            Arc::new(ours),
            Arc::clone(&store) as Arc<dyn RunStore>,
            config,
        )
        .await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        let runs = store.runs_for("locked").await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Skipped(SkipReason::LockHeld));
        assert!(runs[0].started_at.is_none());
    }

    #[tokio::test]
    async fn test_run_occurrence_releases_lock_after_run() {
        let store = Arc::new(MemoryRunStore::new());
        let counter = Arc::new(AtomicU32::new(0));
        let def = counting_job("solo", interval_secs(60), Arc::clone(&counter));

        let ours = MemoryLock::new();
        let theirs = ours.sibling();

        let config = SchedulerConfig {
            distributed_lock: true,
            ..test_config()
        };
        Scheduler::run_occurrence(
            Arc::new(def),
            TriggerType::Scheduled,
            Utc::now(),
            1,
            Arc::new(Executor::new(None)),
            Arc::new(ours),
            Arc::clone(&store) as Arc<dyn RunStore>,
            config,
        )
        .await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        // Grant was given back, so the sibling can take it.
        assert!(
            theirs
                .acquire("solo", Duration::from_secs(60))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_run_occurrence_records_saturation_skip() {
        let store = Arc::new(MemoryRunStore::new());
        let executor = Arc::new(Executor::new(None));
        let gate = Arc::new(Notify::new());

        let release = Arc::clone(&gate);
        let blocker = Work::Async(Arc::new(move |_ctx| {
            let release = Arc::clone(&release);
            Box::pin(async move {
                release.notified().await;
                Ok(json!(null))
            })
        }));

        let counter = Arc::new(AtomicU32::new(0));
        let def = Arc::new(counting_job("busy", interval_secs(60), Arc::clone(&counter)));

        // Occupy the single slot for this code.
        let occupant = {
            let executor = Arc::clone(&executor);
            let ctx = def.context(TriggerType::Scheduled, Utc::now(), 0);
            tokio::spawn(async move {
                executor
                    .execute(&blocker, ctx, Some("busy"), 1, None)
                    .await
            })
        };
        while executor.running_count("busy") == 0 {
            tokio::task::yield_now().await;
        }

        Scheduler::run_occurrence(
            Arc::clone(&def),
            TriggerType::Scheduled,
            Utc::now(),
            1,
            Arc::clone(&executor),
            Arc::new(NoopLock),
            Arc::clone(&store) as Arc<dyn RunStore>,
            test_config(),
        )
        .await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        let runs = store.runs_for("busy").await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Skipped(SkipReason::Saturated));

        gate.notify_one();
        occupant.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_collect_due_skips_stale_fires_without_coalesce() {
        let config = SchedulerConfig {
            coalesce: false,
            misfire_grace_time: 30,
            ..test_config()
        };
        let store = Arc::new(MemoryRunStore::new());
        let scheduler =
            scheduler_with(config).with_store(Arc::clone(&store) as Arc<dyn RunStore>);
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .registry
            .register(counting_job("late", interval_secs(60), counter))
            .unwrap();

        let now = Utc::now();
        scheduler.state.write().await.insert(
            "late".to_string(),
            ScheduleEntry {
                next_fire: now - chrono::Duration::seconds(120),
                run_count: 0,
            },
        );

        let (due, missed) = scheduler.collect_due(now).await;

        // Fires at -120s and -60s are beyond the 30s grace; the one at
        // now is runnable.
        assert_eq!(missed.len(), 2);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].scheduled_time, now);

        // The missed fires land in history as terminal misfire skips.
        scheduler.skip_missed(missed).await;
        let runs = store.runs_for("late").await.unwrap();
        assert_eq!(runs.len(), 2);
        for run in &runs {
            assert_eq!(run.status, RunStatus::Skipped(SkipReason::Misfired));
            assert!(run.started_at.is_none());
        }
        assert_eq!(runs[0].scheduled_time, now - chrono::Duration::seconds(120));
        assert_eq!(runs[1].scheduled_time, now - chrono::Duration::seconds(60));

        let next = scheduler.next_run_time("late").await.unwrap();
        assert_eq!(next, now + chrono::Duration::seconds(60));
        assert_eq!(scheduler.run_count("late").await, 1);
    }

    #[tokio::test]
    async fn test_collect_due_coalesces_backlog() {
        let scheduler = scheduler_with(test_config());
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .registry
            .register(counting_job("late", interval_secs(60), counter))
            .unwrap();

        let now = Utc::now();
        let first_fire = now - chrono::Duration::seconds(120);
        scheduler.state.write().await.insert(
            "late".to_string(),
            ScheduleEntry {
                next_fire: first_fire,
                run_count: 0,
            },
        );

        let (due, missed) = scheduler.collect_due(now).await;

        // The whole backlog collapses into one run stamped with the
        // earliest missed fire time.
        assert!(missed.is_empty());
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].scheduled_time, first_fire);
        assert_eq!(due[0].run_count, 1);

        let next = scheduler.next_run_time("late").await.unwrap();
        assert!(next > now);
    }

    #[tokio::test]
    async fn test_collect_due_unschedules_exhausted_trigger() {
        let scheduler = scheduler_with(test_config());
        let counter = Arc::new(AtomicU32::new(0));
        let fire_at = Utc::now() - chrono::Duration::seconds(5);
        scheduler
            .registry
            .register(counting_job("oneshot", Trigger::once(fire_at), counter))
            .unwrap();
        scheduler.state.write().await.insert(
            "oneshot".to_string(),
            ScheduleEntry {
                next_fire: fire_at,
                run_count: 0,
            },
        );

        let (due, missed) = scheduler.collect_due(Utc::now()).await;
        assert_eq!(due.len(), 1);
        assert!(missed.is_empty());
        assert!(scheduler.next_run_time("oneshot").await.is_none());
    }

    #[tokio::test]
    async fn test_disabled_scheduler_does_not_run() {
        let config = SchedulerConfig {
            enabled: false,
            ..test_config()
        };
        let scheduler = scheduler_with(config);
        let (_tx, rx) = watch::channel(false);
        // Returns immediately instead of looping.
        scheduler.run(rx).await;
    }

    #[tokio::test]
    async fn test_run_loop_fires_interval_job() {
        let scheduler = Arc::new(scheduler_with(test_config()));
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .add_job(counting_job("tick", interval_secs(1), Arc::clone(&counter)))
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let loop_handle = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run(rx).await })
        };

        wait_for(&counter, 1).await;
        tx.send(true).unwrap();
        loop_handle.await.unwrap();
        assert!(scheduler.run_count("tick").await >= 1);
    }
}
