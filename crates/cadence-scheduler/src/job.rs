//! Job definitions: validated, immutable records of what to run, when,
//! and under which retry and concurrency policy.
//!
//! Definitions are built through [`JobDefinition::builder`]; validation
//! happens at `build()` time, so a definition that exists is a definition
//! that is well-formed.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::context::{JobContext, TriggerType};
use crate::error::{JobError, SchedulerError};
use crate::retry::RetryPolicy;
use crate::trigger::Trigger;

/// Boxed future returned by asynchronous job bodies.
pub type JobFuture = Pin<Box<dyn Future<Output = Result<Value, JobError>> + Send>>;

/// Asynchronous job body.
pub type AsyncFn = Arc<dyn Fn(JobContext) -> JobFuture + Send + Sync>;

/// Blocking job body, run on a worker thread by the executor.
pub type SyncFn = Arc<dyn Fn(JobContext) -> Result<Value, JobError> + Send + Sync>;

/// Success callback: `(context, result)`.
pub type OnSuccess = Arc<dyn Fn(&JobContext, &Value) + Send + Sync>;

/// Error callback: `(context, error)`, invoked on every failed attempt.
pub type OnError = Arc<dyn Fn(&JobContext, &JobError) + Send + Sync>;

/// A job body. Sync and async bodies execute uniformly; the executor
/// moves blocking bodies onto the worker pool.
#[derive(Clone)]
pub enum Work {
    Sync(SyncFn),
    Async(AsyncFn),
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Work::Sync(_) => write!(f, "Work::Sync(..)"),
            Work::Async(_) => write!(f, "Work::Async(..)"),
        }
    }
}

/// Validated, immutable description of a schedulable job.
#[derive(Clone)]
pub struct JobDefinition {
    id: String,
    code: String,
    name: String,
    description: Option<String>,
    triggers: Vec<Trigger>,
    retry: RetryPolicy,
    concurrent: bool,
    max_instances: usize,
    timeout: Option<u64>,
    work: Work,
    on_success: Option<OnSuccess>,
    on_error: Option<OnError>,
}

impl fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDefinition")
            .field("code", &self.code)
            .field("name", &self.name)
            .field("triggers", &self.triggers.len())
            .field("retry", &self.retry)
            .field("concurrent", &self.concurrent)
            .field("max_instances", &self.max_instances)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl JobDefinition {
    /// Start building a definition for `code`.
    pub fn builder(code: impl Into<String>) -> JobDefinitionBuilder {
        JobDefinitionBuilder::new(code.into())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Whether distinct runs of this job may overlap.
    pub fn concurrent(&self) -> bool {
        self.concurrent
    }

    /// Concurrency ceiling applied when `concurrent` is true.
    pub fn max_instances(&self) -> usize {
        self.max_instances
    }

    /// Per-attempt execution bound in seconds.
    pub fn timeout(&self) -> Option<u64> {
        self.timeout
    }

    pub fn work(&self) -> &Work {
        &self.work
    }

    pub fn on_success(&self) -> Option<&OnSuccess> {
        self.on_success.as_ref()
    }

    pub fn on_error(&self) -> Option<&OnError> {
        self.on_error.as_ref()
    }

    /// Effective concurrency ceiling: 1 unless overlapping runs are
    /// allowed.
    pub(crate) fn instance_limit(&self) -> usize {
        if self.concurrent { self.max_instances } else { 1 }
    }

    /// Fresh context for a run of this definition.
    pub(crate) fn context(
        &self,
        trigger_type: TriggerType,
        scheduled_time: chrono::DateTime<chrono::Utc>,
        run_count: u64,
    ) -> JobContext {
        JobContext {
            job_id: self.id.clone(),
            job_code: self.code.clone(),
            job_name: self.name.clone(),
            job_description: self.description.clone(),
            run_id: None,
            attempt: 1,
            trigger_type,
            scheduled_time,
            start_time: None,
            retry_of: None,
            run_count,
            extra: Default::default(),
        }
    }

    /// The `index`-th (1-based) sub-job of a multi-trigger definition:
    /// same policy and callbacks, code `CODE#index`, one trigger.
    pub(crate) fn sub_job(&self, index: usize) -> JobDefinition {
        let mut sub = self.clone();
        sub.id = Uuid::new_v4().to_string();
        sub.code = format!("{}#{}", self.code, index);
        sub.triggers = vec![self.triggers[index - 1].clone()];
        sub
    }
}

/// Builder for [`JobDefinition`]; all validation happens in [`build`].
///
/// [`build`]: JobDefinitionBuilder::build
pub struct JobDefinitionBuilder {
    code: String,
    name: Option<String>,
    description: Option<String>,
    triggers: Vec<Trigger>,
    max_retries: u32,
    retry_delay: f64,
    retry: Option<RetryPolicy>,
    concurrent: bool,
    max_instances: usize,
    timeout: Option<u64>,
    work: Option<Work>,
    on_success: Option<OnSuccess>,
    on_error: Option<OnError>,
}

impl JobDefinitionBuilder {
    fn new(code: String) -> Self {
        Self {
            code,
            name: None,
            description: None,
            triggers: Vec::new(),
            max_retries: 0,
            retry_delay: 60.0,
            retry: None,
            concurrent: false,
            max_instances: 1,
            timeout: None,
            work: None,
            on_success: None,
            on_error: None,
        }
    }

    /// Display name; defaults to the job code.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add a trigger. A definition needs at least one; a definition with
    /// several expands into independently scheduled sub-jobs at
    /// registration.
    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    /// Add several triggers at once.
    pub fn triggers(mut self, triggers: impl IntoIterator<Item = Trigger>) -> Self {
        self.triggers.extend(triggers);
        self
    }

    /// Retry budget for the default fixed policy.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay in seconds between attempts of the default fixed policy.
    pub fn retry_delay(mut self, secs: f64) -> Self {
        self.retry_delay = secs;
        self
    }

    /// Explicit retry policy; overrides `max_retries`/`retry_delay`.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Allow distinct runs of this job to overlap, up to `max_instances`.
    pub fn concurrent(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    /// Concurrency ceiling when `concurrent` is enabled. Must be ≥ 1.
    pub fn max_instances(mut self, max_instances: usize) -> Self {
        self.max_instances = max_instances;
        self
    }

    /// Bound a single attempt's execution to `secs` seconds.
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }

    /// Blocking job body; the executor runs it on the worker pool.
    pub fn sync_work<F>(mut self, f: F) -> Self
    where
        F: Fn(JobContext) -> Result<Value, JobError> + Send + Sync + 'static,
    {
        self.work = Some(Work::Sync(Arc::new(f)));
        self
    }

    /// Asynchronous job body, awaited in place.
    pub fn async_work<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
    {
        self.work = Some(Work::Async(Arc::new(move |ctx| Box::pin(f(ctx)))));
        self
    }

    /// Callback invoked after a successful run.
    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&JobContext, &Value) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(f));
        self
    }

    /// Callback invoked after every failed attempt, including the final
    /// one when retries are exhausted.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&JobContext, &JobError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Validate and freeze the definition.
    pub fn build(self) -> Result<JobDefinition, SchedulerError> {
        if self.code.trim().is_empty() {
            return Err(SchedulerError::InvalidDefinition(
                "job code is required".to_string(),
            ));
        }
        // '#' is reserved for sub-job codes (`CODE#i`); allowing it in
        // user codes would let `remove` on one job take out another.
        if self.code.contains('#') {
            return Err(SchedulerError::InvalidDefinition(format!(
                "job code {:?} must not contain '#'",
                self.code
            )));
        }
        if self.triggers.is_empty() {
            return Err(SchedulerError::InvalidDefinition(format!(
                "job {:?} requires at least one trigger",
                self.code
            )));
        }
        let work = self.work.ok_or_else(|| {
            SchedulerError::InvalidDefinition(format!(
                "job {:?} requires a work function",
                self.code
            ))
        })?;
        if self.max_instances < 1 {
            return Err(SchedulerError::InvalidDefinition(format!(
                "job {:?}: max_instances must be at least 1",
                self.code
            )));
        }

        let retry = self.retry.unwrap_or_else(|| {
            if self.max_retries == 0 {
                RetryPolicy::none()
            } else {
                RetryPolicy::fixed(self.max_retries, self.retry_delay)
            }
        });

        Ok(JobDefinition {
            id: Uuid::new_v4().to_string(),
            name: self.name.unwrap_or_else(|| self.code.clone()),
            code: self.code,
            description: self.description,
            triggers: self.triggers,
            retry,
            concurrent: self.concurrent,
            max_instances: self.max_instances,
            timeout: self.timeout,
            work,
            on_success: self.on_success,
            on_error: self.on_error,
        })
    }
}
