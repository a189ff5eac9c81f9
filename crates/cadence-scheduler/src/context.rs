//! Per-run job metadata.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What caused a run to be dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Fired by the job's trigger.
    Scheduled,
    /// Explicitly dispatched via `Scheduler::trigger_job`.
    Manual,
    /// Re-dispatched by the retry policy after a failure.
    Retry,
}

/// Metadata describing one execution attempt of a job.
///
/// Constructed by the scheduler and read by job code. Each run owns its
/// context exclusively; retries derive a fresh context rather than
/// mutating the failed attempt's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobContext {
    /// Identifier of the job definition.
    pub job_id: String,
    /// Registered job code (sub-jobs carry their `CODE#i` form).
    pub job_code: String,
    pub job_name: String,
    pub job_description: Option<String>,
    /// Assigned by the scheduler when the run starts.
    pub run_id: Option<String>,
    /// Attempt number, starting at 1.
    pub attempt: u32,
    pub trigger_type: TriggerType,
    /// The fire time this run was dispatched for.
    pub scheduled_time: DateTime<Utc>,
    /// Set just before execution begins.
    pub start_time: Option<DateTime<Utc>>,
    /// Run id of the attempt this one is retrying.
    pub retry_of: Option<String>,
    /// Cumulative historical executions of this job code (informational).
    pub run_count: u64,
    /// Open mapping for caller-supplied data.
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

impl JobContext {
    /// Context for the retry of this attempt: attempt incremented,
    /// trigger type `Retry`, `retry_of` pointing at this run.
    pub(crate) fn for_retry(&self) -> Self {
        Self {
            run_id: None,
            attempt: self.attempt + 1,
            trigger_type: TriggerType::Retry,
            start_time: None,
            retry_of: self.run_id.clone(),
            ..self.clone()
        }
    }
}
