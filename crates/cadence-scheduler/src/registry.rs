//! Job registry: code to definition lookup with multi-trigger expansion.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::error::SchedulerError;
use crate::job::JobDefinition;

/// Registry of job definitions keyed by code.
///
/// A definition with N > 1 triggers registers the parent code plus one
/// `CODE#i` sub-job per trigger; only the sub-jobs are driven by the
/// control loop, but the parent stays queryable. The registry is passed
/// to the scheduler explicitly so several schedulers can coexist in one
/// process.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: DashMap<String, Arc<JobDefinition>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition, expanding multi-trigger definitions into
    /// sub-jobs. Returns the parent code.
    pub fn register(&self, definition: JobDefinition) -> Result<String, SchedulerError> {
        let code = definition.code().to_string();
        if self.jobs.contains_key(&code) {
            return Err(SchedulerError::JobExists(code));
        }

        let trigger_count = definition.triggers().len();
        if trigger_count > 1 {
            let subs: Vec<JobDefinition> = (1..=trigger_count)
                .map(|i| definition.sub_job(i))
                .collect();
            for sub in &subs {
                if self.jobs.contains_key(sub.code()) {
                    return Err(SchedulerError::JobExists(sub.code().to_string()));
                }
            }
            for sub in subs {
                self.jobs.insert(sub.code().to_string(), Arc::new(sub));
            }
            debug!(job_code = %code, sub_jobs = trigger_count, "registered multi-trigger job");
        } else {
            debug!(job_code = %code, "registered job");
        }

        self.jobs.insert(code.clone(), Arc::new(definition));
        Ok(code)
    }

    /// Look up a definition by code (parent or sub-job).
    pub fn get(&self, code: &str) -> Result<Arc<JobDefinition>, SchedulerError> {
        self.jobs
            .get(code)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SchedulerError::JobNotFound(code.to_string()))
    }

    /// Remove a definition along with any sub-jobs it expanded into.
    pub fn remove(&self, code: &str) -> Result<(), SchedulerError> {
        if self.jobs.remove(code).is_none() {
            return Err(SchedulerError::JobNotFound(code.to_string()));
        }
        let sub_prefix = format!("{code}#");
        self.jobs.retain(|key, _| !key.starts_with(&sub_prefix));
        Ok(())
    }

    /// All registered codes, sub-jobs included.
    pub fn codes(&self) -> Vec<String> {
        self.jobs.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Definitions the control loop schedules: everything except
    /// multi-trigger parents, which exist only for lookup.
    pub fn schedulable(&self) -> Vec<Arc<JobDefinition>> {
        self.jobs
            .iter()
            .filter(|entry| entry.value().triggers().len() == 1)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
