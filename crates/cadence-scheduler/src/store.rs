//! Run-history store contract.
//!
//! Persistence of run history lives behind the [`RunStore`] trait; the
//! engine only calls it and never defines a schema. [`MemoryRunStore`]
//! backs tests and memory-store deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::context::TriggerType;
use crate::error::StoreError;

/// Why a scheduled occurrence was skipped without running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Another scheduler instance holds the job's distributed lock.
    LockHeld,
    /// The job's `max_instances` ceiling was reached.
    Saturated,
    /// The fire time was missed beyond the misfire grace period.
    Misfired,
}

/// Status of one recorded run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "skip_reason")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    /// The occurrence never executed; the reason distinguishes lock
    /// contention from concurrency saturation and misfires.
    Skipped(SkipReason),
}

/// One recorded execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub run_id: String,
    pub job_code: String,
    pub attempt: u32,
    pub trigger_type: TriggerType,
    #[serde(flatten)]
    pub status: RunStatus,
    pub scheduled_time: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Save/load boundary for run history.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a run row. Skipped occurrences are inserted already
    /// terminal.
    async fn record_start(&self, run: &JobRun) -> Result<(), StoreError>;

    /// Finalize a run row.
    async fn record_complete(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    /// All recorded runs for a job code, oldest first.
    async fn runs_for(&self, job_code: &str) -> Result<Vec<JobRun>, StoreError>;

    /// Drop runs scheduled before `older_than`; returns how many were
    /// removed.
    async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// In-memory run store.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: RwLock<Vec<JobRun>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total recorded runs across all jobs.
    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn record_start(&self, run: &JobRun) -> Result<(), StoreError> {
        self.runs.write().await.push(run.clone());
        Ok(())
    }

    async fn record_complete(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut runs = self.runs.write().await;
        let run = runs
            .iter_mut()
            .find(|run| run.run_id == run_id)
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;
        run.status = status;
        run.finished_at = Some(Utc::now());
        run.error = error;
        Ok(())
    }

    async fn runs_for(&self, job_code: &str) -> Result<Vec<JobRun>, StoreError> {
        Ok(self
            .runs
            .read()
            .await
            .iter()
            .filter(|run| run.job_code == job_code)
            .cloned()
            .collect())
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut runs = self.runs.write().await;
        let before = runs.len();
        runs.retain(|run| run.scheduled_time >= older_than);
        Ok((before - runs.len()) as u64)
    }
}
