//! A job-scheduling engine: cron, interval, and one-shot triggers,
//! retry policies with configurable backoff, bounded-concurrency
//! execution, and optional distributed locking for multi-instance
//! deployments.
//!
//! Jobs are described by [`JobDefinition`]s, collected in a
//! [`JobRegistry`], and driven by a [`Scheduler`] control loop:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use cadence_scheduler::{
//!     JobDefinition, JobRegistry, Scheduler, SchedulerConfig, Trigger,
//! };
//! use serde_json::json;
//! use tokio::sync::watch;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(JobRegistry::new());
//! let scheduler = Scheduler::new(Arc::clone(&registry), SchedulerConfig::default())?;
//!
//! scheduler
//!     .add_job(
//!         JobDefinition::builder("reports.daily")
//!             .trigger(Trigger::cron("0 8 * * *")?)
//!             .max_retries(3)
//!             .async_work(|ctx| async move {
//!                 tracing::info!(job = %ctx.job_code, "generating report");
//!                 Ok(json!({ "ok": true }))
//!             })
//!             .build()?,
//!     )
//!     .await?;
//!
//! // Send `true` on the shutdown channel to stop the loop.
//! let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//! scheduler.run(shutdown_rx).await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod job;
pub mod lock;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod trigger;

pub use config::{SchedulerConfig, StoreKind};
pub use context::{JobContext, TriggerType};
pub use error::{JobError, LockError, SchedulerError, StoreError};
pub use executor::{ExecutionOutcome, Executor};
pub use job::{JobDefinition, JobDefinitionBuilder, Work};
pub use lock::{DistributedLock, MemoryLock, NoopLock};
pub use registry::JobRegistry;
pub use retry::{Backoff, RetryPolicy};
pub use scheduler::Scheduler;
pub use store::{JobRun, MemoryRunStore, RunStatus, RunStore, SkipReason};
pub use trigger::{CronFields, IntervalSpec, Trigger};
