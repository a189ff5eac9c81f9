//! Scheduler configuration.

use serde::{Deserialize, Serialize};

/// Which run-history backend the deployment uses. The engine only sees
/// the [`RunStore`](crate::store::RunStore) trait; this tag exists so a
/// config file can select a backend at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Memory,
    Persistent,
}

/// Runtime knobs for one scheduler instance.
///
/// Every field has a default, so a config file can set only what it
/// cares about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// When false, `run` returns immediately without scheduling anything.
    pub enabled: bool,
    /// IANA timezone applied to cron triggers that carry no explicit
    /// timezone of their own.
    pub timezone: String,
    /// Run-history backend selector.
    pub store: StoreKind,
    /// Upper bound on concurrently executing blocking job bodies.
    pub max_workers: usize,
    /// Seconds a fire time may be late before it counts as misfired.
    pub misfire_grace_time: u64,
    /// Collapse a backlog of misfired occurrences into one run instead
    /// of skipping them.
    pub coalesce: bool,
    /// Gate scheduled runs on a distributed lock keyed by job code.
    pub distributed_lock: bool,
    /// Connection URL for the lock backend, when one is configured.
    pub lock_backend_url: Option<String>,
    /// Lock grant lifetime in seconds.
    pub lock_timeout: u64,
    /// Record run history to the store.
    pub enable_history: bool,
    /// Days of run history to keep before pruning.
    pub history_retention_days: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timezone: "Asia/Shanghai".to_string(),
            store: StoreKind::Memory,
            max_workers: 10,
            misfire_grace_time: 30,
            coalesce: true,
            distributed_lock: false,
            lock_backend_url: None,
            lock_timeout: 60,
            enable_history: true,
            history_retention_days: 30,
        }
    }
}
