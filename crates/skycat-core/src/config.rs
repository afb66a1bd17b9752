//! Engine configuration: worker pool sizing and cell lock policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How writers wait for contended cell locks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockPolicy {
    /// Fixed pause between lock attempts, in milliseconds.
    pub backoff_ms: u64,
    /// Attempts allowed when opening a single cell for writing. `None` waits forever.
    pub open_retries: Option<u32>,
    /// Consecutive missed lock attempts an append tolerates before giving up.
    /// Each cell written restores the full budget.
    pub max_append_attempts: u32,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            backoff_ms: 10,
            open_retries: None,
            max_append_attempts: 3600,
        }
    }
}

impl LockPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Configuration shared by every operation on an open catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads used by map-reduce jobs. `None` uses the available parallelism.
    pub workers: Option<usize>,
    /// Capacity of the channel buffering finished partitions.
    pub result_buffer: usize,
    pub lock: LockPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: None,
            result_buffer: 64,
            lock: LockPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Sets the number of worker threads.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers.max(1));
        self
    }

    /// Sets the result channel capacity.
    #[must_use]
    pub fn with_result_buffer(mut self, capacity: usize) -> Self {
        self.result_buffer = capacity.max(1);
        self
    }

    /// Sets the cell lock policy.
    #[must_use]
    pub fn with_lock_policy(mut self, lock: LockPolicy) -> Self {
        self.lock = lock;
        self
    }

    /// Resolve the effective worker count.
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str(r#"{"workers": 3}"#).unwrap();
        assert_eq!(cfg.workers, Some(3));
        assert_eq!(cfg.lock, LockPolicy::default());
        assert_eq!(cfg.worker_count(), 3);
    }

    #[test]
    fn test_builders_clamp() {
        let cfg = EngineConfig::default()
            .with_workers(0)
            .with_result_buffer(0);
        assert_eq!(cfg.worker_count(), 1);
        assert_eq!(cfg.result_buffer, 1);
    }
}
