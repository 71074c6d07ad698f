//! # iotno-scheduler
//!
//! The durable, crash-recoverable two-phase timing machine.
//!
//! Persistent state lives in the transaction row; the in-memory timers are
//! only a cache of wake times derivable from it. On `schedule.requested`
//! the scheduler materializes the row and arms the start timer; the end
//! timer is armed only once the start phase has completed (signalled by
//! `all-devices.completed`), never before. After a restart, rehydration
//! re-arms every timer from the store, which preserves the same ordering.
//!
//! Timer firings flow through a bounded queue into a worker pool. Each
//! firing atomically claims its `(transaction, action)` pair before fanning
//! out one `device.actuation.request` per device, so a duplicate firing is
//! dropped at the claim.

pub mod retention;
pub mod scheduler;

use std::time::Duration;

use iotno_core::Result;
use iotno_core::config::{RetentionConfig, env_usize};

pub use scheduler::Scheduler;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Size of the fire worker pool.
    pub worker_count: usize,
    /// Capacity of the bounded fire queue.
    pub channel_size: usize,
    /// Retention policy for terminal transactions.
    pub retention: RetentionConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 10,
            channel_size: 100,
            retention: RetentionConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Loads from `SCHEDULER_WORKER_COUNT`, `SCHEDULER_CHANNEL_SIZE`, and
    /// the retention environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error when a value is present but unparseable.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(count) = env_usize("SCHEDULER_WORKER_COUNT")? {
            config.worker_count = count.max(1);
        }
        if let Some(size) = env_usize("SCHEDULER_CHANNEL_SIZE")? {
            config.channel_size = size.max(1);
        }
        config.retention = RetentionConfig::from_env()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.worker_count, 10);
        assert_eq!(config.channel_size, 100);
        assert_eq!(config.retention.period, Duration::from_secs(168 * 3600));
    }
}
