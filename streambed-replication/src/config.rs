use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the replication engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Window beyond which a silent or lagging follower leaves the ISR.
    pub replica_max_lag_time_ms: u64,

    /// Offset lag a follower may sustain over the lag window before it
    /// leaves the ISR.
    pub replica_max_lag_offsets: u64,

    /// Per-fetch RPC timeout.
    pub replica_fetch_timeout_ms: u64,

    /// Consecutive fetch timeouts before a follower declares the leader
    /// unreachable.
    pub replica_max_leader_timeout: u32,

    /// Backoff between failed fetch or epoch-sync attempts.
    pub replica_retry_backoff_ms: u64,

    /// How long the leader holds a fetch open waiting for new data before
    /// replying with an empty batch. Must stay well below the fetch timeout.
    pub fetch_wait_max_ms: u64,

    /// Cadence of the leader's ISR evaluation (capped by the lag window).
    pub isr_check_interval_ms: u64,

    /// Largest batch returned to a single fetch.
    pub max_batch_bytes: usize,

    /// Default wait for an ALL-policy publish acknowledgement.
    pub ack_timeout_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replica_max_lag_time_ms: 10_000,
            replica_max_lag_offsets: 10_000,
            replica_fetch_timeout_ms: 3_000,
            replica_max_leader_timeout: 3,
            replica_retry_backoff_ms: 100,
            fetch_wait_max_ms: 250,
            isr_check_interval_ms: 1_000,
            max_batch_bytes: 1024 * 1024,
            ack_timeout_ms: 10_000,
        }
    }
}

impl ReplicationConfig {
    pub fn max_lag(&self) -> Duration {
        Duration::from_millis(self.replica_max_lag_time_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.replica_fetch_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.replica_retry_backoff_ms)
    }

    pub fn fetch_wait_max(&self) -> Duration {
        Duration::from_millis(self.fetch_wait_max_ms)
    }

    pub fn isr_check_interval(&self) -> Duration {
        Duration::from_millis(self.isr_check_interval_ms.min(self.replica_max_lag_time_ms))
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}
