//! Per-stream replication engine: the leader loop that commits writes and
//! maintains the ISR, the follower loop that fetches and reconciles, and the
//! shared configuration.

pub mod config;
pub mod follower;
pub mod isr;
pub mod leader;
pub mod pending;

pub use config::ReplicationConfig;
pub use follower::FollowerHandle;
pub use isr::{FollowerTracker, IsrDelta};
pub use leader::{LeaderHandle, LeaderPublisher};
pub use pending::{PendingAcks, PendingPublish};
