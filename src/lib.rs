//! Streambed - Replicated, Partitioned, Append-Only Log Service
//!
//! Streambed stores named streams of messages on top of a pub/sub transport.
//! Each stream is an ordered, replicated commit log:
//!
//! - Publishes go to the stream's leader, which assigns dense offsets
//! - Followers fetch from the leader and acknowledge by advancing
//! - The high-watermark tracks what is replicated to every in-sync replica
//! - ACK_ALL publishes resolve only once committed, so acked data survives
//!   any failover that leaves one in-sync replica alive
//! - Leader epochs and a reconciliation handshake keep replica logs from
//!   diverging across elections

pub mod config;
pub mod controller;
pub mod node;
pub mod subscription;

pub use streambed_core as core;
pub use streambed_replication as replication;
pub use streambed_storage as storage;
pub use streambed_transport as transport;

pub use config::NodeConfig;
pub use controller::{ControllerEvent, MetadataAuthority, StandaloneController};
pub use node::{Node, PublishAck, PublishRequest, StreamReplica};
pub use subscription::{StartPosition, SubscribeRequest, Subscription};

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::config::NodeConfig;
    pub use crate::controller::StandaloneController;
    pub use crate::core::{
        AckPolicy, Epoch, Message, NodeId, Offset, Result, StreamId, StreamSpec,
    };
    pub use crate::node::{Node, PublishAck, PublishRequest};
    pub use crate::subscription::{StartPosition, SubscribeRequest, Subscription};
    pub use crate::transport::Bus;
}
