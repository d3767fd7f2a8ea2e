use serde::{Deserialize, Serialize};
use std::fmt;

use crate::epoch::Epoch;

/// Identifier of a cluster node.
pub type NodeId = u64;

/// Unique identifier for a stream: the subject it is attached to plus a name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId {
    pub subject: String,
    pub name: String,
}

impl StreamId {
    pub fn new(subject: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.subject, self.name)
    }
}

/// Parameters for creating a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSpec {
    pub id: StreamId,
    pub replication_factor: usize,
    pub min_isr: usize,
}

impl StreamSpec {
    pub fn new(id: StreamId, replication_factor: usize) -> Self {
        Self {
            id,
            replication_factor,
            min_isr: 1,
        }
    }

    pub fn with_min_isr(mut self, min_isr: usize) -> Self {
        self.min_isr = min_isr;
        self
    }
}

/// Authoritative per-stream metadata delivered by the controller.
///
/// Updates are at-least-once and monotonic in epoch per stream; receivers
/// discard anything with an epoch below the latest they have applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamUpdate {
    pub id: StreamId,
    pub epoch: Epoch,
    pub leader: Option<NodeId>,
    pub replicas: Vec<NodeId>,
    pub isr: Vec<NodeId>,
    pub min_isr: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_display() {
        let id = StreamId::new("orders", "orders-log");
        assert_eq!(id.to_string(), "orders/orders-log");
    }
}
