use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use streambed_core::{
    AckPolicy, Epoch, Header, MessageBatch, NodeId, Offset, Result, StreambedError,
};

/// Encode a wire message.
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    bincode::serialize(value)
        .map(Bytes::from)
        .map_err(|e| StreambedError::Serialization(e.to_string()))
}

/// Decode a wire message.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| StreambedError::Serialization(e.to_string()))
}

/// Follower asking the leader for messages starting at `fetch_offset`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationRequest {
    pub replica_id: NodeId,
    pub epoch: Epoch,
    pub fetch_offset: u64,
}

/// Leader's reply to a fetch: its epoch, its HW, and any available batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationResponse {
    pub epoch: Epoch,
    pub high_watermark: Option<Offset>,
    pub batch: Option<MessageBatch>,
}

/// Follower asking the leader for the last valid offset in `epoch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderEpochRequest {
    pub replica_id: NodeId,
    pub epoch: Epoch,
}

/// Leader's answer: the responder's current epoch (so stale leaders can be
/// ignored) and the greatest offset valid at or below the requested epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderEpochResponse {
    pub epoch: Epoch,
    pub end_offset: Option<Offset>,
}

/// A publish addressed to a stream's subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishEnvelope {
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Vec<Header>,
    pub ack_policy: AckPolicy,
    pub correlation_id: String,
    pub ack_inbox: Option<String>,
}

/// Acknowledgement (or error) sent back to a publisher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PublishReply {
    Ack {
        offset: Offset,
        correlation_id: String,
    },
    Error {
        correlation_id: String,
        message: String,
    },
}
