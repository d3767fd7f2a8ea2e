use thiserror::Error;

use crate::stream::NodeId;

pub type Result<T> = std::result::Result<T, StreambedError>;

#[derive(Error, Debug, Clone)]
pub enum StreambedError {
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("temporarily unavailable: {0}")]
    TransientUnavailable(String),

    #[error("not leader (current leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    #[error("stale epoch: request epoch {request} behind current epoch {current}")]
    StaleEpoch { request: u64, current: u64 },

    #[error("offset out of range: {0}")]
    OffsetOutOfRange(u64),

    #[error("reader overtaken by truncation at offset {0}")]
    Truncated(u64),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl StreambedError {
    /// Whether the caller may retry the operation after refreshing metadata
    /// or backing off.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            StreambedError::TransientUnavailable(_)
                | StreambedError::NotLeader { .. }
                | StreambedError::StaleEpoch { .. }
                | StreambedError::Timeout
        )
    }
}

impl From<std::io::Error> for StreambedError {
    fn from(err: std::io::Error) -> Self {
        StreambedError::Storage(err.to_string())
    }
}
