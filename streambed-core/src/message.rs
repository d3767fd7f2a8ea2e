use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::epoch::Epoch;
use crate::error::{Result, StreambedError};
use crate::offset::Offset;

/// A single message in a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Offset assigned by the leader at append time.
    pub offset: Offset,

    /// Leader epoch under which the message was appended.
    pub epoch: Epoch,

    /// Milliseconds since the Unix epoch, assigned by the leader.
    pub timestamp_ms: i64,

    /// Optional key.
    pub key: Option<Bytes>,

    /// Payload.
    pub value: Bytes,

    /// Optional metadata headers.
    pub headers: Vec<Header>,
}

impl Message {
    pub fn new(key: Option<Bytes>, value: Bytes) -> Self {
        Self {
            offset: Offset::START,
            epoch: Epoch::UNASSIGNED,
            timestamp_ms: 0,
            key,
            value,
            headers: Vec::new(),
        }
    }

    pub fn with_headers(mut self, headers: Vec<Header>) -> Self {
        self.headers = headers;
        self
    }

    pub fn size_bytes(&self) -> usize {
        self.key.as_ref().map_or(0, |k| k.len()) + self.value.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub key: String,
    pub value: Bytes,
}

impl Header {
    pub fn new(key: impl Into<String>, value: Bytes) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Acknowledgement policy for a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckPolicy {
    /// No acknowledgement is sent.
    None,

    /// Acknowledge once the leader has appended the message locally.
    Leader,

    /// Acknowledge once the message is replicated to every ISR member.
    All,
}

/// A contiguous run of messages, exchanged between replicas as one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBatch {
    /// Offset of the first message in the batch.
    pub base_offset: Offset,

    /// Messages in strict offset order.
    pub messages: Vec<Message>,

    /// CRC32 over the serialized messages.
    pub crc: u32,
}

impl MessageBatch {
    pub fn new(base_offset: Offset, messages: Vec<Message>) -> Self {
        let crc = Self::checksum(&messages);
        Self {
            base_offset,
            messages,
            crc,
        }
    }

    pub fn count(&self) -> usize {
        self.messages.len()
    }

    pub fn size_bytes(&self) -> usize {
        self.messages.iter().map(|m| m.size_bytes()).sum()
    }

    pub fn last_offset(&self) -> Option<Offset> {
        self.messages.last().map(|m| m.offset)
    }

    pub fn verify_crc(&self) -> Result<()> {
        let computed = Self::checksum(&self.messages);
        if computed != self.crc {
            return Err(StreambedError::Serialization(format!(
                "batch crc mismatch: expected {}, computed {computed}",
                self.crc
            )));
        }
        Ok(())
    }

    fn checksum(messages: &[Message]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        for m in messages {
            hasher.update(&m.offset.value().to_le_bytes());
            hasher.update(&m.epoch.value().to_le_bytes());
            hasher.update(&m.timestamp_ms.to_le_bytes());
            if let Some(key) = &m.key {
                hasher.update(key);
            }
            hasher.update(&m.value);
        }
        hasher.finalize()
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
