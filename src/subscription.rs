use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use streambed_core::{Message, Offset, Result, StreambedError};
use streambed_storage::{CommitLog, ReadMode};

use crate::node::StreamReplica;

const SUBSCRIPTION_QUEUE: usize = 1024;
const READ_CHUNK_BYTES: usize = 64 * 1024;

/// Where a subscription begins reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// The oldest retained message.
    Earliest,

    /// The most recent committed message.
    Latest,

    /// A specific offset.
    Offset(u64),

    /// The first message with a timestamp at or after the given time
    /// (milliseconds since the Unix epoch).
    Timestamp(i64),

    /// Only messages committed after the subscription is opened.
    NewOnly,
}

#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub subject: String,
    pub name: String,
    pub start: StartPosition,
}

/// An ordered stream of committed messages. Dropping the subscription (or
/// calling `cancel`) stops the pump; deleting the stream ends it with an
/// error.
pub struct Subscription {
    rx: mpsc::Receiver<Result<Message>>,
    cancel: CancellationToken,
}

impl Subscription {
    /// Next committed message, in offset order. `None` once cancelled and
    /// drained.
    pub async fn recv(&mut self) -> Option<Result<Message>> {
        self.rx.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Open a committed reader over the replica's log and pump it into a channel.
pub(crate) fn open(replica: &Arc<StreamReplica>, start: StartPosition) -> Result<Subscription> {
    let log = Arc::clone(replica.log());
    let start_offset = resolve(&log, start)?;

    let cancel = replica.subscriptions_token().child_token();
    let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE);

    let mut reader = log.reader(Offset::new(start_offset), ReadMode::Committed);
    let pump_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            match reader.next_batch(READ_CHUNK_BYTES, &pump_cancel).await {
                Ok(batch) => {
                    for message in batch {
                        if tx.send(Ok(message)).await.is_err() {
                            return;
                        }
                    }
                }
                Err(StreambedError::Cancelled) => return,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
    });

    Ok(Subscription { rx, cancel })
}

fn resolve(log: &CommitLog, start: StartPosition) -> Result<u64> {
    match start {
        StartPosition::Earliest => Ok(log.oldest_offset().map(|o| o.value()).unwrap_or(0)),
        StartPosition::Latest => Ok(log.high_watermark().map(|hw| hw.value()).unwrap_or(0)),
        StartPosition::NewOnly => Ok(log
            .high_watermark()
            .map(|hw| hw.value() + 1)
            .unwrap_or(0)),
        StartPosition::Timestamp(ts) => Ok(log
            .lookup_timestamp(ts)?
            .map(|o| o.value())
            .unwrap_or_else(|| log.log_end_offset())),
        StartPosition::Offset(offset) => {
            let oldest = log.oldest_offset().map(|o| o.value()).unwrap_or(0);
            if offset < oldest || offset > log.log_end_offset() {
                return Err(StreambedError::OffsetOutOfRange(offset));
            }
            Ok(offset)
        }
    }
}
