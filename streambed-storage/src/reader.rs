use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use streambed_core::{Message, Result, StreambedError};

use crate::log::CommitLog;

/// How far a reader may see into the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Never read past the high-watermark. Used by subscribers.
    Committed,

    /// Read up to the newest offset. Used by the leader to serve follower
    /// fetches, which must carry uncommitted messages for the HW to advance.
    Uncommitted,
}

/// Streaming reader over a commit log. Messages come back strictly in offset
/// order; `next_batch` blocks until data is visible under the read mode.
pub struct LogReader {
    log: Arc<CommitLog>,
    next: u64,
    mode: ReadMode,
}

impl LogReader {
    pub(crate) fn new(log: Arc<CommitLog>, start: u64, mode: ReadMode) -> Self {
        Self { log, next: start, mode }
    }

    /// Next offset this reader will return.
    pub fn position(&self) -> u64 {
        self.next
    }

    /// Wait until at least one message is visible and return a batch bounded
    /// by `max_bytes`. Returns `Cancelled` when the token fires and
    /// `Truncated` when truncation overtook the cursor.
    pub async fn next_batch(
        &mut self,
        max_bytes: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>> {
        loop {
            if let Some(messages) = self.poll(max_bytes)? {
                return Ok(messages);
            }

            // Register interest before re-checking, so a concurrent append
            // or HW advance cannot slip between the check and the wait.
            let log = self.log.clone();
            let notified = match self.mode {
                ReadMode::Committed => log.hw_notify.notified(),
                ReadMode::Uncommitted => log.data_notify.notified(),
            };

            if let Some(messages) = self.poll(max_bytes)? {
                return Ok(messages);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(StreambedError::Cancelled),
                _ = notified => {}
            }
        }
    }

    /// Like `next_batch`, but gives up after `wait` and returns an empty
    /// batch. Used by the leader to long-poll follower fetches.
    pub async fn next_batch_timeout(
        &mut self,
        max_bytes: usize,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>> {
        match tokio::time::timeout(wait, self.next_batch(max_bytes, cancel)).await {
            Ok(result) => result,
            Err(_) => Ok(Vec::new()),
        }
    }

    fn poll(&mut self, max_bytes: usize) -> Result<Option<Vec<Message>>> {
        let log_end = self.log.log_end_offset();
        if self.next > log_end {
            return Err(StreambedError::Truncated(self.next));
        }

        let limit = match self.mode {
            ReadMode::Committed => self
                .log
                .high_watermark()
                .map(|hw| hw.value() + 1)
                .unwrap_or(0),
            ReadMode::Uncommitted => log_end,
        };

        if self.next < limit {
            let messages = self.log.read_from(self.next, max_bytes, limit)?;
            if let Some(last) = messages.last() {
                self.next = last.offset.value() + 1;
                return Ok(Some(messages));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogConfig;
    use bytes::Bytes;
    use streambed_core::{Epoch, Offset};
    use tempfile::TempDir;

    fn msg(value: &str) -> Message {
        Message::new(None, Bytes::copy_from_slice(value.as_bytes()))
    }

    #[tokio::test]
    async fn test_committed_reader_waits_for_hw() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(dir.path().to_path_buf(), LogConfig::default()).unwrap();
        log.append_batch(Epoch::new(1), vec![msg("a"), msg("b")]).unwrap();

        let mut reader = log.reader(Offset::START, ReadMode::Committed);
        let cancel = CancellationToken::new();

        // Nothing committed: the reader must not return data yet.
        let pending = tokio::time::timeout(
            Duration::from_millis(50),
            reader.next_batch(usize::MAX, &cancel),
        )
        .await;
        assert!(pending.is_err());

        log.advance_high_watermark(Offset::new(0));
        let batch = reader.next_batch(usize::MAX, &cancel).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].value, "a");

        log.advance_high_watermark(Offset::new(1));
        let batch = reader.next_batch(usize::MAX, &cancel).await.unwrap();
        assert_eq!(batch[0].value, "b");
    }

    #[tokio::test]
    async fn test_uncommitted_reader_sees_everything() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(dir.path().to_path_buf(), LogConfig::default()).unwrap();
        log.append_batch(Epoch::new(1), vec![msg("a"), msg("b")]).unwrap();

        let mut reader = log.reader(Offset::START, ReadMode::Uncommitted);
        let cancel = CancellationToken::new();

        let batch = reader.next_batch(usize::MAX, &cancel).await.unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn test_reader_cancellation() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(dir.path().to_path_buf(), LogConfig::default()).unwrap();

        let mut reader = log.reader(Offset::START, ReadMode::Committed);
        let cancel = CancellationToken::new();

        let waiter = tokio::spawn({
            let cancel = cancel.clone();
            async move { reader.next_batch(usize::MAX, &cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(StreambedError::Cancelled)));
    }

    #[tokio::test]
    async fn test_reader_detects_truncation() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(dir.path().to_path_buf(), LogConfig::default()).unwrap();
        log.append_batch(Epoch::new(1), vec![msg("a"), msg("b"), msg("c")])
            .unwrap();
        log.advance_high_watermark(Offset::new(2));

        let mut reader = log.reader(Offset::START, ReadMode::Committed);
        let cancel = CancellationToken::new();
        let batch = reader.next_batch(usize::MAX, &cancel).await.unwrap();
        assert_eq!(batch.len(), 3);

        log.truncate(1).unwrap();
        let result = reader.next_batch(usize::MAX, &cancel).await;
        assert!(matches!(result, Err(StreambedError::Truncated(_))));
    }

    #[tokio::test]
    async fn test_long_poll_returns_empty_on_timeout() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(dir.path().to_path_buf(), LogConfig::default()).unwrap();

        let mut reader = log.reader(Offset::START, ReadMode::Uncommitted);
        let cancel = CancellationToken::new();

        let batch = reader
            .next_batch_timeout(usize::MAX, Duration::from_millis(30), &cancel)
            .await
            .unwrap();
        assert!(batch.is_empty());
    }
}
