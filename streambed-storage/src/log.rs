use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use streambed_core::{
    message::now_timestamp_ms, Epoch, EpochMap, Message, MessageBatch, Offset, Result,
    StreambedError,
};

use crate::index::Index;
use crate::reader::{LogReader, ReadMode};
use crate::segment::Segment;

const META_FILE: &str = "replica.meta";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Maximum size of a single segment file before the log rolls.
    pub max_segment_bytes: u64,

    /// Fsync data and index on every flush.
    pub sync_on_write: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_segment_bytes: 256 * 1024 * 1024,
            sync_on_write: false,
        }
    }
}

/// Durable sidecar state: the leader epoch map and the last persisted HW.
#[derive(Debug, Serialize, Deserialize)]
struct ReplicaMeta {
    epoch_map: EpochMap,
    high_watermark: i64,
}

impl Default for ReplicaMeta {
    fn default() -> Self {
        Self {
            epoch_map: EpochMap::new(),
            high_watermark: -1,
        }
    }
}

struct SegmentPair {
    segment: Segment,
    index: Index,
}

struct LogInner {
    segments: Vec<SegmentPair>,
    epoch_map: EpochMap,
    log_end: u64,
}

/// Append-only ordered storage for one stream replica.
///
/// Offsets are dense and assigned at append time. The high-watermark is the
/// committed frontier: committed readers never see past it. The log is
/// mutated by exactly one writer at a time (the replica's active role loop);
/// readers run concurrently under the inner read lock.
pub struct CommitLog {
    dir: PathBuf,
    config: LogConfig,
    inner: RwLock<LogInner>,
    // -1 means nothing is committed yet. Kept atomic so HW reads are
    // lock-free on the publish hot path.
    hw: AtomicI64,
    pub(crate) data_notify: Notify,
    pub(crate) hw_notify: Notify,
}

impl CommitLog {
    /// Open (or create) the log stored under `dir`. The persisted HW is
    /// clamped to the recovered newest offset.
    pub fn open(dir: PathBuf, config: LogConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&dir).map_err(|e| StreambedError::Storage(e.to_string()))?;

        let mut segment_files = std::fs::read_dir(&dir)
            .map_err(|e| StreambedError::Storage(e.to_string()))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("log"))
            .map(|entry| entry.path())
            .collect::<Vec<_>>();

        segment_files.sort();

        let mut segments = Vec::new();
        if segment_files.is_empty() {
            let segment = Segment::create(Offset::START, &dir, config.max_segment_bytes)?;
            let index = Index::create(segment.path())?;
            segments.push(SegmentPair { segment, index });
        } else {
            for path in segment_files {
                let segment = Segment::open(path.clone(), config.max_segment_bytes)?;
                let index_path = path.with_extension("index");
                let index = if index_path.exists() {
                    Index::open(index_path)?
                } else {
                    Index::create(&path)?
                };
                segments.push(SegmentPair { segment, index });
            }
        }

        let last = segments.last().expect("at least one segment");
        let log_end = last
            .index
            .last_offset()
            .map(|o| o + 1)
            .unwrap_or_else(|| last.segment.base_offset().value());

        let meta_path = dir.join(META_FILE);
        let meta: ReplicaMeta = if meta_path.exists() {
            let bytes =
                std::fs::read(&meta_path).map_err(|e| StreambedError::Storage(e.to_string()))?;
            bincode::deserialize(&bytes)
                .map_err(|e| StreambedError::Serialization(e.to_string()))?
        } else {
            ReplicaMeta::default()
        };

        let mut epoch_map = meta.epoch_map;
        epoch_map.truncate(log_end);

        let hw = meta.high_watermark.min(log_end as i64 - 1);

        Ok(Arc::new(Self {
            dir,
            config,
            inner: RwLock::new(LogInner {
                segments,
                epoch_map,
                log_end,
            }),
            hw: AtomicI64::new(hw),
            data_notify: Notify::new(),
            hw_notify: Notify::new(),
        }))
    }

    /// Next offset to be assigned.
    pub fn log_end_offset(&self) -> u64 {
        self.inner.read().log_end
    }

    /// Last appended offset.
    pub fn newest_offset(&self) -> Option<Offset> {
        let log_end = self.inner.read().log_end;
        log_end.checked_sub(1).map(Offset::new)
    }

    /// First retained offset.
    pub fn oldest_offset(&self) -> Option<Offset> {
        let inner = self.inner.read();
        let base = inner
            .segments
            .first()
            .map(|s| s.segment.base_offset().value())
            .unwrap_or(0);
        (inner.log_end > base).then(|| Offset::new(base))
    }

    /// Highest committed offset, or `None` when nothing is committed yet.
    pub fn high_watermark(&self) -> Option<Offset> {
        let hw = self.hw.load(Ordering::Acquire);
        (hw >= 0).then(|| Offset::new(hw as u64))
    }

    /// Set the HW directly. Values beyond the newest offset are clamped; a
    /// follower lowers its HW this way only during reconciliation.
    pub fn set_high_watermark(&self, hw: Offset) {
        let newest = self.inner.read().log_end as i64 - 1;
        let target = (hw.value() as i64).min(newest);
        self.hw.store(target, Ordering::Release);
        self.hw_notify.notify_waiters();
    }

    /// Advance the HW monotonically, clamped to the newest offset. Returns
    /// whether it moved.
    pub fn advance_high_watermark(&self, to: Offset) -> bool {
        let newest = self.inner.read().log_end as i64 - 1;
        let target = (to.value() as i64).min(newest);
        if target < 0 {
            return false;
        }
        let prev = self.hw.fetch_max(target, Ordering::AcqRel);
        if prev < target {
            self.hw_notify.notify_waiters();
            true
        } else {
            false
        }
    }

    /// Append messages as the leader of `epoch`, assigning offsets and
    /// timestamps. Returns the offset of the first message.
    pub fn append_batch(&self, epoch: Epoch, mut messages: Vec<Message>) -> Result<Offset> {
        if messages.is_empty() {
            return Err(StreambedError::InvalidRequest("empty batch".to_string()));
        }

        let mut inner = self.inner.write();
        let base = inner.log_end;
        let ts = now_timestamp_ms();

        for (i, m) in messages.iter_mut().enumerate() {
            m.offset = Offset::new(base + i as u64);
            m.epoch = epoch;
            m.timestamp_ms = ts;
        }

        if inner.epoch_map.latest().map_or(true, |e| e < epoch) {
            inner.epoch_map.record(epoch, base);
            self.persist_meta(&inner)?;
        }

        for m in &messages {
            self.write_message(&mut inner, m)?;
            inner.log_end = m.offset.value() + 1;
        }
        self.flush(&inner)?;

        drop(inner);
        self.data_notify.notify_waiters();
        Ok(Offset::new(base))
    }

    /// Append a replicated batch on a follower. The batch must start exactly
    /// at the current log end; anything else is rejected so the caller can
    /// discard the response and refetch.
    pub fn append_replicated(&self, batch: &MessageBatch) -> Result<()> {
        batch.verify_crc()?;

        let mut inner = self.inner.write();
        if batch.base_offset.value() != inner.log_end {
            return Err(StreambedError::OffsetOutOfRange(batch.base_offset.value()));
        }

        for m in &batch.messages {
            if m.offset.value() != inner.log_end {
                return Err(StreambedError::OffsetOutOfRange(m.offset.value()));
            }
            // The epoch map must be durable before the first message of a
            // new epoch hits the log, or reconciliation after a crash could
            // pick an unsafe truncation point.
            if inner.epoch_map.latest().map_or(true, |e| e < m.epoch) {
                inner.epoch_map.record(m.epoch, m.offset.value());
                self.persist_meta(&inner)?;
            }
            self.write_message(&mut inner, m)?;
            inner.log_end = m.offset.value() + 1;
        }
        self.flush(&inner)?;

        drop(inner);
        self.data_notify.notify_waiters();
        Ok(())
    }

    /// Discard every message at or beyond `end`, so the log ends at `end`.
    /// Truncating at or past the current end is a no-op.
    pub fn truncate(&self, end: u64) -> Result<()> {
        let mut inner = self.inner.write();
        if end >= inner.log_end {
            return Ok(());
        }

        tracing::info!(
            end,
            log_end = inner.log_end,
            dir = %self.dir.display(),
            "truncating log"
        );

        // Drop whole segments that start at or beyond the cut.
        while inner.segments.len() > 1 {
            let last = inner.segments.last().expect("non-empty");
            if last.segment.base_offset().value() < end {
                break;
            }
            let pair = inner.segments.pop().expect("non-empty");
            let _ = std::fs::remove_file(pair.segment.path());
            let _ = std::fs::remove_file(pair.index.path());
        }

        // Cut within the surviving tail segment.
        let last = inner.segments.last().expect("non-empty");
        if let Some(cut_position) = last.index.truncate_from(end)? {
            last.segment.truncate(cut_position)?;
        }

        inner.log_end = end;
        inner.epoch_map.truncate(end);

        let hw = self.hw.load(Ordering::Acquire);
        if hw >= end as i64 {
            self.hw.store(end as i64 - 1, Ordering::Release);
        }
        self.persist_meta(&inner)?;

        drop(inner);
        self.hw_notify.notify_waiters();
        Ok(())
    }

    /// Durably record the first offset of a new leader epoch. Must be called
    /// before the first append under that epoch.
    pub fn record_leader_epoch(&self, epoch: Epoch) -> Result<()> {
        let mut inner = self.inner.write();
        let start = inner.log_end;
        if inner.epoch_map.record(epoch, start) {
            self.persist_meta(&inner)?;
        }
        Ok(())
    }

    /// Greatest offset whose leader epoch is at most `epoch`.
    pub fn lookup_epoch(&self, epoch: Epoch) -> Option<Offset> {
        let inner = self.inner.read();
        inner.epoch_map.last_offset_in_epoch(epoch, inner.log_end)
    }

    /// Latest epoch recorded in the local epoch map.
    pub fn latest_epoch(&self) -> Option<Epoch> {
        self.inner.read().epoch_map.latest()
    }

    /// Largest locally recorded epoch that is at most `upper`.
    pub fn closest_epoch(&self, upper: Epoch) -> Option<Epoch> {
        self.inner.read().epoch_map.largest_at_most(upper)
    }

    /// First offset whose timestamp is at or after `ts`, if any.
    pub fn lookup_timestamp(&self, ts: i64) -> Result<Option<Offset>> {
        let mut offset = match self.oldest_offset() {
            Some(o) => o.value(),
            None => return Ok(None),
        };
        let log_end = self.log_end_offset();

        while offset < log_end {
            let messages = self.read_from(offset, 64 * 1024, log_end)?;
            if messages.is_empty() {
                break;
            }
            for m in &messages {
                if m.timestamp_ms >= ts {
                    return Ok(Some(m.offset));
                }
            }
            offset = messages.last().expect("non-empty").offset.value() + 1;
        }

        Ok(None)
    }

    /// Read messages in offset order starting at `start`, stopping before
    /// `limit` or once `max_bytes` is exceeded (at least one message is
    /// returned when any is available).
    pub fn read_from(&self, start: u64, max_bytes: usize, limit: u64) -> Result<Vec<Message>> {
        let inner = self.inner.read();
        let end = limit.min(inner.log_end);

        let mut messages = Vec::new();
        let mut bytes = 0usize;
        let mut offset = start;

        while offset < end {
            let (position, size) = Self::locate(&inner, offset)
                .ok_or_else(|| StreambedError::Storage(format!("missing index entry {offset}")))?;

            let pair = inner
                .segments
                .iter()
                .rev()
                .find(|p| p.segment.base_offset().value() <= offset)
                .expect("segment for indexed offset");
            let data = pair.segment.read(position, size as usize)?;
            let message: Message = bincode::deserialize(&data)
                .map_err(|e| StreambedError::Serialization(e.to_string()))?;

            bytes += data.len();
            messages.push(message);
            offset += 1;

            if bytes >= max_bytes {
                break;
            }
        }

        Ok(messages)
    }

    /// Create a streaming reader positioned at `start`.
    pub fn reader(self: &Arc<Self>, start: Offset, mode: ReadMode) -> LogReader {
        LogReader::new(Arc::clone(self), start.value(), mode)
    }

    /// Persist the epoch map and current HW.
    pub fn checkpoint(&self) -> Result<()> {
        let inner = self.inner.read();
        self.persist_meta(&inner)
    }

    fn locate(inner: &LogInner, offset: u64) -> Option<(u64, u32)> {
        inner
            .segments
            .iter()
            .rev()
            .find(|p| p.segment.base_offset().value() <= offset)
            .and_then(|p| p.index.lookup(Offset::new(offset)))
    }

    fn write_message(&self, inner: &mut LogInner, message: &Message) -> Result<()> {
        let data = bincode::serialize(message)
            .map_err(|e| StreambedError::Serialization(e.to_string()))?;

        let needs_roll = {
            let last = inner.segments.last().expect("non-empty");
            !last.segment.can_fit(data.len() as u64) && last.segment.size() > 0
        };
        if needs_roll {
            let segment = Segment::create(message.offset, &self.dir, self.config.max_segment_bytes)?;
            let index = Index::create(segment.path())?;
            inner.segments.push(SegmentPair { segment, index });
        }

        let last = inner.segments.last().expect("non-empty");
        let position = last.segment.append(&data)?;
        last.index
            .append(message.offset, position, data.len() as u32)?;

        Ok(())
    }

    fn flush(&self, inner: &LogInner) -> Result<()> {
        if self.config.sync_on_write {
            if let Some(last) = inner.segments.last() {
                last.segment.sync()?;
                last.index.sync()?;
            }
        }
        Ok(())
    }

    fn persist_meta(&self, inner: &LogInner) -> Result<()> {
        let meta = ReplicaMeta {
            epoch_map: inner.epoch_map.clone(),
            high_watermark: self.hw.load(Ordering::Acquire),
        };
        let bytes =
            bincode::serialize(&meta).map_err(|e| StreambedError::Serialization(e.to_string()))?;

        let tmp = self.dir.join(format!("{META_FILE}.tmp"));
        std::fs::write(&tmp, &bytes).map_err(|e| StreambedError::Storage(e.to_string()))?;
        std::fs::rename(&tmp, self.dir.join(META_FILE))
            .map_err(|e| StreambedError::Storage(e.to_string()))?;
        Ok(())
    }
}
