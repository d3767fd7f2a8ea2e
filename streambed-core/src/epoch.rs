use serde::{Deserialize, Serialize};
use std::fmt;

use crate::offset::Offset;

/// Generation number of a stream's leadership.
///
/// The controller hands out a fresh, strictly larger epoch on every
/// leadership change. Messages carry the epoch they were written under,
/// which is what lets replicas tell competing histories apart after a
/// failover. A stream that has never had a leader sits at `UNASSIGNED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Epoch(u64);

impl Epoch {
    /// No leader has ever been assigned.
    pub const UNASSIGNED: Epoch = Epoch(0);

    /// Epoch served by a stream's first elected leader.
    pub const INITIAL: Epoch = Epoch(1);

    #[inline]
    pub const fn new(value: u64) -> Self {
        Epoch(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The epoch the next elected leader will serve under.
    #[inline]
    pub fn bump(self) -> Self {
        Epoch(self.0 + 1)
    }

    /// Whether this epoch belongs to an actual leadership generation.
    #[inline]
    pub fn is_assigned(self) -> bool {
        self != Epoch::UNASSIGNED
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch-{}", self.0)
    }
}

impl From<u64> for Epoch {
    fn from(value: u64) -> Self {
        Epoch(value)
    }
}

impl From<Epoch> for u64 {
    fn from(epoch: Epoch) -> Self {
        epoch.0
    }
}

/// One entry of the leader epoch map: the first offset produced under an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochEntry {
    pub epoch: Epoch,
    pub start_offset: u64,
}

/// Ordered record of `(epoch, start offset)` pairs for one replica's log.
///
/// The map answers the reconciliation question "what is the last offset the
/// leader considers valid for epoch E?" and is persisted alongside the log so
/// the answer survives restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpochMap {
    entries: Vec<EpochEntry>,
}

impl EpochMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the first offset of a new epoch. Entries must arrive in epoch
    /// order; an epoch at or below the latest recorded one is ignored.
    pub fn record(&mut self, epoch: Epoch, start_offset: u64) -> bool {
        if let Some(last) = self.entries.last() {
            if epoch <= last.epoch {
                return false;
            }
        }
        self.entries.push(EpochEntry {
            epoch,
            start_offset,
        });
        true
    }

    /// The most recently recorded epoch.
    pub fn latest(&self) -> Option<Epoch> {
        self.entries.last().map(|e| e.epoch)
    }

    /// Largest recorded epoch that is at most `upper`.
    pub fn largest_at_most(&self, upper: Epoch) -> Option<Epoch> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.epoch <= upper)
            .map(|e| e.epoch)
    }

    /// Greatest offset whose leader epoch is at most `epoch`, given the log
    /// ends at `log_end` (exclusive). Returns `None` when no such offset
    /// exists, meaning a follower asking for this epoch holds no valid data.
    pub fn last_offset_in_epoch(&self, epoch: Epoch, log_end: u64) -> Option<Offset> {
        let boundary = self
            .entries
            .iter()
            .find(|e| e.epoch > epoch)
            .map(|e| e.start_offset)
            .unwrap_or(log_end);
        if boundary == 0 {
            None
        } else {
            Some(Offset::new(boundary - 1))
        }
    }

    /// Drop entries describing offsets at or beyond `log_end` after the log
    /// was truncated to that point.
    pub fn truncate(&mut self, log_end: u64) {
        self.entries.retain(|e| e.start_offset < log_end);
    }

    pub fn entries(&self) -> &[EpochEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_generations() {
        assert!(!Epoch::UNASSIGNED.is_assigned());
        assert_eq!(Epoch::UNASSIGNED.bump(), Epoch::INITIAL);
        assert!(Epoch::INITIAL < Epoch::INITIAL.bump());
        assert_eq!(Epoch::new(4).value(), 4);
        assert_eq!(Epoch::new(4).to_string(), "epoch-4");
    }

    #[test]
    fn test_record_is_monotonic() {
        let mut map = EpochMap::new();
        assert!(map.record(Epoch::new(1), 0));
        assert!(map.record(Epoch::new(3), 10));
        assert!(!map.record(Epoch::new(2), 20));
        assert_eq!(map.latest(), Some(Epoch::new(3)));
    }

    #[test]
    fn test_last_offset_in_epoch() {
        let mut map = EpochMap::new();
        map.record(Epoch::new(1), 0);
        map.record(Epoch::new(3), 10);

        // Epoch 1 ends where epoch 3 begins.
        assert_eq!(
            map.last_offset_in_epoch(Epoch::new(1), 25),
            Some(Offset::new(9))
        );
        // Epoch 2 was never used; it resolves like epoch 1.
        assert_eq!(
            map.last_offset_in_epoch(Epoch::new(2), 25),
            Some(Offset::new(9))
        );
        // The current epoch extends to the end of the log.
        assert_eq!(
            map.last_offset_in_epoch(Epoch::new(3), 25),
            Some(Offset::new(24))
        );
        // An epoch before any recorded entry holds no data.
        assert_eq!(map.last_offset_in_epoch(Epoch::UNASSIGNED, 25), None);
    }

    #[test]
    fn test_truncate_drops_later_epochs() {
        let mut map = EpochMap::new();
        map.record(Epoch::new(1), 0);
        map.record(Epoch::new(2), 10);
        map.record(Epoch::new(4), 15);

        map.truncate(12);
        assert_eq!(map.latest(), Some(Epoch::new(2)));

        map.truncate(0);
        assert!(map.is_empty());
    }

    #[test]
    fn test_largest_at_most() {
        let mut map = EpochMap::new();
        map.record(Epoch::new(2), 0);
        map.record(Epoch::new(5), 7);

        assert_eq!(map.largest_at_most(Epoch::new(6)), Some(Epoch::new(5)));
        assert_eq!(map.largest_at_most(Epoch::new(4)), Some(Epoch::new(2)));
        assert_eq!(map.largest_at_most(Epoch::new(1)), None);
    }
}
