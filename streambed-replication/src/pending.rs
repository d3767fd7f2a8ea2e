use std::collections::BTreeMap;
use tokio::sync::oneshot;

use streambed_core::{Offset, Result, StreambedError};
use streambed_transport::PublishReply;

/// A publish waiting for its offset to be committed.
pub struct PendingPublish {
    pub correlation_id: String,

    /// Inbox to deliver the ack to over the bus, if the publisher asked.
    pub ack_inbox: Option<String>,

    /// Inline waiter for publishes made through the local API.
    pub reply_tx: Option<oneshot::Sender<Result<PublishReply>>>,
}

/// Table of ALL-policy publishes keyed by offset, resolved as the HW
/// advances. Entries are also reachable by correlation id so a cancelled or
/// timed-out publisher leaves no orphaned state behind.
#[derive(Default)]
pub struct PendingAcks {
    entries: BTreeMap<u64, Vec<PendingPublish>>,
}

impl PendingAcks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, offset: Offset, pending: PendingPublish) {
        self.entries
            .entry(offset.value())
            .or_default()
            .push(pending);
    }

    /// Take every entry whose offset is now committed (below `committed`).
    pub fn resolve_committed(&mut self, committed: u64) -> Vec<(Offset, PendingPublish)> {
        let mut resolved = Vec::new();
        let keys: Vec<u64> = self.entries.range(..committed).map(|(&k, _)| k).collect();
        for key in keys {
            if let Some(list) = self.entries.remove(&key) {
                for pending in list {
                    resolved.push((Offset::new(key), pending));
                }
            }
        }
        resolved
    }

    /// Drop the entry registered under `correlation_id`, if still pending.
    pub fn reap(&mut self, correlation_id: &str) -> bool {
        let mut found = false;
        self.entries.retain(|_, list| {
            list.retain(|p| {
                let matches = p.correlation_id == correlation_id;
                found |= matches;
                !matches
            });
            !list.is_empty()
        });
        found
    }

    /// Take everything, rejecting all waiters. Used at leader demotion.
    pub fn drain(&mut self) -> Vec<(Offset, PendingPublish)> {
        let entries = std::mem::take(&mut self.entries);
        entries
            .into_iter()
            .flat_map(|(k, list)| list.into_iter().map(move |p| (Offset::new(k), p)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(|l| l.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Send an inline rejection to a pending publisher, if it is still waiting.
pub fn reject(pending: PendingPublish, error: StreambedError) {
    if let Some(tx) = pending.reply_tx {
        let _ = tx.send(Err(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(correlation_id: &str) -> PendingPublish {
        PendingPublish {
            correlation_id: correlation_id.to_string(),
            ack_inbox: None,
            reply_tx: None,
        }
    }

    #[test]
    fn test_resolve_in_offset_order() {
        let mut acks = PendingAcks::new();
        acks.register(Offset::new(3), pending("c"));
        acks.register(Offset::new(1), pending("a"));
        acks.register(Offset::new(2), pending("b"));

        let resolved = acks.resolve_committed(3);
        let ids: Vec<_> = resolved
            .iter()
            .map(|(_, p)| p.correlation_id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(acks.len(), 1);

        let resolved = acks.resolve_committed(4);
        assert_eq!(resolved.len(), 1);
        assert!(acks.is_empty());
    }

    #[test]
    fn test_reap_by_correlation() {
        let mut acks = PendingAcks::new();
        acks.register(Offset::new(1), pending("a"));
        acks.register(Offset::new(1), pending("b"));

        assert!(acks.reap("a"));
        assert!(!acks.reap("a"));
        assert_eq!(acks.len(), 1);

        let resolved = acks.resolve_committed(2);
        assert_eq!(resolved[0].1.correlation_id, "b");
    }

    #[test]
    fn test_drain_takes_everything() {
        let mut acks = PendingAcks::new();
        acks.register(Offset::new(1), pending("a"));
        acks.register(Offset::new(9), pending("b"));

        assert_eq!(acks.drain().len(), 2);
        assert!(acks.is_empty());
    }
}
