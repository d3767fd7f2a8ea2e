use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use streambed_core::NodeId;

/// Per-follower progress as seen by the leader.
#[derive(Debug, Clone)]
pub struct FollowerProgress {
    /// Next offset the follower will fetch; everything below it is stored
    /// on the follower.
    pub next_offset: u64,

    /// Last time the follower contacted the leader.
    pub last_seen: Instant,

    /// When the follower first exceeded the offset lag threshold, if it is
    /// currently behind.
    lagging_since: Option<Instant>,
}

/// ISR changes the leader should propose to the controller.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct IsrDelta {
    pub remove: Vec<NodeId>,
    pub add: Vec<NodeId>,
}

impl IsrDelta {
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.add.is_empty()
    }
}

/// Leader-side view of the replica set: who is in the ISR, how far each
/// follower has fetched, and when it was last heard from. The committed
/// frontier is derived from this state.
pub struct FollowerTracker {
    leader: NodeId,
    isr: HashSet<NodeId>,
    progress: HashMap<NodeId, FollowerProgress>,
    max_lag: Duration,
    max_lag_offsets: u64,
}

impl FollowerTracker {
    pub fn new(
        leader: NodeId,
        replicas: &[NodeId],
        isr: &[NodeId],
        max_lag: Duration,
        max_lag_offsets: u64,
        now: Instant,
    ) -> Self {
        let progress = replicas
            .iter()
            .filter(|&&r| r != leader)
            .map(|&r| {
                (
                    r,
                    FollowerProgress {
                        next_offset: 0,
                        last_seen: now,
                        lagging_since: None,
                    },
                )
            })
            .collect();

        Self {
            leader,
            isr: isr.iter().copied().collect(),
            progress,
            max_lag,
            max_lag_offsets,
        }
    }

    /// Record a fetch from `replica` asking for `fetch_offset`, meaning every
    /// offset below it is stored there.
    pub fn observe_fetch(&mut self, replica: NodeId, fetch_offset: u64, log_end: u64, now: Instant) {
        if let Some(p) = self.progress.get_mut(&replica) {
            p.next_offset = p.next_offset.max(fetch_offset);
            p.last_seen = now;
            if log_end.saturating_sub(p.next_offset) > self.max_lag_offsets {
                p.lagging_since.get_or_insert(now);
            } else {
                p.lagging_since = None;
            }
        }
    }

    /// Number of messages replicated to every ISR member: the minimum of the
    /// leader's log end and each ISR follower's fetched count. The HW is one
    /// below this.
    pub fn committed_count(&self, log_end: u64) -> u64 {
        self.isr
            .iter()
            .filter(|&&r| r != self.leader)
            .filter_map(|r| self.progress.get(r))
            .map(|p| p.next_offset)
            .fold(log_end, u64::min)
    }

    /// Evaluate every follower against the lag rules and report the ISR
    /// changes to propose. `committed` is the current committed count; a
    /// follower rejoins only once it has caught up to it.
    pub fn evaluate(&mut self, log_end: u64, committed: u64, now: Instant) -> IsrDelta {
        let mut delta = IsrDelta::default();

        for (&replica, p) in self.progress.iter_mut() {
            let silent = now.duration_since(p.last_seen) > self.max_lag;
            let behind = log_end.saturating_sub(p.next_offset) > self.max_lag_offsets;
            if behind {
                p.lagging_since.get_or_insert(now);
            } else {
                p.lagging_since = None;
            }
            let lagging = p
                .lagging_since
                .map_or(false, |since| now.duration_since(since) > self.max_lag);

            if self.isr.contains(&replica) {
                if silent || lagging {
                    delta.remove.push(replica);
                }
            } else if !silent && p.next_offset >= committed {
                delta.add.push(replica);
            }
        }

        delta.remove.sort_unstable();
        delta.add.sort_unstable();
        delta
    }

    /// Replace the ISR after the controller accepted a proposal.
    pub fn set_isr(&mut self, isr: &[NodeId]) {
        self.isr = isr.iter().copied().collect();
        self.isr.insert(self.leader);
    }

    /// Current ISR including the leader, sorted.
    pub fn isr(&self) -> Vec<NodeId> {
        let mut isr: Vec<_> = self.isr.iter().copied().collect();
        isr.sort_unstable();
        isr
    }

    pub fn isr_size(&self) -> usize {
        self.isr.len()
    }

    pub fn in_isr(&self, replica: NodeId) -> bool {
        self.isr.contains(&replica)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAG: Duration = Duration::from_millis(100);

    fn tracker(now: Instant) -> FollowerTracker {
        FollowerTracker::new(1, &[1, 2, 3], &[1, 2, 3], LAG, 10, now)
    }

    #[test]
    fn test_committed_count_is_isr_minimum() {
        let now = Instant::now();
        let mut t = tracker(now);

        // Nothing fetched yet: nothing is committed.
        assert_eq!(t.committed_count(5), 0);

        t.observe_fetch(2, 5, 5, now);
        t.observe_fetch(3, 3, 5, now);
        assert_eq!(t.committed_count(5), 3);

        // The leader's own log end caps the result.
        t.observe_fetch(3, 9, 5, now);
        assert_eq!(t.committed_count(5), 5);
    }

    #[test]
    fn test_silent_follower_leaves_isr() {
        let now = Instant::now();
        let mut t = tracker(now);
        t.observe_fetch(2, 5, 5, now);

        let later = now + LAG + Duration::from_millis(1);
        let delta = t.evaluate(5, 5, later);
        assert_eq!(delta.remove, vec![2, 3]);

        t.set_isr(&[1, 2]);
        assert_eq!(t.isr(), vec![1, 2]);
        assert!(!t.in_isr(3));
    }

    #[test]
    fn test_lagging_follower_leaves_isr_after_window() {
        let now = Instant::now();
        let mut t = tracker(now);

        // Follower 2 is in contact but far behind.
        t.observe_fetch(2, 0, 100, now);
        t.observe_fetch(3, 100, 100, now);

        // Still within the window: no eviction yet.
        let delta = t.evaluate(100, 0, now + Duration::from_millis(10));
        assert!(!delta.remove.contains(&2));

        // Recent contact but the lag persisted past the window.
        t.observe_fetch(2, 1, 100, now + LAG);
        t.observe_fetch(3, 100, 100, now + LAG);
        let delta = t.evaluate(100, 1, now + LAG + Duration::from_millis(1));
        assert_eq!(delta.remove, vec![2]);
    }

    #[test]
    fn test_removed_follower_rejoins_when_caught_up() {
        let now = Instant::now();
        let mut t = tracker(now);
        t.observe_fetch(2, 10, 10, now);
        t.set_isr(&[1, 2]);

        // Follower 3 reappears but is behind the committed frontier.
        t.observe_fetch(3, 4, 10, now + Duration::from_millis(5));
        let delta = t.evaluate(10, 10, now + Duration::from_millis(6));
        assert!(delta.add.is_empty());

        // Caught up and recently seen: proposed for re-add.
        t.observe_fetch(3, 10, 10, now + Duration::from_millis(8));
        let delta = t.evaluate(10, 10, now + Duration::from_millis(9));
        assert_eq!(delta.add, vec![3]);

        t.set_isr(&[1, 2, 3]);
        assert_eq!(t.isr_size(), 3);
    }

    #[test]
    fn test_isr_shrink_advances_committed_count() {
        let now = Instant::now();
        let mut t = tracker(now);
        t.observe_fetch(2, 7, 7, now);
        // Follower 3 never fetched: commit is held at zero.
        assert_eq!(t.committed_count(7), 0);

        t.set_isr(&[1, 2]);
        assert_eq!(t.committed_count(7), 7);
    }
}
