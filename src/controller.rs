use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use streambed_core::{
    Epoch, MetadataGateway, NodeId, Result, StreamId, StreamSpec, StreamUpdate, StreambedError,
};

/// Metadata transitions pushed to every node.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    Updated(StreamUpdate),
    Deleted(StreamId),
}

/// The external metadata authority as seen by a node: stream lifecycle,
/// authoritative `{leader, replicas, isr, epoch}` transitions, and the
/// gateway the replication engine proposes changes through.
///
/// Delivery of events is at-least-once and monotonic in epoch per stream;
/// consumers filter duplicates and stale epochs.
#[async_trait]
pub trait MetadataAuthority: MetadataGateway {
    async fn create_stream(&self, spec: StreamSpec) -> Result<()>;

    async fn delete_stream(&self, id: &StreamId) -> Result<()>;

    fn register_node(&self, node: NodeId);

    fn subscribe(&self) -> broadcast::Receiver<ControllerEvent>;

    fn snapshot(&self) -> Vec<StreamUpdate>;
}

struct StreamRecord {
    spec: StreamSpec,
    epoch: Epoch,
    leader: Option<NodeId>,
    replicas: Vec<NodeId>,
    isr: Vec<NodeId>,
    /// ISR members that reported the current leader unreachable this epoch.
    reporters: HashSet<NodeId>,
}

impl StreamRecord {
    fn update(&self) -> StreamUpdate {
        StreamUpdate {
            id: self.spec.id.clone(),
            epoch: self.epoch,
            leader: self.leader,
            replicas: self.replicas.clone(),
            isr: self.isr.clone(),
            min_isr: self.spec.min_isr,
        }
    }
}

struct ControllerState {
    nodes: Vec<NodeId>,
    down: HashSet<NodeId>,
    streams: HashMap<StreamId, StreamRecord>,
    next_assign: usize,
}

/// Single-authority in-process metadata service: replica assignment, leader
/// election, epoch numbering, and ISR change acceptance for every stream of
/// one cluster. This is the collaborator the replication engine is written
/// against, not a consensus implementation; a production deployment would
/// back the same interface with a replicated metadata service.
pub struct StandaloneController {
    state: Mutex<ControllerState>,
    events: broadcast::Sender<ControllerEvent>,
}

impl StandaloneController {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            state: Mutex::new(ControllerState {
                nodes: Vec::new(),
                down: HashSet::new(),
                streams: HashMap::new(),
                next_assign: 0,
            }),
            events,
        })
    }

    /// Mark a node dead. Streams it led get a new leader from the live ISR,
    /// or no leader at all until one of its ISR members comes back.
    pub fn fail_node(&self, node: NodeId) {
        let mut state = self.state.lock();
        state.down.insert(node);

        let ids: Vec<StreamId> = state
            .streams
            .iter()
            .filter(|(_, r)| r.leader == Some(node))
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            self.elect_locked(&mut state, &id, Some(node));
        }
    }

    /// Mark a node live again and give leaderless streams it replicates a
    /// chance to elect.
    pub fn revive_node(&self, node: NodeId) {
        let mut state = self.state.lock();
        state.down.remove(&node);

        let ids: Vec<StreamId> = state
            .streams
            .iter()
            .filter(|(_, r)| r.leader.is_none() && r.isr.contains(&node))
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            self.elect_locked(&mut state, &id, None);
        }
    }

    /// Current metadata for one stream.
    pub fn current(&self, id: &StreamId) -> Option<StreamUpdate> {
        self.state.lock().streams.get(id).map(|r| r.update())
    }

    fn elect_locked(&self, state: &mut ControllerState, id: &StreamId, exclude: Option<NodeId>) {
        let down = state.down.clone();
        let Some(record) = state.streams.get_mut(id) else {
            return;
        };

        let candidate = record
            .isr
            .iter()
            .copied()
            .find(|r| Some(*r) != exclude && Some(*r) != record.leader && !down.contains(r));

        record.epoch = record.epoch.bump();
        record.leader = candidate;
        record.reporters.clear();
        match candidate {
            Some(leader) => info!(stream = %id, leader, epoch = %record.epoch, "elected leader"),
            None => info!(stream = %id, epoch = %record.epoch, "no electable replica, stream leaderless"),
        }
        let _ = self.events.send(ControllerEvent::Updated(record.update()));
    }
}

#[async_trait]
impl MetadataGateway for StandaloneController {
    async fn propose_isr_change(
        &self,
        stream: &StreamId,
        epoch: Epoch,
        new_isr: Vec<NodeId>,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        let Some(record) = state.streams.get_mut(stream) else {
            return Ok(false);
        };

        if record.epoch != epoch {
            debug!(stream = %stream, proposed = %epoch, current = %record.epoch, "isr proposal from stale epoch");
            return Ok(false);
        }
        if new_isr.is_empty() || !new_isr.iter().all(|r| record.replicas.contains(r)) {
            return Ok(false);
        }
        if let Some(leader) = record.leader {
            if !new_isr.contains(&leader) {
                return Ok(false);
            }
        }

        record.isr = new_isr;
        let _ = self.events.send(ControllerEvent::Updated(record.update()));
        Ok(true)
    }

    async fn report_unreachable_leader(&self, stream: &StreamId, epoch: Epoch, from: NodeId) {
        let mut state = self.state.lock();
        let Some(record) = state.streams.get_mut(stream) else {
            return;
        };
        if record.epoch != epoch || record.leader == Some(from) || !record.isr.contains(&from) {
            return;
        }
        record.reporters.insert(from);

        // One partitioned replica must not be able to bounce leadership
        // around; a majority of the ISR followers has to agree the leader
        // is gone.
        let followers: Vec<NodeId> = record
            .isr
            .iter()
            .copied()
            .filter(|r| Some(*r) != record.leader)
            .collect();
        let votes = record
            .reporters
            .iter()
            .filter(|r| followers.contains(r))
            .count();
        let needed = followers.len() / 2 + 1;
        if votes < needed {
            debug!(stream = %stream, reporter = from, votes, needed, "unreachable report recorded");
            return;
        }

        let unreachable = record.leader;
        info!(stream = %stream, leader = ?unreachable, votes, "leader reported unreachable by isr majority");
        self.elect_locked(&mut state, stream, unreachable);
    }
}

#[async_trait]
impl MetadataAuthority for StandaloneController {
    async fn create_stream(&self, spec: StreamSpec) -> Result<()> {
        let mut state = self.state.lock();

        if state.streams.contains_key(&spec.id) {
            return Err(StreambedError::InvalidRequest(format!(
                "stream {} already exists",
                spec.id
            )));
        }
        if spec.replication_factor == 0 || spec.replication_factor > state.nodes.len() {
            return Err(StreambedError::Config(format!(
                "replication factor {} not satisfiable with {} nodes",
                spec.replication_factor,
                state.nodes.len()
            )));
        }

        let total = state.nodes.len();
        let start = state.next_assign;
        let replicas: Vec<NodeId> = (0..spec.replication_factor)
            .map(|i| state.nodes[(start + i) % total])
            .collect();
        state.next_assign = (state.next_assign + 1) % total;

        let leader = replicas
            .iter()
            .copied()
            .find(|r| !state.down.contains(r));

        let record = StreamRecord {
            epoch: Epoch::INITIAL,
            leader,
            replicas: replicas.clone(),
            isr: replicas,
            reporters: HashSet::new(),
            spec,
        };
        info!(stream = %record.spec.id, leader = ?leader, replicas = ?record.replicas, "stream created");
        let update = record.update();
        state.streams.insert(record.spec.id.clone(), record);
        let _ = self.events.send(ControllerEvent::Updated(update));
        Ok(())
    }

    async fn delete_stream(&self, id: &StreamId) -> Result<()> {
        let mut state = self.state.lock();
        if state.streams.remove(id).is_none() {
            return Err(StreambedError::StreamNotFound(id.to_string()));
        }
        info!(stream = %id, "stream deleted");
        let _ = self.events.send(ControllerEvent::Deleted(id.clone()));
        Ok(())
    }

    fn register_node(&self, node: NodeId) {
        let mut state = self.state.lock();
        if !state.nodes.contains(&node) {
            state.nodes.push(node);
            state.nodes.sort_unstable();
        }
        state.down.remove(&node);
    }

    fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    fn snapshot(&self) -> Vec<StreamUpdate> {
        self.state
            .lock()
            .streams
            .values()
            .map(|r| r.update())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(rf: usize) -> StreamSpec {
        StreamSpec::new(StreamId::new("orders", "orders-log"), rf)
    }

    #[tokio::test]
    async fn test_create_assigns_replicas_and_leader() {
        let controller = StandaloneController::new();
        for node in [1, 2, 3] {
            controller.register_node(node);
        }

        controller.create_stream(spec(3)).await.unwrap();
        let update = controller.current(&spec(3).id).unwrap();
        assert_eq!(update.epoch, Epoch::INITIAL);
        assert_eq!(update.replicas.len(), 3);
        assert_eq!(update.isr, update.replicas);
        assert_eq!(update.leader, Some(update.replicas[0]));

        // Unsatisfiable replication factor is rejected.
        let too_big = StreamSpec::new(StreamId::new("orders", "wide"), 4);
        assert!(controller.create_stream(too_big).await.is_err());
    }

    #[tokio::test]
    async fn test_failover_elects_from_isr() {
        let controller = StandaloneController::new();
        for node in [1, 2, 3] {
            controller.register_node(node);
        }
        controller.create_stream(spec(3)).await.unwrap();
        let id = spec(3).id;
        let first = controller.current(&id).unwrap();
        let leader = first.leader.unwrap();

        controller.fail_node(leader);
        let after = controller.current(&id).unwrap();
        assert!(after.epoch > first.epoch);
        assert_ne!(after.leader, Some(leader));
        assert!(after.leader.is_some());
        assert!(after.isr.contains(&after.leader.unwrap()));
    }

    #[tokio::test]
    async fn test_leaderless_until_isr_member_revives() {
        let controller = StandaloneController::new();
        for node in [1, 2] {
            controller.register_node(node);
        }
        controller.create_stream(spec(2)).await.unwrap();
        let id = spec(2).id;

        controller.fail_node(2);
        controller.fail_node(1);
        let orphaned = controller.current(&id).unwrap();
        assert_eq!(orphaned.leader, None);

        controller.revive_node(1);
        let restored = controller.current(&id).unwrap();
        assert_eq!(restored.leader, Some(1));
        assert!(restored.epoch > orphaned.epoch);
    }

    #[tokio::test]
    async fn test_isr_proposal_requires_current_epoch() {
        let controller = StandaloneController::new();
        for node in [1, 2, 3] {
            controller.register_node(node);
        }
        controller.create_stream(spec(3)).await.unwrap();
        let id = spec(3).id;
        let update = controller.current(&id).unwrap();
        let leader = update.leader.unwrap();

        let shrunk: Vec<NodeId> = update
            .replicas
            .iter()
            .copied()
            .take(2)
            .collect();
        assert!(controller
            .propose_isr_change(&id, update.epoch, shrunk.clone())
            .await
            .unwrap());

        // A proposal under an old epoch is refused.
        assert!(!controller
            .propose_isr_change(&id, Epoch::UNASSIGNED, shrunk)
            .await
            .unwrap());

        // The leader may never leave the ISR by proposal.
        let without_leader: Vec<NodeId> = update
            .replicas
            .iter()
            .copied()
            .filter(|r| *r != leader)
            .collect();
        let current = controller.current(&id).unwrap();
        assert!(!controller
            .propose_isr_change(&id, current.epoch, without_leader)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_report_triggers_election() {
        let controller = StandaloneController::new();
        for node in [1, 2, 3] {
            controller.register_node(node);
        }
        controller.create_stream(spec(3)).await.unwrap();
        let id = spec(3).id;
        let before = controller.current(&id).unwrap();
        let leader = before.leader.unwrap();
        let reporters: Vec<NodeId> = before
            .replicas
            .iter()
            .copied()
            .filter(|r| *r != leader)
            .collect();

        // A stale-epoch report is ignored.
        controller
            .report_unreachable_leader(&id, Epoch::UNASSIGNED, reporters[0])
            .await;
        assert_eq!(controller.current(&id).unwrap().epoch, before.epoch);

        // A single report is not enough to depose the leader.
        controller
            .report_unreachable_leader(&id, before.epoch, reporters[0])
            .await;
        assert_eq!(controller.current(&id).unwrap().leader, Some(leader));

        // A majority of the ISR followers is.
        controller
            .report_unreachable_leader(&id, before.epoch, reporters[1])
            .await;
        let after = controller.current(&id).unwrap();
        assert!(after.epoch > before.epoch);
        assert_ne!(after.leader, Some(leader));
    }
}
