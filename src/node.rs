use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use streambed_core::{
    AckPolicy, Epoch, Header, MetadataGateway, NodeId, Offset, Result, StreamId, StreamSpec,
    StreamUpdate, StreambedError,
};
use streambed_replication::{FollowerHandle, LeaderHandle};
use streambed_storage::CommitLog;
use streambed_transport::{
    bus::PubSub,
    wire::{PublishEnvelope, PublishReply},
};

use crate::config::NodeConfig;
use crate::controller::{ControllerEvent, MetadataAuthority};
use crate::subscription::{self, SubscribeRequest, Subscription};

/// A publish through the local API.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub subject: String,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Vec<Header>,
    pub ack_policy: AckPolicy,
    pub correlation_id: String,
}

impl PublishRequest {
    pub fn new(subject: impl Into<String>, value: Bytes) -> Self {
        Self {
            subject: subject.into(),
            key: None,
            value,
            headers: Vec::new(),
            ack_policy: AckPolicy::Leader,
            correlation_id: String::new(),
        }
    }

    pub fn with_ack_policy(mut self, policy: AckPolicy) -> Self {
        self.ack_policy = policy;
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }
}

/// Acknowledgement returned to a local publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub offset: Offset,
    pub correlation_id: String,
}

/// A replica's current role for one stream. Transitions replace the variant
/// atomically under the role lock; each variant owns its background workers.
enum Role {
    Idle,
    Leader(LeaderHandle),
    Follower(FollowerHandle),
}

struct RoleSlot {
    epoch: Epoch,
    role: Role,
}

#[derive(Default, Clone)]
struct ReplicaInfo {
    leader: Option<NodeId>,
    isr: Vec<NodeId>,
    min_isr: usize,
}

/// One node's copy of a stream: the commit log plus the active role.
pub struct StreamReplica {
    id: StreamId,
    log: Arc<CommitLog>,
    info: Mutex<ReplicaInfo>,
    role: tokio::sync::Mutex<RoleSlot>,
    subs_cancel: CancellationToken,
}

impl StreamReplica {
    pub fn id(&self) -> &StreamId {
        &self.id
    }

    pub fn log(&self) -> &Arc<CommitLog> {
        &self.log
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.info.lock().leader
    }

    pub fn isr(&self) -> Vec<NodeId> {
        self.info.lock().isr.clone()
    }

    pub(crate) fn subscriptions_token(&self) -> &CancellationToken {
        &self.subs_cancel
    }

    pub async fn is_leader(&self) -> bool {
        matches!(self.role.lock().await.role, Role::Leader(_))
    }
}

/// Delegates engine proposals and reports to the metadata authority.
struct GatewayAdapter {
    authority: Arc<dyn MetadataAuthority>,
}

#[async_trait]
impl MetadataGateway for GatewayAdapter {
    async fn propose_isr_change(
        &self,
        stream: &StreamId,
        epoch: Epoch,
        new_isr: Vec<NodeId>,
    ) -> Result<bool> {
        self.authority
            .propose_isr_change(stream, epoch, new_isr)
            .await
    }

    async fn report_unreachable_leader(&self, stream: &StreamId, epoch: Epoch, from: NodeId) {
        self.authority
            .report_unreachable_leader(stream, epoch, from)
            .await
    }
}

/// One cluster node: hosts a replica for every stream it is assigned to and
/// reconfigures each replica's role as controller updates arrive.
pub struct Node {
    id: NodeId,
    config: NodeConfig,
    bus: Arc<dyn PubSub>,
    authority: Arc<dyn MetadataAuthority>,
    gateway: Arc<dyn MetadataGateway>,
    streams: RwLock<HashMap<StreamId, Arc<StreamReplica>>>,
    cancel: CancellationToken,
    update_task: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Start a node: register with the controller, restore replicas from the
    /// current metadata snapshot, then follow the update feed.
    pub async fn start(
        config: NodeConfig,
        bus: Arc<dyn PubSub>,
        authority: Arc<dyn MetadataAuthority>,
    ) -> Result<Arc<Node>> {
        // Subscribe before taking the snapshot so no update is missed.
        let events = authority.subscribe();
        authority.register_node(config.node_id);

        let node = Arc::new(Node {
            id: config.node_id,
            gateway: Arc::new(GatewayAdapter {
                authority: Arc::clone(&authority),
            }),
            bus,
            authority,
            streams: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            update_task: Mutex::new(None),
            config,
        });

        for update in node.authority.snapshot() {
            if let Err(e) = node.apply_update(update).await {
                warn!(node = node.id, error = %e, "failed to restore replica from snapshot");
            }
        }

        let task = tokio::spawn(Arc::clone(&node).run_update_loop(events));
        *node.update_task.lock() = Some(task);

        info!(node = node.id, "node started");
        Ok(node)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The local replica of a stream, if this node hosts one.
    pub fn stream(&self, id: &StreamId) -> Option<Arc<StreamReplica>> {
        self.streams.read().get(id).cloned()
    }

    pub async fn create_stream(&self, spec: StreamSpec) -> Result<()> {
        self.authority.create_stream(spec).await
    }

    pub async fn delete_stream(&self, id: &StreamId) -> Result<()> {
        self.authority.delete_stream(id).await
    }

    /// Publish to the stream backed by `subject`. Succeeds only on the
    /// stream's current leader; other nodes answer `NotLeader` with the
    /// leader they know of so the caller can re-route.
    pub async fn publish(
        &self,
        request: PublishRequest,
        cancel: &CancellationToken,
    ) -> Result<PublishAck> {
        let candidates: Vec<Arc<StreamReplica>> = self
            .streams
            .read()
            .values()
            .filter(|r| r.id.subject == request.subject)
            .cloned()
            .collect();

        if candidates.is_empty() {
            return Err(StreambedError::StreamNotFound(request.subject));
        }

        for replica in &candidates {
            let publisher = {
                let slot = replica.role.lock().await;
                match &slot.role {
                    Role::Leader(handle) => Some(handle.publisher()),
                    _ => None,
                }
            };

            if let Some(publisher) = publisher {
                let envelope = PublishEnvelope {
                    key: request.key,
                    value: request.value,
                    headers: request.headers,
                    ack_policy: request.ack_policy,
                    correlation_id: request.correlation_id,
                    ack_inbox: None,
                };
                return match publisher.publish(envelope, cancel).await? {
                    PublishReply::Ack {
                        offset,
                        correlation_id,
                    } => Ok(PublishAck {
                        offset,
                        correlation_id,
                    }),
                    PublishReply::Error { message, .. } => {
                        Err(StreambedError::InvalidRequest(message))
                    }
                };
            }
        }

        Err(StreambedError::NotLeader {
            leader: candidates[0].leader().filter(|l| *l != self.id),
        })
    }

    /// Open an ordered subscription over a locally hosted replica. Committed
    /// reads are served by any replica, leader or follower.
    pub async fn subscribe(&self, request: SubscribeRequest) -> Result<Subscription> {
        let id = StreamId::new(request.subject.clone(), request.name.clone());
        let replica = self
            .stream(&id)
            .ok_or_else(|| StreambedError::StreamNotFound(id.to_string()))?;
        subscription::open(&replica, request.start)
    }

    /// Stop every role loop and checkpoint every log.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.update_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let replicas: Vec<Arc<StreamReplica>> =
            self.streams.write().drain().map(|(_, r)| r).collect();
        for replica in replicas {
            Self::retire(replica).await;
        }
        info!(node = self.id, "node stopped");
    }

    async fn run_update_loop(self: Arc<Self>, mut events: broadcast::Receiver<ControllerEvent>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                event = events.recv() => match event {
                    Ok(ControllerEvent::Updated(update)) => {
                        if let Err(e) = self.apply_update(update).await {
                            warn!(node = self.id, error = %e, "failed to apply stream update");
                        }
                    }
                    Ok(ControllerEvent::Deleted(id)) => self.remove_stream(&id).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Missed updates; re-pull the snapshot. Stale entries
                        // are filtered by epoch in apply_update.
                        debug!(node = self.id, missed, "controller feed lagged, resyncing");
                        for update in self.authority.snapshot() {
                            if let Err(e) = self.apply_update(update).await {
                                warn!(node = self.id, error = %e, "failed to apply snapshot update");
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }

    /// Apply one controller update: filter stale epochs, then serialize the
    /// role transition under the replica's role lock, quiescing the previous
    /// role before the next one starts.
    pub async fn apply_update(&self, update: StreamUpdate) -> Result<()> {
        if !update.replicas.contains(&self.id) {
            let removed = self.streams.write().remove(&update.id);
            if let Some(replica) = removed {
                info!(node = self.id, stream = %update.id, "replica unassigned");
                Self::retire(replica).await;
            }
            return Ok(());
        }

        let replica = self.get_or_open(&update.id)?;
        let mut slot = replica.role.lock().await;

        if update.epoch < slot.epoch {
            debug!(
                node = self.id,
                stream = %update.id,
                stale = %update.epoch,
                current = %slot.epoch,
                "ignoring stale update"
            );
            return Ok(());
        }

        *replica.info.lock() = ReplicaInfo {
            leader: update.leader,
            isr: update.isr.clone(),
            min_isr: update.min_isr,
        };

        // Within an epoch the leader never changes, so a same-epoch update
        // (an accepted ISR change, or a duplicate delivery) leaves the
        // running role in place.
        if update.epoch == slot.epoch && !matches!(slot.role, Role::Idle) {
            return Ok(());
        }

        let previous = std::mem::replace(&mut slot.role, Role::Idle);
        match previous {
            Role::Leader(handle) => handle.stop().await,
            Role::Follower(handle) => handle.stop().await,
            Role::Idle => {}
        }
        slot.epoch = update.epoch;

        slot.role = match update.leader {
            Some(leader) if leader == self.id => Role::Leader(
                LeaderHandle::start(
                    update.id.clone(),
                    self.id,
                    update.epoch,
                    update.replicas.clone(),
                    update.isr.clone(),
                    update.min_isr,
                    Arc::clone(&replica.log),
                    Arc::clone(&self.bus),
                    Arc::clone(&self.gateway),
                    self.config.replication.clone(),
                )
                .await?,
            ),
            Some(leader) => Role::Follower(FollowerHandle::start(
                update.id.clone(),
                self.id,
                update.epoch,
                leader,
                Arc::clone(&replica.log),
                Arc::clone(&self.bus),
                Arc::clone(&self.gateway),
                self.config.replication.clone(),
            )),
            None => {
                info!(node = self.id, stream = %update.id, epoch = %update.epoch, "stream leaderless, replica idle");
                Role::Idle
            }
        };

        Ok(())
    }

    fn get_or_open(&self, id: &StreamId) -> Result<Arc<StreamReplica>> {
        if let Some(replica) = self.streams.read().get(id) {
            return Ok(Arc::clone(replica));
        }

        let log = CommitLog::open(self.config.stream_dir(id), self.config.log.clone())?;
        let replica = Arc::new(StreamReplica {
            id: id.clone(),
            log,
            info: Mutex::new(ReplicaInfo::default()),
            role: tokio::sync::Mutex::new(RoleSlot {
                epoch: Epoch::UNASSIGNED,
                role: Role::Idle,
            }),
            subs_cancel: CancellationToken::new(),
        });

        let mut streams = self.streams.write();
        let entry = streams
            .entry(id.clone())
            .or_insert_with(|| Arc::clone(&replica));
        Ok(Arc::clone(entry))
    }

    async fn retire(replica: Arc<StreamReplica>) {
        replica.subs_cancel.cancel();
        let mut slot = replica.role.lock().await;
        let previous = std::mem::replace(&mut slot.role, Role::Idle);
        match previous {
            Role::Leader(handle) => handle.stop().await,
            Role::Follower(handle) => handle.stop().await,
            Role::Idle => {}
        }
        let _ = replica.log.checkpoint();
    }

    async fn remove_stream(&self, id: &StreamId) {
        let removed = self.streams.write().remove(id);
        if let Some(replica) = removed {
            Self::retire(replica).await;
            let _ = std::fs::remove_dir_all(self.config.stream_dir(id));
            info!(node = self.id, stream = %id, "stream removed");
        }
    }
}
