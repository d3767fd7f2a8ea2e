use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use streambed_core::{
    AckPolicy, Epoch, Message, MessageBatch, MetadataGateway, NodeId, Offset, Result, StreamId,
    StreambedError,
};
use streambed_storage::{CommitLog, ReadMode};
use streambed_transport::{
    bus::{respond, BusSubscription, Delivery, PubSub},
    subjects, wire,
    wire::{LeaderEpochRequest, LeaderEpochResponse, PublishEnvelope, PublishReply, ReplicationRequest, ReplicationResponse},
};

use crate::config::ReplicationConfig;
use crate::isr::FollowerTracker;
use crate::pending::{self, PendingAcks, PendingPublish};

/// Running leader role for one stream replica. Owns the authoritative log,
/// serves follower fetches and epoch queries, ingests publishes addressed to
/// the stream's subject, and maintains the ISR.
pub struct LeaderHandle {
    state: Arc<LeaderState>,
    tasks: Vec<JoinHandle<()>>,
}

/// Cloneable publish entry point into a running leader, so callers never
/// hold the replica's role lock across a publish.
#[derive(Clone)]
pub struct LeaderPublisher {
    state: Arc<LeaderState>,
}

struct LeaderState {
    stream: StreamId,
    node_id: NodeId,
    epoch: Epoch,
    min_isr: usize,
    log: Arc<CommitLog>,
    bus: Arc<dyn PubSub>,
    gateway: Arc<dyn MetadataGateway>,
    config: ReplicationConfig,
    tracker: Mutex<FollowerTracker>,
    pending: Mutex<PendingAcks>,
    cancel: CancellationToken,
}

impl LeaderHandle {
    /// Promote this replica to leader for `epoch`. The epoch's start offset
    /// is made durable before any publish is accepted.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        stream: StreamId,
        node_id: NodeId,
        epoch: Epoch,
        replicas: Vec<NodeId>,
        isr: Vec<NodeId>,
        min_isr: usize,
        log: Arc<CommitLog>,
        bus: Arc<dyn PubSub>,
        gateway: Arc<dyn MetadataGateway>,
        config: ReplicationConfig,
    ) -> Result<LeaderHandle> {
        log.record_leader_epoch(epoch)?;

        let tracker = FollowerTracker::new(
            node_id,
            &replicas,
            &isr,
            config.max_lag(),
            config.replica_max_lag_offsets,
            Instant::now(),
        );

        let state = Arc::new(LeaderState {
            stream: stream.clone(),
            node_id,
            epoch,
            min_isr,
            log,
            bus,
            gateway,
            config,
            tracker: Mutex::new(tracker),
            pending: Mutex::new(PendingAcks::new()),
            cancel: CancellationToken::new(),
        });

        let replication_sub = state
            .bus
            .subscribe(&subjects::replication_inbox(&stream, epoch))
            .await?;
        let epoch_sub = state.bus.subscribe(&subjects::epoch_inbox(&stream)).await?;
        let publish_sub = state.bus.subscribe(&stream.subject).await?;

        // With a single-member ISR, local appends commit on their own.
        state.advance_and_resolve().await;

        let tasks = vec![
            tokio::spawn(Arc::clone(&state).serve_replication(replication_sub)),
            tokio::spawn(Arc::clone(&state).serve_epoch_requests(epoch_sub)),
            tokio::spawn(Arc::clone(&state).serve_publishes(publish_sub)),
            tokio::spawn(Arc::clone(&state).run_isr_checker()),
        ];

        info!(stream = %stream, node = node_id, epoch = %epoch, "became leader");

        Ok(LeaderHandle { state, tasks })
    }

    pub fn epoch(&self) -> Epoch {
        self.state.epoch
    }

    pub fn isr(&self) -> Vec<NodeId> {
        self.state.tracker.lock().isr()
    }

    pub fn publisher(&self) -> LeaderPublisher {
        LeaderPublisher {
            state: Arc::clone(&self.state),
        }
    }

    /// Demote: stop accepting publishes, quiesce all loops, and reject every
    /// outstanding pending publish.
    pub async fn stop(mut self) {
        self.state.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }

        let drained = self.state.pending.lock().drain();
        for (_, entry) in drained {
            let correlation_id = entry.correlation_id.clone();
            let ack_inbox = entry.ack_inbox.clone();
            pending::reject(entry, StreambedError::NotLeader { leader: None });
            if let Some(inbox) = ack_inbox {
                let reply = PublishReply::Error {
                    correlation_id,
                    message: "leader deposed".to_string(),
                };
                if let Ok(bytes) = wire::encode(&reply) {
                    let _ = self.state.bus.publish(&inbox, None, bytes).await;
                }
            }
        }

        let _ = self.state.log.checkpoint();
        info!(
            stream = %self.state.stream,
            node = self.state.node_id,
            epoch = %self.state.epoch,
            "leader stopped"
        );
    }
}

impl LeaderPublisher {
    /// Publish through the local API. LEADER-policy acks return after the
    /// local append; ALL-policy waits for the HW to cover the offset, bounded
    /// by the configured ack timeout and the caller's cancellation token.
    pub async fn publish(
        &self,
        envelope: PublishEnvelope,
        cancel: &CancellationToken,
    ) -> Result<PublishReply> {
        self.state.publish_local(envelope, cancel).await
    }

    pub fn epoch(&self) -> Epoch {
        self.state.epoch
    }
}

impl LeaderState {
    fn append_envelope(&self, envelope: &PublishEnvelope) -> Result<Offset> {
        if self.cancel.is_cancelled() {
            return Err(StreambedError::NotLeader { leader: None });
        }

        let isr_size = self.tracker.lock().isr_size();
        if isr_size < self.min_isr {
            return Err(StreambedError::TransientUnavailable(format!(
                "isr size {isr_size} below required minimum {}",
                self.min_isr
            )));
        }

        let message = Message::new(envelope.key.clone(), envelope.value.clone())
            .with_headers(envelope.headers.clone());
        self.log.append_batch(self.epoch, vec![message])
    }

    async fn publish_local(
        &self,
        envelope: PublishEnvelope,
        cancel: &CancellationToken,
    ) -> Result<PublishReply> {
        let offset = self.append_envelope(&envelope)?;
        let ack = PublishReply::Ack {
            offset,
            correlation_id: envelope.correlation_id.clone(),
        };

        match envelope.ack_policy {
            AckPolicy::None | AckPolicy::Leader => {
                self.advance_and_resolve().await;
                Ok(ack)
            }
            AckPolicy::All => {
                let (tx, rx) = oneshot::channel();
                self.pending.lock().register(
                    offset,
                    PendingPublish {
                        correlation_id: envelope.correlation_id.clone(),
                        ack_inbox: None,
                        reply_tx: Some(tx),
                    },
                );
                self.advance_and_resolve().await;

                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.pending.lock().reap(&envelope.correlation_id);
                        Err(StreambedError::Cancelled)
                    }
                    result = tokio::time::timeout(self.config.ack_timeout(), rx) => match result {
                        Ok(Ok(reply)) => reply,
                        Ok(Err(_)) => Err(StreambedError::NotLeader { leader: None }),
                        Err(_) => {
                            self.pending.lock().reap(&envelope.correlation_id);
                            Err(StreambedError::Timeout)
                        }
                    }
                }
            }
        }
    }

    /// Recompute the committed frontier from ISR progress, advance the HW,
    /// and resolve every pending publish the advance covered. Called on every
    /// event that can move the HW: follower fetches and ISR changes.
    async fn advance_and_resolve(&self) {
        let log_end = self.log.log_end_offset();
        let committed = self.tracker.lock().committed_count(log_end);
        if committed > 0 {
            self.log.advance_high_watermark(Offset::new(committed - 1));
        }

        let resolved = self.pending.lock().resolve_committed(committed);
        for (offset, entry) in resolved {
            let reply = PublishReply::Ack {
                offset,
                correlation_id: entry.correlation_id,
            };
            if let Some(tx) = entry.reply_tx {
                let _ = tx.send(Ok(reply.clone()));
            }
            if let Some(inbox) = entry.ack_inbox {
                if let Ok(bytes) = wire::encode(&reply) {
                    let _ = self.bus.publish(&inbox, None, bytes).await;
                }
            }
        }
    }

    async fn serve_replication(self: Arc<Self>, mut sub: BusSubscription) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                delivery = sub.next() => {
                    let Some(delivery) = delivery else { return };
                    // Each fetch is handled independently so one slow
                    // follower cannot stall the others.
                    let state = Arc::clone(&self);
                    tokio::spawn(async move { state.handle_fetch(delivery).await });
                }
            }
        }
    }

    async fn handle_fetch(&self, delivery: Delivery) {
        let request: ReplicationRequest = match wire::decode(&delivery.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(stream = %self.stream, error = %e, "dropping malformed fetch");
                return;
            }
        };

        if request.epoch != self.epoch {
            debug!(
                stream = %self.stream,
                request_epoch = %request.epoch,
                epoch = %self.epoch,
                "fetch with mismatched epoch"
            );
            self.reply_fetch(&delivery, None).await;
            return;
        }

        self.tracker.lock().observe_fetch(
            request.replica_id,
            request.fetch_offset,
            self.log.log_end_offset(),
            Instant::now(),
        );
        self.advance_and_resolve().await;

        // Followers read uncommitted data; they need it to advance the HW.
        let mut reader = self
            .log
            .reader(Offset::new(request.fetch_offset), ReadMode::Uncommitted);
        let messages = reader
            .next_batch_timeout(
                self.config.max_batch_bytes,
                self.config.fetch_wait_max(),
                &self.cancel,
            )
            .await
            .unwrap_or_default();

        let batch = (!messages.is_empty())
            .then(|| MessageBatch::new(Offset::new(request.fetch_offset), messages));
        self.reply_fetch(&delivery, batch).await;
    }

    async fn reply_fetch(&self, delivery: &Delivery, batch: Option<MessageBatch>) {
        let response = ReplicationResponse {
            epoch: self.epoch,
            high_watermark: self.log.high_watermark(),
            batch,
        };
        if let Ok(bytes) = wire::encode(&response) {
            let _ = respond(self.bus.as_ref(), &delivery.reply, bytes).await;
        }
    }

    async fn serve_epoch_requests(self: Arc<Self>, mut sub: BusSubscription) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                delivery = sub.next() => {
                    let Some(delivery) = delivery else { return };
                    let request: LeaderEpochRequest = match wire::decode(&delivery.payload) {
                        Ok(request) => request,
                        Err(_) => continue,
                    };

                    let response = LeaderEpochResponse {
                        epoch: self.epoch,
                        end_offset: self.log.lookup_epoch(request.epoch),
                    };
                    debug!(
                        stream = %self.stream,
                        replica = request.replica_id,
                        requested = %request.epoch,
                        end_offset = ?response.end_offset,
                        "answered epoch query"
                    );
                    if let Ok(bytes) = wire::encode(&response) {
                        let _ = respond(self.bus.as_ref(), &delivery.reply, bytes).await;
                    }
                }
            }
        }
    }

    async fn serve_publishes(self: Arc<Self>, mut sub: BusSubscription) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                delivery = sub.next() => {
                    let Some(delivery) = delivery else { return };
                    let envelope: PublishEnvelope = match wire::decode(&delivery.payload) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            warn!(stream = %self.stream, error = %e, "dropping malformed publish");
                            continue;
                        }
                    };
                    self.handle_publish_envelope(envelope, delivery.reply).await;
                }
            }
        }
    }

    async fn handle_publish_envelope(&self, envelope: PublishEnvelope, reply: Option<String>) {
        let ack_dest = envelope.ack_inbox.clone().or(reply);

        let offset = match self.append_envelope(&envelope) {
            Ok(offset) => offset,
            Err(e) => {
                if let Some(inbox) = ack_dest {
                    let reply = PublishReply::Error {
                        correlation_id: envelope.correlation_id,
                        message: e.to_string(),
                    };
                    if let Ok(bytes) = wire::encode(&reply) {
                        let _ = self.bus.publish(&inbox, None, bytes).await;
                    }
                }
                return;
            }
        };

        match envelope.ack_policy {
            AckPolicy::None => {
                self.advance_and_resolve().await;
            }
            AckPolicy::Leader => {
                self.advance_and_resolve().await;
                if let Some(inbox) = ack_dest {
                    let reply = PublishReply::Ack {
                        offset,
                        correlation_id: envelope.correlation_id,
                    };
                    if let Ok(bytes) = wire::encode(&reply) {
                        let _ = self.bus.publish(&inbox, None, bytes).await;
                    }
                }
            }
            AckPolicy::All => {
                self.pending.lock().register(
                    offset,
                    PendingPublish {
                        correlation_id: envelope.correlation_id,
                        ack_inbox: ack_dest,
                        reply_tx: None,
                    },
                );
                self.advance_and_resolve().await;
            }
        }
    }

    async fn run_isr_checker(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.isr_check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let log_end = self.log.log_end_offset();
            let (delta, current_isr) = {
                let mut tracker = self.tracker.lock();
                let committed = tracker.committed_count(log_end);
                (
                    tracker.evaluate(log_end, committed, Instant::now()),
                    tracker.isr(),
                )
            };

            if !delta.is_empty() {
                let mut new_isr: Vec<NodeId> = current_isr
                    .into_iter()
                    .filter(|r| !delta.remove.contains(r))
                    .collect();
                new_isr.extend(delta.add.iter().copied());
                new_isr.sort_unstable();

                match self
                    .gateway
                    .propose_isr_change(&self.stream, self.epoch, new_isr.clone())
                    .await
                {
                    Ok(true) => {
                        info!(
                            stream = %self.stream,
                            epoch = %self.epoch,
                            removed = ?delta.remove,
                            added = ?delta.add,
                            "isr change accepted"
                        );
                        self.tracker.lock().set_isr(&new_isr);
                        // Shrinking the ISR can make pending publishes
                        // committable; re-run the HW advance.
                        self.advance_and_resolve().await;
                    }
                    Ok(false) => {
                        debug!(stream = %self.stream, "isr change rejected by controller");
                    }
                    Err(e) => {
                        warn!(stream = %self.stream, error = %e, "isr change proposal failed");
                    }
                }
            }

            let _ = self.log.checkpoint();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration;
    use streambed_storage::LogConfig;
    use streambed_transport::bus::{request, Bus};
    use tempfile::TempDir;

    struct AcceptAllGateway;

    #[async_trait]
    impl MetadataGateway for AcceptAllGateway {
        async fn propose_isr_change(
            &self,
            _stream: &StreamId,
            _epoch: Epoch,
            _new_isr: Vec<NodeId>,
        ) -> Result<bool> {
            Ok(true)
        }

        async fn report_unreachable_leader(&self, _stream: &StreamId, _epoch: Epoch, _from: NodeId) {}
    }

    fn envelope(value: &str, policy: AckPolicy) -> PublishEnvelope {
        PublishEnvelope {
            key: None,
            value: Bytes::copy_from_slice(value.as_bytes()),
            headers: Vec::new(),
            ack_policy: policy,
            correlation_id: format!("corr-{value}"),
            ack_inbox: None,
        }
    }

    async fn start_leader(
        dir: &TempDir,
        replicas: Vec<NodeId>,
        isr: Vec<NodeId>,
        min_isr: usize,
        bus: &Bus,
    ) -> LeaderHandle {
        let log = CommitLog::open(dir.path().to_path_buf(), LogConfig::default()).unwrap();
        LeaderHandle::start(
            StreamId::new("orders", "orders-log"),
            1,
            Epoch::new(1),
            replicas,
            isr,
            min_isr,
            log,
            Arc::new(bus.handle(1)),
            Arc::new(AcceptAllGateway),
            ReplicationConfig {
                ack_timeout_ms: 500,
                fetch_wait_max_ms: 50,
                ..ReplicationConfig::default()
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_single_replica_commits_locally() {
        let dir = TempDir::new().unwrap();
        let bus = Bus::new();
        let leader = start_leader(&dir, vec![1], vec![1], 1, &bus).await;

        let cancel = CancellationToken::new();
        let reply = leader
            .publisher()
            .publish(envelope("solo", AckPolicy::All), &cancel)
            .await
            .unwrap();
        match reply {
            PublishReply::Ack { offset, correlation_id } => {
                assert_eq!(offset, Offset::START);
                assert_eq!(correlation_id, "corr-solo");
            }
            PublishReply::Error { .. } => panic!("expected ack"),
        }

        leader.stop().await;
    }

    #[tokio::test]
    async fn test_publish_rejected_below_min_isr() {
        let dir = TempDir::new().unwrap();
        let bus = Bus::new();
        let leader = start_leader(&dir, vec![1, 2], vec![1], 2, &bus).await;

        let cancel = CancellationToken::new();
        let result = leader
            .publisher()
            .publish(envelope("held", AckPolicy::Leader), &cancel)
            .await;
        assert!(matches!(
            result,
            Err(StreambedError::TransientUnavailable(_))
        ));

        leader.stop().await;
    }

    #[tokio::test]
    async fn test_all_policy_waits_for_follower_fetch() {
        let dir = TempDir::new().unwrap();
        let bus = Bus::new();
        let leader = start_leader(&dir, vec![1, 2], vec![1, 2], 1, &bus).await;
        let stream = StreamId::new("orders", "orders-log");

        let publisher = leader.publisher();
        let cancel = CancellationToken::new();
        let publish = tokio::spawn({
            let publisher = publisher.clone();
            let cancel = cancel.clone();
            async move {
                publisher
                    .publish(envelope("replicated", AckPolicy::All), &cancel)
                    .await
            }
        });

        // Act as follower 2: fetch until the leader's HW covers offset 0.
        let follower_bus = bus.handle(2);
        let inbox = subjects::replication_inbox(&stream, Epoch::new(1));
        let mut fetch_offset = 0u64;
        for _ in 0..10 {
            let req = ReplicationRequest {
                replica_id: 2,
                epoch: Epoch::new(1),
                fetch_offset,
            };
            let bytes = request(
                &follower_bus,
                &inbox,
                wire::encode(&req).unwrap(),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
            let response: ReplicationResponse = wire::decode(&bytes).unwrap();
            if let Some(batch) = response.batch {
                fetch_offset = batch.last_offset().unwrap().value() + 1;
            }
            if response.high_watermark == Some(Offset::START) {
                break;
            }
        }

        let reply = publish.await.unwrap().unwrap();
        assert!(matches!(reply, PublishReply::Ack { offset, .. } if offset == Offset::START));

        leader.stop().await;
    }

    #[tokio::test]
    async fn test_subject_publish_acks_to_inbox() {
        let dir = TempDir::new().unwrap();
        let bus = Bus::new();
        let leader = start_leader(&dir, vec![1], vec![1], 1, &bus).await;

        let client = bus.handle(9);
        let mut ack_sub = client.subscribe("acks.client-9").await.unwrap();

        let envelope = PublishEnvelope {
            key: None,
            value: Bytes::from_static(b"via-subject"),
            headers: Vec::new(),
            ack_policy: AckPolicy::All,
            correlation_id: "subject-1".to_string(),
            ack_inbox: Some("acks.client-9".to_string()),
        };
        client
            .publish("orders", None, wire::encode(&envelope).unwrap())
            .await
            .unwrap();

        let delivery = ack_sub
            .next_timeout(Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        let reply: PublishReply = wire::decode(&delivery.payload).unwrap();
        match reply {
            PublishReply::Ack { offset, correlation_id } => {
                assert_eq!(offset, Offset::START);
                assert_eq!(correlation_id, "subject-1");
            }
            PublishReply::Error { .. } => panic!("expected ack"),
        }

        leader.stop().await;
    }

    #[tokio::test]
    async fn test_stop_rejects_pending_publishes() {
        let dir = TempDir::new().unwrap();
        let bus = Bus::new();
        let leader = start_leader(&dir, vec![1, 2], vec![1, 2], 1, &bus).await;

        let publisher = leader.publisher();
        let cancel = CancellationToken::new();
        let publish = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                publisher
                    .publish(envelope("stranded", AckPolicy::All), &cancel)
                    .await
            }
        });

        // Give the publish time to register, then demote the leader.
        tokio::time::sleep(Duration::from_millis(50)).await;
        leader.stop().await;

        let result = publish.await.unwrap();
        assert!(matches!(result, Err(StreambedError::NotLeader { .. })));
    }
}
