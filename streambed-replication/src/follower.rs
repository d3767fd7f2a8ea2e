use std::sync::Arc;
use std::time::Duration;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use streambed_core::{Epoch, MetadataGateway, NodeId, StreamId, StreambedError};
use streambed_storage::CommitLog;
use streambed_transport::{
    bus::{request, PubSub},
    subjects, wire,
    wire::{LeaderEpochRequest, LeaderEpochResponse, ReplicationRequest, ReplicationResponse},
};

use crate::config::ReplicationConfig;

/// Running follower role for one stream replica.
pub struct FollowerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl FollowerHandle {
    /// Start following the leader of `epoch`. The loop reconciles the local
    /// log with the leader, then fetches until cancelled.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        stream: StreamId,
        node_id: NodeId,
        epoch: Epoch,
        leader: NodeId,
        log: Arc<CommitLog>,
        bus: Arc<dyn PubSub>,
        gateway: Arc<dyn MetadataGateway>,
        config: ReplicationConfig,
    ) -> FollowerHandle {
        let cancel = CancellationToken::new();
        let follower = Follower {
            stream,
            node_id,
            epoch,
            leader,
            log,
            bus,
            gateway,
            config,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(follower.run());
        FollowerHandle { cancel, task }
    }

    /// Quiesce the loop. In-flight work is abandoned at the next suspension
    /// point.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

struct Follower {
    stream: StreamId,
    node_id: NodeId,
    epoch: Epoch,
    leader: NodeId,
    log: Arc<CommitLog>,
    bus: Arc<dyn PubSub>,
    gateway: Arc<dyn MetadataGateway>,
    config: ReplicationConfig,
    cancel: CancellationToken,
}

impl Follower {
    async fn run(mut self) {
        info!(
            stream = %self.stream,
            node = self.node_id,
            leader = self.leader,
            epoch = %self.epoch,
            "became follower"
        );

        // An uncommitted suffix inherited from a previous role is not
        // trusted; cut back to the committed frontier before reconciling
        // with the leader, which re-sends anything that is still valid.
        let committed_end = self
            .log
            .high_watermark()
            .map(|hw| hw.value() + 1)
            .unwrap_or(0);
        if let Err(e) = self.log.truncate(committed_end) {
            error!(stream = %self.stream, error = %e, "failed to drop uncommitted suffix");
            return;
        }

        if !self.sync_epoch().await {
            return;
        }
        self.fetch_loop().await;
        let _ = self.log.checkpoint();
    }

    /// Negotiate a consistent log prefix with the leader: ask for the last
    /// offset valid at our newest known epoch and truncate whatever lies
    /// beyond it. Returns `false` when cancelled.
    async fn sync_epoch(&self) -> bool {
        if self.log.latest_epoch().is_none() {
            // Fresh replica: nothing to reconcile.
            return true;
        }

        let Some(emax) = self.log.closest_epoch(self.epoch) else {
            // Every locally recorded epoch is newer than the leader's:
            // nothing local can be valid under this lineage.
            let _ = self.log.truncate(0);
            return true;
        };

        let inbox = subjects::epoch_inbox(&self.stream);
        let mut timeouts = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return false;
            }

            let query = LeaderEpochRequest {
                replica_id: self.node_id,
                epoch: emax,
            };
            let payload = match wire::encode(&query) {
                Ok(payload) => payload,
                Err(_) => return false,
            };

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return false,
                r = request(self.bus.as_ref(), &inbox, payload, self.config.fetch_timeout()) => r,
            };

            match result {
                Ok(bytes) => match wire::decode::<LeaderEpochResponse>(&bytes) {
                    Ok(response) if response.epoch == self.epoch => {
                        let safe_end = response
                            .end_offset
                            .map(|o| o.value() + 1)
                            .unwrap_or(0);
                        if safe_end < self.log.log_end_offset() {
                            info!(
                                stream = %self.stream,
                                safe_end,
                                log_end = self.log.log_end_offset(),
                                "truncating divergent suffix"
                            );
                            if let Err(e) = self.log.truncate(safe_end) {
                                error!(stream = %self.stream, error = %e, "truncation failed");
                                return false;
                            }
                        }
                        return true;
                    }
                    Ok(response) => {
                        // A replica of another epoch answered; ignore it.
                        debug!(
                            stream = %self.stream,
                            answered = %response.epoch,
                            expected = %self.epoch,
                            "epoch answer from wrong epoch"
                        );
                        self.backoff().await;
                    }
                    Err(_) => self.backoff().await,
                },
                Err(StreambedError::Timeout) => {
                    timeouts += 1;
                    if timeouts >= self.config.replica_max_leader_timeout {
                        warn!(
                            stream = %self.stream,
                            leader = self.leader,
                            "leader unreachable during epoch sync"
                        );
                        self.gateway
                            .report_unreachable_leader(&self.stream, self.epoch, self.node_id)
                            .await;
                        timeouts = 0;
                        self.backoff().await;
                    }
                }
                Err(_) => self.backoff().await,
            }
        }
    }

    async fn fetch_loop(&mut self) {
        let mut inbox = subjects::replication_inbox(&self.stream, self.epoch);
        let mut timeouts = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            let fetch_offset = self.log.log_end_offset();
            let fetch = ReplicationRequest {
                replica_id: self.node_id,
                epoch: self.epoch,
                fetch_offset,
            };
            let payload = match wire::encode(&fetch) {
                Ok(payload) => payload,
                Err(_) => return,
            };

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return,
                r = request(self.bus.as_ref(), &inbox, payload, self.config.fetch_timeout()) => r,
            };

            match result {
                Ok(bytes) => {
                    timeouts = 0;
                    let response: ReplicationResponse = match wire::decode(&bytes) {
                        Ok(response) => response,
                        Err(_) => continue,
                    };

                    if response.epoch < self.epoch {
                        debug!(stream = %self.stream, "ignoring stale-epoch response");
                        continue;
                    }
                    if response.epoch > self.epoch {
                        // The leadership moved on under us; renegotiate the
                        // prefix before fetching under the new epoch.
                        warn!(
                            stream = %self.stream,
                            old = %self.epoch,
                            new = %response.epoch,
                            "epoch advanced, resyncing"
                        );
                        self.epoch = response.epoch;
                        if !self.sync_epoch().await {
                            return;
                        }
                        inbox = subjects::replication_inbox(&self.stream, self.epoch);
                        continue;
                    }

                    if let Some(batch) = &response.batch {
                        if batch.base_offset.value() != self.log.log_end_offset() {
                            debug!(
                                stream = %self.stream,
                                base = batch.base_offset.value(),
                                expected = self.log.log_end_offset(),
                                "discarding out-of-order batch"
                            );
                        } else if let Err(e) = self.log.append_replicated(batch) {
                            match e {
                                StreambedError::OffsetOutOfRange(_)
                                | StreambedError::Serialization(_) => {
                                    debug!(stream = %self.stream, error = %e, "discarding batch");
                                }
                                e => {
                                    error!(
                                        stream = %self.stream,
                                        error = %e,
                                        "storage failure, abandoning follower loop"
                                    );
                                    return;
                                }
                            }
                        }
                    }

                    if let Some(leader_hw) = response.high_watermark {
                        // Clamped to the local newest offset internally.
                        self.log.advance_high_watermark(leader_hw);
                    }
                }
                Err(StreambedError::Timeout) => {
                    timeouts += 1;
                    if timeouts >= self.config.replica_max_leader_timeout {
                        warn!(
                            stream = %self.stream,
                            leader = self.leader,
                            epoch = %self.epoch,
                            "leader unreachable"
                        );
                        self.gateway
                            .report_unreachable_leader(&self.stream, self.epoch, self.node_id)
                            .await;
                        timeouts = 0;
                        self.backoff().await;
                    }
                }
                Err(e) => {
                    debug!(stream = %self.stream, error = %e, "fetch failed");
                    self.backoff().await;
                }
            }
        }
    }

    async fn backoff(&self) {
        let base = self.config.retry_backoff().as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=base);
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_millis(base + jitter)) => {}
        }
    }
}
