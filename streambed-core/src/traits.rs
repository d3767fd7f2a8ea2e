use async_trait::async_trait;

use crate::epoch::Epoch;
use crate::error::Result;
use crate::stream::{NodeId, StreamId};

/// The slice of the external metadata authority visible to the replication
/// engine. The controller owns leader election, epoch numbering, and ISR
/// change acceptance; the engine only proposes and reports.
#[async_trait]
pub trait MetadataGateway: Send + Sync {
    /// Leader-initiated ISR change. Returns `true` when the controller
    /// accepted the new set; the in-memory ISR must only change on accept.
    async fn propose_isr_change(
        &self,
        stream: &StreamId,
        epoch: Epoch,
        new_isr: Vec<NodeId>,
    ) -> Result<bool>;

    /// Follower-initiated hint that the leader for `epoch` is unreachable.
    async fn report_unreachable_leader(&self, stream: &StreamId, epoch: Epoch, from: NodeId);
}
