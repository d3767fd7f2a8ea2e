//! Inter-node messaging: a subject-addressed pub/sub abstraction with
//! best-effort delivery, inbox-based request/reply on top of it, and the
//! wire messages exchanged between replicas.

pub mod bus;
pub mod subjects;
pub mod wire;

pub use bus::{request, respond, Bus, BusHandle, BusSubscription, Delivery, PubSub};
pub use wire::{
    decode, encode, LeaderEpochRequest, LeaderEpochResponse, PublishEnvelope, PublishReply,
    ReplicationRequest, ReplicationResponse,
};
