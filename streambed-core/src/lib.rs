//! Core types shared by every streambed crate: offsets, epochs, messages,
//! stream identities, and the crate-wide error type.

pub mod epoch;
pub mod error;
pub mod message;
pub mod offset;
pub mod stream;
pub mod traits;

pub use epoch::{Epoch, EpochEntry, EpochMap};
pub use error::{Result, StreambedError};
pub use message::{AckPolicy, Header, Message, MessageBatch};
pub use offset::Offset;
pub use stream::{NodeId, StreamId, StreamSpec, StreamUpdate};
pub use traits::MetadataGateway;
