use rand::distributions::Alphanumeric;
use rand::Rng;

use streambed_core::{Epoch, StreamId};

/// Inbox a stream leader serves replication fetches on. Scoped by epoch so a
/// deposed leader's inbox goes quiet the moment the epoch moves on.
pub fn replication_inbox(id: &StreamId, epoch: Epoch) -> String {
    format!("replicate.{}.{}.{}", id.subject, id.name, epoch.value())
}

/// Inbox a stream leader serves epoch offset queries on.
pub fn epoch_inbox(id: &StreamId) -> String {
    format!("epoch.{}.{}", id.subject, id.name)
}

/// Fresh reply inbox for one request/reply exchange.
pub fn reply_inbox() -> String {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    format!("_INBOX.{token}")
}
