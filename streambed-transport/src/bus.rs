use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use streambed_core::{NodeId, Result, StreambedError};

use crate::subjects;

const SUBSCRIPTION_QUEUE: usize = 1024;

/// One message delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Bytes,
}

/// Subject-addressed pub/sub with best-effort delivery. Messages may be
/// dropped or arrive out of order between requests; protocol logic must
/// tolerate loss and duplicates.
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, subject: &str, reply: Option<String>, payload: Bytes) -> Result<()>;

    async fn subscribe(&self, subject: &str) -> Result<BusSubscription>;
}

/// Receiving half of a subscription. Dropping it tears the subscription down.
pub struct BusSubscription {
    rx: mpsc::Receiver<Delivery>,
}

impl BusSubscription {
    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    pub async fn next_timeout(&mut self, wait: Duration) -> Result<Option<Delivery>> {
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(delivery) => Ok(delivery),
            Err(_) => Err(StreambedError::Timeout),
        }
    }
}

struct TopicSender {
    owner: NodeId,
    tx: mpsc::Sender<Delivery>,
}

struct BusState {
    topics: HashMap<String, Vec<TopicSender>>,
    cut: HashSet<NodeId>,
}

/// In-process pub/sub fabric shared by every node of a cluster. Queues are
/// bounded and overflow is dropped, matching the best-effort contract. Nodes
/// can be cut off from the fabric to simulate network partitions.
#[derive(Clone)]
pub struct Bus {
    state: Arc<RwLock<BusState>>,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(BusState {
                topics: HashMap::new(),
                cut: HashSet::new(),
            })),
        }
    }

    /// A node-scoped handle. All traffic through it is attributed to `node`
    /// for partition simulation.
    pub fn handle(&self, node: NodeId) -> BusHandle {
        BusHandle {
            node,
            bus: self.clone(),
        }
    }

    /// Cut a node off: its publishes vanish and nothing reaches its
    /// subscriptions until healed.
    pub fn isolate(&self, node: NodeId) {
        self.state.write().cut.insert(node);
    }

    pub fn heal(&self, node: NodeId) {
        self.state.write().cut.remove(&node);
    }

    fn publish_from(&self, from: NodeId, subject: &str, reply: Option<String>, payload: Bytes) {
        let mut state = self.state.write();
        if state.cut.contains(&from) {
            return;
        }

        let cut = state.cut.clone();
        if let Some(senders) = state.topics.get_mut(subject) {
            senders.retain(|s| !s.tx.is_closed());
            for sender in senders.iter() {
                if cut.contains(&sender.owner) {
                    continue;
                }
                let delivery = Delivery {
                    subject: subject.to_string(),
                    reply: reply.clone(),
                    payload: payload.clone(),
                };
                // Full queue means a slow subscriber; drop, per the
                // best-effort contract.
                let _ = sender.tx.try_send(delivery);
            }
        }
    }

    fn subscribe_for(&self, owner: NodeId, subject: &str) -> BusSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE);
        self.state
            .write()
            .topics
            .entry(subject.to_string())
            .or_default()
            .push(TopicSender { owner, tx });
        BusSubscription { rx }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-node view of the bus.
#[derive(Clone)]
pub struct BusHandle {
    node: NodeId,
    bus: Bus,
}

impl BusHandle {
    pub fn node(&self) -> NodeId {
        self.node
    }
}

#[async_trait]
impl PubSub for BusHandle {
    async fn publish(&self, subject: &str, reply: Option<String>, payload: Bytes) -> Result<()> {
        self.bus.publish_from(self.node, subject, reply, payload);
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<BusSubscription> {
        Ok(self.bus.subscribe_for(self.node, subject))
    }
}

/// Inbox-based request/reply: subscribe to a fresh reply inbox, publish the
/// request with the inbox as the reply subject, and wait for one response.
pub async fn request(
    bus: &dyn PubSub,
    subject: &str,
    payload: Bytes,
    timeout: Duration,
) -> Result<Bytes> {
    let inbox = subjects::reply_inbox();
    let mut sub = bus.subscribe(&inbox).await?;
    bus.publish(subject, Some(inbox), payload).await?;

    match sub.next_timeout(timeout).await? {
        Some(delivery) => Ok(delivery.payload),
        None => Err(StreambedError::TransientUnavailable(
            "reply channel closed".to_string(),
        )),
    }
}

/// Publish a reply when the request carried a reply inbox.
pub async fn respond(bus: &dyn PubSub, reply: &Option<String>, payload: Bytes) -> Result<()> {
    if let Some(inbox) = reply {
        bus.publish(inbox, None, payload).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = Bus::new();
        let a = bus.handle(1);
        let b = bus.handle(2);

        let mut sub = b.subscribe("greetings").await.unwrap();
        a.publish("greetings", None, Bytes::from_static(b"hi"))
            .await
            .unwrap();

        let delivery = sub.next().await.unwrap();
        assert_eq!(delivery.subject, "greetings");
        assert_eq!(delivery.payload, Bytes::from_static(b"hi"));
    }

    #[tokio::test]
    async fn test_request_reply() {
        let bus = Bus::new();
        let server = bus.handle(1);
        let client = bus.handle(2);

        let mut sub = server.subscribe("service").await.unwrap();
        tokio::spawn(async move {
            while let Some(delivery) = sub.next().await {
                respond(&server, &delivery.reply, Bytes::from_static(b"pong"))
                    .await
                    .unwrap();
            }
        });

        let reply = request(
            &client,
            "service",
            Bytes::from_static(b"ping"),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(reply, Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn test_request_times_out_without_server() {
        let bus = Bus::new();
        let client = bus.handle(1);

        let result = request(
            &client,
            "nobody-home",
            Bytes::from_static(b"ping"),
            Duration::from_millis(30),
        )
        .await;
        assert!(matches!(result, Err(StreambedError::Timeout)));
    }

    #[tokio::test]
    async fn test_isolated_node_is_cut_off() {
        let bus = Bus::new();
        let a = bus.handle(1);
        let b = bus.handle(2);

        let mut sub = b.subscribe("topic").await.unwrap();

        bus.isolate(1);
        a.publish("topic", None, Bytes::from_static(b"lost"))
            .await
            .unwrap();
        assert!(matches!(
            sub.next_timeout(Duration::from_millis(30)).await,
            Err(StreambedError::Timeout)
        ));

        bus.heal(1);
        a.publish("topic", None, Bytes::from_static(b"found"))
            .await
            .unwrap();
        let delivery = sub.next().await.unwrap();
        assert_eq!(delivery.payload, Bytes::from_static(b"found"));
    }
}
