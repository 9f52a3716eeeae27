//! Broadcast Bus (spec §4.4).
//!
//! The spec assumes "a reliable-ish broadcast primitive with per-topic
//! streams" and explicitly puts the real peer-to-peer transport out of
//! scope (§1). `BroadcastBus` is the seam: production deployments wire a
//! real libp2p-style transport behind it (protocol IDs per §6.2); this
//! crate additionally ships `LocalBus`, an in-process implementation used
//! by tests and single-process multi-node simulations, grounded in the
//! teacher's pattern of mocking its transport trait (`BitcoinOps`) behind
//! a shared in-memory registry for tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use zkseq_types::NodeId;

/// The three logical topics the spec names (§4.4), mirrored onto the
/// libp2p-style protocol IDs used on the wire (§6.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    Tx,
    Batch,
    Consensus,
}

impl Topic {
    pub fn protocol_id(self) -> &'static str {
        match self {
            Topic::Tx => "/zkrollup/tx/1.0.0",
            Topic::Batch => "/zkrollup/batch/1.0.0",
            Topic::Consensus => "/zkrollup/consensus/1.0.0",
        }
    }
}

pub type Handler = Box<dyn Fn(Vec<u8>) + Send + Sync>;

#[async_trait]
pub trait BroadcastBus: Send + Sync {
    /// Best-effort fan-out to every currently-connected peer. Delivery is
    /// at-most-once per peer per message and unordered across peers; the
    /// bus never retries past an unreachable peer (spec §4.4).
    async fn broadcast(&self, topic: Topic, payload: Vec<u8>) -> anyhow::Result<()>;

    /// Registers the single handler for a topic, replacing any previous
    /// one (spec §4.4: "single handler per topic").
    fn on_deliver(&self, topic: Topic, handler: Handler);

    fn peers(&self) -> HashSet<NodeId>;

    fn local_id(&self) -> NodeId;
}

type HandlerSlot = Arc<RwLock<Option<Handler>>>;

struct NodeState {
    handlers: [HandlerSlot; 3],
}

impl NodeState {
    fn new() -> Self {
        Self {
            handlers: [
                Arc::new(RwLock::new(None)),
                Arc::new(RwLock::new(None)),
                Arc::new(RwLock::new(None)),
            ],
        }
    }

    fn slot(&self, topic: Topic) -> &HandlerSlot {
        match topic {
            Topic::Tx => &self.handlers[0],
            Topic::Batch => &self.handlers[1],
            Topic::Consensus => &self.handlers[2],
        }
    }
}

/// Shared registry that lets every `LocalBus` in a process discover and
/// deliver to its peers. Stands in for the real p2p transport's peer
/// table (spec §4.4 "peers() <- peer-set observation").
#[derive(Default, Clone)]
pub struct NetworkHub {
    nodes: Arc<Mutex<std::collections::HashMap<NodeId, Arc<NodeState>>>>,
}

impl NetworkHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, node_id: NodeId) -> LocalBus {
        let state = Arc::new(NodeState::new());
        self.nodes
            .lock()
            .expect("hub lock poisoned")
            .insert(node_id.clone(), state.clone());
        LocalBus {
            hub: self.clone(),
            node_id,
            state,
        }
    }
}

/// In-process `BroadcastBus` backed by a `NetworkHub`.
pub struct LocalBus {
    hub: NetworkHub,
    node_id: NodeId,
    state: Arc<NodeState>,
}

#[async_trait]
impl BroadcastBus for LocalBus {
    async fn broadcast(&self, topic: Topic, payload: Vec<u8>) -> anyhow::Result<()> {
        let nodes = self.hub.nodes.lock().expect("hub lock poisoned");
        let peers: Vec<Arc<NodeState>> = nodes
            .iter()
            .filter(|(id, _)| *id != &self.node_id)
            .map(|(_, state)| state.clone())
            .collect();
        drop(nodes);

        debug!(topic = ?topic, peer_count = peers.len(), "broadcasting");
        for peer in peers {
            let slot = peer.slot(topic).clone();
            let payload = payload.clone();
            // Independent per-peer delivery: one peer's handler panicking
            // or stalling never blocks fan-out to the others.
            tokio::spawn(async move {
                let handler = slot.read().expect("handler lock poisoned");
                if let Some(handler) = handler.as_ref() {
                    handler(payload);
                } else {
                    trace!("dropped message: no handler registered for topic");
                }
            });
        }
        Ok(())
    }

    fn on_deliver(&self, topic: Topic, handler: Handler) {
        let mut slot = self.state.slot(topic).write().expect("handler lock poisoned");
        *slot = Some(handler);
    }

    fn peers(&self) -> HashSet<NodeId> {
        self.hub
            .nodes
            .lock()
            .expect("hub lock poisoned")
            .keys()
            .filter(|id| *id != &self.node_id)
            .cloned()
            .collect()
    }

    fn local_id(&self) -> NodeId {
        self.node_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_all_other_peers() {
        let hub = NetworkHub::new();
        let a = hub.join(NodeId::new("a"));
        let b = hub.join(NodeId::new("b"));
        let c = hub.join(NodeId::new("c"));

        let received = Arc::new(AtomicUsize::new(0));
        let rb = received.clone();
        b.on_deliver(
            Topic::Consensus,
            Box::new(move |_payload| {
                rb.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let rc = received.clone();
        c.on_deliver(
            Topic::Consensus,
            Box::new(move |_payload| {
                rc.fetch_add(1, Ordering::SeqCst);
            }),
        );

        a.broadcast(Topic::Consensus, b"hello".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(received.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn broadcast_does_not_deliver_to_self() {
        let hub = NetworkHub::new();
        let a = hub.join(NodeId::new("a"));

        let received = Arc::new(AtomicUsize::new(0));
        let ra = received.clone();
        a.on_deliver(
            Topic::Tx,
            Box::new(move |_payload| {
                ra.fetch_add(1, Ordering::SeqCst);
            }),
        );

        a.broadcast(Topic::Tx, b"hi".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(received.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn peers_excludes_self() {
        let hub = NetworkHub::new();
        let a = hub.join(NodeId::new("a"));
        let _b = hub.join(NodeId::new("b"));

        let peers = a.peers();
        assert_eq!(peers.len(), 1);
        assert!(peers.contains(&NodeId::new("b")));
        assert!(!peers.contains(&NodeId::new("a")));
    }
}
