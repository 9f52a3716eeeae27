//! BFT Engine (spec §4.5): per-batch consensus state machines, quorum
//! counting, leader rotation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tracing::info;
use zkseq_codec::batch_hash_hex;
use zkseq_network::{BroadcastBus, Topic};
use zkseq_types::{Batch, ConsensusPhase, ConsensusState, Envelope, HexHash, MessageKind, NodeId};

use crate::quorum::quorum_for;
use crate::verifier::MessageVerifier;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BftError {
    #[error("not the current leader")]
    NotLeader,
    #[error("message view {got} does not match current view {expected}")]
    WrongView { expected: i64, got: i64 },
    #[error("no consensus state for batch hash {0}")]
    UnknownBatchHash(HexHash),
    #[error("message failed signature verification")]
    Unverified,
    #[error("message serialization failed")]
    Codec,
    #[error("decided-batch channel closed; sequencer has shut down")]
    ChannelClosed,
}

struct Runtime {
    view: i64,
    sequence: i64,
    is_leader: bool,
}

/// Per-batch consensus state machines, keyed by batch hash (spec §3
/// ownership notes: "Consensus states are owned by the BFT Engine, keyed
/// by batch hash, removed on decision").
pub struct BftEngine {
    node_id: NodeId,
    bus: Arc<dyn BroadcastBus>,
    verifier: Arc<dyn MessageVerifier>,
    runtime: Mutex<Runtime>,
    known_participants: RwLock<HashSet<NodeId>>,
    states: RwLock<HashMap<HexHash, ConsensusState>>,
    decided_tx: mpsc::Sender<Batch>,
}

impl BftEngine {
    /// Builds the engine and its decided-batch channel. The channel has a
    /// capacity of 1 rather than 0 (tokio's `mpsc` requires a positive
    /// buffer), which is the closest a bounded channel gets to the spec's
    /// "send blocks until the sequencer consumes" rendezvous semantics
    /// (§5): once the single slot is occupied, the next `decide` blocks.
    pub fn new(
        node_id: NodeId,
        bus: Arc<dyn BroadcastBus>,
        verifier: Arc<dyn MessageVerifier>,
        is_leader: bool,
    ) -> (Arc<Self>, mpsc::Receiver<Batch>) {
        let (decided_tx, decided_rx) = mpsc::channel(1);
        let mut known_participants = HashSet::new();
        known_participants.insert(node_id.clone());

        let engine = Arc::new(Self {
            node_id,
            bus,
            verifier,
            runtime: Mutex::new(Runtime {
                view: 0,
                sequence: 0,
                is_leader,
            }),
            known_participants: RwLock::new(known_participants),
            states: RwLock::new(HashMap::new()),
            decided_tx,
        });
        (engine, decided_rx)
    }

    pub fn is_leader(&self) -> bool {
        self.runtime.lock().expect("runtime lock poisoned").is_leader
    }

    pub fn view(&self) -> i64 {
        self.runtime.lock().expect("runtime lock poisoned").view
    }

    /// `N` is derived from the known-participants set, which is grown by
    /// the peer observer (`sync_peers`) and by the "participant seen"
    /// heuristic in `handle_message` (spec §4.5 "Quorum").
    pub fn total_nodes(&self) -> usize {
        self.known_participants
            .read()
            .expect("participants lock poisoned")
            .len()
    }

    /// Called periodically by the sequencer's peer-count monitor (spec
    /// §4.7, every 5s) with the bus's current peer set.
    pub fn sync_peers(&self, peers: HashSet<NodeId>) {
        let mut participants = self.known_participants.write().expect("participants lock poisoned");
        participants.extend(peers);
    }

    fn observe_participant(&self, id: &NodeId) {
        let mut participants = self.known_participants.write().expect("participants lock poisoned");
        participants.insert(id.clone());
    }

    /// Snapshot of the known-participants set, sorted lexicographically
    /// (spec §4.5 "Leader rotation"). Exposed so the sequencer can seed a
    /// CRS ceremony's participant list from the same set BFT uses.
    pub fn participants(&self) -> Vec<NodeId> {
        self.sorted_participants()
    }

    /// Participants sorted lexicographically (spec §4.5 "Leader rotation").
    fn sorted_participants(&self) -> Vec<NodeId> {
        let mut participants: Vec<NodeId> = self
            .known_participants
            .read()
            .expect("participants lock poisoned")
            .iter()
            .cloned()
            .collect();
        participants.sort();
        participants
    }

    fn next_leader_after(&self, current: &NodeId) -> NodeId {
        let participants = self.sorted_participants();
        let position = participants.iter().position(|id| id == current).unwrap_or(0);
        let next = (position + 1) % participants.len().max(1);
        participants
            .get(next)
            .cloned()
            .unwrap_or_else(|| current.clone())
    }

    async fn send_envelope(&self, kind: MessageKind) -> Result<(), BftError> {
        let envelope = Envelope::unsigned(kind);
        let payload = serde_json::to_vec(&envelope).map_err(|_| BftError::Codec)?;
        self.bus
            .broadcast(Topic::Consensus, payload)
            .await
            .map_err(|_| BftError::Codec)
    }

    /// Propose (leader only): spec §4.5 step 1.
    pub async fn propose(&self, batch: Batch, timestamp: u64) -> Result<(), BftError> {
        if !self.is_leader() {
            return Err(BftError::NotLeader);
        }

        let hash = batch_hash_hex(&batch);
        let total_nodes = self.total_nodes();

        // Standalone mode (spec §4.5): a lone proposer decides immediately.
        if total_nodes <= 1 {
            info!(batch_hash = %hash, "standalone mode: deciding immediately");
            self.decided_tx
                .send(batch)
                .await
                .map_err(|_| BftError::ChannelClosed)?;
            return Ok(());
        }

        let (view, sequence) = {
            let mut runtime = self.runtime.lock().expect("runtime lock poisoned");
            let current = (runtime.view, runtime.sequence);
            runtime.sequence += 1;
            current
        };

        {
            let mut states = self.states.write().expect("states lock poisoned");
            let mut state = ConsensusState::new(view, sequence, hash.clone(), batch.clone());
            state.prepare_voters.insert(self.node_id.clone());
            state.phase = ConsensusPhase::Prepare;
            states.insert(hash.clone(), state);
        }

        self.send_envelope(MessageKind::PrePrepare {
            view,
            sequence,
            batch_hash: hash.clone(),
            batch,
            node_id: self.node_id.clone(),
            timestamp,
        })
        .await?;

        self.send_envelope(MessageKind::Prepare {
            view,
            sequence,
            batch_hash: hash,
            node_id: self.node_id.clone(),
            timestamp,
        })
        .await
    }

    /// Dispatches an inbound consensus-topic message. Returns an error
    /// for every case the spec says to drop (§4.5 "Failure semantics");
    /// callers log and discard rather than propagate.
    pub async fn handle_message(&self, envelope: Envelope, timestamp: u64) -> Result<(), BftError> {
        if !self.verifier.verify(&envelope) {
            return Err(BftError::Unverified);
        }
        self.observe_participant(envelope.kind.node_id());

        match envelope.kind {
            MessageKind::PrePrepare {
                view,
                sequence,
                batch_hash,
                batch,
                ..
            } => self.on_pre_prepare(view, sequence, batch_hash, batch, timestamp).await,
            MessageKind::Prepare {
                view,
                batch_hash,
                node_id,
                ..
            } => self.on_prepare(view, batch_hash, node_id, timestamp).await,
            MessageKind::Commit {
                view,
                batch_hash,
                node_id,
                ..
            } => self.on_commit(view, batch_hash, node_id).await,
            MessageKind::LeaderRotation { view, next_leader, .. } => {
                self.on_leader_rotation(view, next_leader);
                Ok(())
            }
            MessageKind::CrsCeremonyStart { .. }
            | MessageKind::CrsContributionMsg { .. }
            | MessageKind::CrsCeremonyComplete { .. } => {
                // Ceremony messages share this bus topic but bypass BFT
                // state entirely (spec §4.5 "CRS messages on the same
                // bus"); routing them to `zkseq_ceremony` is the
                // sequencer's job, not the BFT engine's.
                Ok(())
            }
        }
    }

    fn check_view(&self, got: i64) -> Result<(), BftError> {
        let expected = self.view();
        if got != expected {
            return Err(BftError::WrongView { expected, got });
        }
        Ok(())
    }

    async fn on_pre_prepare(
        &self,
        view: i64,
        sequence: i64,
        batch_hash: HexHash,
        batch: Batch,
        timestamp: u64,
    ) -> Result<(), BftError> {
        self.check_view(view)?;

        {
            let mut states = self.states.write().expect("states lock poisoned");
            states
                .entry(batch_hash.clone())
                .or_insert_with(|| ConsensusState::new(view, sequence, batch_hash.clone(), batch));
        }

        {
            let mut states = self.states.write().expect("states lock poisoned");
            if let Some(state) = states.get_mut(&batch_hash) {
                state.prepare_voters.insert(self.node_id.clone());
                state.phase = ConsensusPhase::Prepare;
            }
        }

        self.send_envelope(MessageKind::Prepare {
            view,
            sequence,
            batch_hash,
            node_id: self.node_id.clone(),
            timestamp,
        })
        .await
    }

    async fn on_prepare(
        &self,
        view: i64,
        batch_hash: HexHash,
        sender: NodeId,
        timestamp: u64,
    ) -> Result<(), BftError> {
        self.check_view(view)?;

        let should_commit = {
            let mut states = self.states.write().expect("states lock poisoned");
            let state = states
                .get_mut(&batch_hash)
                .ok_or_else(|| BftError::UnknownBatchHash(batch_hash.clone()))?;
            state.prepare_voters.insert(sender);

            let quorum = quorum_for(self.total_nodes());
            if state.prepare_voters.len() >= quorum && !state.sent_commit {
                state.sent_commit = true;
                state.phase = ConsensusPhase::Commit;
                Some((state.view, state.sequence))
            } else {
                None
            }
        };

        if let Some((view, sequence)) = should_commit {
            self.send_envelope(MessageKind::Commit {
                view,
                sequence,
                batch_hash: batch_hash.clone(),
                node_id: self.node_id.clone(),
                timestamp,
            })
            .await?;
            self.record_own_commit(&batch_hash);
        }
        Ok(())
    }

    fn record_own_commit(&self, batch_hash: &str) {
        let mut states = self.states.write().expect("states lock poisoned");
        if let Some(state) = states.get_mut(batch_hash) {
            state.commit_voters.insert(self.node_id.clone());
        }
    }

    async fn on_commit(&self, view: i64, batch_hash: HexHash, sender: NodeId) -> Result<(), BftError> {
        self.check_view(view)?;

        let decided_batch = {
            let mut states = self.states.write().expect("states lock poisoned");
            let state = states
                .get_mut(&batch_hash)
                .ok_or_else(|| BftError::UnknownBatchHash(batch_hash.clone()))?;
            state.commit_voters.insert(sender);

            let quorum = quorum_for(self.total_nodes());
            if state.commit_voters.len() >= quorum && !state.decided {
                state.decided = true;
                Some(state.batch.clone())
            } else {
                None
            }
        };

        let Some(batch) = decided_batch else {
            return Ok(());
        };

        // Remove the terminal state before handing the batch off so the
        // states lock is not held across the (possibly blocking) channel
        // send (spec §5).
        {
            let mut states = self.states.write().expect("states lock poisoned");
            states.remove(&batch_hash);
        }

        info!(batch_hash = %batch_hash, "batch decided");
        let was_leader = self.is_leader();
        self.decided_tx
            .send(batch)
            .await
            .map_err(|_| BftError::ChannelClosed)?;

        if was_leader {
            self.rotate_leadership().await?;
        }
        Ok(())
    }

    async fn rotate_leadership(&self) -> Result<(), BftError> {
        let next_leader = self.next_leader_after(&self.node_id);
        let view = {
            let mut runtime = self.runtime.lock().expect("runtime lock poisoned");
            runtime.is_leader = next_leader == self.node_id;
            let view = runtime.view;
            runtime.view += 1;
            view
        };

        info!(%next_leader, view, "rotating leadership");
        self.send_envelope(MessageKind::LeaderRotation {
            view,
            next_leader,
            node_id: self.node_id.clone(),
            timestamp: 0,
        })
        .await
    }

    fn on_leader_rotation(&self, view: i64, next_leader: NodeId) {
        let mut runtime = self.runtime.lock().expect("runtime lock poisoned");
        runtime.is_leader = next_leader == self.node_id;
        runtime.view = view + 1;
        if runtime.is_leader {
            info!("became leader");
        }
    }
}

#[cfg(test)]
mod tests {
    use zkseq_network::NetworkHub;
    use zkseq_types::{Address, Transaction, TransactionKind, U256};

    use super::*;
    use crate::verifier::NoopVerifier;

    fn dummy_batch() -> Batch {
        let tx = Transaction {
            kind: TransactionKind::Transfer,
            from: Address::from_low_u64_be(1),
            to: Address::from_low_u64_be(2),
            amount: U256::from(100u64),
            nonce: 1,
            data: vec![],
            gas: 21000,
            signature: vec![0u8; 65],
        };
        Batch::proposed(vec![tx], 0)
    }

    #[tokio::test]
    async fn standalone_node_decides_immediately() {
        let hub = NetworkHub::new();
        let bus = Arc::new(hub.join(NodeId::new("solo")));
        let (engine, mut decided_rx) = BftEngine::new(NodeId::new("solo"), bus, Arc::new(NoopVerifier), true);

        engine.propose(dummy_batch(), 0).await.unwrap();
        let decided = decided_rx.recv().await.unwrap();
        assert_eq!(decided.transactions.len(), 1);
    }

    #[tokio::test]
    async fn non_leader_cannot_propose() {
        let hub = NetworkHub::new();
        let bus = Arc::new(hub.join(NodeId::new("b")));
        let (engine, _rx) = BftEngine::new(NodeId::new("b"), bus, Arc::new(NoopVerifier), false);

        assert_eq!(engine.propose(dummy_batch(), 0).await, Err(BftError::NotLeader));
    }

    #[tokio::test]
    async fn three_node_cluster_decides_by_quorum() {
        let hub = NetworkHub::new();
        let bus_a = Arc::new(hub.join(NodeId::new("a")));
        let bus_b = Arc::new(hub.join(NodeId::new("b")));
        let bus_c = Arc::new(hub.join(NodeId::new("c")));

        let (engine_a, mut rx_a) = BftEngine::new(NodeId::new("a"), bus_a.clone(), Arc::new(NoopVerifier), true);
        let (engine_b, mut rx_b) = BftEngine::new(NodeId::new("b"), bus_b.clone(), Arc::new(NoopVerifier), false);
        let (engine_c, mut rx_c) = BftEngine::new(NodeId::new("c"), bus_c.clone(), Arc::new(NoopVerifier), false);

        for engine in [&engine_a, &engine_b, &engine_c] {
            engine.sync_peers(
                [NodeId::new("a"), NodeId::new("b"), NodeId::new("c")]
                    .into_iter()
                    .collect(),
            );
        }

        let eb = engine_b.clone();
        bus_b.on_deliver(
            Topic::Consensus,
            Box::new(move |payload| {
                let envelope: Envelope = serde_json::from_slice(&payload).unwrap();
                let eb = eb.clone();
                tokio::spawn(async move {
                    let _ = eb.handle_message(envelope, 0).await;
                });
            }),
        );
        let ec = engine_c.clone();
        bus_c.on_deliver(
            Topic::Consensus,
            Box::new(move |payload| {
                let envelope: Envelope = serde_json::from_slice(&payload).unwrap();
                let ec = ec.clone();
                tokio::spawn(async move {
                    let _ = ec.handle_message(envelope, 0).await;
                });
            }),
        );
        let ea = engine_a.clone();
        bus_a.on_deliver(
            Topic::Consensus,
            Box::new(move |payload| {
                let envelope: Envelope = serde_json::from_slice(&payload).unwrap();
                let ea = ea.clone();
                tokio::spawn(async move {
                    let _ = ea.handle_message(envelope, 0).await;
                });
            }),
        );

        engine_a.propose(dummy_batch(), 0).await.unwrap();

        let decided_a = tokio::time::timeout(std::time::Duration::from_secs(2), rx_a.recv())
            .await
            .unwrap()
            .unwrap();
        let decided_b = tokio::time::timeout(std::time::Duration::from_secs(2), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        let decided_c = tokio::time::timeout(std::time::Duration::from_secs(2), rx_c.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(batch_hash_hex(&decided_a), batch_hash_hex(&decided_b));
        assert_eq!(batch_hash_hex(&decided_b), batch_hash_hex(&decided_c));
    }

    #[tokio::test]
    async fn duplicate_prepare_votes_are_idempotent() {
        let hub = NetworkHub::new();
        let bus = Arc::new(hub.join(NodeId::new("b")));
        let (engine, _rx) = BftEngine::new(NodeId::new("b"), bus, Arc::new(NoopVerifier), false);
        engine.sync_peers([NodeId::new("a"), NodeId::new("c")].into_iter().collect());

        let batch = dummy_batch();
        let hash = batch_hash_hex(&batch);
        engine
            .handle_message(
                Envelope::unsigned(MessageKind::PrePrepare {
                    view: 0,
                    sequence: 0,
                    batch_hash: hash.clone(),
                    batch,
                    node_id: NodeId::new("a"),
                    timestamp: 0,
                }),
                0,
            )
            .await
            .unwrap();

        for _ in 0..2 {
            let _ = engine
                .handle_message(
                    Envelope::unsigned(MessageKind::Prepare {
                        view: 0,
                        sequence: 0,
                        batch_hash: hash.clone(),
                        node_id: NodeId::new("c"),
                        timestamp: 0,
                    }),
                    0,
                )
                .await;
        }

        let states = engine.states.read().unwrap();
        let state = states.get(&hash).unwrap();
        // self ("b") + "a" (from pre-prepare) + "c" (deduplicated) = 3
        assert_eq!(state.prepare_voters.len(), 3);
    }

    #[test]
    fn leader_rotation_picks_next_in_lexicographic_order() {
        let hub = NetworkHub::new();
        let bus = Arc::new(hub.join(NodeId::new("a")));
        let (engine, _rx) = BftEngine::new(NodeId::new("a"), bus, Arc::new(NoopVerifier), true);
        engine.sync_peers([NodeId::new("b"), NodeId::new("c")].into_iter().collect());

        assert_eq!(engine.next_leader_after(&NodeId::new("a")), NodeId::new("b"));
        assert_eq!(engine.next_leader_after(&NodeId::new("c")), NodeId::new("a"));
    }

    #[tokio::test]
    async fn stale_view_messages_are_rejected() {
        let hub = NetworkHub::new();
        let bus = Arc::new(hub.join(NodeId::new("b")));
        let (engine, _rx) = BftEngine::new(NodeId::new("b"), bus, Arc::new(NoopVerifier), false);

        let result = engine
            .handle_message(
                Envelope::unsigned(MessageKind::Prepare {
                    view: 99,
                    sequence: 0,
                    batch_hash: "deadbeef".into(),
                    node_id: NodeId::new("a"),
                    timestamp: 0,
                }),
                0,
            )
            .await;

        assert_eq!(result, Err(BftError::WrongView { expected: 0, got: 99 }));
    }
}
