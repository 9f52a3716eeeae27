//! Sequencer (spec §4.7): orchestrates the state store, pool, BFT engine,
//! CRS ceremony and broadcast bus. Owns `JoinHandle`s for its background
//! tasks (batching timer, peer-count monitor, decided-batch consumer,
//! optional L1 submit loop and CRS ceremony timer), each spawned with
//! `tokio::spawn` and torn down via a `tokio_util::sync::CancellationToken`
//! — the async analog of the teacher's `StopReceiver` task-cancellation
//! convention in `node_framework`.

pub mod l1_client;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use zkseq_ceremony::CeremonyEngine;
use zkseq_codec::transaction_hash;
use zkseq_config::SequencerConfig;
use zkseq_consensus::{BftEngine, MessageVerifier};
use zkseq_mempool::{PoolError, TransactionPool};
use zkseq_network::{BroadcastBus, Topic};
use zkseq_state::StateStore;
use zkseq_types::{Batch, Envelope, NodeId, Transaction};

pub use l1_client::{L1Client, NoopL1Client};

fn now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}

/// Orchestrator service. Owned fields mirror the spec's ownership note
/// (§3): "the Sequencer owns the State Store, Pool, BFT Engine, CRS
/// Engine, and Broadcast Bus for its process lifetime."
pub struct Sequencer {
    config: SequencerConfig,
    #[allow(dead_code)]
    node_id: NodeId,
    state: Arc<StateStore>,
    pool: Arc<TransactionPool>,
    bus: Arc<dyn BroadcastBus>,
    bft: Arc<BftEngine>,
    ceremony: Arc<CeremonyEngine>,
    l1_client: Arc<dyn L1Client>,
    decided_rx: AsyncMutex<Option<mpsc::Receiver<Batch>>>,
    /// Practical cap of one in-flight proposed batch at a time (spec §5
    /// "in-flight consensus states <= 1 per proposed batch"): set when a
    /// batch is proposed or forwarded for proposal, cleared once the
    /// decided-batch consumer applies the result.
    batch_in_flight: AtomicBool,
    cancellation: CancellationToken,
}

impl Sequencer {
    pub fn new(
        config: SequencerConfig,
        node_id: NodeId,
        state: Arc<StateStore>,
        pool: Arc<TransactionPool>,
        bus: Arc<dyn BroadcastBus>,
        verifier: Arc<dyn MessageVerifier>,
        l1_client: Arc<dyn L1Client>,
    ) -> Arc<Self> {
        let (bft, decided_rx) = BftEngine::new(node_id.clone(), bus.clone(), verifier, config.is_leader);
        let (ceremony, _ceremony_rx) =
            CeremonyEngine::new(node_id.clone(), bus.clone(), config.ceremony_power, config.is_leader);

        let sequencer = Arc::new(Self {
            config,
            node_id,
            state,
            pool,
            bus,
            bft,
            ceremony,
            l1_client,
            decided_rx: AsyncMutex::new(Some(decided_rx)),
            batch_in_flight: AtomicBool::new(false),
            cancellation: CancellationToken::new(),
        });

        sequencer.install_handlers();
        sequencer
    }

    /// Registers the three topic handlers (spec §4.4: one handler per
    /// topic). Each handler is synchronous at the bus boundary and spawns
    /// its own async work, matching `zkseq_consensus`'s test pattern for
    /// wiring a `LocalBus` handler.
    fn install_handlers(self: &Arc<Self>) {
        let tx_self = self.clone();
        self.bus.on_deliver(
            Topic::Tx,
            Box::new(move |payload| tx_self.clone().on_tx_delivered(payload)),
        );

        let batch_self = self.clone();
        self.bus.on_deliver(
            Topic::Batch,
            Box::new(move |payload| {
                let batch_self = batch_self.clone();
                tokio::spawn(async move { batch_self.on_batch_delivered(payload).await });
            }),
        );

        let consensus_self = self.clone();
        self.bus.on_deliver(
            Topic::Consensus,
            Box::new(move |payload| {
                let consensus_self = consensus_self.clone();
                tokio::spawn(async move { consensus_self.on_consensus_delivered(payload).await });
            }),
        );
    }

    fn on_tx_delivered(self: Arc<Self>, payload: Vec<u8>) {
        let tx: Transaction = match serde_json::from_slice(&payload) {
            Ok(tx) => tx,
            Err(err) => {
                warn!(%err, "dropping malformed inbound transaction");
                return;
            }
        };
        if let Err(err) = self.pool.add(&self.state, tx) {
            debug!(%err, "rejected replicated transaction");
        }
    }

    async fn on_batch_delivered(self: Arc<Self>, payload: Vec<u8>) {
        let batch: Batch = match serde_json::from_slice(&payload) {
            Ok(batch) => batch,
            Err(err) => {
                warn!(%err, "dropping malformed inbound batch");
                return;
            }
        };

        // A finalized batch (proof populated) is a re-broadcast for
        // downstream observers, not something a peer sequencer re-applies:
        // this node reaches the same state by deciding the batch itself
        // through its own BFT quorum (spec §8 testable property #5).
        if !batch.proof.is_empty() {
            debug!(batch_number = batch.number, "observed finalized batch re-broadcast");
            return;
        }

        if !self.bft.is_leader() || self.batch_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }
        let timestamp = now_seconds();
        if let Err(err) = self.bft.propose(batch, timestamp).await {
            warn!(%err, "leader failed to propose forwarded batch");
            self.batch_in_flight.store(false, Ordering::SeqCst);
        }
    }

    async fn on_consensus_delivered(self: Arc<Self>, payload: Vec<u8>) {
        let envelope: Envelope = match serde_json::from_slice(&payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(%err, "dropping malformed consensus message");
                return;
            }
        };
        let timestamp = now_seconds();
        if let Err(err) = self.bft.handle_message(envelope.clone(), timestamp).await {
            debug!(%err, "dropped consensus message");
        }
        if let Err(err) = self.ceremony.handle_message(envelope).await {
            debug!(%err, "dropped CRS ceremony message");
        }
        // Ceremony leadership mirrors BFT leadership (spec §4.6, both
        // "leader only" steps reuse the same rotating-leader notion).
        self.ceremony.set_leader(self.bft.is_leader());
    }

    /// Admission path (spec §4.7): adds to the local pool and replicates
    /// to peers on the `tx` topic so whichever node is leader can include
    /// it. Returns the transaction hash as an opaque client ack.
    pub async fn admit_transaction(&self, tx: Transaction) -> Result<[u8; 32], PoolError> {
        self.pool.add(&self.state, tx.clone())?;
        let hash = transaction_hash(&tx);
        if let Ok(payload) = serde_json::to_vec(&tx) {
            if let Err(err) = self.bus.broadcast(Topic::Tx, payload).await {
                warn!(%err, "failed to replicate admitted transaction");
            }
        }
        Ok(hash)
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub fn pool(&self) -> &Arc<TransactionPool> {
        &self.pool
    }

    /// Spawns every background task and returns their handles. Each task
    /// observes `self.cancellation` and exits promptly at its next
    /// await/blocking point (spec §5 "Cancellation").
    pub fn run(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        handles.push(self.clone().spawn_batching_timer());
        handles.push(self.clone().spawn_peer_monitor());
        handles.push(self.clone().spawn_decided_consumer());
        handles.push(self.clone().spawn_ceremony_timer());
        if self.config.l1_enabled {
            handles.push(self.clone().spawn_l1_submit_loop());
        }
        handles
    }

    pub fn shutdown(&self) {
        self.cancellation.cancel();
    }

    /// Batching timer (spec §4.7): every `batch_interval`, only if no
    /// batch is in-flight and the pool is non-empty, drains up to
    /// `batch_size` transactions and constructs a batch. Leaders propose
    /// it directly; followers broadcast it for the current leader to pick
    /// up.
    fn spawn_batching_timer(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
                self.config.batch_interval_secs.max(1),
            ));
            loop {
                tokio::select! {
                    _ = self.cancellation.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                if self.batch_in_flight.load(Ordering::SeqCst) || self.pool.is_empty() {
                    continue;
                }
                let txs = self.pool.drain(self.config.batch_size);
                if txs.is_empty() {
                    continue;
                }

                self.batch_in_flight.store(true, Ordering::SeqCst);
                let timestamp = now_seconds();
                let batch = Batch::proposed(txs, timestamp);

                if self.bft.is_leader() {
                    if let Err(err) = self.bft.propose(batch, timestamp).await {
                        warn!(%err, "leader failed to propose batch");
                        self.batch_in_flight.store(false, Ordering::SeqCst);
                    }
                } else {
                    match serde_json::to_vec(&batch) {
                        Ok(payload) => {
                            if let Err(err) = self.bus.broadcast(Topic::Batch, payload).await {
                                warn!(%err, "failed to forward batch to leader");
                            }
                        }
                        Err(err) => error!(%err, "failed to serialize batch for forwarding"),
                    }
                    // Not the one proposing: nothing is in flight locally
                    // until the leader's decision comes back through BFT.
                    self.batch_in_flight.store(false, Ordering::SeqCst);
                }
            }
        })
    }

    /// Peer-count monitor (spec §4.7, every 5s reference): refreshes the
    /// BFT engine's known-participants set from the bus's current peers.
    fn spawn_peer_monitor(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
                self.config.peer_poll_interval_secs.max(1),
            ));
            loop {
                tokio::select! {
                    _ = self.cancellation.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let peers: HashSet<NodeId> = self.bus.peers();
                self.bft.sync_peers(peers);
            }
        })
    }

    /// Decided-batch consumer (spec §4.7): applies each decided batch
    /// under the state store's write lock, then re-broadcasts the
    /// finalized batch *outside* that lock (spec §4.7 "Reentrancy").
    fn spawn_decided_consumer(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut decided_rx = self
                .decided_rx
                .lock()
                .await
                .take()
                .expect("decided-batch consumer spawned more than once");

            loop {
                let batch = tokio::select! {
                    _ = self.cancellation.cancelled() => return,
                    batch = decided_rx.recv() => match batch {
                        Some(batch) => batch,
                        None => return,
                    },
                };

                let applied = match self.state.apply_batch(batch) {
                    Ok(applied) => applied,
                    Err(err) => {
                        // A batch that already cleared BFT quorum failing
                        // to apply is a true invariant violation, not bad
                        // inbound data (spec §7 "Fatal" bucket).
                        error!(%err, "fatal: decided batch violated a state invariant");
                        panic!("state invariant violated applying decided batch: {err}");
                    }
                };

                self.batch_in_flight.store(false, Ordering::SeqCst);
                info!(batch_number = applied.number, "batch applied");

                match serde_json::to_vec(&applied) {
                    Ok(payload) => {
                        if let Err(err) = self.bus.broadcast(Topic::Batch, payload).await {
                            warn!(%err, "failed to re-broadcast finalized batch");
                        }
                    }
                    Err(err) => error!(%err, "failed to serialize finalized batch"),
                }
            }
        })
    }

    /// CRS ceremony timer (spec §2: the sequencer "periodically runs" the
    /// ceremony; §4.6 doesn't fix the period, so it's config-driven like
    /// every other periodic behavior in §4.7). Only the leader starts new
    /// epochs; other nodes react to `CRSCeremonyStart` on the consensus
    /// topic.
    fn spawn_ceremony_timer(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
                self.config.ceremony_interval_secs.max(1),
            ));
            loop {
                tokio::select! {
                    _ = self.cancellation.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if !self.bft.is_leader() {
                    continue;
                }
                let mut participants: Vec<NodeId> = self.bft.participants();
                if participants.is_empty() {
                    continue;
                }
                participants.sort();
                if let Err(err) = self.ceremony.start(participants).await {
                    debug!(%err, "skipped starting CRS ceremony");
                }
            }
        })
    }

    /// L1 submit loop (spec §4.7, optional): forwards applied batches to
    /// the out-of-scope L1 client. Tracks the highest submitted batch
    /// number so restarts of this loop don't resubmit.
    fn spawn_l1_submit_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut next_to_submit: u64 = 0;
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
                self.config.l1_submit_period_secs.max(1),
            ));
            loop {
                tokio::select! {
                    _ = self.cancellation.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                let log = match self.state.batch_log() {
                    Ok(log) => log,
                    Err(err) => {
                        error!(%err, "failed to read batch log for L1 submission");
                        continue;
                    }
                };

                for batch in log.into_iter().filter(|b| b.number >= next_to_submit) {
                    let tx_hashes: Vec<[u8; 32]> = batch.transactions.iter().map(transaction_hash).collect();
                    if let Err(err) = self
                        .l1_client
                        .submit_batch(batch.number, batch.state_root, tx_hashes, batch.proof.clone())
                        .await
                    {
                        warn!(%err, batch_number = batch.number, "L1 submission failed");
                        break;
                    }
                    next_to_submit = batch.number + 1;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use mockall::mock;
    use zkseq_config::SequencerConfig;
    use zkseq_consensus::NoopVerifier;
    use zkseq_mempool::PoolConfig;
    use zkseq_network::NetworkHub;
    use zkseq_types::{Account, Address, TransactionKind, U256};

    use super::*;

    fn transfer(from: Address, to: Address, amount: u64, nonce: u64) -> Transaction {
        Transaction {
            kind: TransactionKind::Transfer,
            from,
            to,
            amount: U256::from(amount),
            nonce,
            data: vec![],
            gas: 21000,
            signature: vec![0u8; 65],
        }
    }

    #[derive(Default)]
    struct RecordingL1Client {
        submitted: StdMutex<Vec<u64>>,
    }

    #[async_trait::async_trait]
    impl L1Client for RecordingL1Client {
        async fn submit_batch(
            &self,
            batch_number: u64,
            _state_root: [u8; 32],
            _tx_hashes: Vec<[u8; 32]>,
            _proof: Vec<u8>,
        ) -> anyhow::Result<()> {
            self.submitted.lock().unwrap().push(batch_number);
            Ok(())
        }
    }

    #[tokio::test]
    async fn standalone_sequencer_applies_a_batch_end_to_end() {
        let hub = NetworkHub::new();
        let bus = Arc::new(hub.join(NodeId::new("solo")));
        let state = Arc::new(StateStore::new());
        let pool = Arc::new(TransactionPool::new(PoolConfig::dev()));

        let a = Address::from_low_u64_be(1);
        let b = Address::from_low_u64_be(2);
        state.set_account(Account::with_balance(a, U256::from(1000u64))).unwrap();

        let mut config = SequencerConfig::for_tests();
        config.batch_interval_secs = 60;
        config.is_leader = true;

        let sequencer = Sequencer::new(
            config,
            NodeId::new("solo"),
            state.clone(),
            pool.clone(),
            bus,
            Arc::new(NoopVerifier),
            Arc::new(NoopL1Client),
        );

        sequencer.admit_transaction(transfer(a, b, 100, 1)).await.unwrap();
        let handles = sequencer.run();

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            if state.get_account(&b).map(|acc| acc.balance) == Ok(U256::from(100u64)) {
                break;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("batch was never applied");
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        sequencer.shutdown();
        for handle in handles {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(1), handle).await;
        }
    }

    #[tokio::test]
    async fn l1_submit_loop_forwards_applied_batches() {
        let hub = NetworkHub::new();
        let bus = Arc::new(hub.join(NodeId::new("solo")));
        let state = Arc::new(StateStore::new());
        let pool = Arc::new(TransactionPool::new(PoolConfig::dev()));
        let l1_client = Arc::new(RecordingL1Client::default());

        let a = Address::from_low_u64_be(1);
        state.set_account(Account::with_balance(a, U256::from(1000u64))).unwrap();

        let mut config = SequencerConfig::for_tests();
        config.batch_interval_secs = 60;
        config.l1_enabled = true;
        config.l1_submit_period_secs = 1;

        let sequencer = Sequencer::new(
            config,
            NodeId::new("solo"),
            state.clone(),
            pool,
            bus,
            Arc::new(NoopVerifier),
            l1_client.clone(),
        );

        state.apply_batch(Batch::proposed(vec![], 0)).unwrap();
        let handles = sequencer.run();

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(3);
        loop {
            if !l1_client.submitted.lock().unwrap().is_empty() {
                break;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("L1 submission never happened");
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        sequencer.shutdown();
        for handle in handles {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(1), handle).await;
        }
    }

    mock! {
        FlakyL1Client {}
        #[async_trait::async_trait]
        impl L1Client for FlakyL1Client {
            async fn submit_batch(
                &self,
                batch_number: u64,
                state_root: [u8; 32],
                tx_hashes: Vec<[u8; 32]>,
                proof: Vec<u8>,
            ) -> anyhow::Result<()>;
        }
    }

    #[tokio::test]
    async fn l1_submit_loop_does_not_advance_past_a_failed_submission() {
        let hub = NetworkHub::new();
        let bus = Arc::new(hub.join(NodeId::new("solo")));
        let state = Arc::new(StateStore::new());
        let pool = Arc::new(TransactionPool::new(PoolConfig::dev()));

        let mut mock_client = MockFlakyL1Client::new();
        mock_client
            .expect_submit_batch()
            .returning(|_, _, _, _| Err(anyhow::anyhow!("l1 endpoint unreachable")));

        let mut config = SequencerConfig::for_tests();
        config.batch_interval_secs = 60;
        config.l1_enabled = true;
        config.l1_submit_period_secs = 1;

        let sequencer = Sequencer::new(
            config,
            NodeId::new("solo"),
            state.clone(),
            pool,
            bus,
            Arc::new(NoopVerifier),
            Arc::new(mock_client),
        );

        state.apply_batch(Batch::proposed(vec![], 0)).unwrap();
        let handles = sequencer.run();

        // Give the submit loop a few ticks to (fail to) make progress; the
        // loop must keep retrying `next_to_submit` rather than silently
        // skipping ahead on a transient L1 error (spec §7 "Transient").
        tokio::time::sleep(std::time::Duration::from_millis(2500)).await;

        sequencer.shutdown();
        for handle in handles {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(1), handle).await;
        }
    }
}
