//! CRS Ceremony (spec §4.6): epoch state, ordered contributor queue,
//! contribution verification, finalization.
//!
//! Grounded on the teacher's round-robin session dispatch
//! (`via_verifier_coordinator::sessions::SessionManager`) and its
//! `via_musig2::Signer` state machine: one participant acts per round, in
//! a fixed order, with the result of each round verified before the next
//! one is allowed to proceed. Here the "round" is a Powers-of-Tau
//! contribution rather than a MuSig2 nonce/partial-signature.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use tokio::sync::watch;
use tracing::{info, warn};
use zkseq_network::{BroadcastBus, Topic};
use zkseq_types::{CrsContribution, CrsEpochState, Envelope, MessageKind, NodeId};

use crate::transform::{beacon_transform, transform, verify_successor};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CrsError {
    #[error("not the current leader")]
    NotLeader,
    #[error("no ceremony in progress for this epoch")]
    NoActiveCeremony,
    #[error("message epoch {got} does not match active epoch {expected}")]
    WrongEpoch { expected: i64, got: i64 },
    #[error("step {got} is outside the reorder tolerance of current step {current}")]
    StepOutOfRange { current: usize, got: usize },
    #[error("contribution {0} is not this node's turn to contribute")]
    NotYourTurn(NodeId),
    #[error("contribution failed verification against the current blob")]
    VerificationFailed,
    #[error("message serialization failed")]
    Codec,
}

/// The canonical output of a completed ceremony, delivered on the
/// completion channel (spec §4.6 step 5: "signal completion channel
/// (non-blocking)").
#[derive(Debug, Clone)]
pub struct CompletedCeremony {
    pub epoch: i64,
    pub blob: Vec<u8>,
}

/// Owns one ceremony's state at a time, the way `zkseq_consensus::BftEngine`
/// owns one set of per-batch states: created on `Start`, replaced by the
/// next epoch's `Start`, dropped on process shutdown (spec §9 REDESIGN
/// FLAG: no process-wide mutable singleton).
pub struct CeremonyEngine {
    node_id: NodeId,
    bus: std::sync::Arc<dyn BroadcastBus>,
    power: u32,
    is_leader: AtomicBool,
    last_epoch: Mutex<i64>,
    state: RwLock<Option<CrsEpochState>>,
    completion_tx: watch::Sender<Option<CompletedCeremony>>,
}

impl CeremonyEngine {
    pub fn new(
        node_id: NodeId,
        bus: std::sync::Arc<dyn BroadcastBus>,
        power: u32,
        is_leader: bool,
    ) -> (std::sync::Arc<Self>, watch::Receiver<Option<CompletedCeremony>>) {
        let (completion_tx, completion_rx) = watch::channel(None);
        let engine = std::sync::Arc::new(Self {
            node_id,
            bus,
            power,
            is_leader: AtomicBool::new(is_leader),
            last_epoch: Mutex::new(0),
            state: RwLock::new(None),
            completion_tx,
        });
        (engine, completion_rx)
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Kept in sync with the BFT engine's leader flag by the sequencer:
    /// the ceremony shares the same rotating-leader notion as batch
    /// agreement (spec §4.6 steps 1 and 5, both "leader only").
    pub fn set_leader(&self, is_leader: bool) {
        self.is_leader.store(is_leader, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> Option<CrsEpochState> {
        self.state.read().expect("ceremony lock poisoned").clone()
    }

    async fn send_envelope(&self, kind: MessageKind) -> Result<(), CrsError> {
        let envelope = Envelope::unsigned(kind);
        let payload = serde_json::to_vec(&envelope).map_err(|_| CrsError::Codec)?;
        self.bus
            .broadcast(Topic::Consensus, payload)
            .await
            .map_err(|_| CrsError::Codec)
    }

    /// Start (leader only, spec §4.6 step 1): increments the epoch,
    /// snapshots and sorts the participant set, constructs a fresh blob of
    /// size `2^power`, and broadcasts `CRSCeremonyStart`. The fresh blob's
    /// content (all zero bytes) is a deterministic function of `power`
    /// alone, so every recipient can build an identical initial blob
    /// without it having to travel over the wire.
    pub async fn start(&self, participants: impl IntoIterator<Item = NodeId>) -> Result<(), CrsError> {
        if !self.is_leader() {
            return Err(CrsError::NotLeader);
        }

        let mut sorted: Vec<NodeId> = participants.into_iter().collect();
        sorted.sort();
        sorted.dedup();

        let epoch = {
            let mut last_epoch = self.last_epoch.lock().expect("epoch lock poisoned");
            *last_epoch += 1;
            *last_epoch
        };

        self.build_fresh_state(epoch, sorted.clone());

        info!(epoch, participants = sorted.len(), "starting CRS ceremony");
        self.send_envelope(MessageKind::CrsCeremonyStart {
            epoch,
            participants: sorted.clone(),
            node_id: self.node_id.clone(),
            timestamp: 0,
        })
        .await?;

        if sorted.first() == Some(&self.node_id) {
            self.contribute().await?;
        }
        Ok(())
    }

    fn build_fresh_state(&self, epoch: i64, participants: Vec<NodeId>) {
        let blob = vec![0u8; 1usize << self.power];
        let mut state = self.state.write().expect("ceremony lock poisoned");
        *state = Some(CrsEpochState::new(epoch, participants, self.power, blob));
    }

    /// On Start (everyone, spec §4.6 step 2).
    pub async fn on_start(&self, epoch: i64, participants: Vec<NodeId>) -> Result<(), CrsError> {
        self.build_fresh_state(epoch, participants.clone());
        if participants.first() == Some(&self.node_id) {
            self.contribute().await?;
        }
        Ok(())
    }

    /// Contribute (spec §4.6 step 3): generates entropy, transforms the
    /// locally held blob, broadcasts the result, and advances local state
    /// before anyone else has verified it — the contributor trusts its own
    /// transform.
    async fn contribute(&self) -> Result<(), CrsError> {
        let (epoch, step, blob) = {
            let state = self.state.read().expect("ceremony lock poisoned");
            let state = state.as_ref().ok_or(CrsError::NoActiveCeremony)?;
            match state.current_contributor() {
                Some(id) if *id == self.node_id => {}
                _ => return Err(CrsError::NotYourTurn(self.node_id.clone())),
            }
            (state.epoch, state.current_step, state.ptau_blob.clone())
        };

        let entropy = rand::random::<[u8; 32]>();
        let next_blob = transform(&blob, &entropy);

        {
            let mut state = self.state.write().expect("ceremony lock poisoned");
            if let Some(state) = state.as_mut() {
                state.ptau_blob = next_blob.clone();
                state.current_step = step + 1;
            }
        }

        info!(epoch, step, "contributing to CRS ceremony");
        self.send_envelope(MessageKind::CrsContributionMsg {
            epoch,
            contribution: CrsContribution {
                step,
                blob: next_blob,
                contributor_id: self.node_id.clone(),
                entropy,
            },
            node_id: self.node_id.clone(),
            timestamp: 0,
        })
        .await?;

        self.maybe_finalize().await
    }

    /// On Contribution (spec §4.6 step 4): tolerates steps within ±1 of the
    /// local `current_step` to absorb reordering, but only ever verifies
    /// and applies a contribution against the blob currently held.
    pub async fn on_contribution(&self, epoch: i64, contribution: CrsContribution) -> Result<(), CrsError> {
        let (current_epoch, current_step, current_blob) = {
            let state = self.state.read().expect("ceremony lock poisoned");
            let state = state.as_ref().ok_or(CrsError::NoActiveCeremony)?;
            (state.epoch, state.current_step, state.ptau_blob.clone())
        };

        if epoch != current_epoch {
            return Err(CrsError::WrongEpoch {
                expected: current_epoch,
                got: epoch,
            });
        }

        let step_i = contribution.step as i64;
        let current_i = current_step as i64;
        if (step_i - current_i).abs() > 1 {
            return Err(CrsError::StepOutOfRange {
                current: current_step,
                got: contribution.step,
            });
        }

        if !verify_successor(&current_blob, &contribution.blob, &contribution.entropy) {
            warn!(epoch, step = contribution.step, "CRS contribution failed verification");
            return Err(CrsError::VerificationFailed);
        }

        let participants_len = {
            let mut state = self.state.write().expect("ceremony lock poisoned");
            let state = state.as_mut().ok_or(CrsError::NoActiveCeremony)?;
            state.ptau_blob = contribution.blob;
            state.current_step = contribution.step + 1;
            state.participants.len()
        };

        if self.should_contribute_now() {
            self.contribute().await?;
        } else if current_step + 1 == participants_len && self.is_leader() {
            self.finalize().await?;
        }
        Ok(())
    }

    fn should_contribute_now(&self) -> bool {
        let state = self.state.read().expect("ceremony lock poisoned");
        matches!(state.as_ref().and_then(|s| s.current_contributor()), Some(id) if *id == self.node_id)
    }

    async fn maybe_finalize(&self) -> Result<(), CrsError> {
        let (current_step, participants_len) = {
            let state = self.state.read().expect("ceremony lock poisoned");
            let state = state.as_ref().ok_or(CrsError::NoActiveCeremony)?;
            (state.current_step, state.participants.len())
        };
        if current_step == participants_len && self.is_leader() {
            self.finalize().await?;
        }
        Ok(())
    }

    /// Finalize (leader only, spec §4.6 step 5): applies the deterministic
    /// beacon transform, broadcasts `CRSCeremonyComplete`, marks the local
    /// state completed, and signals the completion channel.
    async fn finalize(&self) -> Result<(), CrsError> {
        let (epoch, final_blob) = {
            let state = self.state.read().expect("ceremony lock poisoned");
            let state = state.as_ref().ok_or(CrsError::NoActiveCeremony)?;
            (state.epoch, beacon_transform(&state.ptau_blob))
        };

        {
            let mut state = self.state.write().expect("ceremony lock poisoned");
            if let Some(state) = state.as_mut() {
                state.ptau_blob = final_blob.clone();
                state.completed = true;
            }
        }

        info!(epoch, "finalizing CRS ceremony");
        self.send_envelope(MessageKind::CrsCeremonyComplete {
            epoch,
            blob: final_blob.clone(),
            node_id: self.node_id.clone(),
            timestamp: 0,
        })
        .await?;

        let _ = self.completion_tx.send(Some(CompletedCeremony { epoch, blob: final_blob }));
        Ok(())
    }

    /// On Complete (spec §4.6 step 6): persists the final blob, marks
    /// completed, signals completion — applied by every node, including
    /// the leader who already did so in `finalize`.
    pub fn on_complete(&self, epoch: i64, blob: Vec<u8>) -> Result<(), CrsError> {
        let mut state = self.state.write().expect("ceremony lock poisoned");
        match state.as_mut() {
            Some(state) if state.epoch == epoch => {
                state.ptau_blob = blob.clone();
                state.completed = true;
            }
            _ => return Err(CrsError::WrongEpoch { expected: 0, got: epoch }),
        }
        drop(state);
        let _ = self.completion_tx.send(Some(CompletedCeremony { epoch, blob }));
        Ok(())
    }

    /// Dispatches an inbound consensus-topic envelope. Ceremony messages
    /// share the bus topic with BFT messages (spec §4.5 "CRS messages on
    /// the same bus"); non-ceremony kinds are a no-op here, mirroring how
    /// `BftEngine::handle_message` no-ops on ceremony kinds.
    pub async fn handle_message(&self, envelope: Envelope) -> Result<(), CrsError> {
        match envelope.kind {
            MessageKind::CrsCeremonyStart { epoch, participants, .. } => self.on_start(epoch, participants).await,
            MessageKind::CrsContributionMsg { epoch, contribution, .. } => {
                self.on_contribution(epoch, contribution).await
            }
            MessageKind::CrsCeremonyComplete { epoch, blob, .. } => self.on_complete(epoch, blob),
            MessageKind::PrePrepare { .. }
            | MessageKind::Prepare { .. }
            | MessageKind::Commit { .. }
            | MessageKind::LeaderRotation { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use zkseq_network::NetworkHub;

    use super::*;

    #[tokio::test]
    async fn three_round_ceremony_converges_to_identical_completed_blob() {
        let hub = NetworkHub::new();
        let bus_a = std::sync::Arc::new(hub.join(NodeId::new("a")));
        let bus_b = std::sync::Arc::new(hub.join(NodeId::new("b")));
        let bus_c = std::sync::Arc::new(hub.join(NodeId::new("c")));

        let (engine_a, mut rx_a) = CeremonyEngine::new(NodeId::new("a"), bus_a.clone(), 8, true);
        let (engine_b, mut rx_b) = CeremonyEngine::new(NodeId::new("b"), bus_b.clone(), 8, false);
        let (engine_c, mut rx_c) = CeremonyEngine::new(NodeId::new("c"), bus_c.clone(), 8, false);

        for (engine, bus) in [
            (engine_b.clone(), &bus_b),
            (engine_c.clone(), &bus_c),
            (engine_a.clone(), &bus_a),
        ] {
            bus.on_deliver(
                zkseq_network::Topic::Consensus,
                Box::new(move |payload| {
                    let envelope: Envelope = serde_json::from_slice(&payload).unwrap();
                    let engine = engine.clone();
                    tokio::spawn(async move {
                        let _ = engine.handle_message(envelope).await;
                    });
                }),
            );
        }

        engine_a
            .start([NodeId::new("a"), NodeId::new("b"), NodeId::new("c")])
            .await
            .unwrap();

        let completed_a = wait_for_completion(&mut rx_a).await;
        let completed_b = wait_for_completion(&mut rx_b).await;
        let completed_c = wait_for_completion(&mut rx_c).await;

        assert_eq!(completed_a.blob, completed_b.blob);
        assert_eq!(completed_b.blob, completed_c.blob);
        assert_eq!(completed_a.blob.len(), 1 << 8);
    }

    async fn wait_for_completion(rx: &mut watch::Receiver<Option<CompletedCeremony>>) -> CompletedCeremony {
        loop {
            if let Some(completed) = rx.borrow().clone() {
                return completed;
            }
            if tokio::time::timeout(std::time::Duration::from_secs(2), rx.changed())
                .await
                .is_err()
            {
                panic!("ceremony did not complete in time");
            }
        }
    }

    #[tokio::test]
    async fn out_of_turn_contribution_is_rejected() {
        let hub = NetworkHub::new();
        let bus = std::sync::Arc::new(hub.join(NodeId::new("b")));
        let (engine, _rx) = CeremonyEngine::new(NodeId::new("b"), bus, 8, false);

        engine
            .on_start(1, vec![NodeId::new("a"), NodeId::new("b"), NodeId::new("c")])
            .await
            .unwrap();

        let result = engine
            .on_contribution(
                1,
                CrsContribution {
                    step: 1,
                    blob: vec![0u8; 1 << 8],
                    contributor_id: NodeId::new("c"),
                    entropy: [0u8; 32],
                },
            )
            .await;

        assert!(matches!(result, Err(CrsError::VerificationFailed) | Err(CrsError::StepOutOfRange { .. })));
    }

    #[tokio::test]
    async fn wrong_epoch_contribution_is_rejected() {
        let hub = NetworkHub::new();
        let bus = std::sync::Arc::new(hub.join(NodeId::new("b")));
        let (engine, _rx) = CeremonyEngine::new(NodeId::new("b"), bus, 8, false);

        engine.on_start(5, vec![NodeId::new("b")]).await.unwrap();

        let result = engine
            .on_contribution(
                6,
                CrsContribution {
                    step: 0,
                    blob: vec![0u8; 1 << 8],
                    contributor_id: NodeId::new("b"),
                    entropy: [1u8; 32],
                },
            )
            .await;

        assert_eq!(
            result,
            Err(CrsError::WrongEpoch { expected: 5, got: 6 })
        );
    }
}
