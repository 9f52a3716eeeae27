use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{ceremony::CrsContribution, node_id::NodeId, Batch, HexHash};

/// Tagged consensus message: each variant carries only the fields it
/// needs instead of one flat struct with a pile of optional fields.
/// `serde`'s externally-tagged representation still produces a `type`
/// discriminant on the wire, plus only the fields relevant to that
/// variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessageKind {
    PrePrepare {
        view: i64,
        sequence: i64,
        batch_hash: HexHash,
        batch: Batch,
        node_id: NodeId,
        timestamp: u64,
    },
    Prepare {
        view: i64,
        sequence: i64,
        batch_hash: HexHash,
        node_id: NodeId,
        timestamp: u64,
    },
    Commit {
        view: i64,
        sequence: i64,
        batch_hash: HexHash,
        node_id: NodeId,
        timestamp: u64,
    },
    LeaderRotation {
        view: i64,
        next_leader: NodeId,
        node_id: NodeId,
        timestamp: u64,
    },
    CrsCeremonyStart {
        epoch: i64,
        participants: Vec<NodeId>,
        node_id: NodeId,
        timestamp: u64,
    },
    CrsContributionMsg {
        epoch: i64,
        contribution: CrsContribution,
        node_id: NodeId,
        timestamp: u64,
    },
    CrsCeremonyComplete {
        epoch: i64,
        #[serde(with = "hex_bytes")]
        blob: Vec<u8>,
        node_id: NodeId,
        timestamp: u64,
    },
}

impl MessageKind {
    pub fn node_id(&self) -> &NodeId {
        match self {
            MessageKind::PrePrepare { node_id, .. }
            | MessageKind::Prepare { node_id, .. }
            | MessageKind::Commit { node_id, .. }
            | MessageKind::LeaderRotation { node_id, .. }
            | MessageKind::CrsCeremonyStart { node_id, .. }
            | MessageKind::CrsContributionMsg { node_id, .. }
            | MessageKind::CrsCeremonyComplete { node_id, .. } => node_id,
        }
    }
}

/// Wire envelope: the hashed, signed payload is `kind` alone — the
/// optional signature never participates in the consensus message hash.
/// Keeping the signature a first-class, separately-verified wrapper
/// (rather than a field silently mixed into the struct) avoids any
/// ambiguity about whether it was covered by verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Vec<u8>>,
}

impl Envelope {
    pub fn unsigned(kind: MessageKind) -> Self {
        Self {
            kind,
            signature: None,
        }
    }
}

/// Phase of a per-batch consensus state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusPhase {
    PrePrepare,
    Prepare,
    Commit,
    Decided,
}

/// Consensus state for one in-flight batch, keyed by `batch_hash` in the
/// BFT engine (spec §3 "Consensus State").
#[derive(Debug, Clone)]
pub struct ConsensusState {
    pub view: i64,
    pub sequence: i64,
    pub phase: ConsensusPhase,
    pub batch_hash: HexHash,
    pub batch: Batch,
    pub prepare_voters: HashSet<NodeId>,
    pub commit_voters: HashSet<NodeId>,
    pub sent_commit: bool,
    pub decided: bool,
}

impl ConsensusState {
    pub fn new(view: i64, sequence: i64, batch_hash: HexHash, batch: Batch) -> Self {
        Self {
            view,
            sequence,
            phase: ConsensusPhase::PrePrepare,
            batch_hash,
            batch,
            prepare_voters: HashSet::new(),
            commit_voters: HashSet::new(),
            sent_commit: false,
            decided: false,
        }
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        let s = s.strip_prefix("0x").unwrap_or(&s);
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
