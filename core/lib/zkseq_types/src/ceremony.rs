use serde::{Deserialize, Serialize};

use crate::node_id::NodeId;

/// CRS epoch state, maintained under its own exclusive lock in
/// `zkseq_ceremony`; this struct is the wire/snapshot representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrsEpochState {
    pub epoch: i64,
    pub participants: Vec<NodeId>,
    pub current_step: usize,
    #[serde(with = "hex_bytes")]
    pub ptau_blob: Vec<u8>,
    pub power: u32,
    pub completed: bool,
}

impl CrsEpochState {
    pub fn new(epoch: i64, participants: Vec<NodeId>, power: u32, ptau_blob: Vec<u8>) -> Self {
        Self {
            epoch,
            participants,
            current_step: 0,
            ptau_blob,
            power,
            completed: false,
        }
    }

    /// `participants[current_step]`, i.e. whose turn it is to contribute.
    pub fn current_contributor(&self) -> Option<&NodeId> {
        self.participants.get(self.current_step)
    }
}

/// One contribution broadcast during a ceremony round.
///
/// `entropy` is published alongside the transformed blob rather than kept
/// secret: the in-process verifier (spec §9 open question, resolved in
/// DESIGN.md) checks a contribution by recomputing `transform(prev, entropy)`
/// and comparing, so the entropy must be public. A production deployment
/// swapping in a real pairing-based Powers-of-Tau verifier would drop this
/// field and verify via a pairing check instead, without the secret ever
/// leaving the contributor's process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrsContribution {
    pub step: usize,
    #[serde(with = "hex_bytes")]
    pub blob: Vec<u8>,
    pub contributor_id: NodeId,
    pub entropy: [u8; 32],
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
