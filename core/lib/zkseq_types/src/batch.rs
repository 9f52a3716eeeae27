use serde::{Deserialize, Serialize};

use crate::Transaction;

/// Ordered batch of transactions decided as a unit.
///
/// `number` is assigned at apply time, not propose time; `state_root` and
/// `proof` are filled in only after the batch has been applied to the
/// state store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub number: u64,
    pub transactions: Vec<Transaction>,
    pub state_root: [u8; 32],
    pub timestamp: u64,
    #[serde(with = "hex_bytes")]
    pub proof: Vec<u8>,
}

impl Batch {
    /// A freshly proposed batch: number/state_root/proof are not yet
    /// meaningful and are zeroed until `zkseq_sequencer` applies it.
    pub fn proposed(transactions: Vec<Transaction>, timestamp: u64) -> Self {
        Self {
            number: 0,
            transactions,
            state_root: [0u8; 32],
            timestamp,
            proof: Vec::new(),
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
