use serde::{Deserialize, Serialize};

use crate::{Address, U256};

/// Transaction kind: `Transfer`, `ContractDeploy`, or `ContractCall`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Transfer,
    ContractDeploy,
    ContractCall,
}

impl TransactionKind {
    /// Single-byte discriminant consumed by the canonical codec.
    pub fn discriminant(self) -> u8 {
        match self {
            TransactionKind::Transfer => 0,
            TransactionKind::ContractDeploy => 1,
            TransactionKind::ContractCall => 2,
        }
    }
}

/// Immutable once admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub kind: TransactionKind,
    pub from: Address,
    pub to: Address,
    pub amount: U256,
    pub nonce: u64,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    pub gas: u64,
    /// 65-byte ECDSA-style signature. Verification happens at the RPC
    /// boundary and is re-asserted by whatever `MessageVerifier` the BFT
    /// engine is configured with.
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
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
