use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{Address, H256, U256};

/// Account state. Created on first write, never destroyed; mutated
/// exclusively by `apply_batch` in `zkseq_state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: Address,
    pub balance: U256,
    pub nonce: u64,
    pub code: Option<Vec<u8>>,
}

impl Account {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            balance: U256::zero(),
            nonce: 0,
            code: None,
        }
    }

    pub fn with_balance(address: Address, balance: U256) -> Self {
        Self {
            address,
            balance,
            nonce: 0,
            code: None,
        }
    }
}

/// Per-account contract storage, kept separate from the account map: code
/// lives in a parallel map and is not folded into the Merkle root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountStorage {
    pub slots: HashMap<H256, H256>,
}
