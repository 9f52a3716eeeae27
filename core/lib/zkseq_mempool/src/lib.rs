//! Transaction Pool (spec §4.3).

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zkseq_state::StateStore;
use zkseq_types::{Address, Transaction, U256};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("nonce {got} is not greater than account nonce {current}")]
    InvalidNonce { current: u64, got: u64 },
    #[error("sender has insufficient balance for amount {0}")]
    InsufficientBalance(U256),
    #[error("sender account not admitted and bootstrap is disabled")]
    NotAdmitted,
}

/// Dev-bootstrap affordance (spec §9 open question), gated by an explicit
/// flag rather than applied unconditionally: production deployments set
/// `dev_bootstrap_balance` to `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub dev_bootstrap_balance: Option<U256>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            dev_bootstrap_balance: None,
        }
    }
}

impl PoolConfig {
    pub fn dev() -> Self {
        Self {
            dev_bootstrap_balance: Some(U256::from(1000u64)),
        }
    }
}

/// Bounded only by memory — eviction policy is an explicit non-goal
/// (spec §4.3).
pub struct TransactionPool {
    config: PoolConfig,
    queue: Mutex<VecDeque<Transaction>>,
}

impl TransactionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Admits a transaction: the sender must already have a strictly
    /// greater nonce than its current on-chain nonce (spec §4.3).
    /// Signature verification is assumed to have already happened at the
    /// RPC boundary; this call does not re-derive a signer from bytes.
    pub fn add(&self, state: &StateStore, tx: Transaction) -> Result<(), PoolError> {
        let account = match state.get_account(&tx.from) {
            Ok(account) => account,
            Err(_) => match self.config.dev_bootstrap_balance {
                Some(balance) => {
                    warn!(sender = ?tx.from, "auto-creating account with dev bootstrap balance");
                    state
                        .ensure_account(tx.from, balance)
                        .map_err(|_| PoolError::NotAdmitted)?;
                    state.get_account(&tx.from).map_err(|_| PoolError::NotAdmitted)?
                }
                None => return Err(PoolError::NotAdmitted),
            },
        };

        if tx.nonce <= account.nonce {
            return Err(PoolError::InvalidNonce {
                current: account.nonce,
                got: tx.nonce,
            });
        }
        if account.balance < tx.amount {
            return Err(PoolError::InsufficientBalance(tx.amount));
        }

        let mut queue = self.queue.lock().expect("mempool lock poisoned");
        debug!(sender = ?tx.from, nonce = tx.nonce, "admitted transaction");
        queue.push_back(tx);
        Ok(())
    }

    /// Pops up to `n` transactions in insertion (FIFO) order. Draining
    /// never reorders transactions, so per-sender nonce order as admitted
    /// is preserved across the returned slice (spec §4.3).
    pub fn drain(&self, n: usize) -> Vec<Transaction> {
        let mut queue = self.queue.lock().expect("mempool lock poisoned");
        let take = n.min(queue.len());
        queue.drain(..take).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().expect("mempool lock poisoned").is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("mempool lock poisoned").len()
    }

    pub fn senders_pending(&self) -> Vec<Address> {
        let queue = self.queue.lock().expect("mempool lock poisoned");
        let mut senders: Vec<Address> = queue.iter().map(|tx| tx.from).collect();
        senders.dedup();
        senders
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zkseq_types::{Account, TransactionKind};

    fn tx(from: Address, nonce: u64, amount: u64) -> Transaction {
        Transaction {
            kind: TransactionKind::Transfer,
            from,
            to: Address::from_low_u64_be(99),
            amount: U256::from(amount),
            nonce,
            data: vec![],
            gas: 21000,
            signature: vec![0u8; 65],
        }
    }

    #[test]
    fn rejects_stale_nonce() {
        let state = StateStore::new();
        let a = Address::from_low_u64_be(1);
        state
            .set_account(Account::with_balance(a, U256::from(1000u64)))
            .unwrap();
        let pool = TransactionPool::new(PoolConfig::default());

        assert_eq!(
            pool.add(&state, tx(a, 0, 1)),
            Err(PoolError::InvalidNonce { current: 0, got: 0 })
        );
    }

    #[test]
    fn rejects_insufficient_balance() {
        let state = StateStore::new();
        let a = Address::from_low_u64_be(1);
        state
            .set_account(Account::with_balance(a, U256::from(5u64)))
            .unwrap();
        let pool = TransactionPool::new(PoolConfig::default());

        assert_eq!(
            pool.add(&state, tx(a, 1, 100)),
            Err(PoolError::InsufficientBalance(U256::from(100u64)))
        );
    }

    #[test]
    fn rejects_unknown_sender_without_bootstrap() {
        let state = StateStore::new();
        let a = Address::from_low_u64_be(1);
        let pool = TransactionPool::new(PoolConfig::default());

        assert_eq!(pool.add(&state, tx(a, 1, 1)), Err(PoolError::NotAdmitted));
    }

    #[test]
    fn dev_bootstrap_auto_creates_account() {
        let state = StateStore::new();
        let a = Address::from_low_u64_be(1);
        let pool = TransactionPool::new(PoolConfig::dev());

        assert!(pool.add(&state, tx(a, 1, 1)).is_ok());
        assert_eq!(state.get_account(&a).unwrap().balance, U256::from(1000u64));
    }

    #[test]
    fn drain_preserves_fifo_order() {
        let state = StateStore::new();
        let a = Address::from_low_u64_be(1);
        state
            .set_account(Account::with_balance(a, U256::from(1000u64)))
            .unwrap();
        let pool = TransactionPool::new(PoolConfig::default());

        pool.add(&state, tx(a, 1, 1)).unwrap();
        pool.add(&state, tx(a, 2, 1)).unwrap();
        pool.add(&state, tx(a, 3, 1)).unwrap();

        let drained = pool.drain(2);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].nonce, 1);
        assert_eq!(drained[1].nonce, 2);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn drain_caps_at_available_length() {
        let state = StateStore::new();
        let a = Address::from_low_u64_be(1);
        state
            .set_account(Account::with_balance(a, U256::from(1000u64)))
            .unwrap();
        let pool = TransactionPool::new(PoolConfig::default());
        pool.add(&state, tx(a, 1, 1)).unwrap();

        let drained = pool.drain(10);
        assert_eq!(drained.len(), 1);
    }
}
