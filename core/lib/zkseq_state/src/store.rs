//! State Store: thread-safe account/code/storage maps, the sparse Merkle
//! commitment, and the append-only batch log.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::info;
use zkseq_codec::batch_hash;
use zkseq_types::{Account, Address, Batch, H256, U256};

use crate::merkle::{leaf_hash, leaf_index_bytes, SparseMerkleTree};

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("account {0:?} not found")]
    AccountNotFound(Address),
    #[error("sender {0:?} has insufficient balance")]
    InsufficientBalance(Address),
    #[error("sender {sender:?} nonce mismatch: expected {expected}, got {actual}")]
    NonceMismatch {
        sender: Address,
        expected: u64,
        actual: u64,
    },
    #[error("lock poisoned")]
    LockPoisoned,
}

struct StateInner {
    accounts: HashMap<Address, Account>,
    storage: HashMap<Address, HashMap<H256, H256>>,
    code: HashMap<Address, Vec<u8>>,
    merkle: SparseMerkleTree,
    batch_log: Vec<Batch>,
    current_batch_number: u64,
}

impl StateInner {
    fn new() -> Self {
        Self {
            accounts: HashMap::new(),
            storage: HashMap::new(),
            code: HashMap::new(),
            merkle: SparseMerkleTree::new(),
            batch_log: Vec::new(),
            current_batch_number: 0,
        }
    }

    fn set_account(&mut self, account: Account) {
        self.merkle
            .set_leaf(leaf_index_bytes(&account.address), leaf_hash(&account));
        self.accounts.insert(account.address, account);
    }
}

/// A single reader-writer lock protects the whole store: all reads take a
/// shared guard, all mutations — including `apply_batch`, which is the
/// sole multi-step mutation — take an exclusive guard for the duration of
/// one critical section.
pub struct StateStore {
    inner: RwLock<StateInner>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StateInner::new()),
        }
    }

    pub fn get_account(&self, address: &Address) -> Result<Account, StateError> {
        let inner = self.inner.read().map_err(|_| StateError::LockPoisoned)?;
        inner
            .accounts
            .get(address)
            .cloned()
            .ok_or(StateError::AccountNotFound(*address))
    }

    /// Creates the account if absent; updates the sparse Merkle leaf to
    /// `leaf_hash(account)` either way.
    pub fn set_account(&self, account: Account) -> Result<(), StateError> {
        let mut inner = self.inner.write().map_err(|_| StateError::LockPoisoned)?;
        inner.set_account(account);
        Ok(())
    }

    pub fn get_code(&self, address: &Address) -> Result<Option<Vec<u8>>, StateError> {
        let inner = self.inner.read().map_err(|_| StateError::LockPoisoned)?;
        Ok(inner.code.get(address).cloned())
    }

    pub fn set_code(&self, address: Address, code: Vec<u8>) -> Result<(), StateError> {
        let mut inner = self.inner.write().map_err(|_| StateError::LockPoisoned)?;
        inner.code.insert(address, code);
        Ok(())
    }

    pub fn get_storage(&self, address: &Address, key: H256) -> Result<H256, StateError> {
        let inner = self.inner.read().map_err(|_| StateError::LockPoisoned)?;
        Ok(inner
            .storage
            .get(address)
            .and_then(|slots| slots.get(&key))
            .copied()
            .unwrap_or_default())
    }

    pub fn set_storage(&self, address: Address, key: H256, value: H256) -> Result<(), StateError> {
        let mut inner = self.inner.write().map_err(|_| StateError::LockPoisoned)?;
        inner.storage.entry(address).or_default().insert(key, value);
        Ok(())
    }

    /// Deterministic SMT root over current accounts.
    pub fn state_root(&self) -> Result<[u8; 32], StateError> {
        let inner = self.inner.read().map_err(|_| StateError::LockPoisoned)?;
        Ok(inner.merkle.root())
    }

    pub fn current_batch_number(&self) -> Result<u64, StateError> {
        let inner = self.inner.read().map_err(|_| StateError::LockPoisoned)?;
        Ok(inner.current_batch_number)
    }

    pub fn batch_log(&self) -> Result<Vec<Batch>, StateError> {
        let inner = self.inner.read().map_err(|_| StateError::LockPoisoned)?;
        Ok(inner.batch_log.clone())
    }

    /// Applies every transaction in a decided batch, stamps the batch
    /// number, fills `state_root`/`proof`, and appends to the batch log —
    /// all inside a single critical section. Per transaction:
    /// `sender.balance -= amount; sender.nonce += 1` on the sender,
    /// `receiver.balance += amount` on the receiver; post-apply
    /// `sender.nonce == tx.nonce` (spec §3: "post-nonce = tx.nonce"), so a
    /// transaction is only valid against a pre-nonce of `tx.nonce - 1`.
    ///
    /// Every transaction is validated against a staged copy of the
    /// accounts it touches before anything is committed to `inner`, so a
    /// failure partway through the batch leaves the account map and
    /// Merkle tree exactly as they were — apply is all-or-nothing, never
    /// partial (spec §4.2).
    ///
    /// The returned `Batch` is the finalized one (number/state_root/proof
    /// populated); the sequencer re-broadcasts it, but must do so
    /// *outside* this call so the write lock is never held across a
    /// network call.
    pub fn apply_batch(&self, mut decided: Batch) -> Result<Batch, StateError> {
        let mut inner = self.inner.write().map_err(|_| StateError::LockPoisoned)?;

        let mut staged: HashMap<Address, Account> = HashMap::new();
        for tx in &decided.transactions {
            let mut sender = match staged.get(&tx.from) {
                Some(account) => account.clone(),
                None => inner
                    .accounts
                    .get(&tx.from)
                    .cloned()
                    .ok_or(StateError::AccountNotFound(tx.from))?,
            };

            if tx.nonce != sender.nonce + 1 {
                return Err(StateError::NonceMismatch {
                    sender: tx.from,
                    expected: sender.nonce + 1,
                    actual: tx.nonce,
                });
            }
            if sender.balance < tx.amount {
                return Err(StateError::InsufficientBalance(tx.from));
            }

            sender.balance -= tx.amount;
            sender.nonce += 1;
            staged.insert(tx.from, sender);

            let mut receiver = match staged.get(&tx.to) {
                Some(account) => account.clone(),
                None => inner
                    .accounts
                    .get(&tx.to)
                    .cloned()
                    .unwrap_or_else(|| Account::new(tx.to)),
            };
            receiver.balance += tx.amount;
            staged.insert(tx.to, receiver);
        }

        for account in staged.into_values() {
            inner.set_account(account);
        }

        let new_root = inner.merkle.root();
        let previous_root = inner
            .batch_log
            .last()
            .map(|b| b.state_root)
            .unwrap_or([0u8; 32]);

        decided.state_root = new_root;
        // Placeholder proof: `old_root || new_root` stands in for a real
        // Groth16 proof, which is produced by a separate proving backend.
        decided.proof = [previous_root, new_root].concat();
        decided.number = inner.current_batch_number;

        inner.batch_log.push(decided.clone());
        inner.current_batch_number += 1;

        info!(
            batch_number = decided.number,
            tx_count = decided.transactions.len(),
            batch_hash = %hex::encode(batch_hash(&decided)),
            "applied batch"
        );

        Ok(decided)
    }

    /// Convenience wrapper used by tests and dev tooling that want
    /// account auto-creation without going through the mempool's
    /// `PoolConfig.dev_bootstrap_balance` gate.
    pub fn ensure_account(&self, address: Address, initial_balance: U256) -> Result<(), StateError> {
        let mut inner = self.inner.write().map_err(|_| StateError::LockPoisoned)?;
        if !inner.accounts.contains_key(&address) {
            inner.set_account(Account::with_balance(address, initial_balance));
        }
        Ok(())
    }
}
