//! Domain and wire types shared by every sequencer crate.
//!
//! Plays the role of both a thin primitives crate (cf. `zksync_basic_types`)
//! and the domain types built on top of it (cf. `zksync_types`) in one
//! crate, since the sequencer core is small enough not to warrant the
//! split.

pub mod account;
pub mod batch;
pub mod ceremony;
pub mod consensus;
pub mod node_id;
pub mod transaction;

pub use account::Account;
pub use batch::Batch;
pub use ceremony::{CrsContribution, CrsEpochState};
pub use consensus::{ConsensusPhase, ConsensusState, Envelope, MessageKind};
pub use node_id::NodeId;
pub use transaction::{Transaction, TransactionKind};

/// Re-exported primitive types, built on `web3::types` rather than
/// hand-rolled fixed-size byte wrappers, so every hash/codec consumer
/// agrees on one representation.
pub use web3::types::{Address, H256, U256};

/// 32-byte hex-encoded batch or message digest.
pub type HexHash = String;

pub fn hex_hash(bytes: &[u8; 32]) -> HexHash {
    hex::encode(bytes)
}
