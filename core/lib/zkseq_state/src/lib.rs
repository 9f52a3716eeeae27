pub mod merkle;
pub mod store;

pub use merkle::SparseMerkleTree;
pub use store::{StateError, StateStore};
