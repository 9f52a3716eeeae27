pub mod engine;
pub mod quorum;
pub mod verifier;

pub use engine::{BftEngine, BftError};
pub use quorum::quorum_for;
pub use verifier::{MessageVerifier, NoopVerifier};
