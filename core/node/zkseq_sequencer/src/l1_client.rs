//! L1 submit interface (spec §6.3): outbound-only, fire-and-await-receipt,
//! opaque to the core. The real client (submitting to an L1 contract) is
//! out of scope per spec §1; this crate only specifies the trait seam.

use async_trait::async_trait;

#[async_trait]
pub trait L1Client: Send + Sync {
    async fn submit_batch(
        &self,
        batch_number: u64,
        state_root: [u8; 32],
        tx_hashes: Vec<[u8; 32]>,
        proof: Vec<u8>,
    ) -> anyhow::Result<()>;
}

/// Used when `l1_enabled = false` (spec §6.5).
#[derive(Debug, Default)]
pub struct NoopL1Client;

#[async_trait]
impl L1Client for NoopL1Client {
    async fn submit_batch(
        &self,
        _batch_number: u64,
        _state_root: [u8; 32],
        _tx_hashes: Vec<[u8; 32]>,
        _proof: Vec<u8>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
