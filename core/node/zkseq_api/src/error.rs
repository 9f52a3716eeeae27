//! RPC-facing error taxonomy (spec §6.1, §7): wraps domain errors from
//! `zkseq_state`/`zkseq_mempool`/`zkseq_codec` into JSON-RPC 2.0 error
//! codes, following the teacher's `Web3Error`-to-`ErrorObjectOwned`
//! mapping convention.

use jsonrpsee::types::ErrorObjectOwned;
use zkseq_mempool::PoolError;
use zkseq_state::StateError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    State(#[from] StateError),
}

/// JSON-RPC 2.0 standard codes (spec §6.1): parse/method-not-found are
/// handled by `jsonrpsee` itself before a method body ever runs, so this
/// crate only ever produces `-32602` (invalid params) or `-32603`
/// (internal).
impl From<ApiError> for ErrorObjectOwned {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::InvalidParams(_) | ApiError::Pool(_) => {
                ErrorObjectOwned::owned(-32602, err.to_string(), None::<()>)
            }
            ApiError::State(_) => ErrorObjectOwned::owned(-32603, err.to_string(), None::<()>),
        }
    }
}
