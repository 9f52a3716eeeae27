//! JSON-RPC server (spec §6.1): the `rollup_*` method table.
//!
//! Grounded on the teacher's `web3_decl`/`api_server` split — a
//! `#[rpc(server)]` trait defined once, and a plain struct implementing
//! it that holds whatever state the methods need (`ViaNamespace` /
//! `RpcState` in `via.rs`). The split between namespaces the teacher uses
//! elsewhere (`eth`, `zks`, `via`) collapses to a single `rollup`
//! namespace here, since the spec names exactly four methods.

mod error;
mod methods;

use std::net::SocketAddr;
use std::sync::Arc;

use jsonrpsee::server::{Server, ServerHandle};
use tracing::info;
use zkseq_sequencer::Sequencer;
use zkseq_state::StateStore;

pub use error::ApiError;
pub use methods::RollupRpcServer;

use methods::RollupApi;

/// Starts the JSON-RPC server bound to `addr`. Returns the `ServerHandle`
/// so the caller (normally `zkseq_node`'s `main.rs`) can hold it for the
/// life of the process and stop it on shutdown.
pub async fn serve(addr: SocketAddr, state: Arc<StateStore>, sequencer: Arc<Sequencer>) -> anyhow::Result<ServerHandle> {
    let server = Server::builder().build(addr).await?;
    let rpc = RollupApi::new(state, sequencer);

    let handle = server.start(rpc.into_rpc());
    info!(%addr, "JSON-RPC server listening");
    Ok(handle)
}
