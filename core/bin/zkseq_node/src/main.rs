//! Thin wiring stub (spec §6.5): builds one sequencer node out of the
//! library crates and runs it until Ctrl-C. Config loading from a file or
//! environment is out of scope (spec §1); this binary just uses
//! `SequencerConfig::for_tests()` the way the teacher's `main.rs` loads a
//! config before handing off to its node builder, minus the env/file
//! layer.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use zkseq_api::serve;
use zkseq_config::SequencerConfig;
use zkseq_consensus::NoopVerifier;
use zkseq_mempool::{PoolConfig, TransactionPool};
use zkseq_network::NetworkHub;
use zkseq_observability::init_logging;
use zkseq_sequencer::{NoopL1Client, Sequencer};
use zkseq_state::StateStore;
use zkseq_types::NodeId;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = SequencerConfig::for_tests();
    let node_id = NodeId::new("zkseq-node-0");

    // A single-process node has no peers to join through; production
    // deployments swap `NetworkHub`/`LocalBus` for a real libp2p-style
    // transport behind the same `BroadcastBus` trait (spec §4.4).
    let hub = NetworkHub::new();
    let bus = Arc::new(hub.join(node_id.clone()));

    let state = Arc::new(StateStore::new());
    let pool_config = if config.dev_bootstrap_balance.is_some() {
        PoolConfig::dev()
    } else {
        PoolConfig::default()
    };
    let pool = Arc::new(TransactionPool::new(pool_config));

    let sequencer = Sequencer::new(
        config.clone(),
        node_id,
        state.clone(),
        pool,
        bus,
        Arc::new(NoopVerifier),
        Arc::new(NoopL1Client),
    );

    let task_handles = sequencer.run();

    let rpc_addr: SocketAddr = format!("127.0.0.1:{}", config.rpc_port)
        .parse()
        .context("invalid rpc_port in SequencerConfig")?;
    let rpc_handle = serve(rpc_addr, state, sequencer.clone()).await?;

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");

    sequencer.shutdown();
    let _ = rpc_handle.stop();
    for handle in task_handles {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
    }

    Ok(())
}
