//! Recognized configuration options (spec §6.5).
//!
//! Pure `serde` structs with no env-loading baked in, matching the
//! teacher's `zksync_config`/`via_config` convention of separating the
//! typed config shape from whatever loads it (file, env, CLI flags —
//! all out of scope here per spec §1).

use serde::{Deserialize, Serialize};

/// TCP port for the peer transport.
pub type Port = u16;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequencerConfig {
    /// TCP port for peer transport.
    pub sequencer_port: Port,
    /// TCP port for JSON-RPC.
    pub rpc_port: Port,
    /// Initial peer multiaddresses.
    pub bootstrap_peers: Vec<String>,
    /// Initial leader flag.
    pub is_leader: bool,
    /// Max transactions per batch.
    pub batch_size: usize,
    /// Timer period for batching, in seconds (reference: 15s, spec §4.7).
    pub batch_interval_secs: u64,
    /// Peer-count monitor poll period, in seconds (reference: 5s, spec §4.7).
    pub peer_poll_interval_secs: u64,
    /// Enable the optional L1 submit loop.
    pub l1_enabled: bool,
    /// L1 submit loop period, in seconds.
    pub l1_submit_period_secs: u64,
    /// log2 of the trusted-setup blob size (spec §4.6, reference: 12).
    pub ceremony_power: u32,
    /// How often the leader starts a new CRS ceremony epoch, in seconds.
    /// Not named in spec §6.5's table; added because §2 states the
    /// sequencer "periodically runs" the ceremony without specifying the
    /// period, and every other periodic behavior in §4.7 is config-driven.
    pub ceremony_interval_secs: u64,
    /// Dev-only bootstrap balance for first-seen senders (spec §9 open
    /// question); `None` gates the affordance off for production.
    pub dev_bootstrap_balance: Option<u64>,
}

impl SequencerConfig {
    /// A configuration suitable for local development and unit/integration
    /// tests, matching the teacher's `for_tests()` convention
    /// (`BtcWatchConfig::for_tests`).
    pub fn for_tests() -> Self {
        Self {
            sequencer_port: 30303,
            rpc_port: 8545,
            bootstrap_peers: Vec::new(),
            is_leader: true,
            batch_size: 100,
            batch_interval_secs: 15,
            peer_poll_interval_secs: 5,
            l1_enabled: false,
            l1_submit_period_secs: 60,
            ceremony_power: 12,
            ceremony_interval_secs: 300,
            dev_bootstrap_balance: Some(1000),
        }
    }
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self::for_tests()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let config = SequencerConfig::for_tests();
        let json = serde_json::to_string(&config).unwrap();
        let decoded: SequencerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, decoded);
    }
}
