//! Logging initialization, matching the density of `tracing::info!` calls
//! seen throughout the teacher's session/processor modules: one call per
//! significant state transition, not one per function entry.

use tracing_subscriber::EnvFilter;

/// Installs a `tracing-subscriber` fmt layer reading `RUST_LOG`, falling
/// back to `info` when unset. Call once, near the top of `main`.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
