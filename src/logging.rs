use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber reading `RUST_LOG`, falling back
/// to `default_level`. Ambient scaffolding for binaries and tests embedding
/// this crate — the crate itself never installs a subscriber on its own.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .compact()
        .init();
}
