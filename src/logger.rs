//! Tracing setup for the driver binary.

use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber once. `RUST_LOG` overrides the
/// default level; logs go to stderr so handler output on stdout stays
/// machine-readable. Safe to call more than once (tests share a
/// process).
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
