//! Tracing setup shared by the binaries.

use tracing_subscriber::EnvFilter;

/// Initializes the global subscriber. `RUST_LOG` overrides `default_directive`
/// when set. Safe to call once per process; later calls are ignored.
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive.to_string()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
