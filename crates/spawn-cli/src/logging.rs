//! Diagnostic tracing for the CLI.
//!
//! Tracing goes to stderr and is controlled by `RUST_LOG`. Command output
//! (tables, worker lines) goes to stdout and is never filtered.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global subscriber. Defaults to `warn` when `RUST_LOG` is
/// unset or unparsable.
///
/// ```bash
/// RUST_LOG=spawn_core=debug spawn worker reconcile
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
