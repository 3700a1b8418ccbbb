//! Development-time tracing.
//!
//! Tracing output goes to stderr and is filtered by `RUST_LOG`. It is not the
//! audit trail: run records (`runs/`) and proposal audit logs are product
//! artifacts and are written regardless of the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the stderr subscriber. Defaults to `warn` when `RUST_LOG` is unset.
///
/// ```bash
/// RUST_LOG=codex_orchestrator=debug codex-orchestrator insights run abc -p "..."
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
