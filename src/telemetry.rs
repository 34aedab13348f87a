//! Tracing setup for binaries and demos embedding the core.
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable holding the log filter directives.
pub const LOG_ENV_VAR: &str = "RECYCLE_LOG";

/// Install a formatting subscriber filtered by `RECYCLE_LOG`, defaulting to `info`.
pub fn init() {
    init_with("info");
}

/// Like [`init`], with a custom fallback filter. Does nothing if a global
/// subscriber is already installed.
pub fn init_with(default_filter: &str) {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
