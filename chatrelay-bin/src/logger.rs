//! Logging initialisation via tracing-subscriber.

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

/// Install the global subscriber, writing to stderr.
///
/// An explicit `level` (from `--log-level`) wins over `RUST_LOG`. Without one,
/// `RUST_LOG` is used when set and parseable, otherwise `info`.
pub fn init(level: Option<&str>) -> Result<()> {
    let filter = build_filter(level)?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("failed to set subscriber: {e}"))
}

fn build_filter(level: Option<&str>) -> Result<EnvFilter> {
    match level {
        Some(l) => EnvFilter::try_new(l).map_err(|e| anyhow!("invalid log level '{l}': {e}")),
        None => Ok(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))),
    }
}
