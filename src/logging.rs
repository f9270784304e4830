use anyhow::{Result, anyhow};
use tracing_subscriber::{EnvFilter, fmt};

pub const LOG_ENV: &str = "LAUNCHER_LOG";

/// Installs the global subscriber. `verbose` lowers the default level to debug
/// when `LAUNCHER_LOG` is not set.
pub fn init(verbose: bool) -> Result<()> {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!("Failed to install log subscriber: {err}"))
}
