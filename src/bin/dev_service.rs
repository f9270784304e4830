use std::{env, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use project_launcher::dev_service::{self, DEV_ADMIN, DevState};
use project_launcher::logging;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(false)?;

    let addr: SocketAddr = env::var("LAUNCHER_DEV_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8765".to_string())
        .parse()
        .context("Invalid LAUNCHER_DEV_ADDR value")?;
    let state = Arc::new(DevState::seeded());

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    info!(
        "development service on http://{addr} (login {} / {})",
        DEV_ADMIN.0, DEV_ADMIN.1
    );

    dev_service::serve(listener, state, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    })
    .await
}
