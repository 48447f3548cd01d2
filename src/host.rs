//! Hosting a service: overlay connections bridged to a local backend

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use tunbridge_bridge::{bridge, BridgeConfig, CloseReason, ExternalEndpoint};
use tunbridge_overlay::{OverlayConnection, TcpCarrierListener};

/// Idle timeout for hosted bridges when none is configured
pub const DEFAULT_HOST_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept overlay connections on `listener` and bridge each one to a new
/// TCP connection to `target`
pub async fn run_host(
    listener: TcpCarrierListener,
    target: String,
    config: BridgeConfig,
) -> Result<()> {
    let local = listener
        .local_addr()
        .context("Failed to read listener address")?;
    info!("Hosting {} for overlay connections on {}", target, local);

    loop {
        let (conn, peer) = listener
            .accept()
            .await
            .context("Failed to accept overlay connection")?;

        let target = target.clone();
        let config = config.clone();
        tokio::spawn(async move {
            match host_connection(conn, &target, &config).await {
                Ok(reason) => debug!("Connection from {} finished: {}", peer, reason),
                Err(e) => warn!("Hosting connection from {} failed: {:#}", peer, e),
            }
        });
    }
}

async fn host_connection(
    conn: OverlayConnection,
    target: &str,
    config: &BridgeConfig,
) -> Result<CloseReason> {
    let backend = match TcpStream::connect(target).await {
        Ok(stream) => stream,
        Err(e) => {
            conn.close().await;
            return Err(e).context(format!("Failed to connect to {}", target));
        }
    };

    let handle = bridge(conn, ExternalEndpoint::tcp(backend), config)?;
    if let Ok(description) = handle.describe().await {
        info!(conn_id = handle.conn_id(), "Hosting {}", description);
    }
    Ok(handle.closed().await)
}
