//! Local endpoints bridged to an overlay service

use anyhow::{Context, Result};
use std::io::{stdin, stdout};
use std::os::fd::AsFd;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use tunbridge_bridge::{bridge, bridge_fds, BridgeConfig, CloseReason, ExternalEndpoint};
use tunbridge_overlay::{
    DestinationMetadata, DialOptions, Dialer, OverlayConnection, Protocol, ServiceDirectory,
};

/// The service to dial and what to tell it about the destination
#[derive(Debug, Clone)]
pub struct Target {
    pub service: String,
    pub options: DialOptions,
}

impl Target {
    /// Use `service` when given, otherwise the service intercepting `host:port`
    pub fn resolve(
        directory: &ServiceDirectory,
        service: Option<&str>,
        host: Option<&str>,
        port: Option<u16>,
    ) -> Result<Self> {
        let destination = match (host, port) {
            (Some(host), Some(port)) => Some((host, port)),
            (None, None) => None,
            _ => anyhow::bail!("--host and --port must be given together"),
        };

        let service = match (service, destination) {
            (Some(service), _) => service.to_string(),
            (None, Some((host, port))) => directory
                .service_for_addr(Protocol::Tcp, host, port)
                .map(|entry| entry.name.clone())
                .context(format!("No service intercepts tcp:{}:{}", host, port))?,
            (None, None) => anyhow::bail!("Either --service or --host/--port is required"),
        };

        let options = match destination {
            Some((host, port)) => {
                DialOptions::with_destination(&DestinationMetadata::new(Protocol::Tcp, host, port))
            }
            None => DialOptions::default(),
        };

        Ok(Self { service, options })
    }

    async fn dial(&self, dialer: &dyn Dialer) -> Result<OverlayConnection> {
        dialer
            .dial(&self.service, self.options.clone())
            .await
            .context(format!("Failed to dial service {}", self.service))
    }
}

/// Bridge this process' stdin and stdout to the target
pub async fn connect_stdio(
    dialer: Arc<dyn Dialer>,
    target: Target,
    config: BridgeConfig,
) -> Result<CloseReason> {
    let conn = target.dial(dialer.as_ref()).await?;
    info!(conn_id = conn.id(), "Connected to service {}", target.service);

    let input = stdin()
        .as_fd()
        .try_clone_to_owned()
        .context("Failed to duplicate stdin")?;
    let output = stdout()
        .as_fd()
        .try_clone_to_owned()
        .context("Failed to duplicate stdout")?;

    let handle = bridge_fds(conn, input, output, &config, || debug!("stdio released"))
        .context("Failed to bridge stdio")?;
    Ok(handle.closed().await)
}

/// Accept TCP connections on `listener` and bridge each one to the target
pub async fn run_forward(
    listener: TcpListener,
    dialer: Arc<dyn Dialer>,
    target: Target,
    config: BridgeConfig,
) -> Result<()> {
    let local = listener.local_addr().context("Failed to read listener address")?;
    info!("Forwarding {} to service {}", local, target.service);

    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .context("Failed to accept connection")?;
        debug!("Accepted connection from {}", peer);

        let dialer = dialer.clone();
        let target = target.clone();
        let config = config.clone();
        tokio::spawn(async move {
            match forward_connection(stream, dialer.as_ref(), &target, &config).await {
                Ok(reason) => debug!("Connection from {} finished: {}", peer, reason),
                Err(e) => warn!("Forwarding {} failed: {:#}", peer, e),
            }
        });
    }
}

async fn forward_connection(
    stream: TcpStream,
    dialer: &dyn Dialer,
    target: &Target,
    config: &BridgeConfig,
) -> Result<CloseReason> {
    let conn = target.dial(dialer).await?;
    let handle = bridge(conn, ExternalEndpoint::tcp(stream), config)?;
    if let Ok(description) = handle.describe().await {
        info!(conn_id = handle.conn_id(), "Bridging {}", description);
    }
    Ok(handle.closed().await)
}
