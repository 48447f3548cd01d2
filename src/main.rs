//! tunbridge CLI - Bridge local endpoints to overlay services
//!
//! Pipe stdio into a service, forward a local TCP port to one, fetch a URL
//! through the service that intercepts it, or host a local backend for
//! overlay connections arriving from a relay.

mod config;
mod fetch;
mod forward;
mod host;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::TunbridgeConfig;
use forward::Target;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tunbridge_bridge::LinkConnector;
use tunbridge_overlay::{Dialer, TcpCarrierListener, TcpDialer};

/// tunbridge - Bridge local endpoints to overlay services
#[derive(Parser, Debug)]
#[command(name = "tunbridge")]
#[command(about = "tunbridge - Bridge local endpoints to overlay services")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (JSON) listing services and bridge settings
    #[arg(short, long, global = true, env = "TUNBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Close bridges after this many seconds without traffic (0 = never)
    #[arg(long, global = true, env = "TUNBRIDGE_IDLE_TIMEOUT")]
    idle_timeout: Option<u64>,

    /// Seconds to wait for a relay to accept a dial
    #[arg(long, global = true, env = "TUNBRIDGE_CONNECT_TIMEOUT", default_value = "10")]
    connect_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bridge stdin and stdout to a service
    #[command(long_about = r#"
Dial a service and bridge it to this process' stdin and stdout, like
netcat. The session ends once both directions finished.

stdin and stdout are switched to non-blocking mode for the session and
restored to blocking mode when it ends. Other processes sharing the same
terminal or pipe see the non-blocking mode while the session runs.

EXAMPLES:
  # Talk to a named service through its relay
  tunbridge connect --service redis --relay relay.example.com:7000

  # Let the configuration pick the service intercepting a destination
  tunbridge --config services.json connect --host db.internal --port 5432

ENVIRONMENT VARIABLES:
  TUNBRIDGE_CONFIG           Configuration file
  TUNBRIDGE_SERVICE          Service to dial
  TUNBRIDGE_RELAY            Relay address for the service
  TUNBRIDGE_IDLE_TIMEOUT     Idle timeout in seconds
    "#)]
    Connect {
        /// Service to dial
        #[arg(long, env = "TUNBRIDGE_SERVICE")]
        service: Option<String>,

        /// Relay carrying the service (e.g., relay.example.com:7000)
        #[arg(long, env = "TUNBRIDGE_RELAY", requires = "service")]
        relay: Option<String>,

        /// Destination host, resolved to a service by its intercepts
        #[arg(long)]
        host: Option<String>,

        /// Destination port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Listen on a local TCP port and bridge every connection to a service
    #[command(long_about = r#"
Listen on a local TCP address and bridge each accepted connection to its
own overlay connection.

EXAMPLES:
  # Expose a remote PostgreSQL on localhost:5433
  tunbridge forward --listen 127.0.0.1:5433 --service postgres \
    --relay relay.example.com:7000

  # Close forwarded connections after five idle minutes
  tunbridge --idle-timeout 300 forward --listen 0.0.0.0:8080 --service web

ENVIRONMENT VARIABLES:
  TUNBRIDGE_LISTEN           Local address to listen on
  TUNBRIDGE_SERVICE          Service to dial
  TUNBRIDGE_RELAY            Relay address for the service
    "#)]
    Forward {
        /// Local address to listen on (e.g., 127.0.0.1:8080)
        #[arg(long, env = "TUNBRIDGE_LISTEN")]
        listen: String,

        /// Service to dial
        #[arg(long, env = "TUNBRIDGE_SERVICE")]
        service: Option<String>,

        /// Relay carrying the service
        #[arg(long, env = "TUNBRIDGE_RELAY", requires = "service")]
        relay: Option<String>,

        /// Destination host, resolved to a service by its intercepts
        #[arg(long)]
        host: Option<String>,

        /// Destination port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Fetch a URL over the overlay and print the body
    #[command(long_about = r#"
Send an HTTP GET through the service intercepting the URL's host and port
and write the response body to stdout.

EXAMPLES:
  tunbridge --config services.json get http://wiki.internal/status

  # Skip the intercept lookup
  tunbridge get --service web --relay relay.example.com:7000 http://web/
    "#)]
    Get {
        /// URL to fetch (http only)
        url: String,

        /// Dial this service instead of looking the URL up
        #[arg(long, env = "TUNBRIDGE_SERVICE")]
        service: Option<String>,

        /// Relay carrying the service
        #[arg(long, env = "TUNBRIDGE_RELAY", requires = "service")]
        relay: Option<String>,
    },

    /// Accept overlay connections and bridge each one to a local backend
    #[command(long_about = r#"
Listen for overlay connections from a relay and bridge each one to a new
TCP connection to the target backend. Hosted bridges close after 10 idle
seconds unless --idle-timeout or a non-zero configured timeout applies.

EXAMPLES:
  # Serve a local web server to overlay clients
  tunbridge host --listen 0.0.0.0:7000 --target 127.0.0.1:8080

  # Keep idle hosted connections open
  tunbridge --idle-timeout 0 host --listen 0.0.0.0:7000 --target localhost:5432

ENVIRONMENT VARIABLES:
  TUNBRIDGE_LISTEN           Address the relay connects to
  TUNBRIDGE_TARGET           Backend address (host:port)
  TUNBRIDGE_IDLE_TIMEOUT     Idle timeout in seconds
    "#)]
    Host {
        /// Address to accept overlay connections on (e.g., 0.0.0.0:7000)
        #[arg(long, env = "TUNBRIDGE_LISTEN")]
        listen: String,

        /// Backend to bridge every connection to (e.g., 127.0.0.1:8080)
        #[arg(long, env = "TUNBRIDGE_TARGET")]
        target: String,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false),
        )
        .with(filter)
        .init();
}

fn make_dialer(config: &TunbridgeConfig, connect_timeout: u64) -> Arc<TcpDialer> {
    Arc::new(
        TcpDialer::new(Arc::new(config.services.clone()))
            .with_connect_timeout(Duration::from_secs(connect_timeout)),
    )
}

/// Run `task` until it finishes or Ctrl+C arrives
async fn run_until_ctrl_c<F>(task: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
        result = task => {
            if let Err(e) = &result {
                error!("{:#}", e);
            }
            result
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(cli.verbose);

    let config =
        TunbridgeConfig::load(cli.config.as_deref())?.with_idle_timeout(cli.idle_timeout);

    match cli.command {
        Commands::Connect {
            service,
            relay,
            host,
            port,
        } => {
            let config = match &service {
                Some(name) => config.with_relay(name, relay),
                None => config,
            };
            let target =
                Target::resolve(&config.services, service.as_deref(), host.as_deref(), port)?;
            let dialer: Arc<dyn Dialer> = make_dialer(&config, cli.connect_timeout);

            run_until_ctrl_c(async move {
                let reason = forward::connect_stdio(dialer, target, config.bridge).await?;
                info!("Session ended: {}", reason);
                reason
                    .into_result()
                    .context("Session ended abnormally")?;
                Ok(())
            })
            .await
        }
        Commands::Forward {
            listen,
            service,
            relay,
            host,
            port,
        } => {
            let config = match &service {
                Some(name) => config.with_relay(name, relay),
                None => config,
            };
            let target =
                Target::resolve(&config.services, service.as_deref(), host.as_deref(), port)?;
            let dialer: Arc<dyn Dialer> = make_dialer(&config, cli.connect_timeout);

            let listener = TcpListener::bind(&listen)
                .await
                .context(format!("Failed to listen on {}", listen))?;

            run_until_ctrl_c(forward::run_forward(listener, dialer, target, config.bridge)).await?;
            info!("tunbridge stopped");
            Ok(())
        }
        Commands::Get {
            url,
            service,
            relay,
        } => {
            let config = match &service {
                Some(name) => config.with_relay(name, relay),
                None => config,
            };
            let dialer = make_dialer(&config, cli.connect_timeout);
            let mut connector = LinkConnector::new(dialer.clone(), dialer.directory().clone());
            if let Some(name) = service {
                connector = connector.with_service(name);
            }

            let response = fetch::get(&connector, &url).await?;
            info!("{} {}", response.status, url);

            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(&response.body)
                .context("Failed to write response body")?;
            stdout.flush().context("Failed to flush stdout")?;

            if !response.status.is_success() {
                anyhow::bail!("Request failed with status {}", response.status);
            }
            Ok(())
        }
        Commands::Host { listen, target } => {
            let mut bridge_config = config.bridge;
            if cli.idle_timeout.is_none() && bridge_config.idle_timeout.is_zero() {
                bridge_config.idle_timeout = host::DEFAULT_HOST_IDLE_TIMEOUT;
            }

            let listener = TcpCarrierListener::bind(&listen)
                .await
                .context(format!("Failed to listen on {}", listen))?;

            run_until_ctrl_c(host::run_host(listener, target, bridge_config)).await?;
            info!("tunbridge stopped");
            Ok(())
        }
    }
}
