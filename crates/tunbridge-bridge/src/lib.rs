//! Bridging overlay connections to local transports
//!
//! A bridge pumps bytes both ways between one overlay connection and one
//! local endpoint (TCP, connected UDP, Unix socket or a pair of pipes) with
//! bounded buffering, half-close and an optional idle timeout. The same
//! overlay connection can instead be used directly as a byte stream through
//! [`OverlayLink`].
//!
//! # Example
//!
//! ```no_run
//! use tunbridge_bridge::{bridge, BridgeConfig, ExternalEndpoint};
//! use tunbridge_overlay::OverlayConnection;
//!
//! # async fn example(conn: OverlayConnection, stream: tokio::net::TcpStream) -> Result<(), Box<dyn std::error::Error>> {
//! let handle = bridge(conn, ExternalEndpoint::tcp(stream), &BridgeConfig::default())?;
//! println!("{}", handle.describe().await?);
//! let reason = handle.closed().await;
//! println!("bridge closed: {}", reason);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod link;
pub mod session;

pub use config::{BridgeConfig, BridgeConfigBuilder};
pub use endpoint::ExternalEndpoint;
pub use engine::{
    BridgeEngine, BridgeState, EndpointKind, ExternalIo, ExternalRead, OverlayData, OverlayIo,
    ReadFlow,
};
pub use error::{BridgeError, BridgeResult, CloseReason};
pub use link::{LinkConnector, OverlayLink};
pub use session::{bridge, bridge_fd, bridge_fds, BridgeHandle};
