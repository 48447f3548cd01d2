//! Overlay connection abstraction
//!
//! The bridge core talks to the overlay through a small contract: a
//! connection handle with a single subscription for inbound events, asynchronous
//! writes answered by completions, half-close and close. This crate holds that
//! contract, the fixed buffer pool shared with bridge sessions, the service
//! directory used to resolve destinations, and a plain TCP carrier.

pub mod connection;
pub mod error;
pub mod pool;
pub mod service;
pub mod tcp;

pub use connection::{
    next_conn_id, CloseTicket, ConnId, OverlayCommand, OverlayConnection, OverlayEvent,
    OverlayPeer, OverlaySubscription, Payload, WriteCompletion, WriteRequest,
};
pub use error::{error_str, OverlayError, OverlayResult};
pub use pool::{BufferPool, PooledBuffer, DEFAULT_BUFFER_SIZE, DEFAULT_POOL_SIZE};
pub use service::{
    DestinationMetadata, DialOptions, Dialer, Intercept, InterceptAddress, PortRange, Protocol,
    ServiceDirectory, ServiceEntry,
};
pub use tcp::{spawn_tcp_carrier, TcpCarrierListener, TcpDialer};
