//! Plain TCP carrier for overlay connections
//!
//! Each overlay connection rides its own TCP stream to the service's relay
//! address. Inbound bytes become [`OverlayEvent::Data`], the relay's FIN
//! becomes [`OverlayEvent::Eof`] and write requests are answered once the
//! bytes were handed to the kernel.

use crate::connection::{
    OverlayCommand, OverlayConnection, OverlayEvent, OverlayPeer, WriteRequest,
};
use crate::error::{OverlayError, OverlayResult};
use crate::pool::DEFAULT_BUFFER_SIZE;
use crate::service::{DialOptions, Dialer, ServiceDirectory};
use async_trait::async_trait;
use bytes::BytesMut;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tracing::{debug, debug_span, warn, Instrument};

/// Default timeout for reaching a relay
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a close waits for queued writes to reach the relay
pub const CLOSE_LINGER: Duration = Duration::from_secs(2);

/// Carry a new overlay connection over `stream`. The carrier task runs until
/// the connection is closed or every handle is dropped.
pub fn spawn_tcp_carrier(stream: TcpStream) -> OverlayConnection {
    let (conn, peer) = OverlayConnection::pair();
    let span = debug_span!("carrier", conn_id = peer.id());
    tokio::spawn(run_carrier(stream, peer).instrument(span));
    conn
}

/// Work for the outbound half, in command order
enum Outbound {
    Write(WriteRequest),
    Shutdown,
}

async fn run_carrier(stream: TcpStream, peer: OverlayPeer) {
    let (events, mut commands) = peer.into_parts();
    let (reader, writer) = stream.into_split();

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let inbound = tokio::spawn(pump_inbound(reader, events).in_current_span());
    let mut outbound = tokio::spawn(pump_outbound(writer, outbound_rx).in_current_span());

    // Writes run on their own task so a relay that stops reading cannot hold
    // up a close for longer than CLOSE_LINGER. A request that never reaches
    // the writer answers ConnClosed when dropped.
    while let Some(cmd) = commands.recv().await {
        match cmd {
            OverlayCommand::Write(req) => {
                let _ = outbound_tx.send(Outbound::Write(req));
            }
            OverlayCommand::CloseWrite => {
                let _ = outbound_tx.send(Outbound::Shutdown);
            }
            OverlayCommand::Close { done } => {
                debug!("closing carrier");
                inbound.abort();
                drop(outbound_tx);
                if tokio::time::timeout(CLOSE_LINGER, &mut outbound).await.is_err() {
                    debug!("relay is not draining, dropping queued writes");
                    outbound.abort();
                    let _ = outbound.await;
                }
                let _ = done.send(());
                return;
            }
        }
    }

    debug!("all connection handles dropped");
    inbound.abort();
}

async fn pump_outbound(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let mut write_closed = false;
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Write(req) => {
                if write_closed {
                    req.complete(Err(OverlayError::ConnClosed));
                    continue;
                }
                let len = req.len();
                match writer.write_all(req.data()).await {
                    Ok(()) => req.complete(Ok(len)),
                    Err(e) => {
                        warn!("relay write failed: {}", e);
                        req.complete(Err(OverlayError::ConnAbort));
                    }
                }
            }
            Outbound::Shutdown => {
                if !write_closed {
                    write_closed = true;
                    if let Err(e) = writer.shutdown().await {
                        debug!("relay shutdown failed: {}", e);
                    }
                }
            }
        }
    }
}

async fn pump_inbound(mut reader: OwnedReadHalf, events: mpsc::Sender<OverlayEvent>) {
    let mut buf = BytesMut::with_capacity(DEFAULT_BUFFER_SIZE);
    loop {
        buf.reserve(DEFAULT_BUFFER_SIZE);
        let event = match reader.read_buf(&mut buf).await {
            Ok(0) => OverlayEvent::Eof,
            Ok(_) => OverlayEvent::Data(buf.split().freeze()),
            Err(e) => {
                debug!("relay read failed: {}", e);
                OverlayEvent::Error(read_error(&e))
            }
        };

        let last = !matches!(event, OverlayEvent::Data(_));
        if events.send(event).await.is_err() || last {
            return;
        }
    }
}

fn read_error(err: &io::Error) -> OverlayError {
    match err.kind() {
        io::ErrorKind::TimedOut => OverlayError::Timeout,
        _ => OverlayError::ConnAbort,
    }
}

/// Dials services by connecting to the relay listed in the directory
#[derive(Debug, Clone)]
pub struct TcpDialer {
    directory: Arc<ServiceDirectory>,
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(directory: Arc<ServiceDirectory>) -> Self {
        Self {
            directory,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn directory(&self) -> &Arc<ServiceDirectory> {
        &self.directory
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, service: &str, options: DialOptions) -> OverlayResult<OverlayConnection> {
        let relay = self
            .directory
            .get(service)
            .and_then(|entry| entry.relay.clone())
            .ok_or(OverlayError::ServiceUnavailable)?;

        if let Some(app_data) = &options.app_data {
            debug!(
                service,
                app_data = %String::from_utf8_lossy(app_data),
                "dialing service"
            );
        }

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&relay))
            .await
            .map_err(|_| OverlayError::Timeout)?
            .map_err(|e| {
                warn!(service, relay = %relay, "failed to reach relay: {}", e);
                OverlayError::GatewayUnavailable
            })?;
        let _ = stream.set_nodelay(true);

        debug!(service, relay = %relay, "relay connected");
        Ok(spawn_tcp_carrier(stream))
    }
}

/// Accepts overlay connections that a relay delivers to a hosted service
#[derive(Debug)]
pub struct TcpCarrierListener {
    listener: TcpListener,
}

impl TcpCarrierListener {
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        Ok(Self::from_listener(TcpListener::bind(addr).await?))
    }

    pub fn from_listener(listener: TcpListener) -> Self {
        Self { listener }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Wait for the next inbound connection
    pub async fn accept(&self) -> io::Result<(OverlayConnection, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let conn = spawn_tcp_carrier(stream);
        debug!(conn_id = conn.id(), peer = %peer, "inbound overlay connection");
        Ok((conn, peer))
    }
}
