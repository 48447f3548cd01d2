//! Overlay connection as a byte stream
//!
//! [`OverlayLink`] implements `AsyncRead` and `AsyncWrite` on top of one overlay
//! connection, so any protocol stack that runs over a socket (an HTTP
//! client, a TLS session) can run over the tunnel instead.
//! [`LinkConnector`] resolves a destination to a service and dials it.

use crate::error::{BridgeError, BridgeResult};
use bytes::{Buf, Bytes, BytesMut};
use std::io::{self, IoSlice};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace};
use tunbridge_overlay::{
    ConnId, DestinationMetadata, DialOptions, Dialer, OverlayConnection, OverlayError,
    OverlayEvent, OverlaySubscription, Protocol, ServiceDirectory,
};

/// Resolves `host:port` destinations to overlay services and dials them
#[derive(Debug, Clone)]
pub struct LinkConnector {
    dialer: Arc<dyn Dialer>,
    directory: Arc<ServiceDirectory>,
    service: Option<String>,
}

impl LinkConnector {
    pub fn new(dialer: Arc<dyn Dialer>, directory: Arc<ServiceDirectory>) -> Self {
        Self {
            dialer,
            directory,
            service: None,
        }
    }

    /// Always dial `service` instead of looking destinations up
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub async fn connect(&self, host: &str, port: u16) -> BridgeResult<OverlayLink> {
        let service = match &self.service {
            Some(name) => name.clone(),
            None => self
                .directory
                .service_for_addr(Protocol::Tcp, host, port)
                .map(|entry| entry.name.clone())
                .ok_or_else(|| BridgeError::ServiceUnavailable {
                    protocol: Protocol::Tcp,
                    host: host.to_string(),
                    port,
                })?,
        };

        let destination = DestinationMetadata::new(Protocol::Tcp, host, port);
        debug!(service = %service, host, port, "connecting link");

        let conn = self
            .dialer
            .dial(&service, DialOptions::with_destination(&destination))
            .await?;
        OverlayLink::new(conn)
    }
}

/// The single write waiting for its overlay completion
#[derive(Debug)]
struct PendingWrite {
    len: usize,
}

#[derive(Debug)]
enum ReadState {
    Open,
    Eof,
    Failed(OverlayError),
}

/// An overlay connection presented as one duplex byte stream.
///
/// Writes are accepted one at a time: `poll_write` hands the bytes to the
/// overlay and the next write, flush or shutdown waits for that write to
/// complete. Dropping the link closes the connection.
#[derive(Debug)]
pub struct OverlayLink {
    conn: OverlayConnection,
    subscription: OverlaySubscription,
    /// Received bytes the reader has not taken yet
    unread: Bytes,
    read_state: ReadState,
    in_flight: Option<PendingWrite>,
    write_closed: bool,
}

impl OverlayLink {
    /// Take over `conn` as its consumer
    pub fn new(conn: OverlayConnection) -> BridgeResult<Self> {
        let subscription = conn.subscribe().map_err(|e| match e {
            OverlayError::InvalidState => {
                BridgeError::InvalidState("overlay connection already has a consumer".to_string())
            }
            e => BridgeError::ConnectionReset(e.to_string()),
        })?;

        Ok(Self {
            conn,
            subscription,
            unread: Bytes::new(),
            read_state: ReadState::Open,
            in_flight: None,
            write_closed: false,
        })
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn.id()
    }

    /// Delivery is pushed by the overlay; nothing to start
    pub fn read_start(&self) {}

    /// Close the connection without waiting for the overlay to confirm
    pub fn close(&self) {
        drop(self.conn.close());
    }

    fn poll_in_flight(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let Some(pending) = &self.in_flight else {
            return Poll::Ready(Ok(()));
        };
        let expected = pending.len;

        let done = ready!(self.subscription.completions.poll_recv(cx));
        self.in_flight = None;
        match done {
            Some(done) => match done.status {
                Ok(n) => {
                    trace!(conn_id = self.conn.id(), len = n, expected, "link write complete");
                    Poll::Ready(Ok(()))
                }
                Err(e) => Poll::Ready(Err(e.into())),
            },
            None => Poll::Ready(Err(OverlayError::ConnClosed.into())),
        }
    }

    fn start_write(&mut self, payload: Bytes) -> io::Result<usize> {
        if self.write_closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "link write side is shut down",
            ));
        }
        let len = payload.len();
        self.conn.write(payload)?;
        self.in_flight = Some(PendingWrite { len });
        Ok(len)
    }
}

impl AsyncRead for OverlayLink {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            if !this.unread.is_empty() {
                let n = this.unread.len().min(buf.remaining());
                buf.put_slice(&this.unread[..n]);
                this.unread.advance(n);
                return Poll::Ready(Ok(()));
            }

            match this.read_state {
                ReadState::Open => {}
                ReadState::Eof => return Poll::Ready(Ok(())),
                ReadState::Failed(e) => return Poll::Ready(Err(e.into())),
            }

            match ready!(this.subscription.events.poll_recv(cx)) {
                Some(OverlayEvent::Data(bytes)) => this.unread = bytes,
                Some(OverlayEvent::Eof) | Some(OverlayEvent::Closed) | None => {
                    debug!(conn_id = this.conn.id(), "link reached end of stream");
                    this.read_state = ReadState::Eof;
                }
                Some(OverlayEvent::Error(e)) => {
                    debug!(conn_id = this.conn.id(), "link read failed: {}", e);
                    this.read_state = ReadState::Failed(e);
                }
            }
        }
    }
}

impl AsyncWrite for OverlayLink {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_in_flight(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        Poll::Ready(this.start_write(Bytes::copy_from_slice(buf)))
    }

    /// All slices go out as one overlay write
    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_in_flight(cx))?;

        let total: usize = bufs.iter().map(|b| b.len()).sum();
        if total == 0 {
            return Poll::Ready(Ok(0));
        }
        let mut payload = BytesMut::with_capacity(total);
        for b in bufs {
            payload.extend_from_slice(b);
        }
        Poll::Ready(this.start_write(payload.freeze()))
    }

    fn is_write_vectored(&self) -> bool {
        true
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_in_flight(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_in_flight(cx))?;
        if !this.write_closed {
            this.write_closed = true;
            this.conn.close_write()?;
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for OverlayLink {
    fn drop(&mut self) {
        self.close();
    }
}
