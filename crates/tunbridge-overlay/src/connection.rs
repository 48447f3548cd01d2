//! Overlay connection handle and its transport-side peer
//!
//! An overlay connection is created as a pair:
//!
//! ```text
//!   consumer (bridge / link)                 overlay transport
//! ┌──────────────────────┐   OverlayCommand  ┌──────────────────┐
//! │  OverlayConnection   │ ────────────────▶ │   OverlayPeer    │
//! │   .subscribe()       │ ◀──────────────── │  .deliver(event) │
//! │     events           │   OverlayEvent    │  req.complete()  │
//! │     completions      │ ◀──────────────── │                  │
//! └──────────────────────┘  WriteCompletion  └──────────────────┘
//! ```
//!
//! The consumer registers once through [`OverlayConnection::subscribe`];
//! a second registration is rejected. Writes are asynchronous: each
//! [`WriteRequest`] is answered by exactly one [`WriteCompletion`] carrying the
//! payload back, even when the transport drops the request unanswered.

use crate::error::{OverlayError, OverlayResult};
use crate::pool::PooledBuffer;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

/// Overlay connection identifier
pub type ConnId = u64;

/// Inbound event queue depth per connection
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique connection id
pub fn next_conn_id() -> ConnId {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Something delivered by the overlay to its consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayEvent {
    /// Bytes from the remote side
    Data(Bytes),
    /// The remote side will send nothing more
    Eof,
    /// The connection was already closed
    Closed,
    /// The overlay failed
    Error(OverlayError),
}

/// Payload of an overlay write
pub enum Payload {
    /// A pool lease from a bridge session; returns to its pool when dropped
    Pooled(PooledBuffer),
    Bytes(Bytes),
}

impl Payload {
    pub fn len(&self) -> usize {
        self.as_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AsRef<[u8]> for Payload {
    fn as_ref(&self) -> &[u8] {
        match self {
            Payload::Pooled(buf) => buf,
            Payload::Bytes(bytes) => bytes,
        }
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<PooledBuffer> for Payload {
    fn from(buf: PooledBuffer) -> Self {
        Payload::Pooled(buf)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Pooled(buf) => write!(f, "Pooled({} bytes)", buf.len()),
            Payload::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
        }
    }
}

/// Outcome of one overlay write, handing the payload back to its owner
#[derive(Debug)]
pub struct WriteCompletion {
    pub status: OverlayResult<usize>,
    pub payload: Payload,
}

/// A write waiting to be carried by the overlay transport.
///
/// Answered by [`WriteRequest::complete`]. A request dropped without an
/// answer completes with `ConnClosed`.
pub struct WriteRequest {
    payload: Option<Payload>,
    reply: mpsc::UnboundedSender<WriteCompletion>,
}

impl WriteRequest {
    pub fn data(&self) -> &[u8] {
        match &self.payload {
            Some(payload) => payload.as_ref(),
            None => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Report the outcome of this write to the consumer
    pub fn complete(mut self, status: OverlayResult<usize>) {
        self.send(status);
    }

    /// Take the payload back without answering. Used when the request never
    /// reached the transport and the caller reports the failure itself.
    fn dismiss(mut self) -> Option<Payload> {
        self.payload.take()
    }

    fn send(&mut self, status: OverlayResult<usize>) {
        if let Some(payload) = self.payload.take() {
            // Consumer gone: the payload is dropped here, which is its release.
            let _ = self.reply.send(WriteCompletion { status, payload });
        }
    }
}

impl Drop for WriteRequest {
    fn drop(&mut self) {
        self.send(Err(OverlayError::ConnClosed));
    }
}

impl fmt::Debug for WriteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteRequest")
            .field("len", &self.len())
            .finish()
    }
}

/// Requests sent from the consumer to the overlay transport
#[derive(Debug)]
pub enum OverlayCommand {
    Write(WriteRequest),
    /// Half-close: stop sending towards the remote side
    CloseWrite,
    /// Close the connection; `done` fires (or is dropped) once closed
    Close { done: oneshot::Sender<()> },
}

/// Resolves once the overlay confirmed a close request
#[derive(Debug)]
pub struct CloseTicket {
    rx: Option<oneshot::Receiver<()>>,
}

impl CloseTicket {
    /// A ticket for a connection that is already closed
    pub fn ready() -> Self {
        Self { rx: None }
    }

    pub fn pending(rx: oneshot::Receiver<()>) -> Self {
        Self { rx: Some(rx) }
    }
}

impl Future for CloseTicket {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match self.rx.as_mut() {
            None => Poll::Ready(()),
            Some(rx) => match Pin::new(rx).poll(cx) {
                // A dropped notifier means the transport is gone: closed too.
                Poll::Ready(_) => {
                    self.rx = None;
                    Poll::Ready(())
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// The receiving ends handed to the single consumer of a connection
#[derive(Debug)]
pub struct OverlaySubscription {
    pub events: mpsc::Receiver<OverlayEvent>,
    pub completions: mpsc::UnboundedReceiver<WriteCompletion>,
}

struct Shared {
    id: ConnId,
    subscription: Mutex<Option<OverlaySubscription>>,
    completions: mpsc::UnboundedSender<WriteCompletion>,
    close_requested: AtomicBool,
}

/// Consumer-side handle to one overlay connection. Cheap to clone; all
/// clones refer to the same connection.
#[derive(Clone)]
pub struct OverlayConnection {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<OverlayCommand>,
}

impl OverlayConnection {
    /// Create a connection and the peer that drives it, with the default
    /// event queue depth and a fresh id
    pub fn pair() -> (OverlayConnection, OverlayPeer) {
        Self::pair_with(next_conn_id(), DEFAULT_EVENT_CAPACITY)
    }

    pub fn pair_with(id: ConnId, event_capacity: usize) -> (OverlayConnection, OverlayPeer) {
        let (events_tx, events_rx) = mpsc::channel(event_capacity.max(1));
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            id,
            subscription: Mutex::new(Some(OverlaySubscription {
                events: events_rx,
                completions: completions_rx,
            })),
            completions: completions_tx,
            close_requested: AtomicBool::new(false),
        });

        let conn = OverlayConnection {
            shared,
            commands: commands_tx,
        };
        let peer = OverlayPeer {
            id,
            events: events_tx,
            commands: commands_rx,
        };
        (conn, peer)
    }

    pub fn id(&self) -> ConnId {
        self.shared.id
    }

    /// Register as the consumer of this connection.
    ///
    /// Fails with `ConnClosed` once the connection is closed and with
    /// `InvalidState` if another consumer already registered.
    pub fn subscribe(&self) -> OverlayResult<OverlaySubscription> {
        if self.is_closed() {
            return Err(OverlayError::ConnClosed);
        }
        self.shared
            .subscription
            .lock()
            .take()
            .ok_or(OverlayError::InvalidState)
    }

    /// Whether a consumer already registered
    pub fn is_subscribed(&self) -> bool {
        self.shared.subscription.lock().is_none()
    }

    /// Queue a write. The outcome arrives later as a [`WriteCompletion`] on
    /// the subscription. On `Err` no completion will follow and the payload
    /// has already been released.
    pub fn write(&self, payload: impl Into<Payload>) -> OverlayResult<()> {
        let request = WriteRequest {
            payload: Some(payload.into()),
            reply: self.shared.completions.clone(),
        };

        if self.shared.close_requested.load(Ordering::Acquire) {
            drop(request.dismiss());
            return Err(OverlayError::ConnClosed);
        }

        trace!(conn_id = self.id(), len = request.len(), "overlay write");
        match self.commands.send(OverlayCommand::Write(request)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(cmd)) => {
                if let OverlayCommand::Write(request) = cmd {
                    drop(request.dismiss());
                }
                Err(OverlayError::ConnClosed)
            }
        }
    }

    /// Half-close: tell the remote side we will send nothing more
    pub fn close_write(&self) -> OverlayResult<()> {
        if self.shared.close_requested.load(Ordering::Acquire) {
            return Err(OverlayError::ConnClosed);
        }
        self.commands
            .send(OverlayCommand::CloseWrite)
            .map_err(|_| OverlayError::ConnClosed)
    }

    /// Close the connection. The returned ticket resolves when the transport
    /// confirmed; closing twice yields an already-resolved ticket.
    pub fn close(&self) -> CloseTicket {
        if self.shared.close_requested.swap(true, Ordering::AcqRel) {
            return CloseTicket::ready();
        }

        let (done, rx) = oneshot::channel();
        match self.commands.send(OverlayCommand::Close { done }) {
            Ok(()) => CloseTicket::pending(rx),
            Err(_) => CloseTicket::ready(),
        }
    }

    /// Closed by us, or the transport went away
    pub fn is_closed(&self) -> bool {
        self.shared.close_requested.load(Ordering::Acquire) || self.commands.is_closed()
    }
}

impl fmt::Debug for OverlayConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayConnection")
            .field("id", &self.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Transport-side end of an overlay connection
#[derive(Debug)]
pub struct OverlayPeer {
    id: ConnId,
    events: mpsc::Sender<OverlayEvent>,
    commands: mpsc::UnboundedReceiver<OverlayCommand>,
}

impl OverlayPeer {
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Deliver an event to the consumer, waiting for queue space
    pub async fn deliver(&self, event: OverlayEvent) -> OverlayResult<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| OverlayError::ConnClosed)
    }

    /// Next command from the consumer; `None` once every handle is gone
    pub async fn next_command(&mut self) -> Option<OverlayCommand> {
        self.commands.recv().await
    }

    pub fn try_next_command(&mut self) -> Option<OverlayCommand> {
        self.commands.try_recv().ok()
    }

    /// Split into the event sender and command receiver, for transports that
    /// pump both directions concurrently
    pub fn into_parts(
        self,
    ) -> (
        mpsc::Sender<OverlayEvent>,
        mpsc::UnboundedReceiver<OverlayCommand>,
    ) {
        (self.events, self.commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;

    #[test]
    fn test_single_consumer() {
        let (conn, _peer) = OverlayConnection::pair();
        assert!(!conn.is_subscribed());

        let _sub = conn.subscribe().unwrap();
        assert!(conn.is_subscribed());

        let again = conn.clone().subscribe();
        assert_eq!(again.unwrap_err(), OverlayError::InvalidState);
    }

    #[test]
    fn test_subscribe_after_close() {
        let (conn, _peer) = OverlayConnection::pair();
        let _ticket = conn.close();
        assert_eq!(conn.subscribe().unwrap_err(), OverlayError::ConnClosed);
    }

    #[tokio::test]
    async fn test_write_completion_round_trip() {
        let (conn, mut peer) = OverlayConnection::pair();
        let mut sub = conn.subscribe().unwrap();

        conn.write(Bytes::from_static(b"ping")).unwrap();

        match peer.next_command().await {
            Some(OverlayCommand::Write(req)) => {
                assert_eq!(req.data(), b"ping");
                req.complete(Ok(4));
            }
            other => panic!("unexpected command: {:?}", other),
        }

        let done = sub.completions.recv().await.unwrap();
        assert_eq!(done.status, Ok(4));
        assert_eq!(done.payload.as_ref(), b"ping");
    }

    #[tokio::test]
    async fn test_dropped_request_completes_with_conn_closed() {
        let pool = BufferPool::with_capacity(1, 16);
        let (conn, mut peer) = OverlayConnection::pair();
        let mut sub = conn.subscribe().unwrap();

        conn.write(pool.acquire().unwrap()).unwrap();
        assert_eq!(pool.available(), 0);

        let cmd = peer.next_command().await.unwrap();
        drop(cmd);

        let done = sub.completions.recv().await.unwrap();
        assert_eq!(done.status, Err(OverlayError::ConnClosed));
        drop(done);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_write_after_peer_gone_releases_payload() {
        let pool = BufferPool::with_capacity(1, 16);
        let (conn, peer) = OverlayConnection::pair();
        let mut sub = conn.subscribe().unwrap();
        drop(peer);

        let err = conn.write(pool.acquire().unwrap()).unwrap_err();
        assert_eq!(err, OverlayError::ConnClosed);
        assert_eq!(pool.available(), 1);
        assert!(sub.completions.try_recv().is_err());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_close_ticket() {
        let (conn, mut peer) = OverlayConnection::pair();
        let ticket = conn.close();

        match peer.next_command().await {
            Some(OverlayCommand::Close { done }) => done.send(()).unwrap(),
            other => panic!("unexpected command: {:?}", other),
        }
        ticket.await;

        // Second close resolves immediately and sends nothing
        conn.close().await;
        assert!(peer.try_next_command().is_none());
        assert_eq!(
            conn.write(Bytes::from_static(b"late")).unwrap_err(),
            OverlayError::ConnClosed
        );
    }

    #[tokio::test]
    async fn test_events_in_order() {
        let (conn, peer) = OverlayConnection::pair();
        let mut sub = conn.subscribe().unwrap();

        peer.deliver(OverlayEvent::Data(Bytes::from_static(b"a")))
            .await
            .unwrap();
        peer.deliver(OverlayEvent::Eof).await.unwrap();

        assert_eq!(
            sub.events.recv().await,
            Some(OverlayEvent::Data(Bytes::from_static(b"a")))
        );
        assert_eq!(sub.events.recv().await, Some(OverlayEvent::Eof));
    }
}
