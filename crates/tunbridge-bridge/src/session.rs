//! Bridge sessions
//!
//! [`bridge`] attaches an overlay connection to an external endpoint and
//! spawns one task that owns the [`BridgeEngine`] for the whole session. The
//! task waits on whichever side is ready, feeds the engine, and once the
//! engine closed it waits for the overlay to confirm before dropping the
//! session state.

use crate::config::BridgeConfig;
use crate::endpoint::ExternalEndpoint;
use crate::engine::{BridgeEngine, EndpointKind, ExternalIo, ExternalRead, OverlayData, ReadFlow};
use crate::error::{BridgeError, BridgeResult, CloseReason};
use bytes::{Buf, Bytes};
use std::fmt;
use std::io;
use std::os::fd::OwnedFd;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, info_span, warn, Instrument};
use tunbridge_overlay::{ConnId, OverlayConnection, OverlayError, OverlayEvent, OverlaySubscription};

type Engine = BridgeEngine<OverlayConnection, ExternalEndpoint>;

enum Control {
    SetIdleTimeout(Duration),
    Describe(oneshot::Sender<BridgeResult<String>>),
    Close,
}

/// Bridge `conn` to `endpoint`. The session runs on its own task until both
/// sides finished, an error occurred, the idle timeout expired or the handle
/// asked it to close.
///
/// Must be called within a tokio runtime.
pub fn bridge(
    conn: OverlayConnection,
    endpoint: ExternalEndpoint,
    config: &BridgeConfig,
) -> BridgeResult<BridgeHandle> {
    config.validate().map_err(BridgeError::InvalidArgument)?;

    let conn_id = conn.id();
    let subscription = conn.subscribe().map_err(|e| match e {
        OverlayError::InvalidState => {
            BridgeError::InvalidState("overlay connection is already bridged".to_string())
        }
        e => {
            warn!(conn_id, "failed to bridge overlay connection: {}", e);
            BridgeError::ConnectionReset(e.to_string())
        }
    })?;

    let span = info_span!("bridge", conn_id);
    let engine = span.in_scope(|| BridgeEngine::attach(conn, endpoint, config))?;

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = watch::channel(None);

    tokio::spawn(run_session(engine, subscription, control_rx, closed_tx).instrument(span));

    Ok(BridgeHandle {
        conn_id,
        control: control_tx,
        closed: closed_rx,
    })
}

/// Bridge `conn` to a single connected socket descriptor. `on_release` runs
/// once the descriptor is closed.
pub fn bridge_fd<F>(
    conn: OverlayConnection,
    fd: OwnedFd,
    config: &BridgeConfig,
    on_release: F,
) -> BridgeResult<BridgeHandle>
where
    F: FnOnce() + Send + Sync + 'static,
{
    let endpoint = ExternalEndpoint::from_fd(fd)?.with_release(on_release);
    bridge(conn, endpoint, config)
}

/// Bridge `conn` to an input and an output descriptor, such as the stdio of
/// a child process. `on_release` runs once both are closed.
pub fn bridge_fds<F>(
    conn: OverlayConnection,
    input: OwnedFd,
    output: OwnedFd,
    config: &BridgeConfig,
    on_release: F,
) -> BridgeResult<BridgeHandle>
where
    F: FnOnce() + Send + Sync + 'static,
{
    let endpoint = ExternalEndpoint::from_fds(input, output)?.with_release(on_release);
    bridge(conn, endpoint, config)
}

async fn run_session(
    mut engine: Engine,
    mut subscription: OverlaySubscription,
    mut control: mpsc::UnboundedReceiver<Control>,
    closed: watch::Sender<Option<CloseReason>>,
) {
    info!("bridge connected");

    // Overlay data the external side did not take yet
    let mut pending: Option<Bytes> = None;
    let mut control_open = true;

    while !engine.is_closed() {
        let reading = engine.read_flow() == ReadFlow::Flowing;
        let deadline = engine.idle_deadline();

        tokio::select! {
            res = engine.external().readable(), if reading => match res {
                Ok(()) => read_external(&mut engine),
                Err(e) => engine.on_external_read(ExternalRead::Error(e, None)),
            },
            res = engine.external().writable(), if pending.is_some() => match res {
                Ok(()) => {
                    if let Some(bytes) = pending.take() {
                        pending = deliver(&mut engine, bytes);
                    }
                }
                Err(e) => {
                    warn!("external endpoint not writable: {}", e);
                    engine.close(CloseReason::ExternalError);
                }
            },
            event = subscription.events.recv(), if pending.is_none() => match event {
                Some(OverlayEvent::Data(bytes)) => pending = deliver(&mut engine, bytes),
                Some(OverlayEvent::Eof) => {
                    let _ = engine.on_overlay_data(OverlayData::Eof);
                }
                Some(OverlayEvent::Closed) | None => {
                    let _ = engine.on_overlay_data(OverlayData::Closed);
                }
                Some(OverlayEvent::Error(e)) => {
                    let _ = engine.on_overlay_data(OverlayData::Error(e));
                }
            },
            Some(done) = subscription.completions.recv() => {
                engine.on_overlay_write_complete(done.status, done.payload);
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                engine.on_idle_expired(Instant::now());
            }
            cmd = control.recv(), if control_open => match cmd {
                Some(Control::SetIdleTimeout(timeout)) => engine.set_idle_timeout(timeout),
                Some(Control::Describe(reply)) => {
                    let _ = reply.send(engine.describe());
                }
                Some(Control::Close) => engine.close(CloseReason::Requested),
                None => control_open = false,
            },
        }
    }

    let reason = engine.close_reason().unwrap_or(CloseReason::Requested);
    if let Some(ticket) = engine.take_close_ticket() {
        ticket.await;
    }
    // Completions still queued hold leases; dropping them refills the pool.
    drop(subscription);
    drop(engine);
    drop(control);

    if reason.is_clean() {
        info!(%reason, "bridge closed");
    } else {
        warn!(%reason, "bridge closed");
    }
    let _ = closed.send(Some(reason));
}

fn read_external(engine: &mut Engine) {
    let Some(mut buf) = engine.alloc() else {
        engine.on_external_read(ExternalRead::NoBuffer);
        return;
    };

    let read = match engine.external().try_read(buf.spare_mut()) {
        Ok(0) if engine.external().kind() == EndpointKind::Stream => ExternalRead::Eof(buf),
        Ok(n) => {
            buf.set_len(n);
            ExternalRead::Data(buf)
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => ExternalRead::WouldBlock(buf),
        Err(e) => ExternalRead::Error(e, Some(buf)),
    };
    engine.on_external_read(read);
}

/// Offer overlay data to the external side; returns what it did not accept
fn deliver(engine: &mut Engine, mut bytes: Bytes) -> Option<Bytes> {
    match engine.on_overlay_data(OverlayData::Data(&bytes)) {
        Ok(n) if n < bytes.len() => {
            bytes.advance(n);
            Some(bytes)
        }
        Ok(_) => None,
        Err(e) => {
            debug!("dropping overlay data: {}", e);
            None
        }
    }
}

/// Controls a running bridge session. Dropping the handle leaves the session
/// running.
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    conn_id: ConnId,
    control: mpsc::UnboundedSender<Control>,
    closed: watch::Receiver<Option<CloseReason>>,
}

impl fmt::Debug for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Control::SetIdleTimeout(t) => f.debug_tuple("SetIdleTimeout").field(t).finish(),
            Control::Describe(_) => f.write_str("Describe"),
            Control::Close => f.write_str("Close"),
        }
    }
}

impl BridgeHandle {
    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// Close the session after `timeout` without traffic. Zero disables.
    pub fn set_idle_timeout(&self, timeout: Duration) -> BridgeResult<()> {
        self.send(Control::SetIdleTimeout(timeout))
    }

    /// Protocol and addresses of the external endpoint, e.g.
    /// `udp: 10.0.0.2:5000 -> 10.0.0.9:9000`
    pub async fn describe(&self) -> BridgeResult<String> {
        let (tx, rx) = oneshot::channel();
        self.send(Control::Describe(tx))?;
        rx.await.map_err(|_| session_gone())?
    }

    /// Ask the session to close. Returns immediately; see [`BridgeHandle::closed`].
    pub fn close(&self) {
        let _ = self.send(Control::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    /// Wait for the session to end
    pub async fn closed(&self) -> CloseReason {
        let mut closed = self.closed.clone();
        loop {
            if let Some(reason) = *closed.borrow_and_update() {
                return reason;
            }
            if closed.changed().await.is_err() {
                // Session task ended without reporting
                return (*closed.borrow()).unwrap_or(CloseReason::ExternalError);
            }
        }
    }

    fn send(&self, control: Control) -> BridgeResult<()> {
        self.control.send(control).map_err(|_| session_gone())
    }
}

fn session_gone() -> BridgeError {
    BridgeError::InvalidState("bridge session is closed".to_string())
}
