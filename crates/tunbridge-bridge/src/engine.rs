//! Bridge state machine
//!
//! `BridgeEngine` pairs one overlay connection with one external endpoint and
//! decides, for every event either side produces, what happens next. It does
//! no I/O scheduling of its own: the session driver (or a test) feeds it
//! external reads, overlay data and write completions, and the engine calls
//! back into the two sides through [`OverlayIo`] and [`ExternalIo`].
//!
//! ```text
//!   external ──read──▶ PooledBuffer ──write──▶ overlay
//!      ▲                    ▲                     │
//!      │                    └──── completion ─────┘  (releases the lease,
//!      │                                               resumes reads)
//!      └──────────── try_write ◀── overlay data
//! ```
//!
//! Backpressure: every external read leases a buffer from a fixed pool and
//! the lease is held until the overlay completes the write. When the pool is
//! empty reads stop, and only a write completion starts them again.
//!
//! End of stream: a stream endpoint closes once both directions reached EOF.
//! EOF on one side half-closes the other. Datagram endpoints close as soon as
//! either side reports EOF.

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult, CloseReason};
use std::io;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use tunbridge_overlay::{
    BufferPool, CloseTicket, OverlayConnection, OverlayError, OverlayResult, Payload, PooledBuffer,
};

/// Transport class of an external endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// Byte stream with half-close (TCP, Unix socket, pipe pair)
    Stream,
    /// Connected datagram socket; no half-close
    Datagram,
}

/// Whether the engine wants more data from the external side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFlow {
    Flowing,
    Stalled,
}

/// Observable lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Active,
    /// External side reached EOF; the overlay was told we send nothing more
    HalfClosedLocal,
    /// Overlay reached EOF; the external write side was shut down
    HalfClosedRemote,
    Closed,
}

/// The external side as the engine sees it
pub trait ExternalIo {
    fn kind(&self) -> EndpointKind;

    /// Non-blocking write. `ErrorKind::WouldBlock` means nothing was taken.
    fn try_write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Shut down the write direction
    fn shutdown_write(&mut self) -> io::Result<()>;

    fn read_start(&mut self) -> io::Result<()>;

    fn read_stop(&mut self);

    /// Give up the underlying descriptors. Called exactly once, on close.
    fn release(&mut self);

    fn describe(&self) -> BridgeResult<String>;
}

/// The overlay side as the engine sees it
pub trait OverlayIo {
    /// Issue a write carrying the lease. On `Err` the lease is already released.
    fn write(&mut self, buf: PooledBuffer) -> OverlayResult<()>;

    fn close_write(&mut self) -> OverlayResult<()>;

    fn close(&mut self) -> CloseTicket;
}

impl OverlayIo for OverlayConnection {
    fn write(&mut self, buf: PooledBuffer) -> OverlayResult<()> {
        OverlayConnection::write(self, buf)
    }

    fn close_write(&mut self) -> OverlayResult<()> {
        OverlayConnection::close_write(self)
    }

    fn close(&mut self) -> CloseTicket {
        OverlayConnection::close(self)
    }
}

/// Outcome of one read attempt on the external side. Every variant that
/// carries a buffer hands the lease back to the engine.
#[derive(Debug)]
pub enum ExternalRead {
    Data(PooledBuffer),
    WouldBlock(PooledBuffer),
    Eof(PooledBuffer),
    /// The pool had no buffer for this read
    NoBuffer,
    Error(io::Error, Option<PooledBuffer>),
}

/// Something the overlay delivered
#[derive(Debug)]
pub enum OverlayData<'a> {
    Data(&'a [u8]),
    Eof,
    Closed,
    Error(OverlayError),
}

/// Full-duplex coordinator between one overlay connection and one external
/// endpoint
pub struct BridgeEngine<O, E> {
    overlay: O,
    external: E,
    pool: BufferPool,
    overlay_eof: bool,
    external_eof: bool,
    read_flow: ReadFlow,
    close_reason: Option<CloseReason>,
    close_ticket: Option<CloseTicket>,
    idle_timeout: Duration,
    idle_deadline: Option<Instant>,
}

impl<O: OverlayIo, E: ExternalIo> BridgeEngine<O, E> {
    /// Pair `overlay` with `external` and start reading from the external side.
    /// The overlay consumer must already be registered.
    pub fn attach(overlay: O, external: E, config: &BridgeConfig) -> BridgeResult<Self> {
        config.validate().map_err(BridgeError::InvalidArgument)?;

        let mut engine = Self {
            overlay,
            external,
            pool: BufferPool::with_capacity(config.pool_size, config.buffer_size),
            overlay_eof: false,
            external_eof: false,
            read_flow: ReadFlow::Stalled,
            close_reason: None,
            close_ticket: None,
            idle_timeout: config.idle_timeout,
            idle_deadline: None,
        };

        if let Err(e) = engine.set_read_flow(ReadFlow::Flowing) {
            warn!("failed to start reading external endpoint: {}", e);
            engine.close(CloseReason::ExternalError);
            return Err(BridgeError::Transport(e));
        }
        engine.touch();

        debug!(
            pool_size = config.pool_size,
            buffer_size = config.buffer_size,
            idle_timeout_ms = config.idle_timeout.as_millis() as u64,
            "bridge attached"
        );
        Ok(engine)
    }

    /// Lease a buffer for the next external read
    pub fn alloc(&self) -> Option<PooledBuffer> {
        if self.is_closed() {
            return None;
        }
        self.pool.acquire()
    }

    pub fn on_external_read(&mut self, read: ExternalRead) {
        if self.is_closed() {
            return;
        }

        match read {
            ExternalRead::Data(buf) if buf.is_empty() => {}
            ExternalRead::Data(buf) => {
                self.touch();
                trace!(len = buf.len(), "external -> overlay");
                if let Err(e) = self.overlay.write(buf) {
                    warn!("overlay write failed: {}", e);
                    self.close(CloseReason::WriteFailed);
                }
            }
            ExternalRead::WouldBlock(_) => {}
            ExternalRead::Eof(_) => {
                self.touch();
                self.on_external_eof();
            }
            ExternalRead::NoBuffer => {
                debug!(
                    outstanding = self.pool.outstanding(),
                    "buffer pool exhausted, pausing external reads"
                );
                if let Err(e) = self.set_read_flow(ReadFlow::Stalled) {
                    warn!("failed to pause external reads: {}", e);
                    self.close(CloseReason::ExternalError);
                }
            }
            ExternalRead::Error(e, _) => {
                warn!("external read failed: {}", e);
                self.close(CloseReason::ExternalError);
            }
        }
    }

    fn on_external_eof(&mut self) {
        self.external_eof = true;
        debug!("external endpoint reached end of stream");

        if self.external.kind() == EndpointKind::Datagram {
            self.close(CloseReason::DatagramEof);
            return;
        }
        if self.overlay_eof {
            self.close(CloseReason::Completed);
            return;
        }

        let _ = self.set_read_flow(ReadFlow::Stalled);
        if let Err(e) = self.overlay.close_write() {
            warn!("overlay half-close failed: {}", e);
            self.close(CloseReason::OverlayError(e));
        }
    }

    /// Handle something the overlay delivered. For data, returns how many
    /// bytes the external side accepted; zero means it would block and the
    /// remainder must be offered again once the endpoint is writable.
    pub fn on_overlay_data(&mut self, data: OverlayData<'_>) -> BridgeResult<usize> {
        if self.is_closed() {
            return Err(BridgeError::InvalidState("bridge is closed".to_string()));
        }

        match data {
            OverlayData::Data(bytes) => {
                self.touch();
                if bytes.is_empty() {
                    return Ok(0);
                }
                if self.overlay_eof {
                    // Nothing may follow EOF; drop it as consumed
                    return Ok(bytes.len());
                }
                match self.external.try_write(bytes) {
                    Ok(n) => {
                        trace!(len = n, offered = bytes.len(), "overlay -> external");
                        Ok(n)
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
                    Err(e) => {
                        warn!("external write failed: {}", e);
                        self.close(CloseReason::ExternalError);
                        Err(BridgeError::Transport(e))
                    }
                }
            }
            OverlayData::Eof => {
                self.touch();
                self.on_overlay_eof();
                Ok(0)
            }
            OverlayData::Closed => {
                debug!("overlay connection already closed");
                self.close(CloseReason::OverlayClosed);
                Ok(0)
            }
            OverlayData::Error(e) => {
                warn!("overlay failed: {}", e);
                self.close(CloseReason::OverlayError(e));
                Err(BridgeError::Overlay(e))
            }
        }
    }

    fn on_overlay_eof(&mut self) {
        if self.overlay_eof {
            return;
        }
        self.overlay_eof = true;
        debug!("overlay reached end of stream");

        if self.external.kind() == EndpointKind::Datagram {
            self.close(CloseReason::DatagramEof);
            return;
        }
        if self.external_eof {
            self.close(CloseReason::Completed);
            return;
        }

        if let Err(e) = self.external.shutdown_write() {
            warn!("external shutdown failed: {}", e);
            self.close(CloseReason::ExternalError);
        }
    }

    /// Handle the completion of an overlay write. The payload is released here
    /// whatever the status; a successful completion is what resumes stalled
    /// reads.
    pub fn on_overlay_write_complete(&mut self, status: OverlayResult<usize>, payload: Payload) {
        drop(payload);

        if self.is_closed() {
            return;
        }

        match status {
            Ok(len) => {
                trace!(len, "overlay write complete");
                if self.read_flow == ReadFlow::Stalled && !self.external_eof {
                    debug!("buffer released, resuming external reads");
                    if let Err(e) = self.set_read_flow(ReadFlow::Flowing) {
                        warn!("failed to resume external reads: {}", e);
                        self.close(CloseReason::ExternalError);
                    }
                }
            }
            Err(e) => {
                warn!("overlay write completed with error: {}", e);
                self.close(CloseReason::WriteFailed);
            }
        }
    }

    /// The only place external reads are started or stopped
    fn set_read_flow(&mut self, flow: ReadFlow) -> io::Result<()> {
        let flow = if self.is_closed() || self.external_eof {
            ReadFlow::Stalled
        } else {
            flow
        };
        if flow == self.read_flow {
            return Ok(());
        }

        self.read_flow = flow;
        match flow {
            ReadFlow::Flowing => self.external.read_start(),
            ReadFlow::Stalled => {
                self.external.read_stop();
                Ok(())
            }
        }
    }

    /// Change the idle timeout. Zero disables it; otherwise the deadline is
    /// rearmed from now.
    pub fn set_idle_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = timeout;
        if timeout.is_zero() {
            self.idle_deadline = None;
        } else {
            self.touch();
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn idle_deadline(&self) -> Option<Instant> {
        self.idle_deadline
    }

    fn touch(&mut self) {
        if self.is_closed() || self.idle_timeout.is_zero() {
            return;
        }
        self.idle_deadline = Some(Instant::now() + self.idle_timeout);
    }

    /// Close the session if its idle deadline passed by `now`
    pub fn on_idle_expired(&mut self, now: Instant) -> bool {
        match self.idle_deadline {
            Some(deadline) if now >= deadline => {
                debug!(idle_timeout_ms = self.idle_timeout.as_millis() as u64, "idle timeout");
                self.close(CloseReason::IdleTimeout);
                true
            }
            _ => false,
        }
    }

    /// Tear the session down. Idempotent: only the first call has an effect.
    pub fn close(&mut self, reason: CloseReason) {
        if self.close_reason.is_some() {
            return;
        }
        debug!(%reason, "closing bridge");

        // Stop reads before marking closed so the endpoint sees read_stop.
        let _ = self.set_read_flow(ReadFlow::Stalled);
        self.close_reason = Some(reason);
        self.idle_deadline = None;

        self.external.release();
        self.close_ticket = Some(self.overlay.close());
    }

    /// The overlay close ticket, once closed. The owner waits on it before
    /// dropping the session.
    pub fn take_close_ticket(&mut self) -> Option<CloseTicket> {
        self.close_ticket.take()
    }

    pub fn describe(&self) -> BridgeResult<String> {
        if self.is_closed() {
            return Err(BridgeError::InvalidState("bridge is closed".to_string()));
        }
        self.external.describe()
    }

    pub fn state(&self) -> BridgeState {
        match (self.close_reason, self.external_eof, self.overlay_eof) {
            (Some(_), _, _) => BridgeState::Closed,
            (None, true, false) => BridgeState::HalfClosedLocal,
            (None, false, true) => BridgeState::HalfClosedRemote,
            (None, _, _) => BridgeState::Active,
        }
    }

    pub fn read_flow(&self) -> ReadFlow {
        self.read_flow
    }

    pub fn is_closed(&self) -> bool {
        self.close_reason.is_some()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn external(&self) -> &E {
        &self.external
    }
}
