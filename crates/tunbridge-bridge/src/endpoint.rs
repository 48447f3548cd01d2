//! External endpoints
//!
//! The local side of a bridge is either one duplex handle (a connected TCP
//! stream, connected UDP socket or Unix stream) or two unidirectional pipes
//! glued together, such as the stdio of a spawned process. Both shapes are
//! owned by [`ExternalEndpoint`] and released through one path.

use crate::engine::{EndpointKind, ExternalIo};
use crate::error::{BridgeError, BridgeResult};
use socket2::{Domain, SockRef, Socket, Type};
use std::fmt;
use std::fs::File;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::OwnedFd;
use tokio::net::unix::pipe;
use tokio::net::{TcpStream, UdpSocket, UnixStream};
use tracing::debug;

enum Io {
    Tcp(TcpStream),
    Udp(UdpSocket),
    Unix(UnixStream),
    Split {
        input: pipe::Receiver,
        /// `None` once the write direction was shut down
        output: Option<pipe::Sender>,
    },
    Released,
}

type ReleaseCallback = Box<dyn FnOnce() + Send + Sync>;

/// The local transport of a bridge session
pub struct ExternalEndpoint {
    io: Io,
    reading: bool,
    on_release: Option<ReleaseCallback>,
    /// Duplicates of descriptors we switched to non-blocking. The flag lives
    /// on the shared open file description, so it is cleared again on release.
    restore_blocking: Vec<OwnedFd>,
}

impl ExternalEndpoint {
    fn new(io: Io) -> Self {
        Self {
            io,
            reading: false,
            on_release: None,
            restore_blocking: Vec::new(),
        }
    }

    pub fn tcp(stream: TcpStream) -> Self {
        Self::new(Io::Tcp(stream))
    }

    /// A connected UDP socket. Unconnected sockets have no single peer to
    /// bridge to and are rejected.
    pub fn udp(socket: UdpSocket) -> BridgeResult<Self> {
        if let Err(e) = socket.peer_addr() {
            debug!("cannot bridge unconnected datagram socket: {}", e);
            return Err(BridgeError::InvalidArgument(
                "datagram socket is not connected".to_string(),
            ));
        }
        Ok(Self::new(Io::Udp(socket)))
    }

    pub fn unix(stream: UnixStream) -> Self {
        Self::new(Io::Unix(stream))
    }

    /// Adopt a single connected socket descriptor, whatever its type.
    ///
    /// Must be called within a tokio runtime.
    pub fn from_fd(fd: OwnedFd) -> BridgeResult<Self> {
        let socket = Socket::from(fd);

        let ty = socket.r#type().map_err(|e| {
            BridgeError::InvalidArgument(format!("descriptor is not a socket: {}", e))
        })?;
        let local = socket.local_addr()?;
        if let Err(e) = socket.peer_addr() {
            return Err(BridgeError::InvalidArgument(format!(
                "socket is not connected: {}",
                e
            )));
        }
        socket.set_nonblocking(true)?;

        let is_inet = local.as_socket().is_some();
        let is_unix = local.domain() == Domain::UNIX;
        let fd = OwnedFd::from(socket);

        let io = if ty == Type::STREAM && is_inet {
            Io::Tcp(TcpStream::from_std(fd.into())?)
        } else if ty == Type::DGRAM && is_inet {
            Io::Udp(UdpSocket::from_std(fd.into())?)
        } else if ty == Type::STREAM && is_unix {
            Io::Unix(UnixStream::from_std(fd.into())?)
        } else {
            return Err(BridgeError::InvalidArgument(format!(
                "unsupported socket type {:?}",
                ty
            )));
        };
        Ok(Self::new(io))
    }

    /// Glue an input and an output descriptor (pipes or ttys) into one
    /// duplex endpoint. Both are switched to non-blocking mode until the
    /// endpoint is released.
    ///
    /// Must be called within a tokio runtime.
    pub fn from_fds(input: OwnedFd, output: OwnedFd) -> BridgeResult<Self> {
        let mut restore_blocking = Vec::new();
        for fd in [&input, &output] {
            if switch_to_nonblocking(fd)? {
                restore_blocking.push(fd.try_clone()?);
            }
        }

        let input = pipe::Receiver::from_file_unchecked(File::from(input))?;
        let output = pipe::Sender::from_file_unchecked(File::from(output))?;
        let mut endpoint = Self::new(Io::Split {
            input,
            output: Some(output),
        });
        endpoint.restore_blocking = restore_blocking;
        Ok(endpoint)
    }

    /// Run `callback` once the endpoint's descriptors are released
    pub fn with_release<F>(mut self, callback: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        self.on_release = Some(Box::new(callback));
        self
    }

    pub fn is_reading(&self) -> bool {
        self.reading
    }

    pub fn is_released(&self) -> bool {
        matches!(self.io, Io::Released)
    }

    /// Wait until a read may make progress
    pub async fn readable(&self) -> io::Result<()> {
        match &self.io {
            Io::Tcp(s) => s.readable().await,
            Io::Udp(s) => s.readable().await,
            Io::Unix(s) => s.readable().await,
            Io::Split { input, .. } => input.readable().await,
            Io::Released => Err(released()),
        }
    }

    /// Non-blocking read. `Ok(0)` is end of stream (or an empty datagram).
    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.io {
            Io::Tcp(s) => s.try_read(buf),
            Io::Udp(s) => s.try_recv(buf),
            Io::Unix(s) => s.try_read(buf),
            Io::Split { input, .. } => input.try_read(buf),
            Io::Released => Err(released()),
        }
    }

    /// Wait until a write may make progress
    pub async fn writable(&self) -> io::Result<()> {
        match &self.io {
            Io::Tcp(s) => s.writable().await,
            Io::Udp(s) => s.writable().await,
            Io::Unix(s) => s.writable().await,
            Io::Split {
                output: Some(output),
                ..
            } => output.writable().await,
            Io::Split { output: None, .. } => Err(io::ErrorKind::BrokenPipe.into()),
            Io::Released => Err(released()),
        }
    }
}

impl ExternalIo for ExternalEndpoint {
    fn kind(&self) -> EndpointKind {
        match self.io {
            Io::Udp(_) => EndpointKind::Datagram,
            _ => EndpointKind::Stream,
        }
    }

    fn try_write(&mut self, data: &[u8]) -> io::Result<usize> {
        match &self.io {
            Io::Tcp(s) => s.try_write(data),
            Io::Udp(s) => s.try_send(data),
            Io::Unix(s) => s.try_write(data),
            Io::Split {
                output: Some(output),
                ..
            } => output.try_write(data),
            Io::Split { output: None, .. } => Err(io::ErrorKind::BrokenPipe.into()),
            Io::Released => Err(released()),
        }
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        match &mut self.io {
            Io::Tcp(s) => SockRef::from(&*s).shutdown(Shutdown::Write),
            Io::Unix(s) => SockRef::from(&*s).shutdown(Shutdown::Write),
            Io::Udp(_) => Ok(()),
            Io::Split { output, .. } => {
                // Closing our end of the pipe is the reader's end of stream
                drop(output.take());
                Ok(())
            }
            Io::Released => Err(released()),
        }
    }

    fn read_start(&mut self) -> io::Result<()> {
        if self.is_released() {
            return Err(released());
        }
        self.reading = true;
        Ok(())
    }

    fn read_stop(&mut self) {
        self.reading = false;
    }

    fn release(&mut self) {
        if self.is_released() {
            return;
        }
        debug!(kind = ?self.kind(), "releasing external endpoint");
        self.reading = false;
        self.io = Io::Released;

        for fd in self.restore_blocking.drain(..) {
            if let Err(e) = SockRef::from(&fd).set_nonblocking(false) {
                debug!("failed to restore blocking mode: {}", e);
            }
        }

        if let Some(callback) = self.on_release.take() {
            callback();
        }
    }

    fn describe(&self) -> BridgeResult<String> {
        match &self.io {
            Io::Tcp(s) => Ok(format!(
                "tcp: {} -> {}",
                fmt_addr(s.local_addr()?),
                fmt_addr(s.peer_addr()?)
            )),
            Io::Udp(s) => Ok(format!(
                "udp: {} -> {}",
                fmt_addr(s.local_addr()?),
                fmt_addr(s.peer_addr()?)
            )),
            Io::Unix(s) => {
                let peer = s.peer_addr().map_err(|e| {
                    BridgeError::InvalidState(format!("pipe has no peer: {}", e))
                })?;
                let name = peer
                    .as_pathname()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                Ok(format!("pipe: -> {}", name))
            }
            Io::Split { .. } => Err(BridgeError::InvalidState(
                "descriptor pair has no peer address".to_string(),
            )),
            Io::Released => Err(BridgeError::InvalidState(
                "endpoint released".to_string(),
            )),
        }
    }
}

impl Drop for ExternalEndpoint {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ExternalEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = match &self.io {
            Io::Tcp(_) => "tcp",
            Io::Udp(_) => "udp",
            Io::Unix(_) => "unix",
            Io::Split { .. } => "split",
            Io::Released => "released",
        };
        f.debug_struct("ExternalEndpoint")
            .field("shape", &shape)
            .field("reading", &self.reading)
            .finish()
    }
}

/// `ip:port`, without brackets around IPv6 hosts
fn fmt_addr(addr: SocketAddr) -> String {
    format!("{}:{}", addr.ip(), addr.port())
}

fn released() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "endpoint released")
}

/// Make `fd` non-blocking. Returns whether it was blocking before.
fn switch_to_nonblocking(fd: &OwnedFd) -> io::Result<bool> {
    let sock = SockRef::from(fd);
    if sock.nonblocking()? {
        return Ok(false);
    }
    sock.set_nonblocking(true)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_unconnected_udp_rejected() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let err = ExternalEndpoint::udp(socket).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_describe_udp() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.connect(b.local_addr().unwrap()).await.unwrap();

        let expected = format!(
            "udp: 127.0.0.1:{} -> 127.0.0.1:{}",
            a.local_addr().unwrap().port(),
            b.local_addr().unwrap().port()
        );
        let endpoint = ExternalEndpoint::udp(a).unwrap();
        assert_eq!(endpoint.kind(), EndpointKind::Datagram);
        assert_eq!(endpoint.describe().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_describe_tcp_and_released() {
        let (client, server) = tcp_pair().await;
        let expected = format!(
            "tcp: {} -> {}",
            fmt_addr(client.local_addr().unwrap()),
            fmt_addr(server.local_addr().unwrap())
        );

        let mut endpoint = ExternalEndpoint::tcp(client);
        assert_eq!(endpoint.describe().unwrap(), expected);

        endpoint.release();
        assert!(matches!(
            endpoint.describe(),
            Err(BridgeError::InvalidState(_))
        ));
        assert!(endpoint.read_start().is_err());
        drop(server);
    }

    #[test]
    fn test_fmt_addr_ipv6_without_brackets() {
        let addr: SocketAddr = "[::1]:8080".parse().unwrap();
        assert_eq!(fmt_addr(addr), "::1:8080");
    }

    #[tokio::test]
    async fn test_from_fd_classifies_sockets() {
        let (client, _server) = tcp_pair().await;
        let fd = OwnedFd::from(client.into_std().unwrap());
        let endpoint = ExternalEndpoint::from_fd(fd).unwrap();
        assert_eq!(endpoint.kind(), EndpointKind::Stream);
        assert!(endpoint.describe().unwrap().starts_with("tcp: 127.0.0.1:"));

        let a = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        a.connect("127.0.0.1:9").unwrap();
        let endpoint = ExternalEndpoint::from_fd(OwnedFd::from(a)).unwrap();
        assert_eq!(endpoint.kind(), EndpointKind::Datagram);

        let (left, _right) = std::os::unix::net::UnixStream::pair().unwrap();
        let endpoint = ExternalEndpoint::from_fd(OwnedFd::from(left)).unwrap();
        assert_eq!(endpoint.kind(), EndpointKind::Stream);
        assert!(endpoint.describe().unwrap().starts_with("pipe: -> "));
    }

    #[tokio::test]
    async fn test_from_fd_rejects_unsupported() {
        let file = tempfile::tempfile().unwrap();
        let err = ExternalEndpoint::from_fd(OwnedFd::from(file)).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let err = ExternalEndpoint::from_fd(OwnedFd::from(listener)).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));

        let unconnected = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let err = ExternalEndpoint::from_fd(OwnedFd::from(unconnected)).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_release_callback_runs_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let (client, _server) = tcp_pair().await;

        let counter = released.clone();
        let mut endpoint = ExternalEndpoint::tcp(client).with_release(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        endpoint.release();
        endpoint.release();
        drop(endpoint);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_from_fds_with_child_stdio() {
        let mut child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let to_child = OwnedFd::from(child.stdin.take().unwrap());
        let from_child = OwnedFd::from(child.stdout.take().unwrap());

        let mut endpoint = ExternalEndpoint::from_fds(from_child, to_child).unwrap();
        assert_eq!(endpoint.kind(), EndpointKind::Stream);
        assert!(matches!(
            endpoint.describe(),
            Err(BridgeError::InvalidState(_))
        ));

        endpoint.writable().await.unwrap();
        assert_eq!(endpoint.try_write(b"ping").unwrap(), 4);
        endpoint.shutdown_write().unwrap();
        assert!(endpoint.try_write(b"late").is_err());

        let mut received = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            endpoint.readable().await.unwrap();
            match endpoint.try_read(&mut buf) {
                Ok(0) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => panic!("read failed: {}", e),
            }
        }
        assert_eq!(received, b"ping");

        endpoint.release();
        child.wait().unwrap();
    }

    #[tokio::test]
    async fn test_from_fds_restores_blocking_mode() {
        let mut child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let to_child = OwnedFd::from(child.stdin.take().unwrap());
        let from_child = OwnedFd::from(child.stdout.take().unwrap());
        let watch_in = from_child.try_clone().unwrap();
        let watch_out = to_child.try_clone().unwrap();
        assert!(!SockRef::from(&watch_in).nonblocking().unwrap());

        let endpoint = ExternalEndpoint::from_fds(from_child, to_child).unwrap();
        assert!(SockRef::from(&watch_in).nonblocking().unwrap());
        assert!(SockRef::from(&watch_out).nonblocking().unwrap());

        drop(endpoint);
        assert!(!SockRef::from(&watch_in).nonblocking().unwrap());
        assert!(!SockRef::from(&watch_out).nonblocking().unwrap());

        drop(watch_out);
        child.wait().unwrap();
    }

    #[tokio::test]
    async fn test_from_fds_keeps_nonblocking_descriptors() {
        let mut child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let to_child = OwnedFd::from(child.stdin.take().unwrap());
        let from_child = OwnedFd::from(child.stdout.take().unwrap());
        SockRef::from(&from_child).set_nonblocking(true).unwrap();
        let watch_in = from_child.try_clone().unwrap();

        let endpoint = ExternalEndpoint::from_fds(from_child, to_child).unwrap();
        drop(endpoint);
        assert!(SockRef::from(&watch_in).nonblocking().unwrap());

        child.wait().unwrap();
    }
}
