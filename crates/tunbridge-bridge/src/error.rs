//! Bridge errors and close reasons

use std::fmt;
use thiserror::Error;
use tunbridge_overlay::{OverlayError, Protocol};

/// Errors surfaced by bridge and link operations
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Connection reset: {0}")]
    ConnectionReset(String),

    #[error("Idle timeout expired")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Overlay error: {0}")]
    Overlay(#[from] OverlayError),

    #[error("No service intercepts {protocol}:{host}:{port}")]
    ServiceUnavailable {
        protocol: Protocol,
        host: String,
        port: u16,
    },
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Why a bridge session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Both directions reached end of stream
    Completed,
    /// A datagram endpoint saw end of stream on either side
    DatagramEof,
    /// The overlay reported the connection already closed
    OverlayClosed,
    /// The overlay failed
    OverlayError(OverlayError),
    /// Reading from or writing to the external endpoint failed
    ExternalError,
    /// An overlay write could not be issued or completed with an error
    WriteFailed,
    /// No traffic within the idle timeout
    IdleTimeout,
    /// Closed on request of the owner
    Requested,
}

impl CloseReason {
    /// Whether the session ended without any failure
    pub fn is_clean(&self) -> bool {
        matches!(
            self,
            CloseReason::Completed
                | CloseReason::DatagramEof
                | CloseReason::OverlayClosed
                | CloseReason::Requested
        )
    }

    /// The error a caller sees for this ending, `Ok` for a clean one. Idle
    /// expiry becomes [`BridgeError::Timeout`].
    pub fn into_result(self) -> BridgeResult<()> {
        match self {
            CloseReason::IdleTimeout => Err(BridgeError::Timeout),
            CloseReason::OverlayError(e) => Err(BridgeError::Overlay(e)),
            CloseReason::ExternalError | CloseReason::WriteFailed => {
                Err(BridgeError::ConnectionReset(self.to_string()))
            }
            CloseReason::Completed
            | CloseReason::DatagramEof
            | CloseReason::OverlayClosed
            | CloseReason::Requested => Ok(()),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Completed => f.write_str("completed"),
            CloseReason::DatagramEof => f.write_str("datagram end of stream"),
            CloseReason::OverlayClosed => f.write_str("overlay connection closed"),
            CloseReason::OverlayError(e) => write!(f, "overlay error: {}", e),
            CloseReason::ExternalError => f.write_str("external endpoint error"),
            CloseReason::WriteFailed => f.write_str("overlay write failed"),
            CloseReason::IdleTimeout => f.write_str("idle timeout"),
            CloseReason::Requested => f.write_str("close requested"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = BridgeError::ServiceUnavailable {
            protocol: Protocol::Tcp,
            host: "example.com".to_string(),
            port: 80,
        };
        assert_eq!(err.to_string(), "No service intercepts tcp:example.com:80");

        let err: BridgeError = OverlayError::ConnClosed.into();
        assert_eq!(err.to_string(), "Overlay error: connection is closed");
    }

    #[test]
    fn test_close_reason_clean() {
        assert!(CloseReason::Completed.is_clean());
        assert!(!CloseReason::IdleTimeout.is_clean());
        assert!(!CloseReason::OverlayError(OverlayError::Timeout).is_clean());
        assert_eq!(CloseReason::IdleTimeout.to_string(), "idle timeout");
    }

    #[test]
    fn test_close_reason_into_result() {
        assert!(CloseReason::Completed.into_result().is_ok());
        assert!(CloseReason::Requested.into_result().is_ok());
        assert!(matches!(
            CloseReason::IdleTimeout.into_result(),
            Err(BridgeError::Timeout)
        ));
        assert!(matches!(
            CloseReason::OverlayError(OverlayError::ConnAbort).into_result(),
            Err(BridgeError::Overlay(OverlayError::ConnAbort))
        ));
        let err = CloseReason::WriteFailed.into_result().unwrap_err();
        assert_eq!(err.to_string(), "Connection reset: overlay write failed");
    }
}
