//! Overlay error codes
//!
//! The overlay SDK reports failures as negative integer codes. `OverlayError`
//! gives the codes the core reacts to their own variants and keeps the rest
//! as `Other(code)`; every code renders through [`error_str`].

use std::fmt;
use thiserror::Error;

/// Overlay-layer errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OverlayError {
    NotAuthorized,
    ControllerUnavailable,
    GatewayUnavailable,
    ServiceUnavailable,
    Eof,
    Timeout,
    ConnAbort,
    InvalidState,
    CryptoFail,
    ConnClosed,
    AllocFailed,
    Other(i32),
}

impl fmt::Display for OverlayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "{} ({})", error_str(*code), code),
            _ => f.write_str(error_str(self.code())),
        }
    }
}

/// Result type for overlay operations
pub type OverlayResult<T> = Result<T, OverlayError>;

impl OverlayError {
    pub const OK: i32 = 0;
    pub const CONFIG_NOT_FOUND: i32 = -1;
    pub const INVALID_CONFIG: i32 = -13;
    pub const AUTHENTICATION_FAILED: i32 = -14;
    pub const NOT_AUTHORIZED: i32 = -15;
    pub const CONTROLLER_UNAVAILABLE: i32 = -16;
    pub const GATEWAY_UNAVAILABLE: i32 = -17;
    pub const SERVICE_UNAVAILABLE: i32 = -18;
    pub const EOF: i32 = -19;
    pub const TIMEOUT: i32 = -20;
    pub const CONN_ABORT: i32 = -21;
    pub const INVALID_STATE: i32 = -22;
    pub const CRYPTO_FAIL: i32 = -23;
    pub const CONN_CLOSED: i32 = -24;
    pub const NOT_FOUND: i32 = -29;
    pub const DISABLED: i32 = -30;
    pub const ALLOC_FAILED: i32 = -38;
    pub const WTF: i32 = -111;

    /// Map a numeric overlay status to an error. `None` for non-negative
    /// values, which are successes (byte counts or OK).
    pub fn from_code(code: i32) -> Option<Self> {
        let err = match code {
            c if c >= Self::OK => return None,
            Self::NOT_AUTHORIZED => Self::NotAuthorized,
            Self::CONTROLLER_UNAVAILABLE => Self::ControllerUnavailable,
            Self::GATEWAY_UNAVAILABLE => Self::GatewayUnavailable,
            Self::SERVICE_UNAVAILABLE => Self::ServiceUnavailable,
            Self::EOF => Self::Eof,
            Self::TIMEOUT => Self::Timeout,
            Self::CONN_ABORT => Self::ConnAbort,
            Self::INVALID_STATE => Self::InvalidState,
            Self::CRYPTO_FAIL => Self::CryptoFail,
            Self::CONN_CLOSED => Self::ConnClosed,
            Self::ALLOC_FAILED => Self::AllocFailed,
            other => Self::Other(other),
        };
        Some(err)
    }

    /// The numeric code of this error
    pub fn code(&self) -> i32 {
        match self {
            Self::NotAuthorized => Self::NOT_AUTHORIZED,
            Self::ControllerUnavailable => Self::CONTROLLER_UNAVAILABLE,
            Self::GatewayUnavailable => Self::GATEWAY_UNAVAILABLE,
            Self::ServiceUnavailable => Self::SERVICE_UNAVAILABLE,
            Self::Eof => Self::EOF,
            Self::Timeout => Self::TIMEOUT,
            Self::ConnAbort => Self::CONN_ABORT,
            Self::InvalidState => Self::INVALID_STATE,
            Self::CryptoFail => Self::CRYPTO_FAIL,
            Self::ConnClosed => Self::CONN_CLOSED,
            Self::AllocFailed => Self::ALLOC_FAILED,
            Self::Other(code) => *code,
        }
    }
}

impl From<OverlayError> for std::io::Error {
    fn from(err: OverlayError) -> Self {
        let kind = match err {
            OverlayError::Eof => std::io::ErrorKind::UnexpectedEof,
            OverlayError::Timeout => std::io::ErrorKind::TimedOut,
            OverlayError::ConnAbort => std::io::ErrorKind::ConnectionAborted,
            OverlayError::ConnClosed => std::io::ErrorKind::BrokenPipe,
            OverlayError::NotAuthorized => std::io::ErrorKind::PermissionDenied,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

/// Human-readable description of an overlay status code
pub fn error_str(code: i32) -> &'static str {
    match code {
        0 => "OK",
        -1 => "configuration not found",
        -2 => "JWT not found",
        -3 => "JWT not accepted by controller",
        -4 => "JWT has invalid format",
        -5 => "PKCS7/ASN.1 parsing failed",
        -6 => "unsupported JWT signing algorithm",
        -7 => "JWT verification failed",
        -8 => "unsupported enrollment method",
        -9 => "enrollment method requires certificate",
        -10 => "error generating private key",
        -11 => "error loading TLS key",
        -12 => "error generating a CSR",
        -13 => "configuration is invalid",
        -14 => "failed to authenticate",
        -15 => "not authorized",
        -16 => "controller is not available",
        -17 => "edge router is not available",
        -18 => "service not available",
        -19 => "end of data",
        -20 => "operation did not complete in time",
        -21 => "connection to edge router terminated",
        -22 => "invalid state",
        -23 => "crypto failure",
        -24 => "connection is closed",
        -25 => "failed posture check",
        -26 => "an MFA enrollment already exists",
        -27 => "the token provided was invalid",
        -28 => "the current identity has not completed MFA enrollment",
        -29 => "entity no longer exists or is no longer accessible",
        -30 => "context is disabled",
        -31 => "api session is partially authenticated, waiting for auth query resolution",
        -32 => "the authenticator could not be extended as it is the incorrect type",
        -33 => "the authenticator could not be extended as the current client certificate does not match",
        -34 => "the active certificate and key could not be set, invalid pair, or could not parse",
        -35 => "the provided certificate already in use",
        -36 => "the provided key/cert are invalid",
        -37 => "the certificate is expected to contain an externalId but none was found",
        -38 => "memory allocation failed",
        -39 => "identity required external login",
        -111 => "WTF: programming error",
        _ => "unexpected error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping() {
        assert_eq!(OverlayError::from_code(0), None);
        assert_eq!(OverlayError::from_code(1024), None);
        assert_eq!(
            OverlayError::from_code(OverlayError::EOF),
            Some(OverlayError::Eof)
        );
        assert_eq!(
            OverlayError::from_code(-26),
            Some(OverlayError::Other(-26))
        );

        for code in [-15, -16, -17, -18, -19, -20, -21, -22, -23, -24, -38, -5] {
            let err = OverlayError::from_code(code).unwrap();
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn test_error_display() {
        assert_eq!(OverlayError::ConnClosed.to_string(), "connection is closed");
        assert_eq!(
            OverlayError::ServiceUnavailable.to_string(),
            "service not available"
        );
        assert_eq!(
            OverlayError::Other(-27).to_string(),
            "the token provided was invalid (-27)"
        );
        assert_eq!(error_str(-9999), "unexpected error");
    }

    #[test]
    fn test_io_error_conversion() {
        let io: std::io::Error = OverlayError::Timeout.into();
        assert_eq!(io.kind(), std::io::ErrorKind::TimedOut);
        assert!(io.to_string().contains("did not complete in time"));
    }
}
