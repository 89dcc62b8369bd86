//! Error types for the selector and the WebSocket session

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

use crate::selector::Direction;

/// Result type alias for selector and session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Selector and WebSocket error types
///
/// Errors are `Clone` because a session's close-reason can be awaited by
/// any number of parties, each of which receives its own copy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// I/O error from the underlying socket or poll handle
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
    /// A continuation for this direction is already pending on the descriptor
    #[error("descriptor {fd} already has a pending {direction:?} continuation")]
    AlreadyRegistered {
        /// Descriptor that was registered twice
        fd: RawFd,
        /// Direction of the duplicate registration
        direction: Direction,
    },
    /// The selector has been shut down
    #[error("selector closed")]
    SelectorClosed,
    /// The descriptor was deregistered while a continuation was pending
    #[error("descriptor deregistered")]
    Deregistered,
    /// Protocol violation
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    /// Invalid WebSocket frame
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),
    /// Invalid UTF-8 in a text frame or close reason
    #[error("invalid UTF-8 in text payload")]
    InvalidUtf8,
    /// Close code that may not appear on the wire
    #[error("invalid close code: {0}")]
    InvalidCloseCode(u16),
    /// Frame exceeds the configured maximum size
    #[error("frame too large")]
    FrameTooLarge,
    /// Stream ended without a close frame
    #[error("connection closed abnormally (no close frame)")]
    ConnectionAbnormallyClosed,
    /// Channel was closed while an operation was in progress
    #[error("connection closed")]
    ConnectionClosed,
    /// The owning task cancelled the session
    #[error("session cancelled")]
    Cancelled,
    /// Requested session feature is not supported
    #[error("{0} is not supported")]
    CapabilityNotSupported(&'static str),
}

impl Error {
    /// Close status code a session sends when it fails with this error
    pub fn close_code(&self) -> u16 {
        match self {
            Error::Protocol(_) | Error::InvalidFrame(_) | Error::InvalidCloseCode(_) => {
                CloseReason::PROTOCOL_ERROR
            }
            Error::InvalidUtf8 => CloseReason::INVALID_PAYLOAD,
            Error::FrameTooLarge => CloseReason::TOO_BIG,
            _ => CloseReason::INTERNAL,
        }
    }
}

/// Close frame reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Optional reason string
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g., server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data
    pub const UNSUPPORTED: u16 = 1003;
    /// No status received (never sent on the wire)
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure (never sent on the wire)
    pub const ABNORMAL: u16 = 1006;
    /// Invalid frame payload
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation
    pub const POLICY: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Mandatory extension
    pub const EXTENSION: u16 = 1010;
    /// Internal error, also used when the owning task fails
    pub const INTERNAL: u16 = 1011;
    /// Service restart
    pub const SERVICE_RESTART: u16 = 1012;
    /// Try again later
    pub const TRY_AGAIN_LATER: u16 = 1013;
    /// TLS handshake failure (never sent on the wire)
    pub const TLS_HANDSHAKE: u16 = 1015;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Check if the close code may be carried in a close frame
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }

    /// Reserved or protocol-internal codes that must never appear on the wire
    pub fn is_reserved(code: u16) -> bool {
        !Self::is_valid_code(code)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            _ => Error::Io(Arc::new(e)),
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(inner) => io::Error::new(inner.kind(), inner.to_string()),
            Error::ConnectionClosed => io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"),
            Error::SelectorClosed | Error::Deregistered => {
                io::Error::new(io::ErrorKind::NotConnected, e.to_string())
            }
            Error::AlreadyRegistered { .. } => io::Error::new(io::ErrorKind::AlreadyExists, e.to_string()),
            Error::CapabilityNotSupported(_) => io::Error::new(io::ErrorKind::Unsupported, e.to_string()),
            other => io::Error::other(other.to_string()),
        }
    }
}
