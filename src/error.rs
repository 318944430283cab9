//! Error types for the fixture server.
//!
//! This module defines all error conditions that can occur while accepting an
//! upgrade, running a scenario, or probing a server.

use thiserror::Error;

/// Result type alias for fixture operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while serving or probing a scenario.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Invalid frame structure or header.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Incomplete frame data.
    #[error("Incomplete frame: need {needed} more bytes")]
    IncompleteFrame {
        /// Number of additional bytes needed.
        needed: usize,
    },

    /// Reserved opcode used.
    #[error("Reserved opcode: {0:#x}")]
    ReservedOpcode(u8),

    /// Invalid opcode value.
    #[error("Invalid opcode: {0:#x}")]
    InvalidOpcode(u8),

    /// Frame size exceeds configured maximum.
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Invalid WebSocket handshake.
    #[error("Invalid handshake: {0}")]
    InvalidHandshake(String),

    /// Handshake data exceeds configured maximum.
    #[error("Handshake too large: {size} bytes (max: {max})")]
    HandshakeTooLarge {
        /// Actual handshake size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// A header value would break the HTTP framing.
    #[error("Invalid value for header {header}: {reason}")]
    InvalidHeaderValue {
        /// Header name.
        header: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// Origin header not in the allowed list.
    #[error("Origin not allowed: {origin}")]
    OriginNotAllowed {
        /// The offending origin.
        origin: String,
    },

    /// Invalid extension configuration or negotiation.
    #[error("Invalid extension: {0}")]
    InvalidExtension(String),

    /// No scenario is registered for the requested resource path.
    #[error("No scenario registered for {0}")]
    UnknownResource(String),

    /// The scenario refused the upgrade during its extra handshake.
    #[error("Scenario rejected handshake ({status}): {reason}")]
    ScenarioRejected {
        /// HTTP status code sent back to the client.
        status: u16,
        /// Human-readable reason, also used as the response body.
        reason: String,
    },

    /// Invalid server or scenario configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An operation did not complete within its configured timeout.
    #[error("Timed out during {0}")]
    Timeout(&'static str),

    /// Connection was closed by the peer before the exchange completed.
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// HTTP status code to answer a failed upgrade with.
    ///
    /// Returns `None` for errors that happen after the upgrade response
    /// has been sent or that leave no usable connection.
    #[must_use]
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Error::InvalidHandshake(_) | Error::InvalidExtension(_) => Some(400),
            Error::HandshakeTooLarge { .. } => Some(431),
            Error::OriginNotAllowed { .. } => Some(403),
            Error::UnknownResource(_) => Some(404),
            Error::ScenarioRejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(_: std::str::Utf8Error) -> Self {
        Error::InvalidHandshake("Invalid UTF-8".into())
    }
}
