//! Error types for protocol operations

use thiserror::Error;
use crate::message::{ErrorCode, ErrorDetails};

/// Protocol-specific errors
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Underlying stream failed
    #[error("I/O error: {0}")]
    Io(String),

    /// Invalid frame format
    #[error("Invalid frame format")]
    InvalidFrame,

    /// Frame too large
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Actual frame size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// The connection carrying the channel went away
    #[error("Connection closed")]
    ConnectionClosed,

    /// A frame arrived for a channel that is not open
    #[error("Invalid channel ID: {0}")]
    InvalidChannelId(u32),

    /// The peer refused the handshake
    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    /// The peer answered with an error frame
    #[error("Remote error: {0}")]
    Remote(ErrorDetails),
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<ProtocolError> for ErrorDetails {
    fn from(error: ProtocolError) -> Self {
        match error {
            ProtocolError::Serialization(msg) => ErrorDetails::new(ErrorCode::InvalidRequest, msg),
            ProtocolError::Io(msg) => ErrorDetails::new(ErrorCode::ConnectionClosed, msg),
            ProtocolError::InvalidFrame => {
                ErrorDetails::new(ErrorCode::InvalidRequest, "Invalid frame format")
            }
            ProtocolError::FrameTooLarge { size, max } => ErrorDetails::new(
                ErrorCode::ResourceExhausted,
                format!("Frame too large: {} bytes (max: {})", size, max),
            ),
            ProtocolError::ConnectionClosed => {
                ErrorDetails::new(ErrorCode::ConnectionClosed, "Connection closed")
            }
            ProtocolError::InvalidChannelId(id) => {
                ErrorDetails::new(ErrorCode::InvalidRequest, format!("Invalid channel ID: {}", id))
            }
            ProtocolError::HandshakeRejected(msg) => ErrorDetails::new(ErrorCode::Unsupported, msg),
            ProtocolError::Remote(details) => details,
        }
    }
}
