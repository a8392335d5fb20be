//! Error types for the minion runtime

use minion_proto::{ErrorCode, ErrorDetails, ProtocolError};
use std::time::Duration;
use thiserror::Error;

/// Main error type for minion operations
#[derive(Debug, Error)]
pub enum MinionError {
    /// Another agent holds the run-lock for this root
    #[error("Minion already running in {0}")]
    AlreadyRunning(String),

    /// Invalid or incomplete configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// No usable connection, or the connection went away
    #[error("Connection error: {0}")]
    Connection(String),

    /// The processor is tearing down
    #[error("Processor is shutting down")]
    ShuttingDown,

    /// The peer has no method under this name
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// The remote method failed
    #[error("Remote error: {0}")]
    Remote(ErrorDetails),

    /// A call outlived its deadline
    #[error("Timeout after {duration:?}")]
    Timeout {
        /// Duration that was exceeded
        duration: Duration,
    },

    /// Malformed traffic on a session
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// TLS setup or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// Unexpected internal failure
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MinionError {
    /// Re-raise a remote failure of `method` locally
    pub fn from_remote(method: &str, details: ErrorDetails) -> Self {
        match details.code {
            ErrorCode::MethodNotFound => Self::MethodNotFound(method.to_string()),
            _ => Self::Remote(details),
        }
    }

    /// Whether retrying on a fresh connection could help
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Io(_) | Self::Tls(_))
    }
}

impl From<ProtocolError> for MinionError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::ConnectionClosed => Self::Connection("connection closed".to_string()),
            ProtocolError::Io(msg) => Self::Connection(msg),
            ProtocolError::HandshakeRejected(msg) => {
                Self::Connection(format!("handshake rejected: {}", msg))
            }
            ProtocolError::Remote(details) => Self::Remote(details),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<MinionError> for ErrorDetails {
    fn from(err: MinionError) -> Self {
        let code = match &err {
            MinionError::ShuttingDown => ErrorCode::ResourceExhausted,
            MinionError::MethodNotFound(_) => ErrorCode::MethodNotFound,
            MinionError::Timeout { .. } => ErrorCode::Timeout,
            MinionError::Connection(_) => ErrorCode::ConnectionClosed,
            MinionError::Remote(details) => return details.clone(),
            _ => ErrorCode::HandlerFailed,
        };
        ErrorDetails::new(code, err.to_string())
    }
}

impl From<toml::de::Error> for MinionError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<rustls::Error> for MinionError {
    fn from(err: rustls::Error) -> Self {
        Self::Tls(err.to_string())
    }
}

impl From<nix::Error> for MinionError {
    fn from(err: nix::Error) -> Self {
        Self::Io(std::io::Error::from(err))
    }
}

impl From<minion_amq::AmqError> for MinionError {
    fn from(err: minion_amq::AmqError) -> Self {
        Self::Connection(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_method_not_found_is_distinguished() {
        let details = ErrorDetails::new(ErrorCode::MethodNotFound, "No method named `frobnicate`");
        let err = MinionError::from_remote("frobnicate", details);
        assert!(matches!(err, MinionError::MethodNotFound(ref m) if m == "frobnicate"));

        let details = ErrorDetails::new(ErrorCode::HandlerFailed, "boom");
        assert!(matches!(
            MinionError::from_remote("ping", details),
            MinionError::Remote(_)
        ));
    }

    #[test]
    fn test_closed_connection_maps_to_connection_error() {
        let err: MinionError = ProtocolError::ConnectionClosed.into();
        assert!(err.is_connection());
    }

    #[test]
    fn test_error_details_keep_remote_payload() {
        let details = ErrorDetails::new(ErrorCode::InvalidArguments, "missing `value`");
        let back: ErrorDetails = MinionError::Remote(details.clone()).into();
        assert_eq!(back, details);

        let shutdown: ErrorDetails = MinionError::ShuttingDown.into();
        assert_eq!(shutdown.code, ErrorCode::ResourceExhausted);
    }
}
