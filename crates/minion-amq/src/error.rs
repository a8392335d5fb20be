//! Error types for broker operations

use thiserror::Error;

/// Broker client errors
#[derive(Debug, Clone, Error)]
pub enum AmqError {
    /// Could not reach or authenticate against the broker
    #[error("Broker connection error: {0}")]
    Connection(String),

    /// The broker refused or failed an operation
    #[error("Broker error: {0}")]
    Broker(String),

    /// No channel is open right now
    #[error("Broker channel not open")]
    ChannelClosed,
}

impl From<lapin::Error> for AmqError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::IOError(e) => Self::Connection(e.to_string()),
            lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
                Self::ChannelClosed
            }
            other => Self::Broker(other.to_string()),
        }
    }
}
