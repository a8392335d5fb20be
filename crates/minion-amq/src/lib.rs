//! # Minion AMQ
//!
//! Broker-facing client for the minion agent: one reconnecting connection,
//! publisher confirms with a bounded in-flight window, and consumers whose
//! ack/reject decision follows the handler outcome.

#![warn(missing_docs)]

/// Broker abstraction and delivery types
pub mod broker;

/// lapin-backed broker implementation
pub mod amqp;

/// Reliable publisher and consumer state machine
pub mod publisher;

/// Error types for broker operations
pub mod error;

pub use amqp::LapinBroker;
pub use broker::{
    Acknowledge, Broker, BrokerChannel, BrokerConnection, BrokerParams, Confirmation, Delivery,
};
pub use error::AmqError;
pub use publisher::{
    BoxError, BrokerStatus, PublisherOptions, PublisherStats, ReliablePublisher,
    DEFAULT_RECONNECT_DELAY, DEFAULT_WINDOW,
};
