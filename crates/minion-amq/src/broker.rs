//! Broker abstraction
//!
//! The publisher only talks to these traits, so the lapin client and the
//! in-memory broker used by tests are interchangeable.

use crate::AmqError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

/// Where and how to reach the broker
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerParams {
    /// Broker host
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Virtual host
    pub virtual_host: String,
    /// Login, guest access when unset
    pub username: Option<String>,
    /// Password for `username`
    pub password: Option<String>,
}

impl Default for BrokerParams {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            virtual_host: "/".to_string(),
            username: None,
            password: None,
        }
    }
}

/// Broker verdict on one published message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// The broker took responsibility for the message
    Ack,
    /// The broker refused the message
    Nack,
}

/// Resolves once the broker confirms a publish
pub type ConfirmFuture = BoxFuture<'static, Result<Confirmation, AmqError>>;

/// Messages pushed to a consumer
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqError>>;

/// Entry point for dialing a broker
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Open a connection
    async fn connect(&self, params: &BrokerParams) -> Result<Arc<dyn BrokerConnection>, AmqError>;
}

/// One live broker connection
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a channel with publisher confirms enabled
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqError>;

    /// Close the connection, ignoring errors
    async fn close(&self);
}

/// A channel on a broker connection
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Publish `body`; the returned future yields the broker's confirmation
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<ConfirmFuture, AmqError>;

    /// Declare `queue`, creating it if missing
    async fn declare_queue(&self, queue: &str, durable: bool) -> Result<(), AmqError>;

    /// Start consuming `queue`
    async fn consume(&self, queue: &str, no_ack: bool) -> Result<DeliveryStream, AmqError>;

    /// Resolves once the channel or its connection is gone
    async fn closed(&self);
}

/// Settles a delivery with the broker
#[async_trait]
pub trait Acknowledge: Send + Sync {
    /// Positive acknowledgement
    async fn ack(&self) -> Result<(), AmqError>;

    /// Negative acknowledgement, optionally returning the message to the queue
    async fn reject(&self, requeue: bool) -> Result<(), AmqError>;
}

/// A message handed to a consumer
pub struct Delivery {
    /// Broker-assigned tag
    pub delivery_tag: u64,
    /// Message body
    pub body: Vec<u8>,
    /// Whether the broker delivered this message before
    pub redelivered: bool,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    /// Wrap a message with the handle that settles it
    pub fn new(
        delivery_tag: u64,
        body: Vec<u8>,
        redelivered: bool,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            delivery_tag,
            body,
            redelivered,
            acker,
        }
    }

    /// Acknowledge the message
    pub async fn ack(&self) -> Result<(), AmqError> {
        self.acker.ack().await
    }

    /// Reject the message
    pub async fn reject(&self, requeue: bool) -> Result<(), AmqError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_default_to_local_guest_broker() {
        let params = BrokerParams::default();
        assert_eq!(params.host, "localhost");
        assert_eq!(params.port, 5672);
        assert_eq!(params.virtual_host, "/");
        assert!(params.username.is_none());
    }
}
