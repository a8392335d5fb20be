//! AMQP 0-9-1 broker backed by lapin

use crate::broker::{
    Acknowledge, Broker, BrokerChannel, BrokerConnection, BrokerParams, ConfirmFuture,
    Confirmation, Delivery, DeliveryStream,
};
use crate::AmqError;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicRejectOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// How often a channel re-checks its own status while waiting for closure
const STATUS_POLL: Duration = Duration::from_secs(1);

/// Dials real brokers through lapin on the ambient tokio runtime
#[derive(Debug, Default, Clone, Copy)]
pub struct LapinBroker;

impl BrokerParams {
    /// AMQP URI for these parameters
    pub fn to_uri(&self) -> AMQPUri {
        let userinfo = match &self.username {
            Some(username) => AMQPUserInfo {
                username: username.clone(),
                password: self.password.clone().unwrap_or_default(),
            },
            None => AMQPUserInfo::default(),
        };

        AMQPUri {
            scheme: AMQPScheme::AMQP,
            authority: AMQPAuthority {
                userinfo,
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.virtual_host.clone(),
            query: AMQPQueryString::default(),
        }
    }
}

#[async_trait]
impl Broker for LapinBroker {
    async fn connect(&self, params: &BrokerParams) -> Result<Arc<dyn BrokerConnection>, AmqError> {
        let properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);

        let connection = Connection::connect_uri(params.to_uri(), properties)
            .await
            .map_err(|e| AmqError::Connection(e.to_string()))?;

        let (closed_tx, closed_rx) = watch::channel(false);
        connection.on_error(move |err| {
            warn!("Broker connection error: {}", err);
            let _ = closed_tx.send(true);
        });

        debug!("Connected to broker at {}:{}", params.host, params.port);
        Ok(Arc::new(LapinConnection {
            connection,
            closed: closed_rx,
        }))
    }
}

struct LapinConnection {
    connection: Connection,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqError> {
        let channel = self.connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        Ok(Arc::new(LapinChannel {
            channel,
            closed: self.closed.clone(),
        }))
    }

    async fn close(&self) {
        if let Err(e) = self.connection.close(200, "closing").await {
            debug!("Broker connection close failed: {}", e);
        }
    }
}

struct LapinChannel {
    channel: Channel,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<ConfirmFuture, AmqError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default(),
            )
            .await?;

        Ok(Box::pin(async move {
            let confirmation = confirm.await?;
            Ok(if confirmation.is_nack() {
                Confirmation::Nack
            } else {
                Confirmation::Ack
            })
        }))
    }

    async fn declare_queue(&self, queue: &str, durable: bool) -> Result<(), AmqError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, no_ack: bool) -> Result<DeliveryStream, AmqError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|delivery| {
                let delivery = delivery?;
                Ok(Delivery::new(
                    delivery.delivery_tag,
                    delivery.data,
                    delivery.redelivered,
                    Box::new(LapinAcker(delivery.acker)),
                ))
            })
            .boxed())
    }

    async fn closed(&self) {
        let mut closed = self.closed.clone();
        loop {
            if *closed.borrow() || !self.channel.status().connected() {
                return;
            }
            tokio::select! {
                changed = closed.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(STATUS_POLL) => {}
            }
        }
    }
}

struct LapinAcker(lapin::acker::Acker);

#[async_trait]
impl Acknowledge for LapinAcker {
    async fn ack(&self) -> Result<(), AmqError> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqError> {
        self.0.reject(BasicRejectOptions { requeue }).await?;
        Ok(())
    }
}
