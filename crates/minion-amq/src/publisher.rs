//! Reliable publisher
//!
//! Keeps one broker connection alive, reconnecting after a fixed delay when
//! it drops. Publishes go out with publisher confirms and at most
//! `window` of them are awaiting a confirmation at any time; a caller that
//! would exceed the window waits until a confirmation frees a slot.
//!
//! Consumers registered through [`ReliablePublisher::consume`] are started
//! again on every new channel. Their callbacks run on the blocking thread
//! pool, so a slow callback never holds up the runtime.

use crate::broker::{Broker, BrokerChannel, BrokerConnection, BrokerParams, Confirmation, Delivery};
use crate::AmqError;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Maximum number of publishes awaiting a broker confirmation
pub const DEFAULT_WINDOW: u64 = 25;

/// Pause between losing the broker and dialing it again
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// How often a publisher blocked on a full window re-checks it
const WINDOW_POLL: Duration = Duration::from_millis(5);

/// Error type consumer callbacks may return
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type ConsumerCallback = Arc<dyn Fn(&Delivery) -> Result<bool, BoxError> + Send + Sync>;

type ChannelHook =
    Arc<dyn Fn(Arc<dyn BrokerChannel>) -> BoxFuture<'static, Result<(), AmqError>> + Send + Sync>;

/// Connection state as seen by the publisher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerStatus {
    /// No connection, possibly waiting to retry
    Disconnected,
    /// Dialing the broker
    Connecting,
    /// Connected, channel not open yet
    Open,
    /// Channel open with confirms enabled; publishes are accepted
    ChannelOpen,
}

/// Publish counters
///
/// `unacked == published - acked - nacked` holds for every snapshot.
/// Counters are never reset, reconnects included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    /// Messages handed to the broker
    pub published: u64,
    /// Confirmed by the broker
    pub acked: u64,
    /// Refused by the broker or lost with their channel
    pub nacked: u64,
    /// Awaiting a confirmation
    pub unacked: u64,
}

/// Tuning knobs for [`ReliablePublisher`]
#[derive(Debug, Clone, Copy)]
pub struct PublisherOptions {
    /// Maximum unconfirmed publishes
    pub window: u64,
    /// Pause before redialing
    pub reconnect_delay: Duration,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// Flow-controlled, reconnecting broker client
///
/// Cheap to clone; clones share the connection and counters.
#[derive(Clone)]
pub struct ReliablePublisher {
    inner: Arc<Inner>,
}

struct Inner {
    broker: Arc<dyn Broker>,
    params: BrokerParams,
    options: PublisherOptions,
    status: watch::Sender<BrokerStatus>,
    channel: RwLock<Option<Arc<dyn BrokerChannel>>>,
    counters: Mutex<PublisherStats>,
    publish_lock: tokio::sync::Mutex<()>,
    consumers: Mutex<Vec<Arc<Consumer>>>,
    on_channel_open: Mutex<Option<ChannelHook>>,
    maintainer: Mutex<Option<JoinHandle<()>>>,
}

struct Consumer {
    queue: String,
    acks: bool,
    callback: ConsumerCallback,
}

enum Verdict {
    Ack,
    Reject,
    Requeue,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ReliablePublisher {
    /// Create a publisher with default options; nothing is dialed until [`connect`](Self::connect)
    pub fn new(broker: Arc<dyn Broker>, params: BrokerParams) -> Self {
        Self::with_options(broker, params, PublisherOptions::default())
    }

    /// Create a publisher with explicit options
    pub fn with_options(
        broker: Arc<dyn Broker>,
        params: BrokerParams,
        options: PublisherOptions,
    ) -> Self {
        let (status, _) = watch::channel(BrokerStatus::Disconnected);
        Self {
            inner: Arc::new(Inner {
                broker,
                params,
                options,
                status,
                channel: RwLock::new(None),
                counters: Mutex::new(PublisherStats::default()),
                publish_lock: tokio::sync::Mutex::new(()),
                consumers: Mutex::new(Vec::new()),
                on_channel_open: Mutex::new(None),
                maintainer: Mutex::new(None),
            }),
        }
    }

    /// Run `hook` on every freshly opened channel, before consumers resume
    ///
    /// This is where exchanges and queues get declared. A failing hook
    /// counts as a failed connection attempt.
    pub fn on_channel_open<F, Fut>(&self, hook: F)
    where
        F: Fn(Arc<dyn BrokerChannel>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AmqError>> + Send + 'static,
    {
        let hook: ChannelHook = Arc::new(move |channel| hook(channel).boxed());
        *lock(&self.inner.on_channel_open) = Some(hook);
    }

    /// Start maintaining the broker connection in the background
    ///
    /// Returns immediately. Calling it again while the connection is being
    /// maintained has no effect.
    pub fn connect(&self) {
        let mut maintainer = lock(&self.inner.maintainer);
        if maintainer.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let inner = self.inner.clone();
        *maintainer = Some(tokio::spawn(inner.maintain()));
    }

    /// Stop reconnecting and drop the current channel
    pub fn close(&self) {
        if let Some(task) = lock(&self.inner.maintainer).take() {
            task.abort();
        }
        self.inner.replace_channel(None);
        self.inner.set_status(BrokerStatus::Disconnected);
    }

    /// Current connection state
    pub fn status(&self) -> BrokerStatus {
        *self.inner.status.borrow()
    }

    /// Wait until the connection reaches `wanted`
    pub async fn wait_for_status(&self, wanted: BrokerStatus) {
        let mut status = self.inner.status.subscribe();
        let _ = status.wait_for(|current| *current == wanted).await;
    }

    /// Snapshot of the publish counters
    pub fn stats(&self) -> PublisherStats {
        *lock(&self.inner.counters)
    }

    /// Publish `body` to `exchange` with `routing_key`
    ///
    /// Waits while the confirmation window is full. Returns `false` when no
    /// channel is open or the broker refused the publish outright; the
    /// broker's later verdict only shows up in [`stats`](Self::stats).
    pub async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> bool {
        // One publish at a time, so the window check and the send are atomic
        let _serial = self.inner.publish_lock.lock().await;

        while lock(&self.inner.counters).unacked >= self.inner.options.window {
            tokio::time::sleep(WINDOW_POLL).await;
        }

        let Some(channel) = self.inner.current_channel() else {
            debug!("Publish to {} dropped: channel not open", exchange);
            return false;
        };

        let confirm = match channel.publish(exchange, routing_key, body).await {
            Ok(confirm) => confirm,
            Err(e) => {
                warn!("Publish to {} failed: {}", exchange, e);
                return false;
            }
        };

        // Counted only once the broker has taken the message
        {
            let mut counters = lock(&self.inner.counters);
            counters.published += 1;
            counters.unacked += 1;
        }

        let publisher = self.clone();
        tokio::spawn(async move {
            let confirmation = match confirm.await {
                Ok(confirmation) => confirmation,
                // A channel that died before confirming never will
                Err(e) => {
                    debug!("Confirmation lost: {}", e);
                    Confirmation::Nack
                }
            };
            publisher.on_delivery_confirmation(confirmation);
        });

        true
    }

    /// Account for one broker confirmation
    ///
    /// Called once per successful publish. Extra confirmations with nothing
    /// in flight are ignored.
    pub fn on_delivery_confirmation(&self, confirmation: Confirmation) {
        let mut counters = lock(&self.inner.counters);
        if counters.unacked == 0 {
            warn!("Broker confirmation with nothing in flight");
            return;
        }

        counters.unacked -= 1;
        match confirmation {
            Confirmation::Ack => counters.acked += 1,
            Confirmation::Nack => counters.nacked += 1,
        }
    }

    /// Consume `queue`, handing each message to `callback`
    ///
    /// With `acks` set, `Ok(true)` acknowledges the message, `Ok(false)`
    /// rejects it for good, and an error or a panic rejects it back onto
    /// the queue. Returns `false` if no channel is open or the broker
    /// refused the consumer. Accepted consumers are restarted after every
    /// reconnect.
    ///
    /// The callback runs on tokio's blocking pool, one delivery at a time
    /// per consumer, so it may block without stalling other tasks.
    pub async fn consume<F>(&self, queue: &str, callback: F, acks: bool) -> bool
    where
        F: Fn(&Delivery) -> Result<bool, BoxError> + Send + Sync + 'static,
    {
        let consumer = Arc::new(Consumer {
            queue: queue.to_string(),
            acks,
            callback: Arc::new(callback),
        });

        let Some(channel) = self.inner.current_channel() else {
            debug!("Consumer on {} not started: channel not open", queue);
            return false;
        };

        match start_consumer(&channel, consumer.clone()).await {
            Ok(()) => {
                lock(&self.inner.consumers).push(consumer);
                true
            }
            Err(e) => {
                warn!("Failed to consume {}: {}", queue, e);
                false
            }
        }
    }
}

impl Inner {
    fn set_status(&self, status: BrokerStatus) {
        self.status.send_replace(status);
    }

    fn current_channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.channel
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace_channel(&self, channel: Option<Arc<dyn BrokerChannel>>) {
        *self.channel.write().unwrap_or_else(PoisonError::into_inner) = channel;
    }

    async fn maintain(self: Arc<Self>) {
        loop {
            self.set_status(BrokerStatus::Connecting);

            match self.establish().await {
                Ok((connection, channel)) => {
                    // Parked here for as long as the channel stays up
                    channel.closed().await;
                    warn!(
                        "Broker channel closed, reconnecting in {:?}",
                        self.options.reconnect_delay
                    );
                    self.replace_channel(None);
                    connection.close().await;
                }
                Err(e) => {
                    error!(
                        "Broker connection to {}:{} failed: {}",
                        self.params.host, self.params.port, e
                    );
                }
            }

            // Still reconnecting; Disconnected is reserved for close()
            self.set_status(BrokerStatus::Connecting);
            tokio::time::sleep(self.options.reconnect_delay).await;
        }
    }

    async fn establish(
        &self,
    ) -> Result<(Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>), AmqError> {
        let connection = self.broker.connect(&self.params).await?;
        self.set_status(BrokerStatus::Open);

        let channel = match self.open_channel(connection.as_ref()).await {
            Ok(channel) => channel,
            Err(e) => {
                connection.close().await;
                return Err(e);
            }
        };

        // Publishes may go out as soon as the channel is stored
        self.replace_channel(Some(channel.clone()));
        self.set_status(BrokerStatus::ChannelOpen);
        info!("Broker channel open on {}:{}", self.params.host, self.params.port);

        let consumers = lock(&self.consumers).clone();
        for consumer in consumers {
            if let Err(e) = start_consumer(&channel, consumer.clone()).await {
                warn!("Failed to resume consumer on {}: {}", consumer.queue, e);
            }
        }

        Ok((connection, channel))
    }

    async fn open_channel(
        &self,
        connection: &dyn BrokerConnection,
    ) -> Result<Arc<dyn BrokerChannel>, AmqError> {
        let channel = connection.open_channel().await?;
        let hook = lock(&self.on_channel_open).clone();
        if let Some(hook) = hook {
            hook(channel.clone()).await?;
        }
        Ok(channel)
    }
}

async fn start_consumer(
    channel: &Arc<dyn BrokerChannel>,
    consumer: Arc<Consumer>,
) -> Result<(), AmqError> {
    let mut deliveries = channel.consume(&consumer.queue, !consumer.acks).await?;
    debug!("Consuming {}", consumer.queue);

    tokio::spawn(async move {
        while let Some(delivery) = deliveries.next().await {
            match delivery {
                Ok(delivery) => consumer.dispatch(delivery).await,
                Err(e) => {
                    debug!("Consumer on {} stopped: {}", consumer.queue, e);
                    break;
                }
            }
        }
    });

    Ok(())
}

impl Consumer {
    async fn dispatch(&self, delivery: Delivery) {
        let callback = self.callback.clone();
        let joined = tokio::task::spawn_blocking(move || {
            // Catch the panic here so the delivery comes back to be settled
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(&delivery)));
            (delivery, outcome)
        })
        .await;

        let (delivery, outcome) = match joined {
            Ok(settled) => settled,
            Err(e) => {
                debug!("Consumer on {} dropped a delivery: {}", self.queue, e);
                return;
            }
        };

        let verdict = match outcome {
            Ok(Ok(true)) => Verdict::Ack,
            Ok(Ok(false)) => {
                warn!(
                    queue = %self.queue,
                    delivery_tag = delivery.delivery_tag,
                    "Message rejected by consumer"
                );
                Verdict::Reject
            }
            Ok(Err(e)) => {
                // Alternate form renders the whole source chain
                self.report_failure(&delivery, &format!("{:#}", anyhow::Error::from_boxed(e)));
                Verdict::Requeue
            }
            Err(payload) => {
                self.report_failure(&delivery, &panic_message(payload.as_ref()));
                Verdict::Requeue
            }
        };

        if !self.acks {
            return;
        }

        let settled = match verdict {
            Verdict::Ack => delivery.ack().await,
            Verdict::Reject => delivery.reject(false).await,
            Verdict::Requeue => delivery.reject(true).await,
        };
        if let Err(e) = settled {
            warn!(
                "Failed to settle delivery {} on {}: {}",
                delivery.delivery_tag, self.queue, e
            );
        }
    }

    fn report_failure(&self, delivery: &Delivery, reason: &str) {
        error!(
            critical = true,
            queue = %self.queue,
            delivery_tag = delivery.delivery_tag,
            body = %String::from_utf8_lossy(&delivery.body),
            "Consumer callback failed: {}",
            reason
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}
