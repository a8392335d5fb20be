//! Logical channel multiplexing over one byte stream
//!
//! A [`Multiplexer`] turns a single bidirectional stream into many
//! concurrent request/response exchanges. Each exchange gets its own channel
//! id; the dialing side of a connection allocates odd ids and the accepting
//! side even ids, so both ends can open channels without colliding. A frame
//! whose id has our parity is the response to a channel we opened; any other
//! id is a new inbound request and is handed to the [`ChannelHandler`] on its
//! own task.
//!
//! The connection closes when the peer hangs up, when any handle calls
//! [`Multiplexer::close`], or when the last handle is dropped.

use crate::codec::FrameCodec;
use crate::frame::CONTROL_CHANNEL;
use crate::message::ErrorDetails;
use crate::{Frame, ProtocolError};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Which end of the connection this multiplexer runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The end that opened the connection (odd channel ids)
    Dialer,
    /// The end that accepted the connection (even channel ids)
    Acceptor,
}

impl Side {
    fn first_channel_id(self) -> u32 {
        match self {
            Self::Dialer => 1,
            Self::Acceptor => 2,
        }
    }

    /// Whether `channel_id` was allocated by this side
    pub fn owns(self, channel_id: u32) -> bool {
        channel_id % 2 == self.first_channel_id() % 2
    }
}

/// Callback invoked for every inbound request
#[async_trait::async_trait]
pub trait ChannelHandler: Send + Sync + 'static {
    /// Produce the single response for `request`
    ///
    /// `Err` is sent back as an error frame.
    async fn handle(&self, channel_id: u32, request: Bytes) -> Result<Bytes, ErrorDetails>;
}

type PendingReply = oneshot::Sender<Result<Bytes, ProtocolError>>;

#[derive(Default)]
struct Channels {
    pending: HashMap<u32, PendingReply>,
    closed: bool,
}

struct Shared {
    side: Side,
    next_channel_id: AtomicU32,
    channels: Mutex<Channels>,
    outbound: mpsc::UnboundedSender<Frame>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn channels(&self) -> MutexGuard<'_, Channels> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn allocate_id(&self) -> u32 {
        loop {
            // Stepping by two keeps the id on our side's parity
            let id = self.next_channel_id.fetch_add(2, Ordering::Relaxed);
            // Skipped once the counter wraps
            if id != CONTROL_CHANNEL {
                return id;
            }
        }
    }

    /// Fail every pending channel and refuse new ones
    fn close(&self) {
        // Collect under the lock, notify outside it
        let drained: Vec<PendingReply> = {
            let mut channels = self.channels();
            channels.closed = true;
            channels.pending.drain().map(|(_, tx)| tx).collect()
        };
        if !drained.is_empty() {
            debug!("Failing {} pending channels on close", drained.len());
        }
        for tx in drained {
            let _ = tx.send(Err(ProtocolError::ConnectionClosed));
        }
        // Wakes the run task; a no-op once it has finished
        let _ = self.shutdown.send(true);
    }

    fn deliver_response(&self, frame: Frame) {
        // Removing the slot makes a duplicate response a no-op
        let sender = self.channels().pending.remove(&frame.channel_id);
        let Some(sender) = sender else {
            debug!("Dropping response for unknown channel {}", frame.channel_id);
            return;
        };

        let result = if frame.is_error() {
            match rmp_serde::from_slice::<ErrorDetails>(&frame.payload) {
                Ok(details) => Err(ProtocolError::Remote(details)),
                Err(e) => Err(ProtocolError::Serialization(e.to_string())),
            }
        } else {
            Ok(frame.payload)
        };

        if sender.send(result).is_err() {
            debug!("Receiver for channel {} dropped", frame.channel_id);
        }
    }

    fn dispatch_request(&self, frame: Frame, handler: &Arc<dyn ChannelHandler>) {
        let handler = Arc::clone(handler);
        let outbound = self.outbound.clone();
        let channel_id = frame.channel_id;

        // Own task per request so a slow handler never holds up the reader
        tokio::spawn(async move {
            let reply = match handler.handle(channel_id, frame.payload).await {
                Ok(payload) => Frame::data(channel_id, payload),
                Err(details) => match rmp_serde::to_vec(&details) {
                    Ok(encoded) => Frame::error(channel_id, Bytes::from(encoded)),
                    Err(e) => {
                        warn!("Failed to encode error for channel {}: {}", channel_id, e);
                        return;
                    }
                },
            };
            if outbound.send(reply).is_err() {
                debug!("Connection gone before channel {} could reply", channel_id);
            }
        });
    }
}

/// Closes the connection once the last [`Multiplexer`] clone is gone
struct Handle(Arc<Shared>);

impl Drop for Handle {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Handle to a multiplexed connection
///
/// Cheap to clone; every clone opens channels on the same connection.
/// Dropping the last clone closes the connection.
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<Shared>,
    _handle: Arc<Handle>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("side", &self.shared.side)
            .field("open_channels", &self.open_channels())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Multiplexer {
    /// Take over `stream` and start serving it on a background task
    ///
    /// `codec` should be the codec used for the handshake so that bytes
    /// already buffered past the handshake are not lost. The returned task
    /// resolves when the connection ends; by then every pending channel has
    /// been failed with [`ProtocolError::ConnectionClosed`].
    pub fn spawn<S>(
        stream: S,
        side: Side,
        codec: FrameCodec,
        handler: Arc<dyn ChannelHandler>,
    ) -> (Self, JoinHandle<Result<(), ProtocolError>>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            side,
            next_channel_id: AtomicU32::new(side.first_channel_id()),
            channels: Mutex::new(Channels::default()),
            outbound,
            shutdown,
        });

        let task = tokio::spawn(Self::run(
            Arc::clone(&shared),
            stream,
            codec,
            handler,
            outbound_rx,
            shutdown_rx,
        ));

        let handle = Arc::new(Handle(Arc::clone(&shared)));
        (
            Self {
                shared,
                _handle: handle,
            },
            task,
        )
    }

    async fn run<S>(
        shared: Arc<Shared>,
        stream: S,
        mut codec: FrameCodec,
        handler: Arc<dyn ChannelHandler>,
        mut outbound_rx: mpsc::UnboundedReceiver<Frame>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        // The read side keeps the handshake codec and whatever it buffered
        let write_codec = FrameCodec::new();

        // Never ends on its own: `shared` keeps a sender alive
        let writing = async {
            while let Some(frame) = outbound_rx.recv().await {
                write_codec.write_frame(&mut writer, &frame).await?;
            }
            Ok::<(), ProtocolError>(())
        };

        let reading = async {
            loop {
                match codec.read_frame(&mut reader).await? {
                    Some(frame) if frame.is_control() => {
                        warn!("Ignoring control frame after handshake");
                    }
                    // Our parity means a response to a channel we opened
                    Some(frame) if shared.side.owns(frame.channel_id) => {
                        shared.deliver_response(frame);
                    }
                    Some(frame) => {
                        debug!(
                            "Inbound request on channel {} ({} bytes)",
                            frame.channel_id,
                            frame.payload_size()
                        );
                        shared.dispatch_request(frame, &handler);
                    }
                    None => {
                        debug!("Peer closed the connection");
                        return Ok::<(), ProtocolError>(());
                    }
                }
            }
        };

        let result = tokio::select! {
            result = writing => result,
            result = reading => result,
            _ = async { let _ = shutdown_rx.wait_for(|closed| *closed).await; } => Ok(()),
        };

        // Whichever branch won, pending channels fail now
        shared.close();
        result
    }

    /// Open a new logical channel
    ///
    /// Exactly one request goes out through the sender and exactly one
    /// response comes back through the receiver.
    pub fn open_channel(&self) -> Result<(ChannelSender, ChannelReceiver), ProtocolError> {
        let channel_id = self.shared.allocate_id();
        let (tx, rx) = oneshot::channel();

        // Checked under the same lock close() takes, so no slot outlives it
        {
            let mut channels = self.shared.channels();
            if channels.closed {
                return Err(ProtocolError::ConnectionClosed);
            }
            channels.pending.insert(channel_id, tx);
        }

        Ok((
            ChannelSender {
                channel_id,
                outbound: self.shared.outbound.clone(),
            },
            ChannelReceiver {
                channel_id,
                rx,
                shared: Arc::clone(&self.shared),
            },
        ))
    }

    /// Tear the connection down, failing all pending channels
    pub fn close(&self) {
        self.shared.close();
    }

    /// Whether the connection has ended
    pub fn is_closed(&self) -> bool {
        self.shared.channels().closed
    }

    /// Channels opened by this side still waiting for their response
    pub fn open_channels(&self) -> usize {
        self.shared.channels().pending.len()
    }

    /// Which side of the connection this is
    pub fn side(&self) -> Side {
        self.shared.side
    }

    /// Whether both handles drive the same connection
    pub fn same_connection(&self, other: &Multiplexer) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

/// Write end of a logical channel
#[derive(Debug)]
pub struct ChannelSender {
    channel_id: u32,
    outbound: mpsc::UnboundedSender<Frame>,
}

impl ChannelSender {
    /// Channel id
    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    /// Send the request; a channel carries exactly one
    pub fn send(self, payload: Bytes) -> Result<(), ProtocolError> {
        self.outbound
            .send(Frame::data(self.channel_id, payload))
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}

/// Read end of a logical channel
pub struct ChannelReceiver {
    channel_id: u32,
    rx: oneshot::Receiver<Result<Bytes, ProtocolError>>,
    shared: Arc<Shared>,
}

impl ChannelReceiver {
    /// Channel id
    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    /// Wait for the response
    pub async fn recv(mut self) -> Result<Bytes, ProtocolError> {
        match (&mut self.rx).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::ConnectionClosed),
        }
    }
}

impl Drop for ChannelReceiver {
    fn drop(&mut self) {
        // A caller that gave up (timeout, cancellation) must not leak its slot
        self.shared.channels().pending.remove(&self.channel_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ErrorCode;
    use std::time::Duration;
    use tokio::time::timeout;

    /// Echoes the request; payloads starting with `slow` take a while
    struct EchoHandler;

    #[async_trait::async_trait]
    impl ChannelHandler for EchoHandler {
        async fn handle(&self, _channel_id: u32, request: Bytes) -> Result<Bytes, ErrorDetails> {
            if request.starts_with(b"slow") {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            if request.starts_with(b"fail") {
                return Err(ErrorDetails::new(ErrorCode::HandlerFailed, "asked to fail"));
            }
            Ok(request)
        }
    }

    fn pair() -> (Multiplexer, Multiplexer, JoinHandle<Result<(), ProtocolError>>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (dialer, _) = Multiplexer::spawn(a, Side::Dialer, FrameCodec::new(), Arc::new(EchoHandler));
        let (acceptor, acceptor_task) =
            Multiplexer::spawn(b, Side::Acceptor, FrameCodec::new(), Arc::new(EchoHandler));
        (dialer, acceptor, acceptor_task)
    }

    async fn exchange(mux: &Multiplexer, payload: &'static str) -> Result<Bytes, ProtocolError> {
        let (tx, rx) = mux.open_channel()?;
        tx.send(Bytes::from_static(payload.as_bytes()))?;
        rx.recv().await
    }

    #[test]
    fn test_side_parity() {
        assert!(Side::Dialer.owns(1));
        assert!(Side::Dialer.owns(3));
        assert!(!Side::Dialer.owns(2));
        assert!(Side::Acceptor.owns(2));
        assert!(!Side::Acceptor.owns(5));
    }

    #[tokio::test]
    async fn test_channel_ids_are_unique_per_side() {
        let (dialer, acceptor, _) = pair();

        let (d1, _r1) = dialer.open_channel().unwrap();
        let (d2, _r2) = dialer.open_channel().unwrap();
        let (a1, _r3) = acceptor.open_channel().unwrap();

        assert_eq!(d1.channel_id(), 1);
        assert_eq!(d2.channel_id(), 3);
        assert_eq!(a1.channel_id(), 2);
        assert_eq!(dialer.open_channels(), 2);
    }

    #[tokio::test]
    async fn test_request_response_both_directions() {
        let (dialer, acceptor, _) = pair();

        let from_dialer = exchange(&dialer, "hello").await.unwrap();
        let from_acceptor = exchange(&acceptor, "world").await.unwrap();

        assert_eq!(from_dialer, Bytes::from_static(b"hello"));
        assert_eq!(from_acceptor, Bytes::from_static(b"world"));
        assert_eq!(dialer.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_slow_channel_does_not_block_others() {
        let (dialer, _acceptor, _) = pair();

        let slow_mux = dialer.clone();
        let slow = tokio::spawn(async move { exchange(&slow_mux, "slow request").await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let fast = timeout(Duration::from_millis(200), exchange(&dialer, "fast"))
            .await
            .expect("fast reply must not wait for the slow one")
            .unwrap();
        assert_eq!(fast, Bytes::from_static(b"fast"));
        assert!(!slow.is_finished());

        let slow = slow.await.unwrap().unwrap();
        assert_eq!(slow, Bytes::from_static(b"slow request"));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_remote_error() {
        let (dialer, _acceptor, _) = pair();

        let result = exchange(&dialer, "fail please").await;
        match result {
            Err(ProtocolError::Remote(details)) => assert_eq!(details.code, ErrorCode::HandlerFailed),
            other => panic!("Expected remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending_channels() {
        let (dialer, acceptor, acceptor_task) = pair();

        let (tx, rx) = dialer.open_channel().unwrap();
        tx.send(Bytes::from_static(b"slow and doomed")).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        acceptor.close();
        acceptor_task.await.unwrap().unwrap();

        let result = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
        assert!(dialer.is_closed() || dialer.open_channels() == 0);
    }

    #[tokio::test]
    async fn test_open_after_close_fails() {
        let (dialer, _acceptor, _) = pair();
        dialer.close();

        assert!(dialer.is_closed());
        assert!(matches!(dialer.open_channel(), Err(ProtocolError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_dropped_receiver_releases_slot() {
        let (dialer, _acceptor, _) = pair();

        let (_tx, rx) = dialer.open_channel().unwrap();
        assert_eq!(dialer.open_channels(), 1);
        drop(rx);
        assert_eq!(dialer.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_dropping_last_handle_ends_connection() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (dialer, dialer_task) =
            Multiplexer::spawn(a, Side::Dialer, FrameCodec::new(), Arc::new(EchoHandler));
        let (acceptor, acceptor_task) =
            Multiplexer::spawn(b, Side::Acceptor, FrameCodec::new(), Arc::new(EchoHandler));

        let clone = dialer.clone();
        drop(dialer);
        assert!(!clone.is_closed());
        assert_eq!(exchange(&clone, "still open").await.unwrap(), Bytes::from_static(b"still open"));

        drop(clone);
        timeout(Duration::from_secs(2), dialer_task).await.unwrap().unwrap().unwrap();

        // The peer sees the hang-up
        timeout(Duration::from_secs(2), acceptor_task).await.unwrap().unwrap().unwrap();
        assert!(acceptor.is_closed());
    }

    #[tokio::test]
    async fn test_many_concurrent_channels() {
        let (dialer, _acceptor, _) = pair();

        let mut tasks = Vec::new();
        for i in 0..64u32 {
            let mux = dialer.clone();
            tasks.push(tokio::spawn(async move {
                let (tx, rx) = mux.open_channel()?;
                tx.send(Bytes::from(i.to_be_bytes().to_vec()))?;
                rx.recv().await.map(|b| (i, b))
            }));
        }

        for task in tasks {
            let (i, reply) = task.await.unwrap().unwrap();
            assert_eq!(reply.as_ref(), &i.to_be_bytes());
        }
        assert_eq!(dialer.open_channels(), 0);
    }
}
