//! Per-worker event loop
//!
//! A processor either accepts sessions on a listener it was handed, or
//! dials the configured endpoint once per registered service and keeps
//! that session alive. Every session starts with a handshake naming the
//! service, then switches to multiplexed RPC.

use crate::identity::{AgentIdentity, RunMode};
use crate::pool::{BlockingPool, DEFAULT_POOL_SIZE};
use crate::rpc::{Capabilities, RpcClient, RpcHandler};
use crate::service::{Service, ServiceContext, ServiceRegistry};
use crate::session::SessionTable;
use crate::tls::{SecurityContext, SessionStream};
use crate::{MinionError, Result};
use minion_amq::ReliablePublisher;
use minion_proto::{FrameCodec, Hello, HelloReply, Multiplexer, ProtocolError, Side};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause between dial attempts in client mode
pub const DIAL_RETRY: Duration = Duration::from_secs(1);

/// Deadline for the handshake of a new connection
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Where sessions come from
#[derive(Debug)]
pub enum Endpoint {
    /// Accept on an already bound socket
    Listen(TcpListener),
    /// Dial `host:port`
    Dial(String),
}

/// Everything a processor is built from
pub struct ProcessorConfig {
    /// Identity, including the run mode
    pub identity: AgentIdentity,
    /// Services to serve or dial for
    pub registry: ServiceRegistry,
    /// Listener or dial target; must match the run mode
    pub endpoint: Endpoint,
    /// TLS policy for sessions
    pub security: SecurityContext,
    /// Broker publisher handed to services
    pub publisher: Option<ReliablePublisher>,
    /// Pause between dial attempts
    pub dial_retry: Duration,
    /// Concurrent blocking calls
    pub pool_size: usize,
}

impl ProcessorConfig {
    /// Configuration with default retry and pool size and no broker
    pub fn new(
        identity: AgentIdentity,
        registry: ServiceRegistry,
        endpoint: Endpoint,
        security: SecurityContext,
    ) -> Self {
        Self {
            identity,
            registry,
            endpoint,
            security,
            publisher: None,
            dial_retry: DIAL_RETRY,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

struct Inner {
    registry: ServiceRegistry,
    endpoint: Mutex<Option<Endpoint>>,
    local_addr: Option<SocketAddr>,
    security: SecurityContext,
    publisher: Option<ReliablePublisher>,
    dial_retry: Duration,
    pool: BlockingPool,
    sessions: Arc<SessionTable>,
    shutdown: CancellationToken,
    dial_attempts: AtomicU64,
    context: ServiceContext,
}

/// One worker's event loop
///
/// Cheap to clone; clones control the same processor.
#[derive(Clone)]
pub struct Processor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("run_mode", &self.inner.context.run_mode())
            .field("services", &self.inner.registry)
            .field("sessions", &self.inner.sessions.len())
            .finish()
    }
}

impl Processor {
    /// Build a processor; the endpoint has to fit the identity's run mode
    pub fn new(config: ProcessorConfig) -> Result<Self> {
        let ProcessorConfig {
            identity,
            registry,
            endpoint,
            security,
            publisher,
            dial_retry,
            pool_size,
        } = config;

        let local_addr = match (&endpoint, identity.run_mode) {
            (Endpoint::Listen(listener), RunMode::Server) => Some(listener.local_addr()?),
            (Endpoint::Dial(_), RunMode::Client) => None,
            (_, mode) => {
                return Err(MinionError::Config(format!(
                    "endpoint {:?} does not fit run mode {:?}",
                    endpoint, mode
                )))
            }
        };

        let pool = BlockingPool::new(pool_size);
        let sessions = Arc::new(SessionTable::new());
        let shutdown = CancellationToken::new();
        let context = ServiceContext::new(
            identity,
            sessions.clone(),
            pool.clone(),
            publisher.clone(),
            shutdown.clone(),
        );

        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                endpoint: Mutex::new(Some(endpoint)),
                local_addr,
                security,
                publisher,
                dial_retry,
                pool,
                sessions,
                shutdown,
                dial_attempts: AtomicU64::new(0),
                context,
            }),
        })
    }

    /// Address of the listener in server mode
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    /// Context handed to services
    pub fn context(&self) -> ServiceContext {
        self.inner.context.clone()
    }

    /// Dial attempts made so far, across all services
    pub fn dial_attempts(&self) -> u64 {
        self.inner.dial_attempts.load(Ordering::Relaxed)
    }

    /// Live outbound session for `service`
    pub fn get_server_connection(&self, service: &str) -> Result<RpcClient> {
        self.inner.sessions.get(service)
    }

    /// Run a blocking call without stalling sessions
    pub async fn run_blocking<F, T>(&self, call: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.inner.pool.run(call).await
    }

    /// Cancelled once teardown begins
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Begin teardown: stop accepting and dialing, close every session
    pub fn shutdown(&self) {
        info!("Processor shutting down");
        self.inner.shutdown.cancel();
        self.inner.pool.close();
    }

    /// Serve until [`shutdown`](Self::shutdown)
    ///
    /// A processor runs once; a second call fails.
    pub async fn run(&self) -> Result<()> {
        let endpoint = self
            .inner
            .endpoint
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| MinionError::Config("processor already ran".to_string()))?;

        let result = self.serve(endpoint).await;

        self.shutdown();
        self.inner.sessions.close_all();
        if let Some(publisher) = &self.inner.publisher {
            publisher.close();
        }
        info!("Processor stopped");
        result
    }

    async fn serve(&self, endpoint: Endpoint) -> Result<()> {
        let ctx = self.context();
        for service in self.inner.registry.iter() {
            debug!("Starting service {}", service.name());
            service.start(&ctx).await?;
        }

        if let Some(publisher) = &self.inner.publisher {
            let registry = self.inner.registry.clone();
            publisher.on_channel_open(move |channel| {
                let registry = registry.clone();
                async move {
                    for service in registry.iter() {
                        service.on_broker_channel(channel.clone()).await?;
                    }
                    Ok(())
                }
            });
            publisher.connect();
        }

        match endpoint {
            Endpoint::Listen(listener) => self.accept_loop(listener).await,
            Endpoint::Dial(target) => {
                self.dial_all(target).await;
                // With nothing to dial the worker still lives until told to stop
                self.inner.shutdown.cancelled().await;
                Ok(())
            }
        }
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<()> {
        info!("Accepting sessions on {}", listener.local_addr()?);
        let token = self.inner.shutdown.clone();

        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((tcp, peer)) => {
                    debug!("Accepted connection from {}", peer);
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.serve_inbound(tcp).await {
                            warn!("Session from {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn serve_inbound(&self, tcp: TcpStream) -> Result<()> {
        tcp.set_nodelay(true)?;
        let mut codec = FrameCodec::new();

        let (stream, service) = with_handshake_timeout(async {
            let mut stream = self.inner.security.accept(tcp).await?;
            let hello: Hello = codec.read_record(&mut stream).await?;

            // The dialer names the service before any RPC traffic
            match self.inner.registry.get(&hello.conn_type) {
                Some(service) => {
                    codec
                        .write_record(&mut stream, &HelloReply::accepted(service.name()))
                        .await?;
                    Ok((stream, service.clone()))
                }
                None => {
                    let reason = format!("unknown service `{}`", hello.conn_type);
                    codec
                        .write_record(&mut stream, &HelloReply::rejected(reason.clone()))
                        .await?;
                    Err(MinionError::Connection(reason))
                }
            }
        })
        .await?;

        self.run_session(stream, codec, Side::Acceptor, service)
            .await
    }

    async fn dial_all(&self, target: String) {
        let dialers = self.inner.registry.iter().map(|service| {
            let this = self.clone();
            let target = target.clone();
            let service = service.clone();
            async move { this.dial_loop(&target, service).await }
        });
        futures::future::join_all(dialers).await;
    }

    async fn dial_loop(&self, target: &str, service: Arc<dyn Service>) {
        let token = self.inner.shutdown.clone();

        while !token.is_cancelled() {
            self.inner.dial_attempts.fetch_add(1, Ordering::Relaxed);
            match self.dial(target, &service).await {
                Ok(()) => info!("Session for {} with {} ended", service.name(), target),
                Err(e) => warn!("Dialing {} for {} failed: {}", target, service.name(), e),
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.inner.dial_retry) => {}
            }
        }
    }

    async fn dial(&self, target: &str, service: &Arc<dyn Service>) -> Result<()> {
        let mut codec = FrameCodec::new();

        let stream = with_handshake_timeout(async {
            let tcp = TcpStream::connect(target).await?;
            tcp.set_nodelay(true)?;
            let mut stream = self.inner.security.connect(tcp).await?;

            codec
                .write_record(&mut stream, &Hello::new(service.name()))
                .await?;
            match codec.read_record::<_, HelloReply>(&mut stream).await? {
                HelloReply::Accepted { conn_type } => {
                    debug!("Handshake with {} accepted for {}", target, conn_type);
                    Ok(stream)
                }
                HelloReply::Rejected { error } => {
                    Err(MinionError::from(ProtocolError::HandshakeRejected(error)))
                }
            }
        })
        .await?;

        self.run_session(stream, codec, Side::Dialer, service.clone())
            .await
    }

    async fn run_session(
        &self,
        stream: SessionStream,
        codec: FrameCodec,
        side: Side,
        service: Arc<dyn Service>,
    ) -> Result<()> {
        let ctx = self.context();
        // Our run mode decides which role's methods the peer may call
        let capabilities = Capabilities::select(
            ctx.run_mode(),
            service.server_commands(&ctx),
            service.client_commands(&ctx),
        );
        let handler = Arc::new(RpcHandler::new(capabilities, self.inner.pool.clone()));
        let (mux, task) = Multiplexer::spawn(stream, side, codec, handler);
        let client = RpcClient::new(service.name(), mux);

        // Only dialed sessions are looked up by service name
        let outbound = side == Side::Dialer;
        if outbound && !self.inner.sessions.insert(client.clone()) {
            client.close();
            return Err(MinionError::Connection(format!(
                "a session for {} is already live",
                service.name()
            )));
        }
        info!("Session for {} established", service.name());

        {
            let service = service.clone();
            let client = client.clone();
            // Off the session task, so the hook can make calls on it
            tokio::spawn(async move { service.on_connect(client).await });
        }

        let token = self.inner.shutdown.clone();
        let result = tokio::select! {
            joined = task => match joined {
                Ok(result) => result.map_err(MinionError::from),
                Err(e) => Err(MinionError::Internal(e.to_string())),
            },
            _ = token.cancelled() => {
                // Fails this session's pending calls with ConnectionClosed
                client.close();
                Ok(())
            }
        };

        if outbound {
            self.inner.sessions.remove(&client);
        }
        result
    }
}

async fn with_handshake_timeout<T>(handshake: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake)
        .await
        .map_err(|_| MinionError::Timeout {
            duration: HANDSHAKE_TIMEOUT,
        })?
}
