//! Service trait, registry and per-processor context
//!
//! A [`Service`] is a named capability: it contributes a command table for
//! each role, plus lifecycle hooks the processor calls at fixed points. The
//! [`ServiceRegistry`] is built once by the binary and handed to every
//! processor; nothing looks services up through global state.

use crate::identity::{AgentIdentity, RunMode};
use crate::pool::BlockingPool;
use crate::rpc::{CommandTable, RpcClient};
use crate::session::SessionTable;
use crate::{MinionError, Result};
use async_trait::async_trait;
use minion_amq::{AmqError, BrokerChannel, ReliablePublisher};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Pause between attempts of [`ServiceContext::connection`]
pub const CONNECTION_RETRY: Duration = Duration::from_secs(1);

/// A named unit of functionality reachable over sessions
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Name peers announce in the handshake
    fn name(&self) -> &str;

    /// Version shown at startup
    fn version(&self) -> &str {
        "0.0.0"
    }

    /// One-line description shown at startup
    fn description(&self) -> &str {
        ""
    }

    /// Methods answered on sessions this side accepted
    fn server_commands(&self, _ctx: &ServiceContext) -> CommandTable {
        CommandTable::new()
    }

    /// Methods answered on sessions this side dialed
    fn client_commands(&self, _ctx: &ServiceContext) -> CommandTable {
        CommandTable::new()
    }

    /// Called once per processor before it accepts or dials
    async fn start(&self, _ctx: &ServiceContext) -> Result<()> {
        Ok(())
    }

    /// Called after a session for this service is established
    ///
    /// Runs on its own task; the session is already serving calls.
    async fn on_connect(&self, _session: RpcClient) {}

    /// Called on every freshly opened broker channel
    async fn on_broker_channel(
        &self,
        _channel: Arc<dyn BrokerChannel>,
    ) -> std::result::Result<(), AmqError> {
        Ok(())
    }

    /// Called once when the agent stops
    fn shutdown(&self) {}
}

/// Services known to the agent, in registration order
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: Vec<Arc<dyn Service>>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.services.iter().map(|s| s.name()))
            .finish()
    }
}

impl ServiceRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `service`; names must be unique
    pub fn register<S: Service>(&mut self, service: S) -> Result<&mut Self> {
        self.register_arc(Arc::new(service))
    }

    /// Add an already shared service
    pub fn register_arc(&mut self, service: Arc<dyn Service>) -> Result<&mut Self> {
        if self.get(service.name()).is_some() {
            return Err(MinionError::Config(format!(
                "service `{}` registered twice",
                service.name()
            )));
        }
        debug!("Registered service {}", service.name());
        self.services.push(service);
        Ok(self)
    }

    /// Service registered under `name`
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Service>> {
        self.services.iter().find(|s| s.name() == name)
    }

    /// Services in registration order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Service>> {
        self.services.iter()
    }

    /// Number of services
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether no service is registered
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Run every service's shutdown hook
    pub fn shutdown_all(&self) {
        for service in &self.services {
            info!("Shutting down service {}", service.name());
            service.shutdown();
        }
    }
}

struct ContextInner {
    identity: AgentIdentity,
    sessions: Arc<SessionTable>,
    pool: BlockingPool,
    publisher: Option<ReliablePublisher>,
    shutdown: CancellationToken,
}

/// What a service can reach inside its processor
///
/// Cheap to clone.
#[derive(Clone)]
pub struct ServiceContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("identity", &self.inner.identity)
            .field("sessions", &self.inner.sessions.len())
            .field("publisher", &self.inner.publisher.is_some())
            .finish()
    }
}

impl ServiceContext {
    pub(crate) fn new(
        identity: AgentIdentity,
        sessions: Arc<SessionTable>,
        pool: BlockingPool,
        publisher: Option<ReliablePublisher>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                identity,
                sessions,
                pool,
                publisher,
                shutdown,
            }),
        }
    }

    /// Identity of this agent
    pub fn identity(&self) -> &AgentIdentity {
        &self.inner.identity
    }

    /// Role of this processor
    pub fn run_mode(&self) -> RunMode {
        self.inner.identity.run_mode
    }

    /// Whether this processor accepts sessions
    pub fn is_server(&self) -> bool {
        self.run_mode() == RunMode::Server
    }

    /// Live outbound session for `service`, failing if there is none yet
    pub fn get_server_connection(&self, service: &str) -> Result<RpcClient> {
        self.inner.sessions.get(service)
    }

    /// Wait for the outbound session for `service`
    ///
    /// Only client-mode processors dial out; in server mode this fails at once.
    pub async fn connection(&self, service: &str) -> Result<RpcClient> {
        if self.is_server() {
            return Err(MinionError::Connection(
                "Only client to server connections available".to_string(),
            ));
        }

        loop {
            match self.get_server_connection(service) {
                Ok(client) => return Ok(client),
                Err(e) => debug!("Waiting for {} session: {}", service, e),
            }
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return Err(MinionError::ShuttingDown),
                _ = tokio::time::sleep(CONNECTION_RETRY) => {}
            }
        }
    }

    /// Run a blocking call on the processor's pool
    pub async fn run_blocking<F, T>(&self, call: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.inner.pool.run(call).await
    }

    /// The processor's blocking pool
    pub fn pool(&self) -> &BlockingPool {
        &self.inner.pool
    }

    /// Broker publisher, if the agent has an `[amqp]` section
    pub fn publisher(&self) -> Option<&ReliablePublisher> {
        self.inner.publisher.as_ref()
    }

    /// Cancelled when the processor begins tearing down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{Capabilities, RpcHandler};
    use minion_proto::{FrameCodec, Multiplexer, Side};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct Named(&'static str, Arc<AtomicUsize>);

    impl Service for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn shutdown(&self) {
            self.1.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn context(run_mode: RunMode) -> (ServiceContext, Arc<SessionTable>) {
        let identity = AgentIdentity {
            durable_id: Uuid::new_v4(),
            ephemeral_id: "run".to_string(),
            run_mode,
        };
        let sessions = Arc::new(SessionTable::new());
        let ctx = ServiceContext::new(
            identity,
            sessions.clone(),
            BlockingPool::new(2),
            None,
            CancellationToken::new(),
        );
        (ctx, sessions)
    }

    fn session(service: &str) -> (RpcClient, RpcClient) {
        let (a, b) = tokio::io::duplex(4096);
        let handler = || {
            Arc::new(RpcHandler::new(
                Capabilities::Client(CommandTable::new()),
                BlockingPool::new(1),
            ))
        };
        let (dialer, _) = Multiplexer::spawn(a, Side::Dialer, FrameCodec::new(), handler());
        let (acceptor, _) = Multiplexer::spawn(b, Side::Acceptor, FrameCodec::new(), handler());
        (
            RpcClient::new(service, dialer),
            RpcClient::new(service, acceptor),
        )
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ServiceRegistry::new();
        registry
            .register(Named("rpc", calls.clone()))
            .unwrap()
            .register(Named("inventory", calls.clone()))
            .unwrap();

        let err = registry.register(Named("rpc", calls.clone())).err().unwrap();
        assert!(matches!(err, MinionError::Config(_)));

        let names: Vec<&str> = registry.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["rpc", "inventory"]);
        assert_eq!(registry.get("inventory").unwrap().version(), "0.0.0");
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_shutdown_all_reaches_every_service() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ServiceRegistry::new();
        registry.register(Named("a", calls.clone())).unwrap();
        registry.register(Named("b", calls.clone())).unwrap();

        registry.shutdown_all();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_connection_refused_in_server_mode() {
        let (ctx, _) = context(RunMode::Server);
        let err = ctx.connection("rpc").await.unwrap_err();
        assert!(matches!(err, MinionError::Connection(_)));
    }

    #[tokio::test]
    async fn test_get_server_connection_without_session() {
        let (ctx, _) = context(RunMode::Client);
        assert!(ctx.get_server_connection("rpc").unwrap_err().is_connection());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_waits_for_session() {
        let (ctx, sessions) = context(RunMode::Client);
        let (client, _peer) = session("rpc");

        let waiting = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.connection("rpc").await })
        };
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!waiting.is_finished());

        sessions.insert(client.clone());
        let found = waiting.await.unwrap().unwrap();
        assert!(found.same_session(&client));
    }

    #[tokio::test]
    async fn test_connection_gives_up_on_shutdown() {
        let (ctx, _) = context(RunMode::Client);
        let token = ctx.shutdown_token();

        let waiting = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.connection("rpc").await })
        };
        token.cancel();

        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, MinionError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_run_blocking_after_pool_closed() {
        let (ctx, _) = context(RunMode::Client);
        assert_eq!(ctx.run_blocking(|| 6 * 7).await.unwrap(), 42);

        ctx.pool().close();
        let err = ctx.run_blocking(|| 0).await.unwrap_err();
        assert!(matches!(err, MinionError::ShuttingDown));
    }
}
