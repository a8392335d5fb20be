//! Name-based RPC dispatch over logical channels
//!
//! Each request on a channel is a [`Call`]: a method name with positional
//! and keyword arguments. The receiving side looks the name up in a
//! [`CommandTable`] and answers with exactly one [`Reply`]. Unknown names
//! produce a `MethodNotFound` reply; the session stays up.
//!
//! Which table answers depends on the role this side plays in the session,
//! fixed once when the session is established ([`Capabilities`]).

use crate::identity::RunMode;
use crate::pool::BlockingPool;
use crate::{MinionError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use minion_proto::{
    Call, ChannelHandler, ErrorCode, ErrorDetails, Message, Multiplexer, Reply, Value,
};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Arguments of one call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    /// Positional arguments
    pub args: Vec<Value>,
    /// Keyword arguments
    pub kwargs: BTreeMap<String, Value>,
}

impl Args {
    /// Argument at `index`, or the keyword `name` if not given positionally
    pub fn get(&self, index: usize, name: &str) -> std::result::Result<&Value, ErrorDetails> {
        self.args
            .get(index)
            .or_else(|| self.kwargs.get(name))
            .ok_or_else(|| {
                ErrorDetails::new(
                    ErrorCode::InvalidArguments,
                    format!("missing argument `{}`", name),
                )
            })
    }

    /// Like [`get`](Self::get) but `None` when absent
    pub fn optional(&self, index: usize, name: &str) -> Option<&Value> {
        self.args.get(index).or_else(|| self.kwargs.get(name))
    }
}

/// What a method returns
pub type MethodResult = std::result::Result<Value, ErrorDetails>;

type AsyncMethod = Arc<dyn Fn(Args) -> BoxFuture<'static, MethodResult> + Send + Sync>;
type BlockingMethod = Arc<dyn Fn(Args) -> MethodResult + Send + Sync>;

#[derive(Clone)]
enum Method {
    Async(AsyncMethod),
    Blocking(BlockingMethod),
}

/// Method name to handler mapping
#[derive(Clone, Default)]
pub struct CommandTable {
    methods: HashMap<String, Method>,
}

impl std::fmt::Debug for CommandTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.methods.keys().collect();
        names.sort();
        f.debug_struct("CommandTable").field("methods", &names).finish()
    }
}

impl CommandTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async method, replacing any previous one with that name
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, method: F) -> &mut Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        let method: AsyncMethod = Arc::new(move |args| method(args).boxed());
        self.methods.insert(name.into(), Method::Async(method));
        self
    }

    /// Register a method that blocks; it runs on the blocking pool
    pub fn register_blocking<F>(&mut self, name: impl Into<String>, method: F) -> &mut Self
    where
        F: Fn(Args) -> MethodResult + Send + Sync + 'static,
    {
        self.methods
            .insert(name.into(), Method::Blocking(Arc::new(method)));
        self
    }

    /// Whether `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Registered method names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run `call` and produce its reply
    pub async fn dispatch(&self, call: Call, pool: &BlockingPool) -> Reply {
        let Call {
            method: name,
            args,
            kwargs,
        } = call;

        let Some(method) = self.methods.get(&name).cloned() else {
            warn!("Call to unknown method `{}`", name);
            return Reply::Error(
                ErrorDetails::new(
                    ErrorCode::MethodNotFound,
                    format!("no method named `{}`", name),
                )
                .with_context("method", name),
            );
        };

        let args = Args { args, kwargs };
        let result = match method {
            Method::Async(method) => AssertUnwindSafe(method(args))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(ErrorDetails::new(ErrorCode::HandlerFailed, "method panicked"))
                }),
            Method::Blocking(method) => pool
                .run(move || method(args))
                .await
                .unwrap_or_else(|e| Err(ErrorDetails::from(e))),
        };

        match result {
            Ok(value) => Reply::Value(value),
            Err(details) => {
                debug!("Method `{}` failed: {}", name, details);
                Reply::Error(details.with_context("method", name))
            }
        }
    }
}

/// The command table a session answers with, chosen by role
#[derive(Debug, Clone)]
pub enum Capabilities {
    /// This side accepted the session
    Server(CommandTable),
    /// This side dialed the session
    Client(CommandTable),
}

impl Capabilities {
    /// Pick the table for `mode`
    pub fn select(mode: RunMode, server: CommandTable, client: CommandTable) -> Self {
        match mode {
            RunMode::Server => Self::Server(server),
            RunMode::Client => Self::Client(client),
        }
    }

    /// The table in effect
    pub fn commands(&self) -> &CommandTable {
        match self {
            Self::Server(table) | Self::Client(table) => table,
        }
    }

    /// Role these capabilities belong to
    pub fn mode(&self) -> RunMode {
        match self {
            Self::Server(_) => RunMode::Server,
            Self::Client(_) => RunMode::Client,
        }
    }
}

/// Answers inbound channels of one session
pub struct RpcHandler {
    capabilities: Capabilities,
    pool: BlockingPool,
}

impl RpcHandler {
    /// Handler answering with `capabilities`, offloading blocking methods to `pool`
    pub fn new(capabilities: Capabilities, pool: BlockingPool) -> Self {
        Self { capabilities, pool }
    }
}

#[async_trait]
impl ChannelHandler for RpcHandler {
    async fn handle(
        &self,
        channel_id: u32,
        request: Bytes,
    ) -> std::result::Result<Bytes, ErrorDetails> {
        let call = match Message::from_bytes(&request)? {
            Message::Call(call) => call,
            Message::Reply(_) => {
                return Err(ErrorDetails::new(
                    ErrorCode::InvalidRequest,
                    "expected a call",
                ))
            }
        };

        debug!("Channel {}: call `{}`", channel_id, call.method);
        let reply = self.capabilities.commands().dispatch(call, &self.pool).await;
        Ok(Message::Reply(reply).to_bytes()?)
    }
}

/// Caller side of a session
///
/// Every call opens its own logical channel, so calls on one client run
/// concurrently.
#[derive(Debug, Clone)]
pub struct RpcClient {
    service: String,
    mux: Multiplexer,
    timeout: Option<Duration>,
}

impl RpcClient {
    /// Client for `service` over an established session
    pub fn new(service: impl Into<String>, mux: Multiplexer) -> Self {
        Self {
            service: service.into(),
            mux,
            timeout: None,
        }
    }

    /// Fail calls that take longer than `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Service this session was established for
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Whether the underlying connection has ended
    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    /// Whether both clients share one connection
    pub fn same_session(&self, other: &RpcClient) -> bool {
        self.mux.same_connection(&other.mux)
    }

    /// Tear the session down; pending calls fail with a connection error
    pub fn close(&self) {
        self.mux.close();
    }

    /// Call `method` with positional and keyword arguments
    pub async fn call(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<Value> {
        self.invoke(Call {
            method: method.to_string(),
            args,
            kwargs,
        })
        .await
    }

    /// Send a prepared call
    pub async fn invoke(&self, call: Call) -> Result<Value> {
        let method = call.method.clone();
        let (sender, receiver) = self.mux.open_channel()?;
        sender.send(Message::Call(call).to_bytes()?)?;

        let response = match self.timeout {
            Some(duration) => tokio::time::timeout(duration, receiver.recv())
                .await
                .map_err(|_| MinionError::Timeout { duration })??,
            None => receiver.recv().await?,
        };

        match Message::from_bytes(&response)? {
            Message::Reply(reply) => reply
                .into_result()
                .map_err(|details| MinionError::from_remote(&method, details)),
            Message::Call(_) => Err(MinionError::Protocol(
                "peer answered with a call".to_string(),
            )),
        }
    }

    /// Round-trip `value` through the peer's `ping` method
    pub async fn ping(&self, value: impl Into<Value>) -> Result<Value> {
        self.invoke(Call::new("ping").arg(value)).await
    }
}

#[cfg(test)]
mod tests;
