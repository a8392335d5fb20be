//! # Minion
//!
//! Runtime for the minion agent. A [`Supervisor`] keeps one worker process
//! per core alive; each worker runs a [`Processor`] that either accepts
//! sessions on the shared listening socket or dials out once per
//! registered [`Service`]. Sessions carry multiplexed RPC calls dispatched
//! through per-service command tables.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use minion_amq as amq;
pub use minion_proto as proto;

/// Error types for the minion runtime
pub mod error;

/// Settings file parsing and validation
pub mod config;

/// Durable and per-run agent identity
pub mod identity;

/// Exclusive run-lock and pid marker
pub mod lock;

/// TLS contexts for accepting and dialing sessions
pub mod tls;

/// Bounded pool for blocking calls
pub mod pool;

/// Name-based RPC dispatch over logical channels
pub mod rpc;

/// Service trait, registry and per-processor context
pub mod service;

/// Live connection sessions keyed by service
pub mod session;

/// Per-worker event loop
pub mod processor;

/// Worker pool supervision
pub mod supervisor;

/// Worker process entry point
pub mod worker;

/// Dropping root privileges after bind
pub mod privileges;

/// OS signal handling
pub mod signals;

pub use config::{MinionSettings, Settings};
pub use error::MinionError;
pub use identity::{AgentIdentity, RunMode};
pub use pool::BlockingPool;
pub use processor::{Endpoint, Processor, ProcessorConfig};
pub use rpc::{Args, Capabilities, CommandTable, RpcClient, RpcHandler};
pub use service::{Service, ServiceContext, ServiceRegistry};
pub use supervisor::{ExecLauncher, Supervisor, WorkerLauncher, WorkerSlot};
pub use tls::SecurityContext;

/// Result type alias for minion operations
pub type Result<T> = std::result::Result<T, MinionError>;
