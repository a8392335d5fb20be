//! # Minion Agent
//!
//! Services compiled into the `minion-agent` binary.

#![warn(missing_docs)]

use minion::{Args, CommandTable, Service, ServiceContext, ServiceRegistry};

/// Connectivity checks between agents
///
/// `ping(value)` answers with `value` in both roles.
#[derive(Debug, Default, Clone, Copy)]
pub struct RpcService;

impl RpcService {
    fn commands() -> CommandTable {
        let mut table = CommandTable::new();
        table.register("ping", |args: Args| async move {
            args.get(0, "value").cloned()
        });
        table
    }
}

impl Service for RpcService {
    fn name(&self) -> &str {
        "rpc"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn description(&self) -> &str {
        "Remote procedure calls between agents"
    }

    fn server_commands(&self, _ctx: &ServiceContext) -> CommandTable {
        Self::commands()
    }

    fn client_commands(&self, _ctx: &ServiceContext) -> CommandTable {
        Self::commands()
    }
}

/// Registry of every service built into the agent
pub fn builtin_services() -> minion::Result<ServiceRegistry> {
    let mut registry = ServiceRegistry::new();
    registry.register(RpcService)?;
    Ok(registry)
}
