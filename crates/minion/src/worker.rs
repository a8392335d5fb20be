//! Worker process entry point
//!
//! A worker re-reads the agent settings, drops privileges and runs one
//! [`Processor`] until a termination signal arrives. In server mode it
//! accepts on the socket inherited from the supervisor.

use crate::config::Settings;
use crate::identity::{AgentIdentity, RunMode};
use crate::processor::{Endpoint, Processor, ProcessorConfig};
use crate::service::ServiceRegistry;
use crate::tls::SecurityContext;
use crate::{privileges, signals, MinionError, Result};
use minion_amq::{LapinBroker, ReliablePublisher};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Serve as worker `index` of the agent rooted at `root`
pub async fn serve(
    root: &Path,
    index: usize,
    listener: Option<std::net::TcpListener>,
    registry: ServiceRegistry,
) -> Result<()> {
    let settings = Settings::load(root)?;
    let minion = &settings.minion;

    let identity = AgentIdentity::load(root, minion.run_mode())?;
    let security = SecurityContext::from_settings(minion)?;

    let endpoint = match (identity.run_mode, listener) {
        (RunMode::Server, Some(listener)) => {
            listener.set_nonblocking(true)?;
            Endpoint::Listen(TcpListener::from_std(listener)?)
        }
        (RunMode::Server, None) => {
            return Err(MinionError::Config(
                "server worker started without a listening socket".to_string(),
            ))
        }
        (RunMode::Client, listener) => {
            if listener.is_some() {
                warn!("Client worker ignores the inherited socket");
            }
            Endpoint::Dial(minion.endpoint())
        }
    };

    privileges::switch_user(minion.user.as_deref(), minion.group.as_deref())?;

    let mut config = ProcessorConfig::new(identity, registry, endpoint, security);
    config.publisher = settings
        .amqp
        .clone()
        .map(|params| ReliablePublisher::new(Arc::new(LapinBroker), params));

    let processor = Processor::new(config)?;
    signals::cancel_on_signal(processor.shutdown_token());

    info!(
        "Worker {} serving as {:?} (pid {})",
        index,
        processor.context().run_mode(),
        std::process::id()
    );
    processor.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_worker_needs_listener() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(
            root.path().join(crate::config::SETTINGS_FILE),
            "[minion]\nserver = true\nplaintext = true\n",
        )
        .unwrap();

        let result = serve(root.path(), 0, None, ServiceRegistry::new()).await;
        assert!(matches!(result, Err(MinionError::Config(_))));
    }

    #[tokio::test]
    async fn test_invalid_settings_abort_worker() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(
            root.path().join(crate::config::SETTINGS_FILE),
            "[minion]\nworkers = 0\n",
        )
        .unwrap();

        let result = serve(root.path(), 0, None, ServiceRegistry::new()).await;
        assert!(matches!(result, Err(MinionError::Config(_))));
    }
}
