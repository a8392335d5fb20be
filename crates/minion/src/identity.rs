//! Durable and per-run agent identity
//!
//! The durable id is a UUID written once to `<root>/agent_id.bin` and read
//! back on every start. Concurrent first starts race on an atomic
//! create-if-absent; the loser reads the winner's id.

use crate::{MinionError, Result};
use std::io::Write;
use std::path::Path;
use uuid::Uuid;

/// File holding the durable id
pub const IDENTITY_FILE: &str = "agent_id.bin";

/// Whether the agent accepts or dials sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Accepts sessions on a listening socket
    Server,
    /// Dials one session per service to a fixed endpoint
    Client,
}

/// Who this agent is
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    /// Stable across restarts of the same installation
    pub durable_id: Uuid,
    /// Fresh on every process start, never persisted
    pub ephemeral_id: String,
    /// Server or client
    pub run_mode: RunMode,
}

impl AgentIdentity {
    /// Read or create the durable id under `root` and mint a new ephemeral id
    pub fn load(root: &Path, run_mode: RunMode) -> Result<Self> {
        Ok(Self {
            durable_id: load_or_create_durable_id(root)?,
            ephemeral_id: Uuid::new_v4().simple().to_string(),
            run_mode,
        })
    }
}

fn load_or_create_durable_id(root: &Path) -> Result<Uuid> {
    let path = root.join(IDENTITY_FILE);
    if let Some(id) = read_id(&path)? {
        return Ok(id);
    }

    let candidate = Uuid::new_v4();
    let mut staged = tempfile::NamedTempFile::new_in(root)?;
    staged.write_all(candidate.to_string().as_bytes())?;
    staged.as_file().sync_all()?;

    match staged.persist_noclobber(&path) {
        Ok(_) => {
            tracing::info!("Created agent identity {}", candidate);
            Ok(candidate)
        }
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => read_id(&path)?
            .ok_or_else(|| MinionError::Config(format!("{} vanished", path.display()))),
        Err(e) => Err(e.error.into()),
    }
}

fn read_id(path: &Path) -> Result<Option<Uuid>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Uuid::parse_str(contents.trim()).map(Some).map_err(|e| {
            MinionError::Config(format!("corrupt identity file {}: {}", path.display(), e))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
