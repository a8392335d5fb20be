//! Settings file parsing and validation
//!
//! Settings live in `<root>/settings.toml`. A missing file means defaults
//! everywhere; an `[amqp]` table enables the broker client.

use crate::identity::RunMode;
use crate::{MinionError, Result};
use minion_amq::BrokerParams;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Name of the settings file inside the agent root
pub const SETTINGS_FILE: &str = "settings.toml";

/// Default listen or dial address
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default listen or dial port
pub const DEFAULT_PORT: u16 = 1983;

/// Top-level settings document
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Agent settings
    pub minion: MinionSettings,
    /// Broker connection, when the agent publishes or consumes
    pub amqp: Option<BrokerParams>,
}

/// The `[minion]` table
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MinionSettings {
    /// Agent name, defaults to the host name
    pub name: String,
    /// Accept sessions instead of dialing out
    pub server: bool,
    /// Listen address in server mode, dial target otherwise
    pub host: String,
    /// Listen or dial port
    pub port: u16,
    /// Server certificate chain, or the CA bundle in client mode
    pub ssl_cert: Option<PathBuf>,
    /// Server private key
    pub ssl_key: Option<PathBuf>,
    /// User to switch to after binding
    pub user: Option<String>,
    /// Group to switch to after binding
    pub group: Option<String>,
    /// Worker processes, defaults to the number of cores
    pub workers: Option<usize>,
    /// Run sessions without TLS
    pub plaintext: bool,
    /// Log filter used when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for MinionSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            server: false,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            ssl_cert: None,
            ssl_key: None,
            user: None,
            group: None,
            workers: None,
            plaintext: false,
            log_level: "info".to_string(),
        }
    }
}

impl MinionSettings {
    /// `host:port` to bind or dial
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether this agent accepts or dials sessions
    pub fn run_mode(&self) -> RunMode {
        if self.server {
            RunMode::Server
        } else {
            RunMode::Client
        }
    }

    /// Number of worker processes to keep alive
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(cpu_count)
    }
}

impl Settings {
    /// Load `<root>/settings.toml`, falling back to defaults if it is absent
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(SETTINGS_FILE);
        let settings = match std::fs::read_to_string(&path) {
            Ok(contents) => Self::from_toml(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e.into()),
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Parse a settings document
    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Reject combinations the runtime cannot start with
    pub fn validate(&self) -> Result<()> {
        let minion = &self.minion;

        if minion.server
            && !minion.plaintext
            && (minion.ssl_cert.is_none() || minion.ssl_key.is_none())
        {
            return Err(MinionError::Config(
                "server mode requires both ssl_cert and ssl_key".to_string(),
            ));
        }

        if minion.workers == Some(0) {
            return Err(MinionError::Config("workers must be at least 1".to_string()));
        }

        if minion.name.trim().is_empty() {
            return Err(MinionError::Config("name must not be empty".to_string()));
        }

        Ok(())
    }
}

/// Number of cores available to this process
pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "minion".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert!(!settings.minion.server);
        assert_eq!(settings.minion.endpoint(), "127.0.0.1:1983");
        assert_eq!(settings.minion.run_mode(), RunMode::Client);
        assert!(!settings.minion.name.is_empty());
        assert_eq!(settings.minion.worker_count(), cpu_count());
        assert!(settings.amqp.is_none());
    }

    #[test]
    fn test_parse_full_document() {
        let settings = Settings::from_toml(
            r#"
            [minion]
            name = "edge-1"
            server = true
            host = "0.0.0.0"
            port = 2000
            ssl_cert = "/etc/minion/cert.pem"
            ssl_key = "/etc/minion/key.pem"
            user = "minion"
            group = "minion"
            workers = 2

            [amqp]
            host = "mq"
            username = "agent"
            password = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(settings.minion.name, "edge-1");
        assert_eq!(settings.minion.run_mode(), RunMode::Server);
        assert_eq!(settings.minion.endpoint(), "0.0.0.0:2000");
        assert_eq!(settings.minion.worker_count(), 2);
        assert_eq!(settings.minion.user.as_deref(), Some("minion"));

        let amqp = settings.amqp.as_ref().unwrap();
        assert_eq!(amqp.host, "mq");
        assert_eq!(amqp.port, 5672);
        assert_eq!(amqp.username.as_deref(), Some("agent"));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_plaintext_server_needs_no_tls_material() {
        let settings = Settings::from_toml("[minion]\nserver = true\nplaintext = true").unwrap();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_server_without_tls_material_is_rejected() {
        let settings = Settings::from_toml(
            r#"
            [minion]
            server = true
            ssl_cert = "/etc/minion/cert.pem"
            "#,
        )
        .unwrap();

        let err = settings.validate().unwrap_err();
        assert!(matches!(err, MinionError::Config(ref msg) if msg.contains("ssl_key")));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let settings = Settings::from_toml("[minion]\nworkers = 0").unwrap();
        assert!(matches!(settings.validate(), Err(MinionError::Config(_))));
    }

    #[test]
    fn test_unparseable_document() {
        let result = Settings::from_toml("[minion]\nport = \"not a port\"");
        assert!(matches!(result, Err(MinionError::Config(_))));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let root = tempfile::tempdir().unwrap();
        let settings = Settings::load(root.path()).unwrap();
        assert_eq!(settings.minion.port, DEFAULT_PORT);
    }

    #[test]
    fn test_load_reads_settings_file() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(
            root.path().join(SETTINGS_FILE),
            "[minion]\nport = 4000\nplaintext = true\n",
        )
        .unwrap();

        let settings = Settings::load(root.path()).unwrap();
        assert_eq!(settings.minion.port, 4000);
        assert!(settings.minion.plaintext);
    }
}
