//! Sessions over TLS
//!
//! Certificates are minted per test: a throwaway CA signs a leaf for
//! `localhost`, and processors talk over 127.0.0.1.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use minion::proto::{Call, Value};
use minion::{
    AgentIdentity, Args, CommandTable, Endpoint, MinionError, Processor, ProcessorConfig,
    RunMode, SecurityContext, Service, ServiceContext, ServiceRegistry,
};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

/// CA certificate plus a server certificate and key it signed
struct Pki {
    _dir: TempDir,
    ca: PathBuf,
    cert: PathBuf,
    key: PathBuf,
}

fn write(dir: &Path, name: &str, pem: String) -> Result<PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, pem)?;
    Ok(path)
}

fn pki(ca_name: &str) -> Result<Pki> {
    let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.distinguished_name = DistinguishedName::new();
    ca_params.distinguished_name.push(DnType::CommonName, ca_name);
    let ca_key = KeyPair::generate()?;
    let ca = ca_params.self_signed(&ca_key)?;

    let mut leaf_params = CertificateParams::new(vec!["localhost".to_string()])?;
    leaf_params.distinguished_name = DistinguishedName::new();
    leaf_params.distinguished_name.push(DnType::CommonName, "localhost");
    let leaf_key = KeyPair::generate()?;
    let leaf = leaf_params.signed_by(&leaf_key, &ca, &ca_key)?;

    let dir = tempfile::tempdir()?;
    Ok(Pki {
        ca: write(dir.path(), "ca.pem", ca.pem())?,
        cert: write(dir.path(), "server.pem", leaf.pem())?,
        key: write(dir.path(), "server.key", leaf_key.serialize_pem())?,
        _dir: dir,
    })
}

struct EchoService;

#[async_trait]
impl Service for EchoService {
    fn name(&self) -> &str {
        "echo"
    }

    fn server_commands(&self, _ctx: &ServiceContext) -> CommandTable {
        let mut table = CommandTable::new();
        table.register("echo", |args: Args| async move { Ok(Value::List(args.args)) });
        table
    }
}

fn processor(run_mode: RunMode, endpoint: Endpoint, security: SecurityContext) -> Result<Processor> {
    let mut registry = ServiceRegistry::new();
    registry.register(EchoService)?;

    let identity = AgentIdentity {
        durable_id: Uuid::new_v4(),
        ephemeral_id: Uuid::new_v4().simple().to_string(),
        run_mode,
    };
    let mut config = ProcessorConfig::new(identity, registry, endpoint, security);
    config.dial_retry = Duration::from_millis(100);

    let processor = Processor::new(config)?;
    tokio::spawn({
        let processor = processor.clone();
        async move { processor.run().await }
    });
    Ok(processor)
}

/// A client trusting the server's CA completes a session and makes calls
#[tokio::test]
async fn test_session_over_tls_with_ca_bundle() -> Result<()> {
    let pki = pki("minion test ca")?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let server = processor(
        RunMode::Server,
        Endpoint::Listen(listener),
        SecurityContext::server(&pki.cert, &pki.key)?,
    )?;
    let client = processor(
        RunMode::Client,
        Endpoint::Dial(addr.to_string()),
        SecurityContext::client(Some(&pki.ca), "localhost")?,
    )?;

    let session = tokio::time::timeout(Duration::from_secs(5), client.context().connection("echo"))
        .await??;
    let value = session.invoke(Call::new("echo").arg("sealed")).await?;
    assert_eq!(value, Value::List(vec![Value::from("sealed")]));

    server.shutdown();
    client.shutdown();
    Ok(())
}

/// A client that trusts some other CA refuses the server's certificate
#[tokio::test]
async fn test_client_with_wrong_ca_is_refused() -> Result<()> {
    let trusted = pki("minion test ca")?;
    let stranger = pki("some other ca")?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let server = SecurityContext::server(&trusted.cert, &trusted.key)?;
    let accepting = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await?;
        server.accept(tcp).await.map(|_| ())
    });

    let client = SecurityContext::client(Some(&stranger.ca), "localhost")?;
    match client.connect(TcpStream::connect(addr).await?).await {
        Err(MinionError::Tls(_)) => {}
        Err(other) => return Err(anyhow!("unexpected error {:?}", other)),
        Ok(_) => return Err(anyhow!("handshake with an untrusted server succeeded")),
    }

    let accepted = tokio::time::timeout(Duration::from_secs(5), accepting).await??;
    assert!(accepted.is_err());
    Ok(())
}

/// Without a CA bundle the client encrypts but does not verify the server
#[tokio::test]
async fn test_client_without_bundle_accepts_any_server() -> Result<()> {
    let pki = pki("minion test ca")?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let server = SecurityContext::server(&pki.cert, &pki.key)?;
    let accepting = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await?;
        let mut stream = server.accept(tcp).await?;
        let mut greeting = [0u8; 5];
        stream.read_exact(&mut greeting).await?;
        stream.write_all(&greeting).await?;
        stream.flush().await?;
        Ok::<_, MinionError>(greeting)
    });

    let client = SecurityContext::client(None, "localhost")?;
    let mut stream = client.connect(TcpStream::connect(addr).await?).await?;
    stream.write_all(b"hello").await?;
    stream.flush().await?;
    let mut echoed = [0u8; 5];
    stream.read_exact(&mut echoed).await?;

    assert_eq!(&echoed, b"hello");
    assert_eq!(&accepting.await??, b"hello");
    Ok(())
}
