//! Minion Agent Binary
//!
//! `minion-agent <ROOT>` supervises one worker process per core. The
//! supervisor re-executes this binary with the hidden `worker` subcommand
//! for every slot.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use minion::{signals, worker, Settings, Supervisor};
use minion_agent::builtin_services;
use std::os::fd::{FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use tracing::{info, Instrument};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "minion-agent", version, about = "Minion agent")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Agent root directory holding settings.toml and the agent identity
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve as one worker of a running supervisor
    #[command(hide = true)]
    Worker {
        /// Agent root directory
        root: PathBuf,

        /// Worker slot
        #[arg(long)]
        index: usize,

        /// Inherited listening socket
        #[arg(long)]
        listen_fd: Option<RawFd>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Worker {
            root,
            index,
            listen_fd,
        }) => run_worker(&root, index, listen_fd),
        None => {
            let root = cli.root.context("the agent root directory is required")?;
            run_supervisor(root)
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building the async runtime")
}

fn run_supervisor(root: PathBuf) -> Result<()> {
    let settings = Settings::load(&root)
        .with_context(|| format!("loading settings from {}", root.display()))?;
    init_logging(&settings.minion.log_level);

    let registry = builtin_services()?;
    for service in registry.iter() {
        info!(
            "Service {} {}: {}",
            service.name(),
            service.version(),
            service.description()
        );
    }

    runtime()?.block_on(async move {
        let mut supervisor = Supervisor::acquire(&root, settings, registry)
            .with_context(|| format!("starting agent in {}", root.display()))?;
        signals::cancel_on_signal(supervisor.shutdown_token());

        let result = supervisor.run().await;
        supervisor.shutdown().await;
        result.context("supervising workers")
    })
}

fn run_worker(root: &Path, index: usize, listen_fd: Option<RawFd>) -> Result<()> {
    let settings = Settings::load(root)
        .with_context(|| format!("loading settings from {}", root.display()))?;
    init_logging(&settings.minion.log_level);

    // SAFETY: the supervisor cleared close-on-exec on this socket for us and
    // nothing else in this process refers to the descriptor.
    let listener = listen_fd.map(|fd| unsafe { std::net::TcpListener::from_raw_fd(fd) });
    let registry = builtin_services()?;

    runtime()?
        .block_on(
            worker::serve(root, index, listener, registry)
                .instrument(tracing::info_span!("worker", index)),
        )
        .with_context(|| format!("worker {} failed", index))
}
