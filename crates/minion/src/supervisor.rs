//! Worker pool supervision
//!
//! The supervisor holds the run-lock, the agent identity and, in server
//! mode, the bound listening socket. It keeps one worker process per slot
//! alive: every poll interval it reaps dead workers and launches
//! replacements into the same slot.

use crate::config::Settings;
use crate::identity::AgentIdentity;
use crate::lock::RunLock;
use crate::service::ServiceRegistry;
use crate::tls::SecurityContext;
use crate::Result;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often dead workers are looked for
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How long a worker gets to exit after SIGTERM before it is killed
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Starts the process for a worker slot
pub trait WorkerLauncher: Send + Sync {
    /// Launch the worker for slot `index`
    fn launch(&self, index: usize) -> std::io::Result<Child>;
}

/// Re-executes the running binary in worker mode
#[derive(Debug, Clone)]
pub struct ExecLauncher {
    exe: PathBuf,
    root: PathBuf,
    listen_fd: Option<RawFd>,
}

impl ExecLauncher {
    /// Launcher for workers of the agent rooted at `root`
    pub fn new(root: impl Into<PathBuf>, listen_fd: Option<RawFd>) -> std::io::Result<Self> {
        Ok(Self {
            exe: std::env::current_exe()?,
            root: root.into(),
            listen_fd,
        })
    }
}

impl WorkerLauncher for ExecLauncher {
    fn launch(&self, index: usize) -> std::io::Result<Child> {
        let mut command = Command::new(&self.exe);
        command
            .arg("worker")
            .arg(&self.root)
            .arg("--index")
            .arg(index.to_string());
        if let Some(fd) = self.listen_fd {
            command.arg("--listen-fd").arg(fd.to_string());
        }
        command.kill_on_drop(true).spawn()
    }
}

/// One worker position in the pool
#[derive(Debug)]
pub struct WorkerSlot {
    index: usize,
    child: Option<Child>,
    restarts: u32,
}

impl WorkerSlot {
    fn new(index: usize) -> Self {
        Self {
            index,
            child: None,
            restarts: 0,
        }
    }

    /// Slot number
    pub fn index(&self) -> usize {
        self.index
    }

    /// Pid of the current worker, if it has not been reaped
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Times this slot's worker has been replaced
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Whether the worker is running; reaps it if it exited
    pub fn is_alive(&mut self) -> bool {
        match &mut self.child {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn start(&mut self, launcher: &dyn WorkerLauncher) -> std::io::Result<()> {
        let child = launcher.launch(self.index)?;
        debug!("Worker {} started with pid {:?}", self.index, child.id());
        self.child = Some(child);
        Ok(())
    }

    async fn stop(&mut self, grace: Duration) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let Some(pid) = child.id() else {
            // Already reaped
            return;
        };

        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!("SIGTERM to worker {} failed: {}", self.index, e);
        }
        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            warn!("Worker {} ignored SIGTERM, killing it", self.index);
            if let Err(e) = child.kill().await {
                debug!("Killing worker {} failed: {}", self.index, e);
            }
        }
    }
}

/// Owner of the worker pool and the agent's identity
pub struct Supervisor {
    root: PathBuf,
    settings: Settings,
    identity: AgentIdentity,
    registry: ServiceRegistry,
    security: SecurityContext,
    listener: Option<std::net::TcpListener>,
    slots: Vec<WorkerSlot>,
    launcher: Box<dyn WorkerLauncher>,
    poll_interval: Duration,
    shutdown: CancellationToken,
    lock: Option<RunLock>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("root", &self.root)
            .field("identity", &self.identity)
            .field("services", &self.registry)
            .field("slots", &self.slots)
            .finish()
    }
}

impl Supervisor {
    /// Take the run-lock for `root` and prepare one slot per worker
    ///
    /// Fails with `AlreadyRunning` if another agent holds the lock, and with
    /// a configuration error if TLS material is missing. In server mode the
    /// listening socket is bound here, once, and shared with every worker.
    pub fn acquire(
        root: impl Into<PathBuf>,
        settings: Settings,
        registry: ServiceRegistry,
    ) -> Result<Self> {
        let root = root.into();
        let lock = RunLock::acquire(&root)?;
        settings.validate()?;

        let identity = AgentIdentity::load(&root, settings.minion.run_mode())?;
        let security = SecurityContext::from_settings(&settings.minion)?;

        let listener = if settings.minion.server {
            let listener = std::net::TcpListener::bind(settings.minion.endpoint())?;
            inheritable(&listener)?;
            info!("Listening on {}", listener.local_addr()?);
            Some(listener)
        } else {
            None
        };

        let launcher = ExecLauncher::new(&root, listener.as_ref().map(AsRawFd::as_raw_fd))?;
        let slots = (0..settings.minion.worker_count())
            .map(WorkerSlot::new)
            .collect();

        info!(
            "Agent {} ({}) acquired {}",
            settings.minion.name,
            identity.durable_id,
            root.display()
        );

        Ok(Self {
            root,
            settings,
            identity,
            registry,
            security,
            listener,
            slots,
            launcher: Box::new(launcher),
            poll_interval: POLL_INTERVAL,
            shutdown: CancellationToken::new(),
            lock: Some(lock),
        })
    }

    /// Launch workers with `launcher` instead of re-executing this binary
    pub fn with_launcher(mut self, launcher: impl WorkerLauncher + 'static) -> Self {
        self.launcher = Box::new(launcher);
        self
    }

    /// Look for dead workers every `interval`
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Agent root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Settings the agent runs with
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Identity of this run
    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    /// Security context prepared for the workers' mode
    pub fn security(&self) -> &SecurityContext {
        &self.security
    }

    /// Address of the shared listener in server mode
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Worker slots
    pub fn slots(&self) -> &[WorkerSlot] {
        &self.slots
    }

    /// Cancel to make [`run`](Self::run) return
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Launch a worker into every empty slot
    pub fn start_workers(&mut self) -> usize {
        let mut started = 0;
        for slot in &mut self.slots {
            if slot.child.is_some() {
                continue;
            }
            match slot.start(self.launcher.as_ref()) {
                Ok(()) => started += 1,
                Err(e) => error!(critical = true, "Failed to start worker {}: {}", slot.index, e),
            }
        }
        started
    }

    /// Replace every worker that has exited, returning how many were replaced
    ///
    /// A slot whose relaunch fails stays empty until the next check.
    pub fn check_workers(&mut self) -> usize {
        let mut replaced = 0;
        for slot in &mut self.slots {
            if slot.is_alive() {
                continue;
            }

            if slot.child.take().is_some() {
                error!(critical = true, "Worker {} died, replacing it", slot.index);
            } else {
                warn!("Worker {} not running, starting it", slot.index);
            }

            match slot.start(self.launcher.as_ref()) {
                Ok(()) => {
                    slot.restarts += 1;
                    replaced += 1;
                    info!("Worker {} replaced (pid {:?})", slot.index, slot.pid());
                }
                Err(e) => error!(critical = true, "Failed to start worker {}: {}", slot.index, e),
            }
        }
        replaced
    }

    /// Start the workers and keep them alive until the shutdown token fires
    pub async fn run(&mut self) -> Result<()> {
        let started = self.start_workers();
        info!("Started {} of {} workers", started, self.slots.len());

        let token = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            self.check_workers();
        }
        Ok(())
    }

    /// Stop every worker, close the listener, shut services down and
    /// release the run-lock
    ///
    /// Workers that already exited are skipped; calling it twice is harmless.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        futures::future::join_all(self.slots.iter_mut().map(|slot| slot.stop(STOP_GRACE))).await;
        self.listener = None;

        if let Some(lock) = self.lock.take() {
            self.registry.shutdown_all();
            drop(lock);
            info!("Agent in {} stopped", self.root.display());
        }
    }
}

/// Let worker processes inherit `listener`
fn inheritable(listener: &std::net::TcpListener) -> Result<()> {
    let fd = listener.as_raw_fd();
    let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    fcntl(fd, FcntlArg::F_SETFD(flags - FdFlag::FD_CLOEXEC))?;
    Ok(())
}
