//! Tunnel lifecycle controller

use crate::args::{LaunchConfig, build_arguments};
use crate::artifact::{ArtifactCache, ArtifactDescriptor};
use crate::classifier::{AgentFault, Classification, classify};
use crate::config::SupervisorConfig;
use crate::download::{Fetcher, HttpFetcher};
use crate::readiness::{ReadinessMonitor, ReadinessOutcome};
use crate::runtime::check_runtime;
use crate::{Result, SupervisorError, SupervisorState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound for reading the agent's remaining stderr after it exited
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How the agent process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelExit {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Terminating signal, if any (unix only)
    pub signal: Option<i32>,
    /// Whether a caller asked for the shutdown
    pub requested: bool,
}

impl TunnelExit {
    fn from_status(status: ExitStatus, requested: bool) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            requested,
        }
    }
}

/// Graceful interrupt request sent to the waiter task.
///
/// `requested` is false when the supervisor itself reacts to fatal agent output.
#[derive(Debug, Clone, Copy)]
struct Interrupt {
    requested: bool,
}

/// Supervisor-owned record of the running agent
#[derive(Debug)]
struct ActiveTunnel {
    id: u64,
    pid: u32,
    started_at: DateTime<Utc>,
    control: mpsc::UnboundedSender<Interrupt>,
    exit: watch::Receiver<Option<TunnelExit>>,
    last_error: Arc<std::sync::Mutex<Option<AgentFault>>>,
    fault: CancellationToken,
    slot: Weak<Mutex<Slot>>,
}

impl ActiveTunnel {
    fn handle(self: &Arc<Self>) -> TunnelHandle {
        TunnelHandle {
            id: self.id,
            pid: self.pid,
            started_at: self.started_at,
            tunnel: Arc::downgrade(self),
            exit: self.exit.clone(),
            last_error: Arc::clone(&self.last_error),
        }
    }

    fn interrupt(&self, requested: bool) {
        // A closed channel means the waiter already saw the exit.
        let _ = self.control.send(Interrupt { requested });
    }
}

#[derive(Debug, Default)]
struct Slot {
    state: SupervisorState,
    active: Option<Arc<ActiveTunnel>>,
}

impl Slot {
    fn tracks(&self, id: u64) -> bool {
        self.active.as_ref().is_some_and(|t| t.id == id)
    }
}

/// Caller-side view of a running tunnel.
///
/// Holds only a weak reference to the supervised process: it can ask for a
/// shutdown and observe the exit, but cannot touch the process itself.
#[derive(Debug, Clone)]
pub struct TunnelHandle {
    id: u64,
    pid: u32,
    started_at: DateTime<Utc>,
    tunnel: Weak<ActiveTunnel>,
    exit: watch::Receiver<Option<TunnelExit>>,
    last_error: Arc<std::sync::Mutex<Option<AgentFault>>>,
}

impl TunnelHandle {
    /// Supervisor-local tunnel id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Process id of the agent
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Fatal condition reported by the agent, if any
    pub fn last_error(&self) -> Option<AgentFault> {
        lock_fault(&self.last_error).clone()
    }

    pub fn is_running(&self) -> bool {
        self.exit.borrow().is_none()
    }

    /// Exit details once the process has ended
    pub fn exit_status(&self) -> Option<TunnelExit> {
        *self.exit.borrow()
    }

    /// Interrupt the tunnel and wait until it has exited.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::NoActiveTunnel`] if the tunnel is no longer supervised.
    pub async fn close(&self) -> Result<TunnelExit> {
        let tunnel = self
            .tunnel
            .upgrade()
            .ok_or(SupervisorError::NoActiveTunnel)?;
        shutdown(tunnel).await
    }

    /// Wait for the tunnel to end.
    ///
    /// Resolves to `Ok` only for a requested shutdown. An exit the caller did not ask
    /// for is an error: [`SupervisorError::AgentFatal`] when the agent reported a
    /// fatal condition, [`SupervisorError::TunnelLost`] otherwise.
    pub async fn closed(&self) -> Result<TunnelExit> {
        let exit = wait_exit(self.exit.clone()).await?;
        if exit.requested {
            return Ok(exit);
        }
        match self.last_error() {
            Some(fault) => Err(SupervisorError::AgentFatal(fault)),
            None => Err(SupervisorError::TunnelLost {
                code: exit.code,
                signal: exit.signal,
            }),
        }
    }
}

/// Supervises at most one tunnel agent at a time.
///
/// Cloning is cheap; clones share the same state.
#[derive(Clone)]
pub struct TunnelSupervisor {
    config: Arc<SupervisorConfig>,
    cache: ArtifactCache,
    slot: Arc<Mutex<Slot>>,
    next_id: Arc<AtomicU64>,
}

enum LaunchAbort {
    Fault,
    Exited(Result<TunnelExit>),
}

/// Ownership of the slot for one in-flight `launch`.
///
/// Dropping an armed claim (the launch future was cancelled or failed) frees the
/// slot and interrupts the tunnel it started, if any.
struct LaunchClaim {
    slot: Arc<Mutex<Slot>>,
    tunnel: Option<Arc<ActiveTunnel>>,
    armed: bool,
}

impl LaunchClaim {
    /// The launch reached a final outcome; the slot is managed elsewhere from now on.
    fn settle(&mut self) {
        self.armed = false;
    }
}

impl Drop for LaunchClaim {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let tunnel = self.tunnel.take();
        if let Some(tunnel) = &tunnel {
            info!(pid = tunnel.pid, "Launch abandoned, closing tunnel");
            tunnel.interrupt(true);
        }
        let id = tunnel.map(|t| t.id);

        match self.slot.try_lock() {
            Ok(mut slot) => abandon(&mut slot, id),
            Err(_) => {
                let slot = Arc::clone(&self.slot);
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    runtime.spawn(async move { abandon(&mut *slot.lock().await, id) });
                }
            }
        }
    }
}

fn abandon(slot: &mut Slot, tunnel: Option<u64>) {
    match tunnel {
        Some(id) if slot.tracks(id) => slot.state = SupervisorState::Terminating,
        _ if slot.active.is_none() => slot.state = SupervisorState::Idle,
        _ => {}
    }
}

impl TunnelSupervisor {
    /// Create a supervisor that downloads artifacts over HTTP(S)
    pub fn new(config: SupervisorConfig) -> Result<Self> {
        Self::with_fetcher(config, Arc::new(HttpFetcher::new()))
    }

    /// Create a supervisor with a custom artifact fetcher
    pub fn with_fetcher(config: SupervisorConfig, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
        config.validate()?;
        let cache = ArtifactCache::new(config.artifact.clone(), config.runtime.clone(), fetcher);
        Ok(Self {
            config: Arc::new(config),
            cache,
            slot: Arc::new(Mutex::new(Slot::default())),
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn artifacts(&self) -> &ArtifactCache {
        &self.cache
    }

    pub async fn state(&self) -> SupervisorState {
        self.slot.lock().await.state
    }

    /// Handle to the currently tracked tunnel, if any
    pub async fn active_handle(&self) -> Option<TunnelHandle> {
        self.slot.lock().await.active.as_ref().map(ActiveTunnel::handle)
    }

    /// Fetch/validate the artifact, start the agent and wait until it is ready.
    ///
    /// Dropping the returned future before it completes gives up the launch: the
    /// supervisor goes back to `Idle` and any agent already started is closed.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::Busy`] if a tunnel is already being supervised, otherwise
    /// whichever step failed: artifact, runtime, readiness timeout, fatal agent output
    /// or an early exit. After a readiness timeout the agent keeps running and stays
    /// tracked; use [`TunnelSupervisor::kill`] to stop it.
    pub async fn launch(&self, options: LaunchConfig) -> Result<TunnelHandle> {
        let mut claim = self.claim().await?;
        let artifact = self.prepare(&options).await?;
        self.start(options, artifact, &mut claim).await
    }

    /// Interrupt the tunnel behind `handle` and wait for it to exit.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::NoActiveTunnel`] unless `handle` refers to the tracked tunnel.
    pub async fn terminate(&self, handle: &TunnelHandle) -> Result<TunnelExit> {
        let tunnel = {
            let slot = self.slot.lock().await;
            match slot.active.as_ref() {
                Some(tunnel) if tunnel.id == handle.id => Arc::clone(tunnel),
                _ => return Err(SupervisorError::NoActiveTunnel),
            }
        };
        shutdown(tunnel).await
    }

    /// Interrupt the tracked tunnel without waiting for it to exit.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::NoActiveTunnel`] if nothing is tracked.
    pub async fn kill(&self) -> Result<()> {
        let mut slot = self.slot.lock().await;
        let tunnel = slot
            .active
            .as_ref()
            .map(Arc::clone)
            .ok_or(SupervisorError::NoActiveTunnel)?;
        slot.state = SupervisorState::Terminating;
        info!(pid = tunnel.pid, "Killing tunnel");
        tunnel.interrupt(true);
        Ok(())
    }

    async fn claim(&self) -> Result<LaunchClaim> {
        let mut slot = self.slot.lock().await;
        if slot.state != SupervisorState::Idle {
            return Err(SupervisorError::Busy(slot.state));
        }
        slot.state = SupervisorState::Downloading;
        Ok(LaunchClaim {
            slot: Arc::clone(&self.slot),
            tunnel: None,
            armed: true,
        })
    }

    async fn set_state(&self, state: SupervisorState) {
        self.slot.lock().await.state = state;
    }

    async fn prepare(&self, options: &LaunchConfig) -> Result<ArtifactDescriptor> {
        let version = options.tunnel_version();
        let artifact = self.cache.ensure(version.as_deref()).await?;

        self.set_state(SupervisorState::Verifying).await;
        if !tokio::fs::try_exists(&artifact.cache_path).await? {
            return Err(SupervisorError::ArtifactMissing(artifact.cache_path));
        }

        let runtime = check_runtime(&self.config.runtime).await?;
        debug!(version = ?runtime.version, "Runtime check passed");
        Ok(artifact)
    }

    async fn start(
        &self,
        options: LaunchConfig,
        artifact: ArtifactDescriptor,
        claim: &mut LaunchClaim,
    ) -> Result<TunnelHandle> {
        self.set_state(SupervisorState::Launching).await;

        let monitor = ReadinessMonitor::from_config(&self.config.readiness);
        monitor.clear_stale_marker().await?;

        let verbose = options.verbose();
        let args = build_arguments(&options, &artifact.cache_path, &self.config.readiness);
        let runtime = &self.config.runtime;
        if verbose {
            info!(program = %runtime.program, ?args, "Starting tunnel");
        } else {
            debug!(program = %runtime.program, ?args, "Starting tunnel");
        }

        let spawned = Command::new(&runtime.program)
            .args(&runtime.launch_args)
            .args(&args)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Only matters until the exit waiter owns the child.
            .kill_on_drop(true)
            .spawn();
        let mut child = spawned.map_err(|e| {
            SupervisorError::Process(format!("Failed to spawn {}: {}", runtime.program, e))
        })?;

        let pid = child.id().unwrap_or_default();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let last_error = Arc::new(std::sync::Mutex::new(None));
        let fault = CancellationToken::new();

        let tunnel = Arc::new(ActiveTunnel {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            pid,
            started_at: Utc::now(),
            control: control_tx.clone(),
            exit: exit_rx,
            last_error: Arc::clone(&last_error),
            fault: fault.clone(),
            slot: Arc::downgrade(&self.slot),
        });
        info!(pid, tunnel_id = tunnel.id, "Tunnel process started");

        let stderr_task = child.stderr.take().map(|stderr| {
            let monitor = DiagnosticsMonitor {
                pid,
                verbose,
                control: control_tx,
                last_error,
                fault: fault.clone(),
            };
            tokio::spawn(monitor.run(stderr))
        });
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, move |line| {
                if verbose {
                    info!(pid, "{}", line);
                } else {
                    debug!(pid, "{}", line);
                }
            }));
        }

        {
            let mut slot = self.slot.lock().await;
            slot.active = Some(Arc::clone(&tunnel));
            slot.state = SupervisorState::AwaitingReady;
        }
        claim.tunnel = Some(Arc::clone(&tunnel));

        tokio::spawn(supervise_exit(
            child,
            control_rx,
            exit_tx,
            Arc::clone(&self.slot),
            tunnel.id,
            self.config.shutdown_timeout,
        ));

        let abort = {
            let fault = fault.clone();
            let exit_rx = tunnel.exit.clone();
            async move {
                tokio::select! {
                    biased;
                    _ = fault.cancelled() => LaunchAbort::Fault,
                    status = wait_exit(exit_rx) => LaunchAbort::Exited(status),
                }
            }
        };

        let outcome = match monitor.wait(abort).await {
            ReadinessOutcome::Ready { .. } if fault.is_cancelled() => {
                Err(self.fail_on_fault(&tunnel).await)
            }
            ReadinessOutcome::Ready { elapsed } => {
                // A kill during the wait leaves the state at Terminating.
                let promoted = {
                    let mut slot = self.slot.lock().await;
                    let awaiting =
                        slot.tracks(tunnel.id) && slot.state == SupervisorState::AwaitingReady;
                    if awaiting {
                        slot.state = SupervisorState::Running;
                    }
                    awaiting
                };
                if promoted {
                    info!(pid, ?elapsed, "Tunnel is ready");
                    Ok(tunnel.handle())
                } else {
                    let exit = wait_exit(tunnel.exit.clone()).await;
                    Err(early_exit_error(&tunnel, exit, stderr_task).await)
                }
            }
            ReadinessOutcome::Aborted(LaunchAbort::Fault) => Err(self.fail_on_fault(&tunnel).await),
            ReadinessOutcome::Aborted(LaunchAbort::Exited(exit)) => {
                Err(early_exit_error(&tunnel, exit, stderr_task).await)
            }
            ReadinessOutcome::TimedOut { elapsed } => {
                warn!(pid, ?elapsed, "Tunnel did not signal readiness, leaving it running");
                Err(SupervisorError::LaunchTimeout { elapsed })
            }
        };
        claim.settle();
        outcome
    }

    /// The agent reported a fatal condition: wait for the interrupted process to go
    /// away, then surface the fault.
    async fn fail_on_fault(&self, tunnel: &Arc<ActiveTunnel>) -> SupervisorError {
        {
            let mut slot = self.slot.lock().await;
            if slot.tracks(tunnel.id) {
                slot.state = SupervisorState::Terminating;
            }
        }
        if let Err(e) = wait_exit(tunnel.exit.clone()).await {
            warn!(pid = tunnel.pid, "Lost track of failing tunnel: {}", e);
        }
        let fault = lock_fault(&tunnel.last_error).clone();
        match fault {
            Some(fault) => SupervisorError::AgentFatal(fault),
            None => SupervisorError::Process("tunnel failed without a diagnostic".to_string()),
        }
    }
}

async fn early_exit_error(
    tunnel: &ActiveTunnel,
    exit: Result<TunnelExit>,
    stderr_task: Option<tokio::task::JoinHandle<()>>,
) -> SupervisorError {
    let exit = match exit {
        Ok(exit) => exit,
        Err(e) => return e,
    };
    // Lines written just before exiting may still be in the pipe.
    if let Some(task) = stderr_task {
        if tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await.is_err() {
            debug!(pid = tunnel.pid, "Tunnel stderr still open after exit");
        }
    }
    let fault = lock_fault(&tunnel.last_error).clone();
    match fault {
        Some(fault) => SupervisorError::AgentFatal(fault),
        None => SupervisorError::UnexpectedExit {
            code: exit.code,
            signal: exit.signal,
        },
    }
}

/// Ask the tunnel to stop and wait for its exit
async fn shutdown(tunnel: Arc<ActiveTunnel>) -> Result<TunnelExit> {
    if let Some(slot) = tunnel.slot.upgrade() {
        let mut slot = slot.lock().await;
        if slot.tracks(tunnel.id) {
            slot.state = SupervisorState::Terminating;
        }
    }
    info!(pid = tunnel.pid, "Closing tunnel");
    tunnel.interrupt(true);

    let exit = tunnel.exit.clone();
    drop(tunnel);
    wait_exit(exit).await
}

async fn wait_exit(mut exit: watch::Receiver<Option<TunnelExit>>) -> Result<TunnelExit> {
    let observed = exit.wait_for(Option::is_some).await.map(|value| *value);
    match observed {
        Ok(Some(status)) => Ok(status),
        _ => Err(SupervisorError::Process(
            "tunnel supervision ended without an exit status".to_string(),
        )),
    }
}

fn lock_fault(
    slot: &std::sync::Mutex<Option<AgentFault>>,
) -> std::sync::MutexGuard<'_, Option<AgentFault>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns the child process until it exits; the only place that signals it.
async fn supervise_exit(
    mut child: Child,
    mut control: mpsc::UnboundedReceiver<Interrupt>,
    exit_tx: watch::Sender<Option<TunnelExit>>,
    slot: Arc<Mutex<Slot>>,
    id: u64,
    shutdown_timeout: Duration,
) {
    let pid = child.id().unwrap_or_default();
    let mut requested = false;
    let mut kill_deadline: Option<Instant> = None;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(request) = control.recv() => {
                requested |= request.requested;
                if let Err(e) = send_interrupt(&mut child) {
                    warn!(pid, "Failed to interrupt tunnel: {}", e);
                }
                if kill_deadline.is_none() {
                    kill_deadline = Some(Instant::now() + shutdown_timeout);
                }
            }
            _ = tokio::time::sleep_until(kill_deadline.unwrap_or_else(Instant::now)), if kill_deadline.is_some() => {
                warn!(pid, ?shutdown_timeout, "Tunnel ignored the interrupt, killing it");
                if let Err(e) = child.start_kill() {
                    warn!(pid, "Failed to kill tunnel: {}", e);
                }
                kill_deadline = None;
            }
        }
    };

    let exit = match status {
        Ok(status) => TunnelExit::from_status(status, requested),
        Err(e) => {
            warn!(pid, "Failed to wait for tunnel: {}", e);
            TunnelExit {
                code: None,
                signal: None,
                requested,
            }
        }
    };

    if requested {
        info!(pid, code = ?exit.code, signal = ?exit.signal, "Tunnel closed");
    } else {
        warn!(pid, code = ?exit.code, signal = ?exit.signal, "Tunnel exited");
    }

    {
        let mut slot = slot.lock().await;
        if slot.tracks(id) {
            slot.active = None;
            slot.state = SupervisorState::Idle;
        }
    }
    exit_tx.send_replace(Some(exit));
}

#[cfg(unix)]
fn send_interrupt(child: &mut Child) -> std::io::Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGINT).map_err(std::io::Error::from),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn send_interrupt(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}

/// Watches agent stderr and reacts to fatal lines
struct DiagnosticsMonitor {
    pid: u32,
    verbose: bool,
    control: mpsc::UnboundedSender<Interrupt>,
    last_error: Arc<std::sync::Mutex<Option<AgentFault>>>,
    fault: CancellationToken,
}

impl DiagnosticsMonitor {
    async fn run<R>(self, stderr: R)
    where
        R: AsyncRead + Unpin,
    {
        forward_lines(stderr, |line| self.on_line(line)).await;
    }

    fn on_line(&self, line: &str) {
        let pid = self.pid;
        match classify(line) {
            Classification::Pass => {
                if self.verbose {
                    info!(pid, "{}", line);
                } else {
                    debug!(pid, "{}", line);
                }
            }
            Classification::UpdateAvailable => info!(pid, "{}", line.trim()),
            Classification::Fatal(fault) => {
                warn!(pid, "{}", line.trim());
                {
                    // Keep the first fault; later lines are usually fallout from it.
                    let mut last = lock_fault(&self.last_error);
                    if last.is_none() {
                        *last = Some(fault);
                    }
                }
                if !self.fault.is_cancelled() {
                    self.fault.cancel();
                    let _ = self.control.send(Interrupt { requested: false });
                }
            }
        }
    }
}

/// Feed each line of `reader` (lossily decoded) to `on_line` until EOF.
async fn forward_lines<R, F>(reader: R, mut on_line: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                if !line.trim().is_empty() {
                    on_line(line);
                }
            }
            Err(e) => {
                debug!("Stopped reading tunnel output: {}", e);
                break;
            }
        }
    }
}
