//! Tunnel process supervisor
//!
//! Owns the lifecycle of the external `paqet` process:
//! - spawn in `run` mode with a config file path
//! - capture stdout/stderr into the [`RingLogBuffer`] with live fan-out
//! - classify exits as clean stop, clean exit or crash
//! - graceful termination with a forced kill after a grace period
//!
//! State machine:
//!
//! ```text
//! idle --start--> starting --spawn ok--> connected --exit (stop requested)--> idle
//!                     |                      `--exit (unexpected, non-zero)--> error
//!                     `--spawn failure--> error
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::error::SupervisorError;
use crate::log_buffer::{LogSubscription, RingLogBuffer, SubscriberId, DEFAULT_CAPACITY};

/// Subcommand for the long-running tunnel
pub const RUN_SUBCOMMAND: &str = "run";

/// Time allowed between SIGTERM and a forced kill
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How long to wait for the exit watcher after a forced kill
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Environment override for the tunnel binary location
pub const BINARY_ENV: &str = "AUTOPAQET_BINARY";

/// Lifecycle state of the supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Idle,
    Starting,
    Connected,
    Error,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Starting => write!(f, "starting"),
            Self::Connected => write!(f, "connected"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Callback invoked on every state transition
pub type StateHandler = Arc<dyn Fn(ProcessState) + Send + Sync>;

/// The start/stop surface the diagnostic orchestrator drives.
#[async_trait]
pub trait TunnelRunner: Send + Sync {
    async fn start(&self, config_path: &Path) -> Result<(), SupervisorError>;
    async fn stop(&self) -> Result<(), SupervisorError>;

    /// Mute or unmute external state-change notifications.
    fn set_state_notifications(&self, _enabled: bool) {}
}

struct RunningProcess {
    generation: u64,
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
}

struct Shared {
    state: ProcessState,
    process: Option<RunningProcess>,
    generation: u64,
    /// Set by `stop()` before signalling, read by the exit watcher.
    stop_requested: bool,
    last_error: Option<String>,
    on_state_change: Option<StateHandler>,
    notify: bool,
}

struct Inner {
    binary: PathBuf,
    grace_period: Duration,
    shared: Mutex<Shared>,
    logs: Arc<RingLogBuffer>,
    state_tx: broadcast::Sender<ProcessState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a transition. The returned handler must be invoked after the
    /// lock is released.
    fn transition(&self, shared: &mut Shared, state: ProcessState) -> Option<StateHandler> {
        shared.state = state;
        let _ = self.state_tx.send(state);
        if shared.notify {
            shared.on_state_change.clone()
        } else {
            None
        }
    }

    fn fail(&self, msg: String) {
        error!("{}", msg);
        let handler = {
            let mut shared = self.lock();
            shared.last_error = Some(msg.clone());
            self.transition(&mut shared, ProcessState::Error)
        };
        self.logs.append(format!("[ERROR] {msg}"));
        fire(handler, ProcessState::Error);
    }

    async fn watch_exit(
        self: Arc<Self>,
        mut child: Child,
        generation: u64,
        kill_rx: oneshot::Receiver<()>,
        exited_tx: watch::Sender<bool>,
    ) {
        let status = tokio::select! {
            status = child.wait() => status,
            Ok(()) = kill_rx => {
                if let Err(e) = child.start_kill() {
                    warn!(%e, "Failed to kill tunnel process");
                }
                child.wait().await
            }
        };

        let mut crash = None;
        let (state, handler) = {
            let mut shared = self.lock();
            if shared.generation != generation {
                // A newer process already replaced this one.
                drop(shared);
                let _ = exited_tx.send(true);
                return;
            }
            shared.process = None;

            let state = if shared.stop_requested {
                shared.stop_requested = false;
                if let Ok(s) = &status {
                    debug!(exit = %s, "Tunnel process exited after stop request");
                }
                ProcessState::Idle
            } else {
                match &status {
                    Ok(s) if s.success() => {
                        info!("Tunnel process exited cleanly");
                        ProcessState::Idle
                    }
                    Ok(s) => {
                        crash = Some(format!("paqet exited with error: {s}"));
                        ProcessState::Error
                    }
                    Err(e) => {
                        crash = Some(format!("failed to wait for paqet: {e}"));
                        ProcessState::Error
                    }
                }
            };
            if let Some(msg) = &crash {
                shared.last_error = Some(msg.clone());
            }
            (state, self.transition(&mut shared, state))
        };

        if let Some(msg) = crash {
            warn!("{}", msg);
            self.logs.append(format!("[ERROR] {msg}"));
        }
        fire(handler, state);
        let _ = exited_tx.send(true);
    }
}

fn fire(handler: Option<StateHandler>, state: ProcessState) {
    if let Some(handler) = handler {
        handler(state);
    }
}

async fn pump_lines<R>(reader: R, logs: Arc<RingLogBuffer>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => logs.append(line),
            Ok(None) => break,
            Err(e) => {
                debug!(%e, "Tunnel output reader stopped");
                break;
            }
        }
    }
}

/// Supervisor for one tunnel process at a time.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self::with_capacity(binary, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(binary: impl Into<PathBuf>, log_capacity: usize) -> Self {
        let (state_tx, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                binary: binary.into(),
                grace_period: DEFAULT_GRACE_PERIOD,
                shared: Mutex::new(Shared {
                    state: ProcessState::Idle,
                    process: None,
                    generation: 0,
                    stop_requested: false,
                    last_error: None,
                    on_state_change: None,
                    notify: true,
                }),
                logs: Arc::new(RingLogBuffer::new(log_capacity)),
                state_tx,
            }),
        }
    }

    /// Override the SIGTERM grace period. Only valid before first use.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.grace_period = grace_period;
        }
        self
    }

    /// Path of the tunnel binary this supervisor launches
    pub fn binary(&self) -> &Path {
        &self.inner.binary
    }

    /// Current lifecycle state
    pub fn state(&self) -> ProcessState {
        self.inner.lock().state
    }

    /// Message of the most recent failure, if any
    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    /// Process id of the running tunnel
    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().process.as_ref().and_then(|p| p.pid)
    }

    /// Install the callback fired on each transition while notifications are enabled
    pub fn set_state_change_handler<F>(&self, handler: F)
    where
        F: Fn(ProcessState) + Send + Sync + 'static,
    {
        self.inner.lock().on_state_change = Some(Arc::new(handler));
    }

    /// Subscribe to every transition, independent of notification muting.
    pub fn subscribe_state(&self) -> broadcast::Receiver<ProcessState> {
        self.inner.state_tx.subscribe()
    }

    /// Shared buffer holding the tunnel's output
    pub fn log_buffer(&self) -> Arc<RingLogBuffer> {
        self.inner.logs.clone()
    }

    /// Last `count` captured lines, oldest first
    pub fn logs(&self, count: usize) -> Vec<String> {
        self.inner.logs.snapshot(count)
    }

    /// Drop all captured lines
    pub fn clear_logs(&self) {
        self.inner.logs.clear();
    }

    /// Receive each new output line as it is captured
    pub fn subscribe_logs(&self) -> LogSubscription {
        self.inner.logs.subscribe()
    }

    /// Close a subscription returned by [`Self::subscribe_logs`]
    pub fn unsubscribe_logs(&self, id: SubscriberId) {
        self.inner.logs.unsubscribe(id);
    }

    /// Launch the tunnel in `run` mode with the given config file.
    pub async fn start(&self, config_path: &Path) -> Result<(), SupervisorError> {
        let handler = {
            let mut shared = self.inner.lock();
            if !matches!(shared.state, ProcessState::Idle | ProcessState::Error) {
                return Err(SupervisorError::AlreadyRunning(shared.state));
            }
            shared.stop_requested = false;
            self.inner.transition(&mut shared, ProcessState::Starting)
        };
        fire(handler, ProcessState::Starting);

        info!(
            binary = %self.inner.binary.display(),
            config = %config_path.display(),
            "Starting tunnel process"
        );

        let mut cmd = Command::new(&self.inner.binary);
        cmd.arg(RUN_SUBCOMMAND)
            .arg("-c")
            .arg(config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        hide_console(&mut cmd);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.inner.fail(format!("failed to start paqet: {e}"));
                return Err(SupervisorError::Spawn(e));
            }
        };

        let Some(stdout) = child.stdout.take() else {
            let _ = child.start_kill();
            self.inner.fail("failed to create stdout pipe".to_string());
            return Err(SupervisorError::Pipe("stdout"));
        };
        let Some(stderr) = child.stderr.take() else {
            let _ = child.start_kill();
            self.inner.fail("failed to create stderr pipe".to_string());
            return Err(SupervisorError::Pipe("stderr"));
        };

        tokio::spawn(pump_lines(stdout, self.inner.logs.clone()));
        tokio::spawn(pump_lines(stderr, self.inner.logs.clone()));

        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);

        let (generation, handler) = {
            let mut shared = self.inner.lock();
            shared.generation += 1;
            let generation = shared.generation;
            shared.process = Some(RunningProcess {
                generation,
                pid,
                kill_tx: Some(kill_tx),
                exited: exited_rx,
            });
            (
                generation,
                self.inner.transition(&mut shared, ProcessState::Connected),
            )
        };
        fire(handler, ProcessState::Connected);

        info!(pid = ?pid, "Tunnel process started");

        let inner = self.inner.clone();
        tokio::spawn(inner.watch_exit(child, generation, kill_rx, exited_tx));

        Ok(())
    }

    /// Stop the tunnel: SIGTERM, wait up to the grace period, then kill.
    /// Always ends in `idle`.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let (generation, pid, kill_tx, mut exited) = {
            let mut shared = self.inner.lock();
            let Some(process) = shared.process.as_mut() else {
                let handler = if shared.state != ProcessState::Idle {
                    self.inner.transition(&mut shared, ProcessState::Idle)
                } else {
                    None
                };
                drop(shared);
                fire(handler, ProcessState::Idle);
                return Ok(());
            };
            let running = (
                process.generation,
                process.pid,
                process.kill_tx.take(),
                process.exited.clone(),
            );
            shared.stop_requested = true;
            running
        };

        info!(pid = ?pid, "Stopping tunnel process");
        let mut kill_tx = kill_tx;

        if let Err(e) = terminate(pid) {
            warn!(%e, "Graceful termination unavailable, forcing kill");
            if let Some(tx) = kill_tx.take() {
                let _ = tx.send(());
            }
        }

        let graceful = tokio::time::timeout(self.inner.grace_period, exited.wait_for(|done| *done))
            .await
            .is_ok();

        if !graceful {
            warn!("Tunnel process did not terminate gracefully, forcing kill");
            if let Some(tx) = kill_tx.take() {
                let _ = tx.send(());
            }
            if tokio::time::timeout(KILL_WAIT, exited.wait_for(|done| *done))
                .await
                .is_err()
            {
                error!(pid = ?pid, "Tunnel process did not exit after kill");
            }
        }

        let handler = {
            let mut shared = self.inner.lock();
            if shared.generation == generation && shared.process.is_some() {
                // The watcher has not reported yet; retire its generation so a
                // late exit is not read as a crash.
                shared.process = None;
                shared.generation += 1;
            }
            shared.stop_requested = false;
            if shared.state != ProcessState::Idle {
                self.inner.transition(&mut shared, ProcessState::Idle)
            } else {
                None
            }
        };
        fire(handler, ProcessState::Idle);

        Ok(())
    }
}

#[async_trait]
impl TunnelRunner for ProcessSupervisor {
    async fn start(&self, config_path: &Path) -> Result<(), SupervisorError> {
        ProcessSupervisor::start(self, config_path).await
    }

    async fn stop(&self) -> Result<(), SupervisorError> {
        ProcessSupervisor::stop(self).await
    }

    fn set_state_notifications(&self, enabled: bool) {
        self.inner.lock().notify = enabled;
    }
}

#[cfg(unix)]
fn terminate(pid: Option<u32>) -> Result<(), SupervisorError> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let pid = pid.ok_or_else(|| SupervisorError::Signal("process id unavailable".into()))?;
    let raw = i32::try_from(pid).map_err(|e| SupervisorError::Signal(e.to_string()))?;
    signal::kill(Pid::from_raw(raw), Signal::SIGTERM)
        .map_err(|e| SupervisorError::Signal(e.to_string()))
}

#[cfg(not(unix))]
fn terminate(_pid: Option<u32>) -> Result<(), SupervisorError> {
    Err(SupervisorError::Signal("no graceful signal on this platform".into()))
}

/// Keep spawned helpers from flashing a console window on Windows.
#[cfg(windows)]
pub(crate) fn hide_console(cmd: &mut Command) {
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
pub(crate) fn hide_console(_cmd: &mut Command) {}

/// Locate the `paqet` binary.
pub fn find_tunnel_binary() -> Result<PathBuf, SupervisorError> {
    let names: &[&str] = if cfg!(windows) {
        &["paqet.exe"]
    } else {
        &["paqet"]
    };

    // 1) explicit override
    if let Ok(path) = std::env::var(BINARY_ENV) {
        let p = PathBuf::from(path);
        if p.exists() {
            return Ok(p);
        }
    }

    // 2) next to our own executable (bundled install)
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            let found = names
                .iter()
                .flat_map(|name| [exe_dir.join(name), exe_dir.join("bin").join(name)])
                .find(|p| p.exists());
            if let Some(found) = found {
                return Ok(found.canonicalize().unwrap_or(found));
            }
        }
    }

    // 3) classic locations
    let mut candidates: Vec<PathBuf> = Vec::new();
    for name in names {
        candidates.push(PathBuf::from(".").join(name));
        candidates.push(PathBuf::from("/usr/local/bin").join(name));
        candidates.push(PathBuf::from("/usr/bin").join(name));
    }

    // 4) PATH
    for name in names {
        if let Ok(path) = which::which(name) {
            candidates.push(path);
        }
    }

    candidates.into_iter().find(|p| p.exists()).ok_or_else(|| {
        SupervisorError::BinaryNotFound(format!(
            "set {BINARY_ENV}=/path/to/paqet or install paqet into PATH"
        ))
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    fn fake_tunnel(dir: &TempDir, body: &str) -> (PathBuf, PathBuf) {
        let script = dir.path().join("fake-paqet.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let config = dir.path().join("config.yaml");
        std::fs::write(&config, "role: client\n").unwrap();
        (script, config)
    }

    async fn wait_for_state(sup: &ProcessSupervisor, want: ProcessState) -> bool {
        for _ in 0..50 {
            if sup.state() == want {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[test]
    fn initial_state_is_idle() {
        let sup = ProcessSupervisor::new("/fake/binary");
        assert_eq!(sup.state(), ProcessState::Idle);
        assert!(sup.last_error().is_none());
    }

    #[tokio::test]
    async fn stop_when_idle_is_noop() {
        let sup = ProcessSupervisor::new("/fake/binary");
        sup.stop().await.unwrap();
        assert_eq!(sup.state(), ProcessState::Idle);
    }

    #[tokio::test]
    async fn bad_binary_moves_to_error() {
        let sup = ProcessSupervisor::new("/nonexistent/binary");
        let err = sup.start(Path::new("/fake/config.yaml")).await.unwrap_err();

        assert!(matches!(err, SupervisorError::Spawn(_)));
        assert_eq!(sup.state(), ProcessState::Error);
        assert!(sup.last_error().unwrap().contains("failed to start paqet"));
        assert!(sup.logs(10)[0].starts_with("[ERROR]"));
    }

    #[tokio::test]
    async fn start_and_stop() {
        let dir = TempDir::new().unwrap();
        let (script, config) =
            fake_tunnel(&dir, "while true; do echo running; sleep 0.1; done");

        let sup = ProcessSupervisor::new(script);
        sup.start(&config).await.unwrap();
        assert_eq!(sup.state(), ProcessState::Connected);
        assert!(sup.pid().is_some());

        sup.stop().await.unwrap();
        assert_eq!(sup.state(), ProcessState::Idle);
        assert!(sup.pid().is_none());
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (script, config) = fake_tunnel(&dir, "sleep 60");

        let sup = ProcessSupervisor::new(script);
        sup.start(&config).await.unwrap();

        let err = sup.start(&config).await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::AlreadyRunning(ProcessState::Connected)
        ));

        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unexpected_nonzero_exit_is_error() {
        let dir = TempDir::new().unwrap();
        let (script, config) = fake_tunnel(&dir, "echo boom; exit 3");

        let sup = ProcessSupervisor::new(script);
        sup.start(&config).await.unwrap();

        assert!(wait_for_state(&sup, ProcessState::Error).await);
        assert!(sup.last_error().unwrap().contains("exited with error"));
    }

    #[tokio::test]
    async fn clean_exit_returns_to_idle() {
        let dir = TempDir::new().unwrap();
        let (script, config) = fake_tunnel(&dir, "echo done; exit 0");

        let sup = ProcessSupervisor::new(script);
        sup.start(&config).await.unwrap();

        // Connected first, then idle once the watcher sees the exit.
        assert!(wait_for_state(&sup, ProcessState::Idle).await);
        assert!(sup.last_error().is_none());
    }

    #[tokio::test]
    async fn restart_allowed_after_error() {
        let dir = TempDir::new().unwrap();
        let (script, config) = fake_tunnel(&dir, "exit 1");

        let sup = ProcessSupervisor::new(script);
        sup.start(&config).await.unwrap();
        assert!(wait_for_state(&sup, ProcessState::Error).await);

        sup.start(&config).await.unwrap();
        assert!(wait_for_state(&sup, ProcessState::Error).await);
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let dir = TempDir::new().unwrap();
        let (script, config) =
            fake_tunnel(&dir, "echo 'log line 1'\necho 'log line 2' >&2\nsleep 0.3");

        let sup = ProcessSupervisor::new(script);
        sup.start(&config).await.unwrap();
        assert!(wait_for_state(&sup, ProcessState::Idle).await);

        let logs = sup.logs(10);
        assert!(logs.contains(&"log line 1".to_string()));
        assert!(logs.contains(&"log line 2".to_string()));
    }

    #[tokio::test]
    async fn live_subscriber_receives_lines() {
        let dir = TempDir::new().unwrap();
        let (script, config) = fake_tunnel(&dir, "echo hello\nsleep 0.5");

        let sup = ProcessSupervisor::new(script);
        let mut sub = sup.subscribe_logs();
        sup.start(&config).await.unwrap();

        let line = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("timed out waiting for log line");
        assert_eq!(line.as_deref(), Some("hello"));

        sup.unsubscribe_logs(sub.id());
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn state_callback_sees_starting_then_error() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sup = ProcessSupervisor::new("/nonexistent/binary");
        let sink = seen.clone();
        sup.set_state_change_handler(move |s| sink.lock().unwrap().push(s));

        let _ = sup.start(Path::new("/fake/config")).await;

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![ProcessState::Starting, ProcessState::Error]);
    }

    #[tokio::test]
    async fn muted_notifications_skip_callback_but_not_broadcast() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sup = ProcessSupervisor::new("/nonexistent/binary");
        let sink = seen.clone();
        sup.set_state_change_handler(move |s| sink.lock().unwrap().push(s));
        let mut states = sup.subscribe_state();

        TunnelRunner::set_state_notifications(&sup, false);
        let _ = sup.start(Path::new("/fake/config")).await;

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(states.recv().await.unwrap(), ProcessState::Starting);
        assert_eq!(states.recv().await.unwrap(), ProcessState::Error);
    }

    #[tokio::test]
    async fn stubborn_process_is_killed_after_grace_period() {
        let dir = TempDir::new().unwrap();
        let (script, config) =
            fake_tunnel(&dir, "trap '' TERM\nwhile true; do sleep 0.1; done");

        let sup = ProcessSupervisor::new(script).with_grace_period(Duration::from_millis(300));
        sup.start(&config).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        sup.stop().await.unwrap();
        assert_eq!(sup.state(), ProcessState::Idle);
        assert!(sup.last_error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn late_exit_after_stop_is_not_a_crash() {
        let dir = TempDir::new().unwrap();
        let (script, config) =
            fake_tunnel(&dir, "trap '' TERM\nwhile true; do sleep 0.1; done");

        let crashes = Arc::new(StdMutex::new(0usize));
        let sup = ProcessSupervisor::new(script).with_grace_period(Duration::from_millis(300));
        let sink = crashes.clone();
        sup.set_state_change_handler(move |s| {
            if s == ProcessState::Error {
                *sink.lock().unwrap() += 1;
            }
        });
        sup.start(&config).await.unwrap();

        // Paused time lets both stop deadlines lapse before the exit is reaped.
        sup.stop().await.unwrap();
        assert_eq!(sup.state(), ProcessState::Idle);

        tokio::task::spawn_blocking(|| std::thread::sleep(std::time::Duration::from_millis(500)))
            .await
            .unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(sup.state(), ProcessState::Idle);
        assert!(sup.last_error().is_none());
        assert_eq!(*crashes.lock().unwrap(), 0);
        assert!(sup.pid().is_none());
    }
}
