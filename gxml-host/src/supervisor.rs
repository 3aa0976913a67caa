//! Worker process lifecycle: spawn, readiness, crash detection, shutdown.
//!
//! Each spawn wires three tasks around the child process. A frame reader
//! drains stdout through [`FrameDecoder`], a diagnostic scanner reads
//! stderr line-wise and watches for the readiness sentinel, and an exit
//! monitor owns the [`Child`] and reports its exit status. All three feed
//! one event channel, and every event is tagged with the spawn generation
//! so a dead process can never speak for its successor.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncBufReadExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{FrameDecoder, RequestEncoder};
use crate::bridge::protocol::BackendInfo;

/// Lifecycle state of the worker process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    /// No process; nothing has asked for one yet, or shutdown ran.
    #[default]
    Stopped,
    /// Process spawned, readiness sentinel not seen yet.
    Starting,
    /// Sentinel seen; requests may be written.
    Ready,
    /// Process died outside shutdown; a respawn is pending.
    Crashed,
}

impl WorkerState {
    pub fn is_ready(&self) -> bool {
        matches!(self, WorkerState::Ready)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] io::Error),
    #[error("worker stdin not captured")]
    StdinNotCaptured,
    #[error("worker stdout not captured")]
    StdoutNotCaptured,
    #[error("worker stderr not captured")]
    StderrNotCaptured,
    #[error("invalid engine search path: {0}")]
    SearchPaths(String),
}

/// Extension point for different worker launch strategies.
///
/// Implementations must pipe all three stdio streams; the supervisor owns
/// them once the child is handed over.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self) -> Result<Child, SpawnError>;
}

/// Pipe all three streams and make sure an orphaned child dies with us.
pub fn configure_stdio(cmd: &mut Command) {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
}

/// Default launcher: runs the Python compute engine as
/// `python3 -u -m <module>`, with the configured search paths prepended to
/// `PYTHONPATH`.
#[derive(Debug, Clone)]
pub struct PythonWorkerLauncher {
    python: String,
    module: String,
    search_paths: Vec<PathBuf>,
}

impl PythonWorkerLauncher {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            python: "python3".to_string(),
            module: module.into(),
            search_paths: Vec::new(),
        }
    }

    pub fn with_python(mut self, python: impl Into<String>) -> Self {
        self.python = python.into();
        self
    }

    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_paths.push(path.into());
        self
    }

    fn command(&self) -> Result<Command, SpawnError> {
        let mut cmd = Command::new(&self.python);
        // -u keeps the engine's pipes unbuffered; responses must not sit in
        // a stdio buffer while the host waits.
        cmd.arg("-u").arg("-m").arg(&self.module);
        if !self.search_paths.is_empty() {
            let mut paths = self.search_paths.clone();
            if let Some(existing) = std::env::var_os("PYTHONPATH") {
                paths.extend(std::env::split_paths(&existing));
            }
            let joined =
                std::env::join_paths(&paths).map_err(|e| SpawnError::SearchPaths(e.to_string()))?;
            cmd.env("PYTHONPATH", joined);
        }
        configure_stdio(&mut cmd);
        Ok(cmd)
    }
}

impl WorkerLauncher for PythonWorkerLauncher {
    fn launch(&self) -> Result<Child, SpawnError> {
        Ok(self.command()?.spawn()?)
    }
}

/// Event from one of a worker's reader tasks.
#[derive(Debug)]
pub(crate) struct WorkerEvent {
    pub generation: u64,
    pub kind: WorkerEventKind,
}

#[derive(Debug)]
pub(crate) enum WorkerEventKind {
    /// One complete frame payload from stdout.
    Frame(Bytes),
    /// stdout failed at the transport level; the process must go.
    ReadFailed(String),
    /// Readiness sentinel seen on stderr.
    Ready(BackendInfo),
    /// Any other stderr line.
    Diag(String),
    /// The process exited. `None` when waiting on it failed.
    Exited(Option<ExitStatus>),
}

#[derive(Debug, Clone, Copy)]
enum KillRequest {
    /// Signal politely, escalate to SIGKILL after `grace`.
    Graceful { grace: Duration },
    /// Straight to SIGKILL.
    Immediate,
}

struct RunningWorker {
    stdin: FramedWrite<ChildStdin, RequestEncoder>,
    kill_tx: mpsc::Sender<KillRequest>,
    spawned_at: DateTime<Utc>,
    ready_at: Option<DateTime<Utc>>,
}

/// Owns the worker process and its lifecycle state machine.
///
/// Driven entirely from the host event loop; the spawned reader tasks only
/// feed the event channel.
pub(crate) struct Supervisor {
    launcher: Arc<dyn WorkerLauncher>,
    events_tx: mpsc::Sender<WorkerEvent>,
    shutdown_grace: Duration,
    state: WorkerState,
    generation: u64,
    worker: Option<RunningWorker>,
    backend_info: Option<BackendInfo>,
}

impl Supervisor {
    pub(crate) fn new(
        launcher: Arc<dyn WorkerLauncher>,
        events_tx: mpsc::Sender<WorkerEvent>,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            launcher,
            events_tx,
            shutdown_grace,
            state: WorkerState::Stopped,
            generation: 0,
            worker: None,
            backend_info: None,
        }
    }

    pub(crate) fn state(&self) -> WorkerState {
        self.state
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state.is_ready() && self.worker.is_some()
    }

    pub(crate) fn backend_info(&self) -> Option<&BackendInfo> {
        self.backend_info.as_ref()
    }

    pub(crate) fn spawned_at(&self) -> Option<DateTime<Utc>> {
        self.worker.as_ref().map(|worker| worker.spawned_at)
    }

    pub(crate) fn ready_at(&self) -> Option<DateTime<Utc>> {
        self.worker.as_ref().and_then(|worker| worker.ready_at)
    }

    /// Spawn the worker if no process is alive. Idempotent while one is.
    pub(crate) fn ensure_running(&mut self) -> Result<(), SpawnError> {
        if self.worker.is_some() {
            return Ok(());
        }

        let mut child = self.launcher.launch()?;
        let stdin = child.stdin.take().ok_or(SpawnError::StdinNotCaptured)?;
        let stdout = child.stdout.take().ok_or(SpawnError::StdoutNotCaptured)?;
        let stderr = child.stderr.take().ok_or(SpawnError::StderrNotCaptured)?;

        self.generation += 1;
        let generation = self.generation;
        tracing::info!(generation, pid = child.id(), "Worker spawned");

        tokio::spawn(read_frames(generation, stdout, self.events_tx.clone()));
        tokio::spawn(scan_diagnostics(generation, stderr, self.events_tx.clone()));
        let (kill_tx, kill_rx) = mpsc::channel(1);
        tokio::spawn(monitor_exit(generation, child, kill_rx, self.events_tx.clone()));

        self.worker = Some(RunningWorker {
            stdin: FramedWrite::new(stdin, RequestEncoder),
            kill_tx,
            spawned_at: Utc::now(),
            ready_at: None,
        });
        self.state = WorkerState::Starting;
        self.backend_info = None;
        Ok(())
    }

    /// Record the readiness sentinel. Harmless if the worker re-announces.
    pub(crate) fn mark_ready(&mut self, info: BackendInfo) {
        let Some(worker) = &mut self.worker else {
            return;
        };
        if worker.ready_at.is_none() {
            worker.ready_at = Some(Utc::now());
        }
        tracing::info!(backend = %info.backend, available = ?info.available, "Worker ready");
        self.backend_info = Some(info);
        self.state = WorkerState::Ready;
    }

    /// Record an exit. Returns true when the caller should schedule a
    /// respawn, which is every exit not caused by an explicit shutdown.
    pub(crate) fn note_exit(&mut self, status: Option<ExitStatus>) -> bool {
        self.worker = None;
        self.backend_info = None;
        match self.state {
            WorkerState::Stopped => false,
            _ => {
                tracing::warn!(code = status.and_then(|s| s.code()), "Worker exited");
                self.state = WorkerState::Crashed;
                true
            }
        }
    }

    /// Write one request payload to the worker's stdin.
    pub(crate) async fn write_request(&mut self, payload: Bytes) -> Result<(), io::Error> {
        match &mut self.worker {
            Some(worker) => worker.stdin.send(payload).await,
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no worker process")),
        }
    }

    /// Ask the exit monitor to take the process down hard.
    pub(crate) fn kill(&mut self) {
        if let Some(worker) = &self.worker {
            let _ = worker.kill_tx.try_send(KillRequest::Immediate);
        }
    }

    /// Close the worker's stdin, terminate the process, and suppress the
    /// respawn that normally follows an exit.
    pub(crate) fn shutdown(&mut self) {
        self.state = WorkerState::Stopped;
        self.backend_info = None;
        if let Some(worker) = self.worker.take() {
            // Dropping the framed writer closes stdin; a well-behaved
            // worker exits on EOF and the monitor escalates if it does not.
            drop(worker.stdin);
            let _ = worker.kill_tx.try_send(KillRequest::Graceful {
                grace: self.shutdown_grace,
            });
        }
    }
}

async fn read_frames(generation: u64, stdout: ChildStdout, events: mpsc::Sender<WorkerEvent>) {
    let mut frames = FramedRead::new(stdout, FrameDecoder::new());
    loop {
        let kind = match frames.next().await {
            Some(Ok(payload)) => WorkerEventKind::Frame(payload),
            Some(Err(e)) => {
                let event = WorkerEvent { generation, kind: WorkerEventKind::ReadFailed(e.to_string()) };
                let _ = events.send(event).await;
                break;
            }
            // EOF; the exit monitor reports what happened.
            None => break,
        };
        if events.send(WorkerEvent { generation, kind }).await.is_err() {
            break;
        }
    }
    tracing::debug!(generation, "Frame reader task exiting");
}

async fn scan_diagnostics(generation: u64, stderr: ChildStderr, events: mpsc::Sender<WorkerEvent>) {
    let mut lines = tokio::io::BufReader::new(stderr).lines();
    loop {
        let kind = match lines.next_line().await {
            Ok(Some(line)) => match BackendInfo::from_sentinel(&line) {
                Some(info) => WorkerEventKind::Ready(info),
                None => WorkerEventKind::Diag(line),
            },
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(generation, error = %e, "Diagnostic stream failed");
                break;
            }
        };
        if events.send(WorkerEvent { generation, kind }).await.is_err() {
            break;
        }
    }
    tracing::debug!(generation, "Diagnostic scanner task exiting");
}

/// Owns the child for its whole life: waits for exit, or carries out a kill
/// request, then reports the status on the event channel.
async fn monitor_exit(
    generation: u64,
    mut child: Child,
    mut kill_rx: mpsc::Receiver<KillRequest>,
    events: mpsc::Sender<WorkerEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status.ok(),
        request = kill_rx.recv() => match request {
            Some(KillRequest::Graceful { grace }) => terminate(&mut child, grace).await,
            Some(KillRequest::Immediate) | None => {
                let _ = child.start_kill();
                child.wait().await.ok()
            }
        },
    };
    let event = WorkerEvent { generation, kind: WorkerEventKind::Exited(status) };
    let _ = events.send(event).await;
}

/// SIGTERM first where we can, SIGKILL once `grace` runs out.
async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => {
            tracing::warn!("Worker ignored termination request, killing");
            let _ = child.start_kill();
            child.wait().await.ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launcher() -> Arc<dyn WorkerLauncher> {
        Arc::new(PythonWorkerLauncher::new("gxml_engine.worker"))
    }

    fn supervisor(events_tx: mpsc::Sender<WorkerEvent>) -> Supervisor {
        Supervisor::new(launcher(), events_tx, Duration::from_millis(200))
    }

    #[test]
    fn python_command_runs_the_module_unbuffered() {
        let launcher = PythonWorkerLauncher::new("gxml_engine.worker");
        let cmd = launcher.command().unwrap();

        assert_eq!(cmd.as_std().get_program(), "python3");
        let args: Vec<_> = cmd.as_std().get_args().collect();
        assert_eq!(args, ["-u", "-m", "gxml_engine.worker"]);
    }

    #[test]
    fn search_paths_lead_pythonpath() {
        let launcher = PythonWorkerLauncher::new("gxml_engine.worker")
            .with_python("python3.12")
            .with_search_path("/opt/gxml-engine");
        let cmd = launcher.command().unwrap();

        assert_eq!(cmd.as_std().get_program(), "python3.12");
        let pythonpath = cmd
            .as_std()
            .get_envs()
            .find(|(key, _)| *key == "PYTHONPATH")
            .and_then(|(_, value)| value)
            .unwrap();
        assert!(pythonpath.to_string_lossy().starts_with("/opt/gxml-engine"));
    }

    #[test]
    fn fresh_supervisor_is_stopped() {
        let (events_tx, _events_rx) = mpsc::channel(4);
        let supervisor = supervisor(events_tx);

        assert_eq!(supervisor.state(), WorkerState::Stopped);
        assert!(!supervisor.is_ready());
        assert_eq!(supervisor.generation(), 0);
        assert!(supervisor.spawned_at().is_none());
    }

    #[test]
    fn readiness_without_a_process_is_ignored() {
        let (events_tx, _events_rx) = mpsc::channel(4);
        let mut supervisor = supervisor(events_tx);

        supervisor.mark_ready(BackendInfo::default());

        assert_eq!(supervisor.state(), WorkerState::Stopped);
        assert!(supervisor.backend_info().is_none());
    }

    #[test]
    fn exit_after_shutdown_does_not_ask_for_a_respawn() {
        let (events_tx, _events_rx) = mpsc::channel(4);
        let mut supervisor = supervisor(events_tx);

        supervisor.shutdown();
        assert!(!supervisor.note_exit(None));
        assert_eq!(supervisor.state(), WorkerState::Stopped);
    }

    #[cfg(unix)]
    mod with_real_processes {
        use super::*;

        struct ShellLauncher(&'static str);

        impl WorkerLauncher for ShellLauncher {
            fn launch(&self) -> Result<Child, SpawnError> {
                let mut cmd = Command::new("/bin/sh");
                cmd.arg("-c").arg(self.0);
                configure_stdio(&mut cmd);
                Ok(cmd.spawn()?)
            }
        }

        async fn next_event(rx: &mut mpsc::Receiver<WorkerEvent>) -> WorkerEvent {
            tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for worker event")
                .expect("event channel closed")
        }

        #[tokio::test]
        async fn ensure_running_spawns_once() {
            let (events_tx, mut events_rx) = mpsc::channel(16);
            let mut supervisor =
                Supervisor::new(Arc::new(ShellLauncher("sleep 30")), events_tx, Duration::from_millis(200));

            supervisor.ensure_running().unwrap();
            supervisor.ensure_running().unwrap();

            assert_eq!(supervisor.generation(), 1);
            assert_eq!(supervisor.state(), WorkerState::Starting);
            assert!(supervisor.spawned_at().is_some());
            assert!(supervisor.ready_at().is_none());

            supervisor.shutdown();
            let event = next_event(&mut events_rx).await;
            assert_eq!(event.generation, 1);
            assert!(matches!(event.kind, WorkerEventKind::Exited(_)));
        }

        #[tokio::test]
        async fn crash_is_reported_with_its_exit_code() {
            let (events_tx, mut events_rx) = mpsc::channel(16);
            let mut supervisor =
                Supervisor::new(Arc::new(ShellLauncher("exit 7")), events_tx, Duration::from_millis(200));

            supervisor.ensure_running().unwrap();
            let event = next_event(&mut events_rx).await;
            let WorkerEventKind::Exited(status) = event.kind else {
                panic!("expected exit event, got {:?}", event.kind);
            };
            assert_eq!(status.and_then(|s| s.code()), Some(7));

            assert!(supervisor.note_exit(status));
            assert_eq!(supervisor.state(), WorkerState::Crashed);
        }

        #[tokio::test]
        async fn sentinel_on_stderr_reaches_the_event_channel() {
            let (events_tx, mut events_rx) = mpsc::channel(16);
            let mut supervisor = Supervisor::new(
                Arc::new(ShellLauncher(
                    "echo 'GXML_WORKER_READY backend=c c=True gpu=False' >&2; sleep 30",
                )),
                events_tx,
                Duration::from_millis(200),
            );

            supervisor.ensure_running().unwrap();
            let event = next_event(&mut events_rx).await;
            let WorkerEventKind::Ready(info) = event.kind else {
                panic!("expected readiness event, got {:?}", event.kind);
            };
            assert_eq!(info.backend, "c");

            supervisor.mark_ready(info);
            assert_eq!(supervisor.state(), WorkerState::Ready);
            assert!(supervisor.is_ready());
            assert!(supervisor.ready_at().is_some());

            supervisor.shutdown();
            assert_eq!(supervisor.state(), WorkerState::Stopped);
        }
    }
}
