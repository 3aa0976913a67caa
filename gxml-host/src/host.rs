//! Host facade and the owning event loop for the worker channel.
//!
//! All shared state lives inside one spawned task. [`RenderWorker`] handles
//! are cheap clones of an ops channel into that task; the task owns the
//! [`Supervisor`] and [`Dispatcher`] outright, so there are no locks to
//! take and no ordering to reason about beyond the loop body itself.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::bridge::envelope::Envelope;
use crate::bridge::protocol::{BackendInfo, RenderReply, WorkerCommand};
use crate::dispatcher::{Dispatcher, PendingRequest, RequestError};
use crate::supervisor::{Supervisor, WorkerEvent, WorkerEventKind, WorkerLauncher, WorkerState};

/// Host-side configuration for the worker channel.
#[derive(Clone)]
pub struct HostConfig {
    pub launcher: Arc<dyn WorkerLauncher>,
    /// Delay before respawning a crashed worker.
    pub restart_delay: Duration,
    /// How long shutdown waits for a polite exit before killing.
    pub shutdown_grace: Duration,
    /// Spawn the worker immediately instead of on first request.
    pub eager_start: bool,
}

impl HostConfig {
    pub fn new(launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            launcher,
            restart_delay: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(2),
            eager_start: false,
        }
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_eager_start(mut self, eager: bool) -> Self {
        self.eager_start = eager;
        self
    }
}

/// Point-in-time view of the channel, for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub backend: Option<BackendInfo>,
    pub queued: usize,
    pub in_flight: bool,
    pub spawned_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
}

enum HostOp {
    Submit(PendingRequest),
    EnsureRunning,
    Status(oneshot::Sender<WorkerStatus>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the render worker channel.
///
/// Clones share one event loop. Dropping every clone stops the loop and
/// takes the worker process down with it.
#[derive(Clone)]
pub struct RenderWorker {
    ops: mpsc::Sender<HostOp>,
}

impl RenderWorker {
    /// Start the channel's event loop on the current runtime. The worker
    /// process itself starts lazily on first request unless
    /// [`HostConfig::eager_start`] is set.
    pub fn spawn(config: HostConfig) -> RenderWorker {
        let (ops_tx, ops_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::channel(256);
        let supervisor = Supervisor::new(config.launcher, events_tx, config.shutdown_grace);
        if config.eager_start {
            // fresh channel with capacity to spare, cannot fail
            let _ = ops_tx.try_send(HostOp::EnsureRunning);
        }
        tokio::spawn(run_host_loop(
            config.restart_delay,
            supervisor,
            Dispatcher::new(),
            ops_rx,
            events_rx,
        ));
        RenderWorker { ops: ops_tx }
    }

    /// Render a scene document, resolving to timings plus the geometry
    /// trailer. The document must be a single line: a missing trailing
    /// newline is added, an interior one is rejected.
    pub async fn render(&self, document: &str) -> Result<RenderReply, RequestError> {
        let payload = line_payload(document)?;
        let (tx, rx) = oneshot::channel();
        self.submit(HostOp::Submit(PendingRequest::render(payload, tx))).await?;
        rx.await.map_err(|_| RequestError::ChannelClosed)?
    }

    /// Send a typed control command and get its JSON result.
    pub async fn command(&self, command: &WorkerCommand) -> Result<Value, RequestError> {
        let json = serde_json::to_string(command)
            .map_err(|e| RequestError::InvalidRequest(e.to_string()))?;
        self.command_raw(&json).await
    }

    /// Send a pre-encoded JSON command line. Single-line, like
    /// [`RenderWorker::render`].
    pub async fn command_raw(&self, json: &str) -> Result<Value, RequestError> {
        let payload = line_payload(json)?;
        let (tx, rx) = oneshot::channel();
        self.submit(HostOp::Submit(PendingRequest::command(payload, tx))).await?;
        rx.await.map_err(|_| RequestError::ChannelClosed)?
    }

    /// Ask the worker which backends it has and which one is active.
    pub async fn backend_info(&self) -> Result<BackendInfo, RequestError> {
        let value = self.command(&WorkerCommand::GetBackendInfo).await?;
        serde_json::from_value(value).map_err(|e| RequestError::MalformedMetadata(e.to_string()))
    }

    /// Switch geometry computation to another backend.
    pub async fn set_backend(&self, backend: &str) -> Result<Value, RequestError> {
        self.command(&WorkerCommand::SetBackend { backend: backend.to_string() }).await
    }

    /// Spawn the worker now instead of waiting for the first request.
    pub async fn ensure_running(&self) -> Result<(), RequestError> {
        self.submit(HostOp::EnsureRunning).await
    }

    pub async fn status(&self) -> Result<WorkerStatus, RequestError> {
        let (tx, rx) = oneshot::channel();
        self.submit(HostOp::Status(tx)).await?;
        rx.await.map_err(|_| RequestError::ChannelClosed)
    }

    /// Stop the worker and reject every outstanding request. Terminal: the
    /// channel cannot be used again afterwards.
    pub async fn shutdown(&self) -> Result<(), RequestError> {
        let (tx, rx) = oneshot::channel();
        self.submit(HostOp::Shutdown(tx)).await?;
        rx.await.map_err(|_| RequestError::ChannelClosed)
    }

    async fn submit(&self, op: HostOp) -> Result<(), RequestError> {
        self.ops.send(op).await.map_err(|_| RequestError::ChannelClosed)
    }
}

/// Requests go down as single lines: add the terminator when it is
/// missing, refuse a newline anywhere else. The worker reads line-wise,
/// so an interior newline would draw two reply frames and desynchronize
/// the order-based pairing for every request behind it.
fn line_payload(text: &str) -> Result<Bytes, RequestError> {
    let body = text.strip_suffix('\n').unwrap_or(text);
    if body.contains('\n') {
        return Err(RequestError::InvalidRequest(
            "text contains an interior newline".to_string(),
        ));
    }
    let mut payload = String::with_capacity(body.len() + 1);
    payload.push_str(body);
    payload.push('\n');
    Ok(Bytes::from(payload))
}

async fn run_host_loop(
    restart_delay: Duration,
    mut supervisor: Supervisor,
    mut dispatcher: Dispatcher,
    mut ops_rx: mpsc::Receiver<HostOp>,
    mut events_rx: mpsc::Receiver<WorkerEvent>,
) {
    let mut restart_at: Option<Instant> = None;

    loop {
        tokio::select! {
            biased;

            Some(event) = events_rx.recv() => {
                if event.generation != supervisor.generation() {
                    tracing::trace!(generation = event.generation, "Dropping event from a previous worker");
                    continue;
                }
                match event.kind {
                    WorkerEventKind::Frame(payload) => {
                        match Envelope::parse(payload) {
                            Ok(envelope) => dispatcher.resolve(envelope),
                            Err(e) if dispatcher.has_in_flight() => {
                                tracing::warn!(error = %e, "Rejecting in-flight request");
                                dispatcher.reject_in_flight(e.into());
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Dropping malformed envelope with no request in flight");
                            }
                        }
                        dispatch_next(&mut supervisor, &mut dispatcher).await;
                    }
                    WorkerEventKind::Ready(info) => {
                        supervisor.mark_ready(info);
                        dispatch_next(&mut supervisor, &mut dispatcher).await;
                    }
                    WorkerEventKind::Diag(line) => {
                        tracing::info!(target: "gxml_host::worker", "{}", line);
                    }
                    WorkerEventKind::ReadFailed(error) => {
                        tracing::error!(%error, "Worker output stream failed, killing process");
                        supervisor.kill();
                    }
                    WorkerEventKind::Exited(status) => {
                        dispatcher.reject_in_flight(RequestError::WorkerCrashed);
                        if supervisor.note_exit(status) {
                            restart_at = Some(Instant::now() + restart_delay);
                        }
                    }
                }
            }

            op = ops_rx.recv() => match op {
                Some(HostOp::Submit(request)) => {
                    dispatcher.enqueue(request);
                    ensure_running(&mut supervisor, restart_delay, &mut restart_at);
                    dispatch_next(&mut supervisor, &mut dispatcher).await;
                }
                Some(HostOp::EnsureRunning) => {
                    ensure_running(&mut supervisor, restart_delay, &mut restart_at);
                }
                Some(HostOp::Status(tx)) => {
                    let _ = tx.send(WorkerStatus {
                        state: supervisor.state(),
                        backend: supervisor.backend_info().cloned(),
                        queued: dispatcher.queued(),
                        in_flight: dispatcher.has_in_flight(),
                        spawned_at: supervisor.spawned_at(),
                        ready_at: supervisor.ready_at(),
                    });
                }
                Some(HostOp::Shutdown(tx)) => {
                    tracing::info!("Shutting down worker channel");
                    dispatcher.reject_all(&RequestError::ShuttingDown);
                    supervisor.shutdown();
                    let _ = tx.send(());
                    return;
                }
                None => {
                    tracing::debug!("All handles dropped, stopping worker");
                    dispatcher.reject_all(&RequestError::ShuttingDown);
                    supervisor.shutdown();
                    return;
                }
            },

            _ = sleep_until_restart(restart_at), if restart_at.is_some() => {
                restart_at = None;
                tracing::info!("Respawning worker after crash");
                ensure_running(&mut supervisor, restart_delay, &mut restart_at);
            }
        }
    }
}

/// Spawn the worker unless one is alive or a respawn timer is already
/// counting down. A failed spawn arms the timer for a retry.
fn ensure_running(supervisor: &mut Supervisor, restart_delay: Duration, restart_at: &mut Option<Instant>) {
    if restart_at.is_some() {
        return;
    }
    if let Err(e) = supervisor.ensure_running() {
        tracing::error!(error = %e, delay = ?restart_delay, "Worker spawn failed, retrying");
        *restart_at = Some(Instant::now() + restart_delay);
    }
}

/// Write the next queued request if the worker is ready and nothing is in
/// flight. A failed write rejects that request and kills the process; the
/// exit path takes care of the rest of the queue.
async fn dispatch_next(supervisor: &mut Supervisor, dispatcher: &mut Dispatcher) {
    if !supervisor.is_ready() {
        return;
    }
    let Some(payload) = dispatcher.start_next() else {
        return;
    };
    if let Err(e) = supervisor.write_request(payload).await {
        tracing::error!(error = %e, "Request write failed, killing worker");
        dispatcher.reject_in_flight(RequestError::WriteFailed(e.to_string()));
        supervisor.kill();
    }
}

async fn sleep_until_restart(at: Option<Instant>) {
    match at {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
