//! Process supervisor - owns one worker process and its event loop.
//!
//! Flow:
//! 1. Spawn the worker through the configured [`WorkerSpawner`](crate::process::WorkerSpawner)
//! 2. Wait for its `ready` handshake
//! 3. Run the event loop: settle pending calls, forward chunks, serve
//!    capability requests, expire timeouts
//! 4. On exit (requested or not): reject every pending call, publish
//!    `Stopped` and exactly one [`LifecycleEvent::Exit`]
//!
//! All registry and process state lives inside the event loop task. Callers
//! reach it through a command channel, so nothing here needs a lock except
//! the lifecycle slot that serializes start/stop.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, sleep_until};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{
    Body, ErrorInfo, IdGenerator, Message, MessageId, Request, RequestKind, Response,
    StreamChunk, codes,
};
use crate::config::OrchestratorConfig;
use crate::process::{BoxedReader, BoxedWriter, ExitReport, SpawnError, WorkerProcess};
use crate::proxy::CapabilityProxy;
use crate::registry::{CallResult, ChunkSink, CorrelationRegistry, RequestError};

const COMMAND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Ready,
    Stopping,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// Readiness handshake received.
    Ready { capabilities: Vec<String> },
    /// Spawn failure, readiness timeout or a failed startup.
    Error { message: String },
    /// The worker is gone. `requested` is false for crashes.
    Exit {
        status: Option<ExitReport>,
        requested: bool,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] SpawnError),
    #[error("worker did not become ready within {0:?}")]
    ReadinessTimeout(Duration),
    #[error("worker exited during startup")]
    ExitedDuringStartup,
}

enum Command {
    Call {
        kind: RequestKind,
        payload: Value,
        timeout: Duration,
        sink: Option<ChunkSink>,
        settle: oneshot::Sender<CallResult>,
    },
    Stop,
}

struct WorkerLink {
    commands: mpsc::Sender<Command>,
    capabilities: Vec<String>,
    event_loop: JoinHandle<()>,
}

pub struct Supervisor {
    config: OrchestratorConfig,
    proxy: Arc<CapabilityProxy>,
    worker: Mutex<Option<WorkerLink>>,
    state: Arc<watch::Sender<WorkerState>>,
    events: broadcast::Sender<LifecycleEvent>,
    /// OS pid of the current worker, 0 when none.
    pid: Arc<AtomicU32>,
}

impl Supervisor {
    pub fn new(config: OrchestratorConfig, proxy: Arc<CapabilityProxy>) -> Self {
        let (state, _) = watch::channel(WorkerState::Stopped);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            proxy,
            worker: Mutex::new(None),
            state: Arc::new(state),
            events,
            pid: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Spawn the worker and wait for its readiness handshake.
    ///
    /// Succeeds without spawning when a worker is already ready. Calls issued
    /// while a start is in progress wait for it.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() && self.is_running() {
            tracing::debug!("Worker already running");
            return Ok(());
        }
        // A previous incarnation exited on its own; its loop is finished.
        if let Some(stale) = worker.take() {
            let _ = stale.event_loop.await;
        }

        self.state.send_replace(WorkerState::Starting);
        let spawned = match self.config.spawner.spawn(&self.config.launch) {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!(error = %e, program = %self.config.launch.program.display(), "Failed to spawn worker");
                self.state.send_replace(WorkerState::Stopped);
                self.emit(LifecycleEvent::Error {
                    message: e.to_string(),
                });
                return Err(e.into());
            }
        };

        let pid = spawned.process.id();
        self.pid.store(pid.unwrap_or(0), Ordering::Relaxed);
        tracing::info!(?pid, "Worker spawned, waiting for ready");

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (ready_tx, mut ready_rx) = oneshot::channel();
        let outbox = spawn_writer(spawned.writer);

        let event_loop = EventLoop {
            reader: FramedRead::new(spawned.reader, JsonCodec::<Message>::new()),
            outbox,
            commands: commands_rx,
            process: spawned.process,
            ready: Some(ready_tx),
            state: Arc::clone(&self.state),
            events: self.events.clone(),
            pid: Arc::clone(&self.pid),
            proxy: Arc::clone(&self.proxy),
            shutdown_grace: self.config.shutdown_grace,
            kill_timeout: self.config.kill_timeout,
            stop_requested: false,
            terminate_at: None,
            kill_at: None,
        };
        let event_loop = tokio::spawn(event_loop.run());

        let handshake = match tokio::time::timeout(self.config.ready_timeout, &mut ready_rx).await {
            Ok(received) => received.map_err(|_| SupervisorError::ExitedDuringStartup),
            Err(_) => {
                // Closing first makes a ready that races the deadline either
                // land here or be refused by the event loop.
                ready_rx.close();
                ready_rx
                    .try_recv()
                    .map_err(|_| SupervisorError::ReadinessTimeout(self.config.ready_timeout))
            }
        };

        match handshake {
            Ok(capabilities) => {
                mark_ready(&self.state);
                tracing::info!(?pid, ?capabilities, "Worker ready");
                *worker = Some(WorkerLink {
                    commands: commands_tx,
                    capabilities,
                    event_loop,
                });
                Ok(())
            }
            Err(SupervisorError::ExitedDuringStartup) => {
                // The loop dropped the handshake sender: the process is gone.
                let _ = event_loop.await;
                tracing::error!("Worker exited before sending ready");
                self.emit(LifecycleEvent::Error {
                    message: SupervisorError::ExitedDuringStartup.to_string(),
                });
                Err(SupervisorError::ExitedDuringStartup)
            }
            Err(_) => {
                let timeout = self.config.ready_timeout;
                tracing::error!(?timeout, "Worker readiness timed out, stopping it");
                self.emit(LifecycleEvent::Error {
                    message: SupervisorError::ReadinessTimeout(timeout).to_string(),
                });
                let _ = commands_tx.send(Command::Stop).await;
                let _ = event_loop.await;
                Err(SupervisorError::ReadinessTimeout(timeout))
            }
        }
    }

    /// Shut the worker down: shutdown message, then terminate after the grace
    /// delay, then kill after the force-kill deadline. Returns once the
    /// process has exited.
    pub async fn stop(&self) {
        let mut worker = self.worker.lock().await;
        let Some(link) = worker.take() else {
            return;
        };
        if link.commands.send(Command::Stop).await.is_err() {
            tracing::debug!("Worker already exited");
        }
        if let Err(e) = link.event_loop.await {
            tracing::error!(error = %e, "Worker event loop failed");
            self.pid.store(0, Ordering::Relaxed);
            self.state.send_replace(WorkerState::Stopped);
        }
    }

    /// Stop then start. Observers see `Stopped` in between.
    pub async fn restart(&self) -> Result<(), SupervisorError> {
        self.stop().await;
        self.start().await
    }

    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Ready
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn worker_pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Capabilities the current worker advertised in its handshake.
    pub async fn capabilities(&self) -> Vec<String> {
        self.worker
            .lock()
            .await
            .as_ref()
            .map(|link| link.capabilities.clone())
            .unwrap_or_default()
    }

    pub async fn send_request(&self, kind: &str, payload: Value, timeout: Duration) -> CallResult {
        self.call(kind, payload, timeout, None).await
    }

    /// Like [`send_request`](Self::send_request); every chunk of the reply is
    /// passed to `on_chunk`, in order, before the call settles.
    pub async fn send_streaming_request<F>(
        &self,
        kind: &str,
        payload: Value,
        on_chunk: F,
        timeout: Duration,
    ) -> CallResult
    where
        F: FnMut(StreamChunk) + Send + 'static,
    {
        self.call(kind, payload, timeout, Some(Box::new(on_chunk)))
            .await
    }

    async fn call(
        &self,
        kind: &str,
        payload: Value,
        timeout: Duration,
        sink: Option<ChunkSink>,
    ) -> CallResult {
        let kind = match RequestKind::parse(kind) {
            Ok(kind @ RequestKind::Domain(_)) => kind,
            Ok(other) => {
                return Err(RequestError::Invalid(format!(
                    "{other} is served by the host, not the worker"
                )));
            }
            Err(e) => return Err(RequestError::Invalid(e.to_string())),
        };

        let commands = self
            .worker
            .lock()
            .await
            .as_ref()
            .map(|link| link.commands.clone())
            .ok_or(RequestError::NotRunning)?;

        let (settle, settled) = oneshot::channel();
        commands
            .send(Command::Call {
                kind,
                payload,
                timeout,
                sink,
                settle,
            })
            .await
            .map_err(|_| RequestError::NotRunning)?;

        settled.await.unwrap_or(Err(RequestError::ProcessExited))
    }

    fn emit(&self, event: LifecycleEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// `Starting` -> `Ready`. Both start() and the event loop apply it, so
/// start() never returns before `is_running()` holds; a worker that already
/// moved on to `Stopping`/`Stopped` is left alone.
fn mark_ready(state: &watch::Sender<WorkerState>) {
    state.send_if_modified(|current| {
        if *current == WorkerState::Starting {
            *current = WorkerState::Ready;
            true
        } else {
            false
        }
    });
}

/// Serialize outgoing messages onto the worker's input. Exits when every
/// sender is gone or the pipe breaks; dropping the writer closes the pipe.
///
/// The queue is unbounded so the event loop never waits on a worker that
/// stopped reading its input.
fn spawn_writer(writer: BoxedWriter) -> mpsc::UnboundedSender<Message> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    tokio::spawn(async move {
        let mut framed = FramedWrite::new(writer, JsonCodec::<Message>::new());
        while let Some(msg) = rx.recv().await {
            let kind = msg.kind();
            tracing::trace!(id = %msg.id, %kind, "Writing message to worker");
            if let Err(e) = framed.send(msg).await {
                tracing::warn!(error = %e, %kind, "Failed to write to worker");
                break;
            }
        }
        tracing::debug!("Worker writer exiting");
    });
    tx
}

struct EventLoop {
    reader: FramedRead<BoxedReader, JsonCodec<Message>>,
    outbox: mpsc::UnboundedSender<Message>,
    commands: mpsc::Receiver<Command>,
    process: Box<dyn WorkerProcess>,
    ready: Option<oneshot::Sender<Vec<String>>>,
    state: Arc<watch::Sender<WorkerState>>,
    events: broadcast::Sender<LifecycleEvent>,
    pid: Arc<AtomicU32>,
    proxy: Arc<CapabilityProxy>,
    shutdown_grace: Duration,
    kill_timeout: Duration,
    stop_requested: bool,
    terminate_at: Option<Instant>,
    kill_at: Option<Instant>,
}

impl EventLoop {
    async fn run(mut self) {
        let mut registry = CorrelationRegistry::new();
        let mut ids = IdGenerator::new();
        let mut proxies: JoinSet<()> = JoinSet::new();
        let mut eof = false;
        let mut commands_open = true;

        let status = loop {
            tokio::select! {
                biased;

                frame = self.reader.next(), if !eof => match frame {
                    Some(Ok(Ok(msg))) => {
                        self.dispatch(msg, &mut registry, &mut ids, &mut proxies);
                    }
                    Some(Ok(Err(e))) => {
                        tracing::warn!(error = %e, "Dropping malformed message from worker");
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Worker channel failed");
                        eof = true;
                        self.output_closed();
                    }
                    None => {
                        eof = true;
                        self.output_closed();
                    }
                },

                cmd = self.commands.recv(), if commands_open => match cmd {
                    Some(Command::Call { kind, payload, timeout, sink, settle }) => {
                        if self.stop_requested {
                            let _ = settle.send(Err(RequestError::NotRunning));
                            continue;
                        }
                        let msg = ids.message(Body::Request(Request {
                            kind: kind.clone(),
                            payload,
                        }));
                        let id = msg.id.clone();
                        tracing::debug!(request_id = %id, %kind, ?timeout, "Sending request");
                        registry.insert(id.clone(), kind.to_string(), timeout, sink, settle);
                        if self.outbox.send(msg).is_err() {
                            registry.fail(&id, RequestError::ProcessExited);
                        }
                    }
                    Some(Command::Stop) => self.begin_stop(&mut ids),
                    None => {
                        // Every handle is gone; nobody can stop us later.
                        commands_open = false;
                        self.begin_stop(&mut ids);
                    }
                },

                Some(_) = registry.next_timeout(), if !registry.is_empty() => {}

                Some(joined) = proxies.join_next(), if !proxies.is_empty() => {
                    if let Err(e) = joined
                        && e.is_panic()
                    {
                        tracing::error!(error = %e, "Capability proxy task panicked");
                    }
                }

                _ = sleep_until(self.terminate_at.unwrap_or_else(Instant::now)), if self.terminate_at.is_some() => {
                    self.terminate_at = None;
                    tracing::debug!("Sending terminate signal to worker");
                    if let Err(e) = self.process.terminate() {
                        tracing::warn!(error = %e, "Failed to terminate worker");
                    }
                }

                _ = sleep_until(self.kill_at.unwrap_or_else(Instant::now)), if self.kill_at.is_some() && self.terminate_at.is_none() => {
                    self.kill_at = None;
                    tracing::warn!("Worker did not exit in time, killing it");
                    if let Err(e) = self.process.kill() {
                        tracing::error!(error = %e, "Failed to kill worker");
                    }
                }

                status = self.process.wait() => break status,
            }
        };

        self.finish(status, &mut registry, &mut proxies);
    }

    fn dispatch(
        &mut self,
        msg: Message,
        registry: &mut CorrelationRegistry,
        ids: &mut IdGenerator,
        proxies: &mut JoinSet<()>,
    ) {
        let Message { id, body, .. } = msg;
        match body {
            Body::Ready { capabilities } => match self.ready.take() {
                Some(ready) if !self.stop_requested => {
                    // Publish only once start() has taken the handshake.
                    if ready.send(capabilities.clone()).is_ok() {
                        mark_ready(&self.state);
                        let _ = self.events.send(LifecycleEvent::Ready { capabilities });
                    } else {
                        tracing::warn!("Ready arrived after start gave up, stopping worker");
                        self.begin_stop(ids);
                    }
                }
                _ => tracing::warn!("Ignoring unexpected ready from worker"),
            },
            Body::Response(response) => {
                registry.settle(response);
            }
            Body::Chunk(chunk) => {
                registry.forward_chunk(chunk);
            }
            Body::Request(Request { kind, payload }) => match kind {
                RequestKind::Capability | RequestKind::CapabilityStream => {
                    let streaming = kind == RequestKind::CapabilityStream;
                    tracing::debug!(request_id = %id, streaming, "Capability request from worker");
                    let proxy = Arc::clone(&self.proxy);
                    let outbox = self.outbox.clone();
                    proxies.spawn(async move {
                        proxy.handle(id, streaming, payload, outbox).await;
                    });
                }
                RequestKind::Domain(name) => {
                    tracing::warn!(request_id = %id, kind = %name, "Worker sent a request the host does not serve");
                    self.reply_unsupported(id, RequestKind::Domain(name), ids);
                }
            },
            Body::Shutdown => tracing::warn!("Ignoring shutdown sent by worker"),
        }
    }

    fn reply_unsupported(&self, request_id: MessageId, kind: RequestKind, ids: &mut IdGenerator) {
        let reply = ids.message(Body::Response(Response {
            channel: kind.reply_channel(),
            request_id,
            outcome: Err(ErrorInfo::new(
                codes::UNSUPPORTED_REQUEST,
                format!("host does not serve {kind}"),
            )),
        }));
        let _ = self.outbox.send(reply);
    }

    fn begin_stop(&mut self, ids: &mut IdGenerator) {
        if self.stop_requested {
            return;
        }
        self.stop_requested = true;
        self.state.send_replace(WorkerState::Stopping);
        tracing::info!("Stopping worker");

        // Best effort; the signals below do not depend on it.
        if self.outbox.send(ids.message(Body::Shutdown)).is_err() {
            tracing::debug!("Could not send shutdown message");
        }

        let terminate_at = Instant::now() + self.shutdown_grace;
        self.terminate_at = Some(match self.terminate_at {
            Some(earlier) => earlier.min(terminate_at),
            None => terminate_at,
        });
        let kill_at = terminate_at + self.kill_timeout;
        self.kill_at = Some(match self.kill_at {
            Some(earlier) => earlier.min(kill_at),
            None => kill_at,
        });
    }

    /// The worker closed its output. It can no longer answer anything, so
    /// terminate it now unless a stop is already under way.
    fn output_closed(&mut self) {
        if self.stop_requested || self.terminate_at.is_some() {
            tracing::debug!("Worker output closed");
            return;
        }
        tracing::warn!("Worker closed its output, terminating it");
        let now = Instant::now();
        self.terminate_at = Some(now);
        self.kill_at = Some(now + self.kill_timeout);
    }

    fn finish(
        mut self,
        status: std::io::Result<ExitReport>,
        registry: &mut CorrelationRegistry,
        proxies: &mut JoinSet<()>,
    ) {
        let requested = self.stop_requested;
        match &status {
            Ok(report) if requested => tracing::info!(%report, "Worker stopped"),
            Ok(report) => tracing::warn!(%report, "Worker exited unexpectedly"),
            Err(e) => tracing::error!(error = %e, "Failed to observe worker exit"),
        }

        self.pid.store(0, Ordering::Relaxed);
        proxies.abort_all();

        let rejected = registry.reject_all(|| RequestError::ProcessExited);
        // Calls queued behind the exit never reached the registry.
        self.commands.close();
        let mut queued = 0;
        while let Ok(cmd) = self.commands.try_recv() {
            if let Command::Call { settle, .. } = cmd {
                let _ = settle.send(Err(RequestError::ProcessExited));
                queued += 1;
            }
        }
        if rejected + queued > 0 {
            tracing::warn!(rejected, queued, "Rejected outstanding requests after worker exit");
        }

        self.state.send_replace(WorkerState::Stopped);
        let _ = self.events.send(LifecycleEvent::Exit {
            status: status.ok(),
            requested,
        });
    }
}
