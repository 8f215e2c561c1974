//! Worker process spawning.
//!
//! The supervisor never touches `tokio::process` directly; it asks a
//! [`WorkerSpawner`] for a [`SpawnedWorker`] (both pipe ends plus a
//! [`WorkerProcess`] handle). Two strategies ship with the crate:
//!
//! - [`CommandSpawner`]: an OS subprocess speaking over stdin/stdout.
//! - [`InProcessSpawner`]: a task inside the host runtime over an in-memory
//!   duplex pipe. Terminate fires a cancellation token, kill aborts the task.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{BACKEND_URL_ENV, HOST_ONLY_ENV, LOG_ENV, LaunchSpec};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitReport {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitReport {
    fn from(status: std::process::ExitStatus) -> Self {
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
        }
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Handle to a running worker.
#[async_trait]
pub trait WorkerProcess: Send {
    /// OS process id, if the worker is an OS process.
    fn id(&self) -> Option<u32>;

    /// Wait for the worker to exit. Must be cancel-safe: the supervisor polls
    /// it inside `select!` and calls it again after other branches run.
    async fn wait(&mut self) -> io::Result<ExitReport>;

    /// Ask the worker to exit (SIGTERM for OS processes).
    fn terminate(&mut self) -> io::Result<()>;

    /// Force the worker to exit.
    fn kill(&mut self) -> io::Result<()>;
}

/// A freshly spawned worker: channel ends as seen from the host.
pub struct SpawnedWorker {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub process: Box<dyn WorkerProcess>,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, launch: &LaunchSpec) -> Result<SpawnedWorker, SpawnError>;
}

/// Spawns the worker entry point as an OS process.
pub struct CommandSpawner;

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, launch: &LaunchSpec) -> Result<SpawnedWorker, SpawnError> {
        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        for name in HOST_ONLY_ENV {
            command.env_remove(name);
        }
        if let Some(ref url) = launch.backend_url {
            command.env(BACKEND_URL_ENV, url);
        }
        if let Some(ref level) = launch.log_level {
            command.env(LOG_ENV, level);
        }
        for (key, value) in &launch.env {
            command.env(key, value);
        }

        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;

        tracing::debug!(program = %launch.program.display(), pid = ?child.id(), "Spawned worker process");

        Ok(SpawnedWorker {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            process: Box::new(ChildProcess { child }),
        })
    }
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> io::Result<ExitReport> {
        self.child.wait().await.map(ExitReport::from)
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        match self.child.id() {
            Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(io::Error::from),
            // Already reaped.
            None => Ok(()),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        match self.child.start_kill() {
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }
}

/// Worker-side ends of an in-process channel.
pub struct InProcessIo {
    /// Messages from the host.
    pub reader: tokio::io::ReadHalf<DuplexStream>,
    /// Messages to the host.
    pub writer: tokio::io::WriteHalf<DuplexStream>,
    /// Fired when the host terminates the worker.
    pub shutdown: CancellationToken,
}

type WorkerFuture = Pin<Box<dyn Future<Output = ExitReport> + Send>>;
type WorkerFactory = dyn Fn(InProcessIo) -> WorkerFuture + Send + Sync;

/// Runs workers as tasks on the host runtime.
#[derive(Clone)]
pub struct InProcessSpawner {
    factory: Arc<WorkerFactory>,
    buffer: usize,
}

impl InProcessSpawner {
    pub fn new<F, Fut>(factory: F) -> Self
    where
        F: Fn(InProcessIo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ExitReport> + Send + 'static,
    {
        Self {
            factory: Arc::new(move |io| -> WorkerFuture { Box::pin(factory(io)) }),
            buffer: 64 * 1024,
        }
    }

    pub fn with_buffer(mut self, bytes: usize) -> Self {
        self.buffer = bytes;
        self
    }
}

impl WorkerSpawner for InProcessSpawner {
    fn spawn(&self, _launch: &LaunchSpec) -> Result<SpawnedWorker, SpawnError> {
        let (host_side, worker_side) = tokio::io::duplex(self.buffer);
        let (host_reader, host_writer) = tokio::io::split(host_side);
        let (worker_reader, worker_writer) = tokio::io::split(worker_side);

        let shutdown = CancellationToken::new();
        let fut = (self.factory)(InProcessIo {
            reader: worker_reader,
            writer: worker_writer,
            shutdown: shutdown.clone(),
        });
        let task = tokio::spawn(fut);

        Ok(SpawnedWorker {
            reader: Box::new(host_reader),
            writer: Box::new(host_writer),
            process: Box::new(TaskProcess {
                task,
                shutdown,
                exited: None,
            }),
        })
    }
}

/// Signal number reported when an in-process worker is aborted.
const ABORTED_SIGNAL: i32 = 9;

struct TaskProcess {
    task: JoinHandle<ExitReport>,
    shutdown: CancellationToken,
    exited: Option<ExitReport>,
}

#[async_trait]
impl WorkerProcess for TaskProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> io::Result<ExitReport> {
        if let Some(report) = self.exited {
            return Ok(report);
        }
        let report = match (&mut self.task).await {
            Ok(report) => report,
            Err(e) if e.is_cancelled() => ExitReport::signal(ABORTED_SIGNAL),
            Err(e) => {
                tracing::error!(error = %e, "In-process worker panicked");
                ExitReport::code(101)
            }
        };
        self.exited = Some(report);
        Ok(report)
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.shutdown.cancel();
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.task.abort();
        Ok(())
    }
}
