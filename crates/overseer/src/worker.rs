//! Worker runtime - the child side of the protocol.
//!
//! The host side (spawning, routing, capability proxy) is in supervisor.rs.
//!
//! A worker announces itself with `ready`, then serves domain requests
//! concurrently, one task per request. Handlers stream partial output with
//! [`RequestContext::emit_chunk`] and reach the model only through
//! [`HostClient`], which sends capability requests back over the same
//! channel and awaits them with a worker-side [`CorrelationRegistry`].

use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{
    Body, Channel, ErrorInfo, IdGenerator, Message, MessageId, Request, RequestKind, Response,
    StreamChunk, codes,
};
use crate::proxy::{CapabilityRequest, CapabilityResult};
use crate::registry::{CallResult, ChunkSink, CorrelationRegistry, RequestError};

/// A domain request as seen by a handler.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub id: MessageId,
    /// Full kind, e.g. `task:process`.
    pub kind: String,
    pub payload: Value,
}

/// Trait for the request handler - the worker's actual logic.
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Request kinds advertised in the readiness handshake.
    fn capabilities(&self) -> Vec<String>;

    /// Serve one request. The returned value becomes the response payload,
    /// an error becomes a non-success response.
    async fn handle(
        &self,
        request: IncomingRequest,
        ctx: RequestContext,
    ) -> Result<Value, ErrorInfo>;
}

enum Outgoing {
    Body(Body),
    Call {
        kind: RequestKind,
        payload: Value,
        timeout: Duration,
        sink: Option<ChunkSink>,
        settle: oneshot::Sender<CallResult>,
    },
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "host channel closed")
}

/// Handle for the request being served.
///
/// Sends are queued on an unbounded channel and written by the worker's
/// writer task, so they can be made from synchronous callbacks.
#[derive(Clone)]
pub struct RequestContext {
    request_id: MessageId,
    channel: Channel,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    host: HostClient,
}

impl RequestContext {
    pub fn request_id(&self) -> &MessageId {
        &self.request_id
    }

    /// Stream a partial result to the caller as a `<domain>:chunk`.
    pub fn emit_chunk(&self, content: impl Into<String>) -> io::Result<()> {
        let content = content.into();
        if content.is_empty() {
            return Ok(());
        }
        self.outgoing
            .send(Outgoing::Body(Body::Chunk(StreamChunk {
                channel: self.channel.clone(),
                request_id: self.request_id.clone(),
                content,
                done: false,
            })))
            .map_err(|_| closed())
    }

    pub fn host(&self) -> &HostClient {
        &self.host
    }
}

/// Capability calls back to the host.
#[derive(Clone)]
pub struct HostClient {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    timeout: Duration,
}

impl HostClient {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Ask the host to run the model and wait for the whole result.
    pub async fn invoke(
        &self,
        request: &CapabilityRequest,
    ) -> Result<CapabilityResult, RequestError> {
        let value = self.call(RequestKind::Capability, request, None).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Like [`invoke`](Self::invoke); each fragment is passed to
    /// `on_fragment` as the host relays it.
    pub async fn invoke_streaming<F>(
        &self,
        request: &CapabilityRequest,
        mut on_fragment: F,
    ) -> Result<CapabilityResult, RequestError>
    where
        F: FnMut(String) + Send + 'static,
    {
        let sink: ChunkSink = Box::new(move |chunk: StreamChunk| on_fragment(chunk.content));
        let value = self
            .call(RequestKind::CapabilityStream, request, Some(sink))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn call(
        &self,
        kind: RequestKind,
        request: &CapabilityRequest,
        sink: Option<ChunkSink>,
    ) -> CallResult {
        let payload =
            serde_json::to_value(request).map_err(|e| RequestError::Invalid(e.to_string()))?;
        let (settle, settled) = oneshot::channel();
        self.outgoing
            .send(Outgoing::Call {
                kind,
                payload,
                timeout: self.timeout,
                sink,
                settle,
            })
            .map_err(|_| RequestError::NotRunning)?;
        settled.await.unwrap_or(Err(RequestError::NotRunning))
    }
}

pub struct WorkerConfig {
    /// Bound on each capability call to the host.
    pub host_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host_timeout: Duration::from_secs(120),
        }
    }
}

/// Frames go out through their own task so a host that is slow to read never
/// stops the worker from reading its input or expiring host calls.
fn spawn_writer<W>(writer: W) -> (mpsc::UnboundedSender<Message>, JoinHandle<io::Result<()>>)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let task = tokio::spawn(async move {
        let mut framed = FramedWrite::new(writer, JsonCodec::<Message>::new());
        while let Some(msg) = rx.recv().await {
            if let Err(e) = framed.send(msg).await {
                tracing::error!(error = %e, "Failed to write to host");
                return Err(e);
            }
        }
        framed.close().await
    });
    (tx, task)
}

/// Run the worker protocol over an arbitrary byte channel.
///
/// Returns when the host sends `shutdown`, closes the channel, or `shutdown`
/// fires. In-flight handlers are aborted and queued output is flushed.
pub async fn serve<H, R, W>(
    handler: Arc<H>,
    reader: R,
    writer: W,
    config: WorkerConfig,
    shutdown: CancellationToken,
) -> io::Result<()>
where
    H: RequestHandler,
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut reader = FramedRead::new(reader, JsonCodec::<Message>::new());
    let (frames, writer_task) = spawn_writer(writer);
    let mut ids = IdGenerator::new();
    let mut registry = CorrelationRegistry::new();
    let mut tasks: JoinSet<()> = JoinSet::new();

    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Outgoing>();
    let host = HostClient {
        outgoing: outgoing_tx.clone(),
        timeout: config.host_timeout,
    };

    let capabilities = handler.capabilities();
    tracing::info!(?capabilities, "Sending ready to host");
    frames
        .send(ids.message(Body::Ready { capabilities }))
        .map_err(|_| closed())?;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                tracing::info!("Shutdown signal received");
                break;
            }

            _ = frames.closed() => break,

            frame = reader.next() => match frame {
                Some(Ok(Ok(msg))) => {
                    let Message { id, body, .. } = msg;
                    match body {
                        Body::Request(Request { kind: RequestKind::Domain(kind), payload }) => {
                            tracing::debug!(request_id = %id, %kind, "Request received");
                            let ctx = RequestContext {
                                request_id: id.clone(),
                                channel: RequestKind::Domain(kind.clone()).reply_channel(),
                                outgoing: outgoing_tx.clone(),
                                host: host.clone(),
                            };
                            let handler = Arc::clone(&handler);
                            let outgoing = outgoing_tx.clone();
                            tasks.spawn(async move {
                                let channel = ctx.channel.clone();
                                let request = IncomingRequest { id: id.clone(), kind, payload };
                                let outcome = AssertUnwindSafe(handler.handle(request, ctx))
                                    .catch_unwind()
                                    .await
                                    .unwrap_or_else(|_| {
                                        tracing::error!(request_id = %id, "Request handler panicked");
                                        Err(ErrorInfo::new(codes::HANDLER_ERROR, "request handler panicked"))
                                    });
                                let _ = outgoing.send(Outgoing::Body(Body::Response(Response {
                                    channel,
                                    request_id: id,
                                    outcome,
                                })));
                            });
                        }
                        Body::Request(Request { kind, .. }) => {
                            tracing::warn!(request_id = %id, %kind, "Host sent a request only the host serves");
                            let reply = ids.message(Body::Response(Response {
                                channel: kind.reply_channel(),
                                request_id: id,
                                outcome: Err(ErrorInfo::new(
                                    codes::UNSUPPORTED_REQUEST,
                                    format!("worker does not serve {kind}"),
                                )),
                            }));
                            let _ = frames.send(reply);
                        }
                        Body::Response(response) => {
                            registry.settle(response);
                        }
                        Body::Chunk(chunk) => {
                            registry.forward_chunk(chunk);
                        }
                        Body::Shutdown => {
                            tracing::info!("Shutdown requested");
                            break;
                        }
                        Body::Ready { .. } => tracing::warn!("Ignoring ready sent by host"),
                    }
                }
                Some(Ok(Err(e))) => {
                    tracing::warn!(error = %e, "Dropping malformed message from host");
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Host channel failed");
                    break;
                }
                None => {
                    tracing::info!("Host channel closed, exiting");
                    break;
                }
            },

            Some(out) = outgoing_rx.recv() => match out {
                Outgoing::Body(body) => {
                    let _ = frames.send(ids.message(body));
                }
                Outgoing::Call { kind, payload, timeout, sink, settle } => {
                    let msg = ids.message(Body::Request(Request { kind: kind.clone(), payload }));
                    tracing::debug!(request_id = %msg.id, %kind, "Calling host");
                    registry.insert(msg.id.clone(), kind.to_string(), timeout, sink, settle);
                    let _ = frames.send(msg);
                }
            },

            Some(_) = registry.next_timeout(), if !registry.is_empty() => {}

            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined
                    && e.is_panic()
                {
                    tracing::error!(error = %e, "Request task panicked");
                }
            }
        }
    }

    tasks.abort_all();
    registry.reject_all(|| RequestError::NotRunning);
    drop(frames);
    tracing::info!("Worker exiting");
    writer_task.await.map_err(io::Error::other)?
}

/// Run the worker on stdin/stdout. SIGTERM triggers the same clean exit as a
/// shutdown message.
pub async fn run_worker<H: RequestHandler>(handler: Arc<H>, config: WorkerConfig) -> io::Result<()> {
    let shutdown = CancellationToken::new();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        let token = shutdown.clone();
        tokio::spawn(async move {
            if sigterm.recv().await.is_some() {
                tracing::info!("SIGTERM received");
                token.cancel();
            }
        });
    }

    serve(
        handler,
        tokio::io::stdin(),
        tokio::io::stdout(),
        config,
        shutdown,
    )
    .await
}
