//! Correlation registry - turns message sends into awaitable calls.
//!
//! Owned by exactly one event loop. Every outstanding request has one entry
//! holding its settlement sender, its timer key and an optional chunk sink.
//! An entry is removed on the first of: matching response, timer expiry,
//! [`CorrelationRegistry::reject_all`]. Later messages for the same id find
//! nothing and are dropped.

use std::collections::HashMap;
use std::future::poll_fn;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::time::{DelayQueue, delay_queue};

use crate::bridge::protocol::{ErrorInfo, MessageId, Response, StreamChunk, codes};

/// Receives stream chunks of one call, in arrival order.
pub type ChunkSink = Box<dyn FnMut(StreamChunk) + Send>;

pub type CallResult = Result<Value, RequestError>;

/// Failure of a single request/response call.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("{kind} timed out after {after:?}")]
    Timeout { kind: String, after: Duration },
    #[error("worker process exited")]
    ProcessExited,
    #[error("worker is not running")]
    NotRunning,
    #[error("remote error {0}")]
    Remote(ErrorInfo),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("failed to decode response payload: {0}")]
    Decode(#[from] serde_json::Error),
}

impl RequestError {
    /// Wire error code for this failure.
    pub fn code(&self) -> &str {
        match self {
            Self::Timeout { .. } => codes::REQUEST_TIMEOUT,
            Self::ProcessExited => codes::PROCESS_EXITED,
            Self::NotRunning => codes::NOT_RUNNING,
            Self::Remote(info) => &info.code,
            Self::Invalid(_) => codes::INVALID_REQUEST,
            Self::Decode(_) => codes::DECODE_ERROR,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_process_exited(&self) -> bool {
        matches!(self, Self::ProcessExited)
    }

    /// Structured form, for relaying the failure over the wire.
    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            Self::Remote(info) => info.clone(),
            other => ErrorInfo::new(other.code(), other.to_string()),
        }
    }
}

struct PendingCall {
    kind: String,
    settle: oneshot::Sender<CallResult>,
    timer: delay_queue::Key,
    sink: Option<ChunkSink>,
    started_at: Instant,
}

#[derive(Default)]
pub struct CorrelationRegistry {
    pending: HashMap<MessageId, PendingCall>,
    timers: DelayQueue<MessageId>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending call. Must happen before the request is written.
    pub fn register(
        &mut self,
        id: MessageId,
        kind: impl Into<String>,
        timeout: Duration,
        sink: Option<ChunkSink>,
    ) -> oneshot::Receiver<CallResult> {
        let (settle, rx) = oneshot::channel();
        self.insert(id, kind, timeout, sink, settle);
        rx
    }

    /// Like [`register`](Self::register), for callers that already hold the
    /// receiving end of the settlement channel.
    pub fn insert(
        &mut self,
        id: MessageId,
        kind: impl Into<String>,
        timeout: Duration,
        sink: Option<ChunkSink>,
        settle: oneshot::Sender<CallResult>,
    ) {
        let timer = self.timers.insert(id.clone(), timeout);
        let previous = self.pending.insert(
            id.clone(),
            PendingCall {
                kind: kind.into(),
                settle,
                timer,
                sink,
                started_at: Instant::now(),
            },
        );
        if let Some(previous) = previous {
            tracing::error!(request_id = %id, kind = %previous.kind, "Duplicate request id registered");
            self.timers.remove(&previous.timer);
        }
    }

    /// Settle the call a response answers. Returns false when no call matched.
    pub fn settle(&mut self, response: Response) -> bool {
        let Some(call) = self.pending.remove(&response.request_id) else {
            tracing::debug!(request_id = %response.request_id, "Dropping response for unknown request");
            return false;
        };
        self.timers.remove(&call.timer);

        tracing::debug!(
            request_id = %response.request_id,
            kind = %call.kind,
            success = response.is_success(),
            elapsed_ms = call.started_at.elapsed().as_millis() as u64,
            "Request settled"
        );
        let _ = call
            .settle
            .send(response.outcome.map_err(RequestError::Remote));
        true
    }

    /// Forward a chunk to the sink of its call. The call stays pending.
    pub fn forward_chunk(&mut self, chunk: StreamChunk) -> bool {
        match self.pending.get_mut(&chunk.request_id) {
            Some(PendingCall {
                sink: Some(sink), ..
            }) => {
                sink(chunk);
                true
            }
            Some(_) => {
                tracing::debug!(request_id = %chunk.request_id, "Dropping chunk for non-streaming request");
                false
            }
            None => {
                tracing::debug!(request_id = %chunk.request_id, "Dropping chunk for unknown request");
                false
            }
        }
    }

    /// Fail one call (e.g. its request could not be written).
    pub fn fail(&mut self, id: &MessageId, error: RequestError) -> bool {
        match self.pending.remove(id) {
            Some(call) => {
                self.timers.remove(&call.timer);
                let _ = call.settle.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Reject every outstanding call. Returns how many were rejected.
    pub fn reject_all(&mut self, error: impl Fn() -> RequestError) -> usize {
        let count = self.pending.len();
        for (id, call) in self.pending.drain() {
            tracing::debug!(request_id = %id, kind = %call.kind, "Rejecting outstanding request");
            let _ = call.settle.send(Err(error()));
        }
        self.timers.clear();
        count
    }

    /// Wait for the next call to time out, reject it and return its id.
    ///
    /// Resolves to `None` immediately when nothing is pending, so callers in
    /// a `select!` loop should pattern-match on `Some`.
    pub async fn next_timeout(&mut self) -> Option<MessageId> {
        let expired = poll_fn(|cx| self.timers.poll_expired(cx)).await?;
        let id = expired.into_inner();
        let call = self.pending.remove(&id)?;
        let after = call.started_at.elapsed();
        tracing::warn!(request_id = %id, kind = %call.kind, ?after, "Request timed out");
        let _ = call.settle.send(Err(RequestError::Timeout {
            kind: call.kind,
            after,
        }));
        Some(id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::Channel;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn ok(id: &str, payload: Value) -> Response {
        Response {
            channel: Channel::Domain("agent".to_string()),
            request_id: MessageId::new(id),
            outcome: Ok(payload),
        }
    }

    fn chunk(id: &str, content: &str) -> StreamChunk {
        StreamChunk {
            channel: Channel::Domain("task".to_string()),
            request_id: MessageId::new(id),
            content: content.to_string(),
            done: false,
        }
    }

    #[tokio::test]
    async fn out_of_order_responses_reach_their_callers() {
        let mut registry = CorrelationRegistry::new();
        let receivers: Vec<_> = (0..5)
            .map(|i| {
                let rx = registry.register(
                    MessageId::new(format!("r-{i}")),
                    "agent:list",
                    Duration::from_secs(5),
                    None,
                );
                (i, rx)
            })
            .collect();

        for i in [3, 0, 4, 1, 2] {
            assert!(registry.settle(ok(&format!("r-{i}"), json!(i))));
        }
        assert!(registry.is_empty());

        for (i, rx) in receivers {
            assert_eq!(rx.await.unwrap().unwrap(), json!(i));
        }
    }

    #[tokio::test]
    async fn second_response_is_dropped() {
        let mut registry = CorrelationRegistry::new();
        let rx = registry.register(MessageId::new("r-1"), "agent:list", Duration::from_secs(5), None);

        assert!(registry.settle(ok("r-1", json!("first"))));
        assert!(!registry.settle(ok("r-1", json!("second"))));

        assert_eq!(rx.await.unwrap().unwrap(), json!("first"));
    }

    #[tokio::test]
    async fn failed_response_carries_remote_error() {
        let mut registry = CorrelationRegistry::new();
        let rx = registry.register(MessageId::new("r-1"), "agent:register", Duration::from_secs(5), None);

        registry.settle(Response {
            channel: Channel::Domain("agent".to_string()),
            request_id: MessageId::new("r-1"),
            outcome: Err(ErrorInfo::new("DUPLICATE", "agent exists")),
        });

        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "DUPLICATE");
        assert!(matches!(err, RequestError::Remote(ref info) if info.message == "agent exists"));
    }

    #[tokio::test]
    async fn chunks_reach_sink_in_order_and_keep_entry() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let mut registry = CorrelationRegistry::new();
        let rx = registry.register(
            MessageId::new("s-1"),
            "task:process",
            Duration::from_secs(5),
            Some(Box::new(move |c: StreamChunk| {
                sink_seen.lock().unwrap().push(c.content)
            })),
        );

        for part in ["a", "b", "c"] {
            assert!(registry.forward_chunk(chunk("s-1", part)));
        }
        assert!(registry.contains(&MessageId::new("s-1")));
        assert!(!registry.forward_chunk(chunk("unknown", "x")));

        registry.settle(ok("s-1", json!("abc")));
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(rx.await.unwrap().unwrap(), json!("abc"));

        assert!(!registry.forward_chunk(chunk("s-1", "late")));
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn chunk_for_plain_request_is_dropped() {
        let mut registry = CorrelationRegistry::new();
        let _rx = registry.register(MessageId::new("r-1"), "agent:list", Duration::from_secs(5), None);
        assert!(!registry.forward_chunk(chunk("r-1", "x")));
        assert!(registry.contains(&MessageId::new("r-1")));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_rejects_and_removes_entry() {
        let mut registry = CorrelationRegistry::new();
        let rx = registry.register(MessageId::new("r-1"), "agent:list", Duration::from_millis(50), None);
        let _other = registry.register(MessageId::new("r-2"), "agent:list", Duration::from_secs(60), None);

        let expired = registry.next_timeout().await;
        assert_eq!(expired, Some(MessageId::new("r-1")));
        assert_eq!(registry.len(), 1);

        let err = rx.await.unwrap().unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.code(), codes::REQUEST_TIMEOUT);

        // Late response for the expired id is dropped.
        assert!(!registry.settle(ok("r-1", json!(null))));
    }

    #[tokio::test]
    async fn next_timeout_is_none_when_empty() {
        let mut registry = CorrelationRegistry::new();
        assert_eq!(registry.next_timeout().await, None);
    }

    #[tokio::test]
    async fn reject_all_empties_registry() {
        let mut registry = CorrelationRegistry::new();
        let receivers: Vec<_> = (0..3)
            .map(|i| {
                registry.register(
                    MessageId::new(format!("r-{i}")),
                    "task:process",
                    Duration::from_secs(5),
                    None,
                )
            })
            .collect();

        assert_eq!(registry.reject_all(|| RequestError::ProcessExited), 3);
        assert!(registry.is_empty());
        assert_eq!(registry.next_timeout().await, None);

        for rx in receivers {
            assert!(rx.await.unwrap().unwrap_err().is_process_exited());
        }
    }

    #[tokio::test]
    async fn settle_cancels_timer() {
        let mut registry = CorrelationRegistry::new();
        let rx = registry.register(MessageId::new("r-1"), "agent:list", Duration::from_millis(1), None);
        registry.settle(ok("r-1", json!(1)));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(registry.next_timeout().await, None);
        assert_eq!(rx.await.unwrap().unwrap(), json!(1));
    }
}
