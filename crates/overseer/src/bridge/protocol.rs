//! Wire protocol types for host-worker communication.
//!
//! A single bidirectional channel (worker stdin/stdout) carries every message.
//! On the wire each frame is an [`Envelope`]; in memory it is a [`Message`]
//! whose [`Body`] is already classified by its `kind` tag, so dispatch can
//! match exhaustively instead of probing for fields.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable error codes carried in non-success responses.
pub mod codes {
    pub const REQUEST_TIMEOUT: &str = "REQUEST_TIMEOUT";
    pub const PROCESS_EXITED: &str = "PROCESS_EXITED";
    pub const NOT_RUNNING: &str = "NOT_RUNNING";
    pub const CAPABILITY_UNAVAILABLE: &str = "CAPABILITY_UNAVAILABLE";
    pub const BACKEND_ERROR: &str = "BACKEND_ERROR";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const UNSUPPORTED_REQUEST: &str = "UNSUPPORTED_REQUEST";
    pub const HANDLER_ERROR: &str = "HANDLER_ERROR";
    pub const DECODE_ERROR: &str = "DECODE_ERROR";
}

/// Identifier of a message, unique within the lifetime of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Current Unix time in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Allocates message ids and stamps outgoing messages.
///
/// Ids combine the wall clock, a random per-generator seed and a monotonic
/// counter, so two generators (or two incarnations of the same worker) never
/// collide. Each event loop owns its generator; nothing is shared.
#[derive(Debug)]
pub struct IdGenerator {
    seed: u32,
    counter: u64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            seed: uuid::Uuid::new_v4().as_u128() as u32,
            counter: 0,
        }
    }

    pub fn next_id(&mut self) -> MessageId {
        self.counter += 1;
        MessageId(format!(
            "{:x}-{:08x}-{}",
            now_millis(),
            self.seed,
            self.counter
        ))
    }

    /// Wrap a body into a fresh message.
    pub fn message(&mut self, body: Body) -> Message {
        Message {
            id: self.next_id(),
            timestamp: now_millis(),
            body,
        }
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Structured error of a non-success response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Classified `kind` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Ready,
    Shutdown,
    CapabilityRequest,
    CapabilityStreamRequest,
    CapabilityResponse,
    CapabilityChunk,
    /// Domain request, holds the full kind (e.g. `agent:list`).
    Request(String),
    /// Domain response, holds the domain (`<domain>:response`).
    Response(String),
    /// Domain stream chunk, holds the domain (`<domain>:chunk`).
    Chunk(String),
}

impl MessageKind {
    pub fn parse(kind: &str) -> Result<Self, ProtocolError> {
        let parsed = match kind {
            "" => return Err(ProtocolError::EmptyKind),
            "ready" => Self::Ready,
            "shutdown" => Self::Shutdown,
            "capability-request" => Self::CapabilityRequest,
            "capability-stream-request" => Self::CapabilityStreamRequest,
            "capability-response" => Self::CapabilityResponse,
            "capability-chunk" => Self::CapabilityChunk,
            other => {
                if let Some(domain) = other.strip_suffix(":response")
                    && !domain.is_empty()
                {
                    Self::Response(domain.to_string())
                } else if let Some(domain) = other.strip_suffix(":chunk")
                    && !domain.is_empty()
                {
                    Self::Chunk(domain.to_string())
                } else {
                    Self::Request(other.to_string())
                }
            }
        };
        Ok(parsed)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => f.write_str("ready"),
            Self::Shutdown => f.write_str("shutdown"),
            Self::CapabilityRequest => f.write_str("capability-request"),
            Self::CapabilityStreamRequest => f.write_str("capability-stream-request"),
            Self::CapabilityResponse => f.write_str("capability-response"),
            Self::CapabilityChunk => f.write_str("capability-chunk"),
            Self::Request(kind) => f.write_str(kind),
            Self::Response(domain) => write!(f, "{domain}:response"),
            Self::Chunk(domain) => write!(f, "{domain}:chunk"),
        }
    }
}

/// Which reply family a response or chunk belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    Capability,
    Domain(String),
}

/// What a request asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// Worker asks the host to invoke the model and answer in one response.
    Capability,
    /// Worker asks the host to invoke the model and stream fragments.
    CapabilityStream,
    /// Generic `<domain>:<action>` request.
    Domain(String),
}

impl RequestKind {
    /// Parse a caller-supplied request kind. Reserved reply kinds are rejected.
    pub fn parse(kind: &str) -> Result<Self, ProtocolError> {
        match MessageKind::parse(kind)? {
            MessageKind::CapabilityRequest => Ok(Self::Capability),
            MessageKind::CapabilityStreamRequest => Ok(Self::CapabilityStream),
            MessageKind::Request(kind) => Ok(Self::Domain(kind)),
            _ => Err(ProtocolError::NotARequest(kind.to_string())),
        }
    }

    /// Channel used by replies to this request.
    pub fn reply_channel(&self) -> Channel {
        match self {
            Self::Capability | Self::CapabilityStream => Channel::Capability,
            Self::Domain(kind) => {
                let domain = kind.split(':').next().unwrap_or(kind);
                Channel::Domain(domain.to_string())
            }
        }
    }

    pub fn as_message_kind(&self) -> MessageKind {
        match self {
            Self::Capability => MessageKind::CapabilityRequest,
            Self::CapabilityStream => MessageKind::CapabilityStreamRequest,
            Self::Domain(kind) => MessageKind::Request(kind.clone()),
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_message_kind().fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub kind: RequestKind,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub channel: Channel,
    pub request_id: MessageId,
    pub outcome: Result<Value, ErrorInfo>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamChunk {
    pub channel: Channel,
    pub request_id: MessageId,
    pub content: String,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Readiness handshake, first message of a freshly spawned worker.
    Ready { capabilities: Vec<String> },
    /// Host asks the worker to terminate itself.
    Shutdown,
    Request(Request),
    Response(Response),
    Chunk(StreamChunk),
}

impl Body {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Ready { .. } => MessageKind::Ready,
            Self::Shutdown => MessageKind::Shutdown,
            Self::Request(req) => req.kind.as_message_kind(),
            Self::Response(resp) => match &resp.channel {
                Channel::Capability => MessageKind::CapabilityResponse,
                Channel::Domain(domain) => MessageKind::Response(domain.clone()),
            },
            Self::Chunk(chunk) => match &chunk.channel {
                Channel::Capability => MessageKind::CapabilityChunk,
                Channel::Domain(domain) => MessageKind::Chunk(domain.clone()),
            },
        }
    }
}

/// A typed message. Serializes through [`Envelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Envelope", into = "Envelope")]
pub struct Message {
    pub id: MessageId,
    pub timestamp: i64,
    pub body: Body,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// Correlation id of a response or chunk.
    pub fn request_id(&self) -> Option<&MessageId> {
        match &self.body {
            Body::Response(resp) => Some(&resp.request_id),
            Body::Chunk(chunk) => Some(&chunk.request_id),
            _ => None,
        }
    }
}

/// Raw wire shape of every message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub kind: String,
    pub id: MessageId,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ReadyPayload {
    #[serde(default)]
    capabilities: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChunkPayload {
    content: String,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("message kind is empty")]
    EmptyKind,
    #[error("`{0}` is not a request kind")]
    NotARequest(String),
    #[error("{kind} message is missing `{field}`")]
    MissingField { kind: String, field: &'static str },
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
}

fn missing(kind: &str, field: &'static str) -> ProtocolError {
    ProtocolError::MissingField {
        kind: kind.to_string(),
        field,
    }
}

fn invalid(kind: &str, e: serde_json::Error) -> ProtocolError {
    ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        reason: e.to_string(),
    }
}

fn response_body(
    raw_kind: &str,
    channel: Channel,
    request_id: Option<MessageId>,
    success: Option<bool>,
    payload: Option<Value>,
    error: Option<ErrorInfo>,
) -> Result<Body, ProtocolError> {
    let request_id = request_id.ok_or_else(|| missing(raw_kind, "requestId"))?;
    let success = success.ok_or_else(|| missing(raw_kind, "success"))?;
    let outcome = if success {
        Ok(payload.unwrap_or(Value::Null))
    } else {
        Err(error.unwrap_or_else(|| {
            ErrorInfo::new(codes::HANDLER_ERROR, "request failed without error detail")
        }))
    };
    Ok(Body::Response(Response {
        channel,
        request_id,
        outcome,
    }))
}

fn chunk_body(
    raw_kind: &str,
    channel: Channel,
    request_id: Option<MessageId>,
    payload: Option<Value>,
) -> Result<Body, ProtocolError> {
    let request_id = request_id.ok_or_else(|| missing(raw_kind, "requestId"))?;
    let payload = payload.ok_or_else(|| missing(raw_kind, "payload"))?;
    let chunk: ChunkPayload =
        serde_json::from_value(payload).map_err(|e| invalid(raw_kind, e))?;
    Ok(Body::Chunk(StreamChunk {
        channel,
        request_id,
        content: chunk.content,
        done: chunk.done,
    }))
}

impl TryFrom<Envelope> for Message {
    type Error = ProtocolError;

    fn try_from(env: Envelope) -> Result<Self, Self::Error> {
        let Envelope {
            kind: raw_kind,
            id,
            timestamp,
            request_id,
            success,
            payload,
            error,
        } = env;

        let request = |kind: RequestKind, payload: Option<Value>| {
            Body::Request(Request {
                kind,
                payload: payload.unwrap_or(Value::Null),
            })
        };

        let body = match MessageKind::parse(&raw_kind)? {
            MessageKind::Ready => {
                let ready: ReadyPayload = match payload {
                    Some(payload) => {
                        serde_json::from_value(payload).map_err(|e| invalid(&raw_kind, e))?
                    }
                    None => ReadyPayload::default(),
                };
                Body::Ready {
                    capabilities: ready.capabilities,
                }
            }
            MessageKind::Shutdown => Body::Shutdown,
            MessageKind::CapabilityRequest => request(RequestKind::Capability, payload),
            MessageKind::CapabilityStreamRequest => {
                request(RequestKind::CapabilityStream, payload)
            }
            MessageKind::Request(kind) => request(RequestKind::Domain(kind), payload),
            MessageKind::CapabilityResponse => response_body(
                &raw_kind,
                Channel::Capability,
                request_id,
                success,
                payload,
                error,
            )?,
            MessageKind::Response(domain) => response_body(
                &raw_kind,
                Channel::Domain(domain),
                request_id,
                success,
                payload,
                error,
            )?,
            MessageKind::CapabilityChunk => {
                chunk_body(&raw_kind, Channel::Capability, request_id, payload)?
            }
            MessageKind::Chunk(domain) => {
                chunk_body(&raw_kind, Channel::Domain(domain), request_id, payload)?
            }
        };

        Ok(Message {
            id,
            timestamp,
            body,
        })
    }
}

impl From<Message> for Envelope {
    fn from(msg: Message) -> Self {
        let mut env = Envelope {
            kind: msg.body.kind().to_string(),
            id: msg.id,
            timestamp: msg.timestamp,
            request_id: None,
            success: None,
            payload: None,
            error: None,
        };

        match msg.body {
            Body::Ready { capabilities } => {
                env.payload = Some(serde_json::json!({ "capabilities": capabilities }));
            }
            Body::Shutdown => {}
            Body::Request(req) => {
                env.payload = Some(req.payload);
            }
            Body::Response(resp) => {
                env.request_id = Some(resp.request_id);
                match resp.outcome {
                    Ok(payload) => {
                        env.success = Some(true);
                        env.payload = Some(payload);
                    }
                    Err(error) => {
                        env.success = Some(false);
                        env.error = Some(error);
                    }
                }
            }
            Body::Chunk(chunk) => {
                env.request_id = Some(chunk.request_id);
                env.payload = Some(serde_json::json!({
                    "content": chunk.content,
                    "done": chunk.done,
                }));
            }
        }

        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(body: Body) -> Message {
        Message {
            id: MessageId::new("m-1"),
            timestamp: 1_700_000_000_000,
            body,
        }
    }

    #[test]
    fn ready_serializes() {
        let ready = msg(Body::Ready {
            capabilities: vec!["agent:list".to_string()],
        });
        insta::assert_json_snapshot!(ready, @r#"
        {
          "kind": "ready",
          "id": "m-1",
          "timestamp": 1700000000000,
          "payload": {
            "capabilities": [
              "agent:list"
            ]
          }
        }
        "#);
    }

    #[test]
    fn shutdown_serializes() {
        insta::assert_json_snapshot!(msg(Body::Shutdown), @r#"
        {
          "kind": "shutdown",
          "id": "m-1",
          "timestamp": 1700000000000
        }
        "#);
    }

    #[test]
    fn success_response_serializes() {
        let resp = msg(Body::Response(Response {
            channel: Channel::Domain("agent".to_string()),
            request_id: MessageId::new("r-7"),
            outcome: Ok(json!({"agents": []})),
        }));
        insta::assert_json_snapshot!(resp, @r#"
        {
          "kind": "agent:response",
          "id": "m-1",
          "timestamp": 1700000000000,
          "requestId": "r-7",
          "success": true,
          "payload": {
            "agents": []
          }
        }
        "#);
    }

    #[test]
    fn error_response_serializes() {
        let resp = msg(Body::Response(Response {
            channel: Channel::Capability,
            request_id: MessageId::new("r-7"),
            outcome: Err(ErrorInfo::new(
                codes::CAPABILITY_UNAVAILABLE,
                "no backend available",
            )),
        }));
        insta::assert_json_snapshot!(resp, @r#"
        {
          "kind": "capability-response",
          "id": "m-1",
          "timestamp": 1700000000000,
          "requestId": "r-7",
          "success": false,
          "error": {
            "code": "CAPABILITY_UNAVAILABLE",
            "message": "no backend available"
          }
        }
        "#);
    }

    #[test]
    fn chunk_serializes() {
        let chunk = msg(Body::Chunk(StreamChunk {
            channel: Channel::Capability,
            request_id: MessageId::new("r-7"),
            content: "Hel".to_string(),
            done: false,
        }));
        insta::assert_json_snapshot!(chunk, @r#"
        {
          "kind": "capability-chunk",
          "id": "m-1",
          "timestamp": 1700000000000,
          "requestId": "r-7",
          "payload": {
            "content": "Hel",
            "done": false
          }
        }
        "#);
    }

    #[test]
    fn kinds_classify() {
        assert_eq!(MessageKind::parse("ready").unwrap(), MessageKind::Ready);
        assert_eq!(
            MessageKind::parse("capability-stream-request").unwrap(),
            MessageKind::CapabilityStreamRequest
        );
        assert_eq!(
            MessageKind::parse("agent:list").unwrap(),
            MessageKind::Request("agent:list".to_string())
        );
        assert_eq!(
            MessageKind::parse("task:response").unwrap(),
            MessageKind::Response("task".to_string())
        );
        assert_eq!(
            MessageKind::parse("task:chunk").unwrap(),
            MessageKind::Chunk("task".to_string())
        );
        // A bare suffix has no domain and stays a request.
        assert_eq!(
            MessageKind::parse(":chunk").unwrap(),
            MessageKind::Request(":chunk".to_string())
        );
        assert!(matches!(
            MessageKind::parse(""),
            Err(ProtocolError::EmptyKind)
        ));
    }

    #[test]
    fn kind_display_matches_parse() {
        for raw in [
            "ready",
            "shutdown",
            "capability-request",
            "capability-chunk",
            "agent:register",
            "agent:response",
            "task:chunk",
        ] {
            assert_eq!(MessageKind::parse(raw).unwrap().to_string(), raw);
        }
    }

    #[test]
    fn domain_requests_reply_on_their_domain() {
        let kind = RequestKind::parse("agent:list").unwrap();
        assert_eq!(kind.reply_channel(), Channel::Domain("agent".to_string()));

        let kind = RequestKind::parse("ping").unwrap();
        assert_eq!(kind.reply_channel(), Channel::Domain("ping".to_string()));

        assert!(RequestKind::parse("agent:response").is_err());
        assert!(RequestKind::parse("ready").is_err());
    }

    #[test]
    fn response_without_request_id_is_rejected() {
        let raw = json!({
            "kind": "agent:response",
            "id": "m-2",
            "timestamp": 1,
            "success": true
        });
        let err = serde_json::from_value::<Message>(raw).unwrap_err();
        assert!(err.to_string().contains("requestId"), "{err}");
    }

    #[test]
    fn failed_response_without_error_gets_placeholder() {
        let raw = json!({
            "kind": "capability-response",
            "id": "m-3",
            "timestamp": 1,
            "requestId": "r-1",
            "success": false
        });
        let parsed: Message = serde_json::from_value(raw).unwrap();
        match parsed.body {
            Body::Response(resp) => {
                let err = resp.outcome.unwrap_err();
                assert_eq!(err.code, codes::HANDLER_ERROR);
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn chunk_payload_must_carry_content() {
        let raw = json!({
            "kind": "task:chunk",
            "id": "m-4",
            "timestamp": 1,
            "requestId": "r-1",
            "payload": {"done": true}
        });
        assert!(serde_json::from_value::<Message>(raw).is_err());
    }

    #[test]
    fn ready_without_payload_has_no_capabilities() {
        let raw = json!({"kind": "ready", "id": "w-1", "timestamp": 5});
        let parsed: Message = serde_json::from_value(raw).unwrap();
        assert_eq!(
            parsed.body,
            Body::Ready {
                capabilities: vec![]
            }
        );
    }

    #[test]
    fn generated_ids_are_unique_across_generators() {
        let mut a = IdGenerator::new();
        let mut b = IdGenerator::new();
        let ids: std::collections::HashSet<MessageId> = (0..100)
            .flat_map(|_| [a.next_id(), b.next_id()])
            .collect();
        assert_eq!(ids.len(), 200);
    }
}
