//! OpenAI-compatible chat completions backend.
//!
//! Posts to `<base>/chat/completions` with `stream: true` and turns the
//! server-sent event body into a [`FragmentStream`].

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::bytes::{Bytes, BytesMut};

use super::{
    BackendError, ChatMessage, FragmentStream, GenerateOptions, LanguageModel, ModelInfo,
};
use crate::config::{MODEL_API_KEY_ENV, MODEL_NAME_ENV, MODEL_URL_ENV};

const DEFAULT_MODEL: &str = "gpt-4o-mini";

pub struct OpenAiCompatibleModel {
    endpoint: String,
    info: ModelInfo,
    client: reqwest::Client,
}

impl OpenAiCompatibleModel {
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        api_key: Option<&str>,
    ) -> Result<Self, BackendError> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = api_key
            && let Ok(value) = reqwest::header::HeaderValue::from_str(&format!("Bearer {key}"))
        {
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        let user_agent = format!("overseer/{}", crate::VERSION);
        if let Ok(value) = reqwest::header::HeaderValue::from_str(&user_agent) {
            headers.insert(reqwest::header::USER_AGENT, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let model = model.into();
        Ok(Self {
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            info: ModelInfo::new(model.clone(), "openai", model),
            client,
        })
    }

    /// Build from the host-only model variables. `Ok(None)` when no model URL
    /// is configured.
    pub fn from_env() -> Result<Option<Self>, BackendError> {
        let Ok(base_url) = std::env::var(MODEL_URL_ENV) else {
            return Ok(None);
        };
        let model = std::env::var(MODEL_NAME_ENV).unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let api_key = std::env::var(MODEL_API_KEY_ENV).ok();
        Self::new(&base_url, model, api_key.as_deref()).map(Some)
    }

    pub fn with_vendor(mut self, vendor: impl Into<String>) -> Self {
        self.info.vendor = vendor.into();
        self
    }

    pub fn with_family(mut self, family: impl Into<String>) -> Self {
        self.info.family = family.into();
        self
    }

    fn request_body(&self, messages: Vec<ChatMessage>, options: GenerateOptions) -> Value {
        let mut body = options;
        body.insert("model".to_string(), Value::String(self.info.id.clone()));
        body.insert("stream".to_string(), Value::Bool(true));
        body.insert(
            "messages".to_string(),
            serde_json::to_value(messages).unwrap_or(Value::Array(Vec::new())),
        );
        Value::Object(body)
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleModel {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        options: GenerateOptions,
    ) -> Result<FragmentStream, BackendError> {
        let body = self.request_body(messages, options);
        tracing::debug!(endpoint = %self.endpoint, model = %self.info.id, "Starting completion");

        let response = self.client.post(&self.endpoint).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(sse_fragments(response.bytes_stream().boxed()))
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Fragment(String),
    Done,
    Skip,
}

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

fn parse_sse_line(line: &str) -> Result<SseLine, BackendError> {
    // Comments, `event:`, `id:` and blank separators carry nothing for us.
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim_start();
    if data.is_empty() {
        return Ok(SseLine::Skip);
    }
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }

    let chunk: CompletionChunk = serde_json::from_str(data)
        .map_err(|e| BackendError::Stream(format!("{e} in event {data:?}")))?;
    if let Some(error) = chunk.error {
        return Err(BackendError::Other(error.message));
    }
    let text: String = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .collect();
    if text.is_empty() {
        Ok(SseLine::Skip)
    } else {
        Ok(SseLine::Fragment(text))
    }
}

/// Splits a byte stream on `\n`. Lines are only cut at newlines, so a UTF-8
/// sequence split across network reads stays intact.
#[derive(Default)]
struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let line = self.buf.split_to(pos + 1);
        Some(
            String::from_utf8_lossy(&line)
                .trim_end_matches(['\r', '\n'])
                .to_string(),
        )
    }

    /// Terminate a trailing line the server did not end with a newline.
    fn finish(&mut self) {
        if !self.buf.is_empty() {
            self.buf.extend_from_slice(b"\n");
        }
    }
}

struct SseState {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    lines: LineBuffer,
    eof: bool,
    finished: bool,
}

fn sse_fragments(body: BoxStream<'static, reqwest::Result<Bytes>>) -> FragmentStream {
    let state = SseState {
        body,
        lines: LineBuffer::default(),
        eof: false,
        finished: false,
    };

    futures::stream::unfold(state, |mut st| async move {
        loop {
            if st.finished {
                return None;
            }
            if let Some(line) = st.lines.next_line() {
                match parse_sse_line(&line) {
                    Ok(SseLine::Fragment(text)) => return Some((Ok(text), st)),
                    Ok(SseLine::Skip) => continue,
                    Ok(SseLine::Done) => return None,
                    Err(e) => {
                        st.finished = true;
                        return Some((Err(e), st));
                    }
                }
            }
            if st.eof {
                return None;
            }
            match st.body.next().await {
                Some(Ok(bytes)) => st.lines.extend(&bytes),
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(BackendError::Http(e)), st));
                }
                None => {
                    st.eof = true;
                    st.lines.finish();
                }
            }
        }
    })
    .boxed()
}
