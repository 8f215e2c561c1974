//! Capability proxy - the host invokes the model on the worker's behalf.
//!
//! The worker has no backend credentials. It sends `capability-request` or
//! `capability-stream-request`; the host picks a model from its catalog by
//! walking the selector chain, runs it, and answers with one terminal
//! `capability-response`. Streamed calls emit one `capability-chunk`
//! (`done = false`) per fragment before that response. Completion is never
//! signalled by a chunk.

use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::backend::{
    BackendError, ChatMessage, GenerateOptions, LanguageModel, ModelCatalog, ModelSelector,
};
use crate::bridge::protocol::{
    Body, Channel, ErrorInfo, IdGenerator, Message, MessageId, Response, StreamChunk, codes,
};

/// Payload of a capability request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRequest {
    pub messages: Vec<ChatMessage>,
    /// Preference-ordered fallback chain. Omitted or empty means the host's
    /// default chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selectors: Option<Vec<ModelSelector>>,
    #[serde(default, skip_serializing_if = "GenerateOptions::is_empty")]
    pub options: GenerateOptions,
}

impl CapabilityRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            selectors: None,
            options: GenerateOptions::new(),
        }
    }

    pub fn with_selectors(mut self, selectors: Vec<ModelSelector>) -> Self {
        self.selectors = Some(selectors);
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }
}

/// Success payload of a capability response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityResult {
    pub content: String,
    /// Id of the model that produced the content.
    pub model: String,
    /// Selector that matched.
    pub selector: ModelSelector,
    /// Position of that selector in the chain.
    pub selector_index: usize,
}

/// A model resolved from a selector chain.
pub struct Resolved {
    pub index: usize,
    pub selector: ModelSelector,
    pub model: Arc<dyn LanguageModel>,
}

pub struct CapabilityProxy {
    catalog: ModelCatalog,
    default_selectors: Vec<ModelSelector>,
}

impl CapabilityProxy {
    pub fn new(catalog: ModelCatalog, default_selectors: Vec<ModelSelector>) -> Self {
        Self {
            catalog,
            default_selectors,
        }
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// First selector of the chain with a matching model.
    pub fn resolve(&self, chain: &[ModelSelector]) -> Option<Resolved> {
        chain.iter().enumerate().find_map(|(index, selector)| {
            match self.catalog.select(selector) {
                Some(model) => Some(Resolved {
                    index,
                    selector: selector.clone(),
                    model,
                }),
                None => {
                    tracing::debug!(%selector, index, "No model matches selector");
                    None
                }
            }
        })
    }

    /// Service one capability request and write every reply to `outbox`.
    ///
    /// Always ends with exactly one response for `request_id`, unless the
    /// outbox closes first (the worker is gone).
    pub async fn handle(
        &self,
        request_id: MessageId,
        streaming: bool,
        payload: Value,
        outbox: mpsc::UnboundedSender<Message>,
    ) {
        let mut ids = IdGenerator::new();
        let outcome = self
            .invoke(&request_id, streaming, payload, &mut ids, &outbox)
            .await;

        match &outcome {
            Ok(_) => tracing::debug!(%request_id, streaming, "Capability request served"),
            Err(error) => {
                tracing::warn!(%request_id, code = %error.code, message = %error.message, "Capability request failed")
            }
        }

        let response = ids.message(Body::Response(Response {
            channel: Channel::Capability,
            request_id,
            outcome,
        }));
        if outbox.send(response).is_err() {
            tracing::debug!("Worker channel closed before capability response");
        }
    }

    async fn invoke(
        &self,
        request_id: &MessageId,
        streaming: bool,
        payload: Value,
        ids: &mut IdGenerator,
        outbox: &mpsc::UnboundedSender<Message>,
    ) -> Result<Value, ErrorInfo> {
        let request: CapabilityRequest = serde_json::from_value(payload).map_err(|e| {
            ErrorInfo::new(
                codes::INVALID_REQUEST,
                format!("invalid capability request: {e}"),
            )
        })?;
        if request.messages.is_empty() {
            return Err(ErrorInfo::new(
                codes::INVALID_REQUEST,
                "capability request has no messages",
            ));
        }

        let chain = match request.selectors.as_deref() {
            Some(selectors) if !selectors.is_empty() => selectors,
            _ => self.default_selectors.as_slice(),
        };
        let Resolved {
            index,
            selector,
            model,
        } = self.resolve(chain).ok_or_else(|| {
            ErrorInfo::new(codes::CAPABILITY_UNAVAILABLE, "no backend available")
                .with_details(serde_json::json!({ "selectors": chain }))
        })?;

        let model_id = model.info().id.clone();
        tracing::info!(%request_id, %selector, selector_index = index, model = %model_id, streaming, "Invoking model");

        let mut fragments = model
            .stream(request.messages, request.options)
            .await
            .map_err(backend_error)?;

        let mut content = String::new();
        while let Some(fragment) = fragments.next().await {
            let fragment = fragment.map_err(backend_error)?;
            if streaming {
                let chunk = ids.message(Body::Chunk(StreamChunk {
                    channel: Channel::Capability,
                    request_id: request_id.clone(),
                    content: fragment.clone(),
                    done: false,
                }));
                if outbox.send(chunk).is_err() {
                    return Err(ErrorInfo::new(
                        codes::PROCESS_EXITED,
                        "worker channel closed while streaming",
                    ));
                }
            }
            content.push_str(&fragment);
        }

        let result = CapabilityResult {
            content,
            model: model_id,
            selector,
            selector_index: index,
        };
        serde_json::to_value(result)
            .map_err(|e| ErrorInfo::new(codes::HANDLER_ERROR, e.to_string()))
    }
}

fn backend_error(e: BackendError) -> ErrorInfo {
    ErrorInfo::new(codes::BACKEND_ERROR, e.to_string())
}
