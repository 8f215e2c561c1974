//! Reference worker logic: a registry of remote capabilities plus a task
//! processor that reaches the model only through the host.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::backend::{ChatMessage, ModelSelector};
use crate::bridge::protocol::{ErrorInfo, codes};
use crate::proxy::CapabilityRequest;
use crate::worker::{IncomingRequest, RequestContext, RequestHandler};

/// Request kinds served by [`AgentWorker`].
pub mod kinds {
    pub const REGISTER: &str = "agent:register";
    pub const LIST: &str = "agent:list";
    pub const PROCESS_TASK: &str = "task:process";
}

/// A capability advertised to the worker by some other part of the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCapability {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Extra instructions prepended as a system message when a task names
    /// this capability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl RemoteCapability {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            instructions: None,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Name of a registered capability whose instructions apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selectors: Option<Vec<ModelSelector>>,
}

impl TaskRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            agent: None,
            stream: false,
            selectors: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_selectors(mut self, selectors: Vec<ModelSelector>) -> Self {
        self.selectors = Some(selectors);
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub content: String,
    pub model: String,
    pub selector_index: usize,
}

fn invalid(e: impl std::fmt::Display) -> ErrorInfo {
    ErrorInfo::new(codes::INVALID_REQUEST, e.to_string())
}

/// [`RequestHandler`] behind the `overseer-worker` binary.
#[derive(Default)]
pub struct AgentWorker {
    registry: Mutex<BTreeMap<String, RemoteCapability>>,
}

impl AgentWorker {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, capability: RemoteCapability) -> bool {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry
            .insert(capability.name.clone(), capability)
            .is_none()
    }

    fn list(&self) -> Vec<RemoteCapability> {
        let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.values().cloned().collect()
    }

    fn build_messages(&self, task: &TaskRequest) -> Result<Vec<ChatMessage>, ErrorInfo> {
        let mut messages = Vec::new();
        if let Some(name) = &task.agent {
            let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            let capability = registry.get(name).ok_or_else(|| {
                ErrorInfo::new(codes::INVALID_REQUEST, format!("unknown agent {name:?}"))
            })?;
            if let Some(instructions) = &capability.instructions {
                messages.push(ChatMessage::system(instructions.clone()));
            }
        }
        if let Some(system) = &task.system {
            messages.push(ChatMessage::system(system.clone()));
        }
        messages.push(ChatMessage::user(task.prompt.clone()));
        Ok(messages)
    }

    async fn process(&self, task: TaskRequest, ctx: RequestContext) -> Result<Value, ErrorInfo> {
        if task.prompt.trim().is_empty() {
            return Err(invalid("prompt is empty"));
        }
        let mut request = CapabilityRequest::new(self.build_messages(&task)?);
        request.selectors = task.selectors.clone();

        let result = if task.stream {
            let relay = ctx.clone();
            ctx.host()
                .invoke_streaming(&request, move |fragment| {
                    if let Err(e) = relay.emit_chunk(fragment) {
                        tracing::debug!(error = %e, "Dropping fragment, host channel closed");
                    }
                })
                .await
        } else {
            ctx.host().invoke(&request).await
        }
        .map_err(|e| e.to_error_info())?;

        tracing::debug!(
            request_id = %ctx.request_id(),
            model = %result.model,
            selector_index = result.selector_index,
            "Task processed"
        );

        let reply = TaskResult {
            content: result.content,
            model: result.model,
            selector_index: result.selector_index,
        };
        serde_json::to_value(reply).map_err(|e| ErrorInfo::new(codes::HANDLER_ERROR, e.to_string()))
    }
}

#[async_trait::async_trait]
impl RequestHandler for AgentWorker {
    fn capabilities(&self) -> Vec<String> {
        vec![
            kinds::REGISTER.to_string(),
            kinds::LIST.to_string(),
            kinds::PROCESS_TASK.to_string(),
        ]
    }

    async fn handle(
        &self,
        request: IncomingRequest,
        ctx: RequestContext,
    ) -> Result<Value, ErrorInfo> {
        match request.kind.as_str() {
            kinds::REGISTER => {
                let capability: RemoteCapability =
                    serde_json::from_value(request.payload).map_err(invalid)?;
                if capability.name.is_empty() {
                    return Err(invalid("capability name is empty"));
                }
                tracing::info!(name = %capability.name, "Registering capability");
                let created = self.register(capability);
                Ok(json!({ "registered": true, "created": created }))
            }
            kinds::LIST => Ok(json!(self.list())),
            kinds::PROCESS_TASK => {
                let task: TaskRequest = serde_json::from_value(request.payload).map_err(invalid)?;
                self.process(task, ctx).await
            }
            other => Err(ErrorInfo::new(
                codes::UNSUPPORTED_REQUEST,
                format!("no handler for {other}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use futures::StreamExt;

    use crate::backend::{
        BackendError, FragmentStream, GenerateOptions, LanguageModel, ModelCatalog, ModelInfo,
    };
    use crate::config::{LaunchSpec, OrchestratorConfig};
    use crate::process::{ExitReport, InProcessIo, InProcessSpawner};
    use crate::proxy::CapabilityProxy;
    use crate::supervisor::Supervisor;
    use crate::worker::{WorkerConfig, serve};

    /// Replies with the messages it was given, one fragment per message.
    struct Parrot {
        info: ModelInfo,
    }

    #[async_trait::async_trait]
    impl LanguageModel for Parrot {
        fn info(&self) -> &ModelInfo {
            &self.info
        }

        async fn stream(
            &self,
            messages: Vec<ChatMessage>,
            _options: GenerateOptions,
        ) -> Result<FragmentStream, BackendError> {
            let parts: Vec<_> = messages
                .into_iter()
                .map(|m| Ok(format!("[{}]", m.content)))
                .collect();
            Ok(futures::stream::iter(parts).boxed())
        }
    }

    async fn running() -> Supervisor {
        let spawner = InProcessSpawner::new(|io: InProcessIo| async move {
            let handler = Arc::new(AgentWorker::new());
            match serve(handler, io.reader, io.writer, WorkerConfig::default(), io.shutdown).await {
                Ok(()) => ExitReport::code(0),
                Err(_) => ExitReport::code(1),
            }
        });
        let config = OrchestratorConfig::new(LaunchSpec::default()).with_spawner(Arc::new(spawner));
        let catalog = ModelCatalog::new().with_model(Arc::new(Parrot {
            info: ModelInfo::new("parrot-1", "birds", "parrot"),
        }));
        let proxy = Arc::new(CapabilityProxy::new(catalog, vec![ModelSelector::any()]));
        let sup = Supervisor::new(config, proxy);
        sup.start().await.unwrap();
        sup
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn register_then_list() {
        let sup = running().await;

        let cap = RemoteCapability::new("reviewer", "Reviews diffs");
        let first = sup
            .send_request(kinds::REGISTER, json!(cap), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(first, json!({"registered": true, "created": true}));
        let again = sup
            .send_request(kinds::REGISTER, json!(cap), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(again["created"], json!(false));

        let listed = sup.send_request(kinds::LIST, Value::Null, TIMEOUT).await.unwrap();
        insta::assert_json_snapshot!(listed, @r#"
        [
          {
            "name": "reviewer",
            "description": "Reviews diffs"
          }
        ]
        "#);
    }

    #[tokio::test]
    async fn task_uses_agent_instructions() {
        let sup = running().await;
        let cap = RemoteCapability::new("poet", "").with_instructions("rhyme");
        sup.send_request(kinds::REGISTER, json!(cap), TIMEOUT)
            .await
            .unwrap();

        let task = TaskRequest::new("write").with_agent("poet");
        let reply = sup
            .send_request(kinds::PROCESS_TASK, json!(task), TIMEOUT)
            .await
            .unwrap();
        let result: TaskResult = serde_json::from_value(reply).unwrap();
        assert_eq!(result.content, "[rhyme][write]");
        assert_eq!(result.model, "parrot-1");
        assert_eq!(result.selector_index, 0);
    }

    #[tokio::test]
    async fn streaming_task_relays_fragments() {
        let sup = running().await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let task = TaskRequest::new("go").with_system("be brief").streaming();
        let reply = sup
            .send_streaming_request(
                kinds::PROCESS_TASK,
                json!(task),
                move |chunk| sink.lock().unwrap().push(chunk.content),
                TIMEOUT,
            )
            .await
            .unwrap();

        assert_eq!(reply["content"], json!("[be brief][go]"));
        assert_eq!(*seen.lock().unwrap(), vec!["[be brief]", "[go]"]);
    }

    #[tokio::test]
    async fn task_errors() {
        let sup = running().await;

        let err = sup
            .send_request(kinds::PROCESS_TASK, json!(TaskRequest::new("x").with_agent("ghost")), TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::INVALID_REQUEST);

        let err = sup
            .send_request(kinds::PROCESS_TASK, json!({"prompt": "  "}), TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::INVALID_REQUEST);

        let task = TaskRequest::new("x").with_selectors(vec![ModelSelector::vendor("nobody")]);
        let err = sup
            .send_request(kinds::PROCESS_TASK, json!(task), TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::CAPABILITY_UNAVAILABLE);
    }
}
