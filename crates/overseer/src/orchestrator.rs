//! High-level entry point: one supervised worker plus the model catalog it
//! reaches through the host.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{broadcast, watch};

use crate::agents::{RemoteCapability, TaskRequest, TaskResult, kinds};
use crate::backend::ModelCatalog;
use crate::bridge::protocol::StreamChunk;
use crate::config::OrchestratorConfig;
use crate::proxy::CapabilityProxy;
use crate::registry::{CallResult, RequestError};
use crate::supervisor::{LifecycleEvent, Supervisor, SupervisorError, WorkerState};

pub struct Orchestrator {
    supervisor: Supervisor,
    request_timeout: Duration,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, catalog: ModelCatalog) -> Self {
        let proxy = Arc::new(CapabilityProxy::new(
            catalog,
            config.default_selectors.clone(),
        ));
        let request_timeout = config.request_timeout;
        Self {
            supervisor: Supervisor::new(config, proxy),
            request_timeout,
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub async fn start(&self) -> Result<(), SupervisorError> {
        self.supervisor.start().await
    }

    pub async fn stop(&self) {
        self.supervisor.stop().await
    }

    pub async fn restart(&self) -> Result<(), SupervisorError> {
        self.supervisor.restart().await
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    pub fn state(&self) -> WorkerState {
        self.supervisor.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.supervisor.subscribe_state()
    }

    /// Lifecycle events (`Ready`, `Error`, `Exit`) in the order they occur.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.supervisor.subscribe()
    }

    /// Send a domain request and decode the success payload.
    ///
    /// `timeout` defaults to the configured request timeout.
    pub async fn send_request<T: DeserializeOwned>(
        &self,
        kind: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<T, RequestError> {
        let value = self
            .supervisor
            .send_request(kind, payload, timeout.unwrap_or(self.request_timeout))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn send_streaming_request<F>(
        &self,
        kind: &str,
        payload: Value,
        on_chunk: F,
        timeout: Option<Duration>,
    ) -> CallResult
    where
        F: FnMut(StreamChunk) + Send + 'static,
    {
        self.supervisor
            .send_streaming_request(
                kind,
                payload,
                on_chunk,
                timeout.unwrap_or(self.request_timeout),
            )
            .await
    }

    pub async fn list_remote_capabilities(&self) -> Result<Vec<RemoteCapability>, RequestError> {
        self.send_request(kinds::LIST, Value::Null, None).await
    }

    pub async fn register_capability(&self, capability: &RemoteCapability) -> Result<(), RequestError> {
        let payload =
            serde_json::to_value(capability).map_err(|e| RequestError::Invalid(e.to_string()))?;
        let _: Value = self.send_request(kinds::REGISTER, payload, None).await?;
        Ok(())
    }

    /// Run a task on the worker, passing streamed text to `on_chunk`.
    pub async fn process_task<F>(
        &self,
        task: &TaskRequest,
        mut on_chunk: F,
    ) -> Result<TaskResult, RequestError>
    where
        F: FnMut(String) + Send + 'static,
    {
        let mut task = task.clone();
        task.stream = true;
        let payload = serde_json::to_value(&task).map_err(|e| RequestError::Invalid(e.to_string()))?;
        let value = self
            .send_streaming_request(
                kinds::PROCESS_TASK,
                payload,
                move |chunk| on_chunk(chunk.content),
                None,
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }
}
