//! Shared fixtures for tests that drive the real worker binary.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use overseer::backend::{FragmentStream, GenerateOptions};
use overseer::{
    BackendError, ChatMessage, LaunchSpec, LanguageModel, ModelCatalog, ModelInfo, ModelSelector,
    Orchestrator, OrchestratorConfig,
};

pub const WORKER: &str = env!("CARGO_BIN_EXE_overseer-worker");

/// Streams a fixed reply, word by word.
pub struct FakeModel {
    info: ModelInfo,
    words: Vec<String>,
}

impl FakeModel {
    pub fn new(id: &str, vendor: &str, reply: &str) -> Self {
        Self {
            info: ModelInfo::new(id, vendor, "fake"),
            words: reply.split_inclusive(' ').map(str::to_string).collect(),
        }
    }
}

#[async_trait::async_trait]
impl LanguageModel for FakeModel {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    async fn stream(
        &self,
        _messages: Vec<ChatMessage>,
        _options: GenerateOptions,
    ) -> Result<FragmentStream, BackendError> {
        let words: Vec<_> = self.words.iter().cloned().map(Ok).collect();
        Ok(futures::stream::iter(words).boxed())
    }
}

/// Never produces output.
pub struct StalledModel {
    info: ModelInfo,
}

impl StalledModel {
    pub fn new(id: &str) -> Self {
        Self {
            info: ModelInfo::new(id, "stalled", "fake"),
        }
    }
}

#[async_trait::async_trait]
impl LanguageModel for StalledModel {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    async fn stream(
        &self,
        _messages: Vec<ChatMessage>,
        _options: GenerateOptions,
    ) -> Result<FragmentStream, BackendError> {
        Ok(futures::stream::pending().boxed())
    }
}

pub fn config(default_selectors: Vec<ModelSelector>) -> OrchestratorConfig {
    OrchestratorConfig::new(LaunchSpec::new(WORKER).with_log_level("warn"))
        .with_default_selectors(default_selectors)
        .with_ready_timeout(Duration::from_secs(10))
        .with_shutdown_grace(Duration::from_millis(100))
        .with_kill_timeout(Duration::from_secs(2))
        .with_request_timeout(Duration::from_secs(10))
}

pub fn orchestrator(catalog: ModelCatalog, default_selectors: Vec<ModelSelector>) -> Orchestrator {
    Orchestrator::new(config(default_selectors), catalog)
}

pub fn fake_catalog() -> ModelCatalog {
    ModelCatalog::new().with_model(Arc::new(FakeModel::new("fake-1", "fake", "the quick fox")))
}
