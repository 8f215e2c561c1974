//! Language model backends reachable only from the host.
//!
//! The worker never holds credentials; it names the model it wants through
//! [`ModelSelector`]s and the host resolves them against its [`ModelCatalog`].

mod openai;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub use openai::OpenAiCompatibleModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Identity of a model instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub vendor: String,
    pub family: String,
}

impl ModelInfo {
    pub fn new(
        id: impl Into<String>,
        vendor: impl Into<String>,
        family: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            vendor: vendor.into(),
            family: family.into(),
        }
    }
}

/// Partial description of the wanted model. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl ModelSelector {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn vendor(vendor: impl Into<String>) -> Self {
        Self {
            vendor: Some(vendor.into()),
            ..Self::default()
        }
    }

    pub fn with_family(mut self, family: impl Into<String>) -> Self {
        self.family = Some(family.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn matches(&self, info: &ModelInfo) -> bool {
        fn field(want: &Option<String>, have: &str) -> bool {
            want.as_deref().is_none_or(|w| w == have)
        }
        field(&self.vendor, &info.vendor)
            && field(&self.family, &info.family)
            && field(&self.id, &info.id)
    }
}

impl fmt::Display for ModelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = [
            ("vendor", &self.vendor),
            ("family", &self.family),
            ("id", &self.id),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.as_ref().map(|v| format!("{name}={v}")))
        .collect();
        if parts.is_empty() {
            f.write_str("*")
        } else {
            f.write_str(&parts.join(","))
        }
    }
}

/// Free-form generation options forwarded to the backend.
pub type GenerateOptions = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed backend stream: {0}")]
    Stream(String),
    #[error("{0}")]
    Other(String),
}

/// Text fragments in generation order.
pub type FragmentStream = BoxStream<'static, Result<String, BackendError>>;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn info(&self) -> &ModelInfo;

    /// Start a generation. Errors before the first fragment are returned
    /// directly, later ones as stream items.
    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        options: GenerateOptions,
    ) -> Result<FragmentStream, BackendError>;
}

/// Models available to the host, in preference order.
#[derive(Clone, Default)]
pub struct ModelCatalog {
    models: Vec<Arc<dyn LanguageModel>>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.models.push(model);
        self
    }

    pub fn add(&mut self, model: Arc<dyn LanguageModel>) {
        self.models.push(model);
    }

    /// First model matching the selector.
    pub fn select(&self, selector: &ModelSelector) -> Option<Arc<dyn LanguageModel>> {
        self.models
            .iter()
            .find(|m| selector.matches(m.info()))
            .cloned()
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelInfo> {
        self.models.iter().map(|m| m.info())
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
