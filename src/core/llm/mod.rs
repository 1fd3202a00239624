pub mod generic_provider;
pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use generic_provider::HttpProvider;
pub use registry::{ApiFormat, ProviderKind};

/// Base64 image attached to a chat turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageData {
    pub base64: String,
    pub media_type: String,
}

/// Provider-agnostic chat turn. Each wire format decides where `images` go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageData>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
            images: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            images: Vec::new(),
        }
    }

    pub fn with_images(mut self, images: Vec<ImageData>) -> Self {
        self.images = images;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatOutput {
    pub content: String,
    pub reasoning: Option<String>,
}

impl ChatOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            reasoning: None,
        }
    }
}

/// Provider binding stored on every agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(rename = "type", default)]
    pub kind: ProviderKind,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub endpoint: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::new(ProviderKind::default())
    }
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            api_key: String::new(),
            model: String::new(),
            endpoint: String::new(),
        }
        .with_defaults()
    }

    /// Fill an empty model or endpoint with the provider's defaults.
    pub fn with_defaults(mut self) -> Self {
        if self.model.trim().is_empty() {
            self.model = self.kind.default_model().to_string();
        }
        if self.endpoint.trim().is_empty() {
            self.endpoint = self.kind.default_endpoint().to_string();
        }
        self
    }

    pub fn label(&self) -> String {
        format!("{} / {}", self.kind.as_str(), self.model)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("unknown provider type: {0}")]
    UnknownProvider(String),

    #[error("{0} requires an API key")]
    MissingApiKey(String),

    #[error("{provider} API error: {status} {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("{provider} request failed: {source}")]
    Transport {
        provider: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} returned an unreadable response: {message}")]
    Decode { provider: String, message: String },
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        config: &ProviderConfig,
    ) -> Result<ChatOutput, ProviderError>;
}

pub fn has_images(messages: &[ChatMessage]) -> bool {
    messages.iter().any(|m| !m.images.is_empty())
}
