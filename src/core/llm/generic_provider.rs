use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::registry::{ApiFormat, ProviderKind};
use super::{ChatMessage, ChatOutput, LlmProvider, ProviderConfig, ProviderError};

const MAX_TOKENS: u32 = 8192;
const ANTHROPIC_VERSION: &str = "2024-06-20";

// ── Anthropic Messages request/response ──

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
}

#[derive(Debug, Serialize)]
pub(crate) struct AnthropicMessage {
    role: String,
    content: AnthropicContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum AnthropicContent {
    Text(String),
    Blocks(Vec<AnthropicBlock>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicBlock {
    Text { text: String },
    Image { source: AnthropicImageSource },
}

#[derive(Debug, Serialize)]
struct AnthropicImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicResBlock>,
}

#[derive(Deserialize)]
struct AnthropicResBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

// ── OpenAI-compatible request/response ──

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiMessage {
    role: String,
    content: OpenAiContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum OpenAiContent {
    Text(String),
    Parts(Vec<OpenAiPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OpenAiPart {
    Text { text: String },
    ImageUrl { image_url: OpenAiImageUrl },
}

#[derive(Debug, Serialize)]
struct OpenAiImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessageOwned,
}

#[derive(Deserialize)]
struct OpenAiMessageOwned {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

// ── Ollama request/response ──

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage>,
    stream: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct OllamaMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: Option<OllamaMessageOwned>,
}

#[derive(Deserialize)]
struct OllamaMessageOwned {
    #[serde(default)]
    content: String,
}

// ── Wire transforms ──

pub(crate) fn to_anthropic_messages(messages: &[ChatMessage]) -> Vec<AnthropicMessage> {
    messages
        .iter()
        .map(|m| {
            let content = if m.images.is_empty() {
                AnthropicContent::Text(m.content.clone())
            } else {
                let mut blocks = vec![AnthropicBlock::Text {
                    text: m.content.clone(),
                }];
                blocks.extend(m.images.iter().map(|img| AnthropicBlock::Image {
                    source: AnthropicImageSource {
                        kind: "base64",
                        media_type: img.media_type.clone(),
                        data: img.base64.clone(),
                    },
                }));
                AnthropicContent::Blocks(blocks)
            };
            AnthropicMessage {
                role: m.role.clone(),
                content,
            }
        })
        .collect()
}

pub(crate) fn to_openai_messages(messages: &[ChatMessage]) -> Vec<OpenAiMessage> {
    messages
        .iter()
        .map(|m| {
            let content = if m.images.is_empty() {
                OpenAiContent::Text(m.content.clone())
            } else {
                let mut parts = vec![OpenAiPart::Text {
                    text: m.content.clone(),
                }];
                parts.extend(m.images.iter().map(|img| OpenAiPart::ImageUrl {
                    image_url: OpenAiImageUrl {
                        url: format!("data:{};base64,{}", img.media_type, img.base64),
                    },
                }));
                OpenAiContent::Parts(parts)
            };
            OpenAiMessage {
                role: m.role.clone(),
                content,
            }
        })
        .collect()
}

pub(crate) fn to_ollama_messages(messages: &[ChatMessage]) -> Vec<OllamaMessage> {
    messages
        .iter()
        .map(|m| OllamaMessage {
            role: m.role.clone(),
            content: m.content.clone(),
            images: m.images.iter().map(|img| img.base64.clone()).collect(),
        })
        .collect()
}

fn openai_chat_url(endpoint: &str) -> String {
    let base = endpoint.trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else {
        format!("{}/chat/completions", base)
    }
}

fn ollama_chat_url(endpoint: &str) -> String {
    let base = endpoint.trim_end_matches('/');
    if base.ends_with("/api/chat") {
        base.to_string()
    } else {
        format!("{}/api/chat", base)
    }
}

// ── HTTP Provider ──

/// Talks to every supported provider over plain HTTP, picking the wire
/// format from the agent's provider binding.
#[derive(Clone, Default)]
pub struct HttpProvider {
    client: Client,
}

impl HttpProvider {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    async fn send_json<B: Serialize, R: DeserializeOwned>(
        &self,
        kind: ProviderKind,
        request: reqwest::RequestBuilder,
        body: &B,
    ) -> Result<R, ProviderError> {
        let provider = kind.display_name().to_string();
        let res = request
            .json(body)
            .send()
            .await
            .map_err(|source| ProviderError::Transport {
                provider: provider.clone(),
                source,
            })?;

        let status = res.status();
        if !status.is_success() {
            return Err(ProviderError::Http {
                provider,
                status: status.as_u16(),
                body: res.text().await.unwrap_or_default(),
            });
        }

        res.json::<R>().await.map_err(|e| ProviderError::Decode {
            provider,
            message: e.to_string(),
        })
    }

    async fn chat_anthropic(
        &self,
        messages: &[ChatMessage],
        config: &ProviderConfig,
    ) -> Result<ChatOutput, ProviderError> {
        let req = AnthropicRequest {
            model: &config.model,
            max_tokens: MAX_TOKENS,
            messages: to_anthropic_messages(messages),
        };
        let request = self
            .client
            .post(&config.endpoint)
            .header("x-api-key", &config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION);

        let parsed: AnthropicResponse = self.send_json(config.kind, request, &req).await?;
        let content = parsed
            .content
            .into_iter()
            .find(|b| b.kind == "text")
            .and_then(|b| b.text)
            .unwrap_or_default();
        Ok(ChatOutput::text(content))
    }

    async fn chat_openai(
        &self,
        messages: &[ChatMessage],
        config: &ProviderConfig,
    ) -> Result<ChatOutput, ProviderError> {
        let is_reasoner = config.model.contains("reasoner");
        let req = OpenAiRequest {
            model: &config.model,
            messages: to_openai_messages(messages),
            max_tokens: (!is_reasoner).then_some(MAX_TOKENS),
        };
        let request = self
            .client
            .post(openai_chat_url(&config.endpoint))
            .header("Authorization", format!("Bearer {}", config.api_key));

        let parsed: OpenAiResponse = self.send_json(config.kind, request, &req).await?;
        let message = parsed.choices.into_iter().next().map(|c| c.message);
        Ok(match message {
            Some(m) => ChatOutput {
                content: m.content.unwrap_or_default(),
                reasoning: m.reasoning_content.filter(|r| !r.is_empty()),
            },
            None => ChatOutput::default(),
        })
    }

    async fn chat_ollama(
        &self,
        messages: &[ChatMessage],
        config: &ProviderConfig,
    ) -> Result<ChatOutput, ProviderError> {
        let req = OllamaRequest {
            model: &config.model,
            messages: to_ollama_messages(messages),
            stream: false,
        };
        let request = self.client.post(ollama_chat_url(&config.endpoint));

        let parsed: OllamaResponse = self.send_json(config.kind, request, &req).await?;
        Ok(ChatOutput::text(
            parsed.message.map(|m| m.content).unwrap_or_default(),
        ))
    }
}

#[async_trait]
impl LlmProvider for HttpProvider {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        config: &ProviderConfig,
    ) -> Result<ChatOutput, ProviderError> {
        let config = config.clone().with_defaults();
        if config.kind.requires_api_key() && config.api_key.trim().is_empty() {
            return Err(ProviderError::MissingApiKey(
                config.kind.display_name().to_string(),
            ));
        }

        debug!(
            "chat via {} ({} messages)",
            config.label(),
            messages.len()
        );

        match config.kind.api_format() {
            ApiFormat::Anthropic => self.chat_anthropic(messages, &config).await,
            ApiFormat::Openai => self.chat_openai(messages, &config).await,
            ApiFormat::Ollama => self.chat_ollama(messages, &config).await,
        }
    }
}
