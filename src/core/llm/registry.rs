use serde::{Deserialize, Serialize};

use super::ProviderError;

/// Supported provider families. Each one fixes a wire format and defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    Minimax,
    Deepseek,
    Ollama,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFormat {
    /// Messages API: images are content blocks.
    Anthropic,
    /// Chat completions: images are `image_url` data URIs.
    Openai,
    /// `/api/chat`: images ride in a separate base64 array.
    Ollama,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::Minimax,
        ProviderKind::Deepseek,
        ProviderKind::Ollama,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Minimax => "minimax",
            ProviderKind::Deepseek => "deepseek",
            ProviderKind::Ollama => "ollama",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ProviderError> {
        let normalized = value.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| ProviderError::UnknownProvider(value.to_string()))
    }

    pub fn display_name(self) -> &'static str {
        match self {
            ProviderKind::Minimax => "MiniMax",
            ProviderKind::Deepseek => "DeepSeek",
            ProviderKind::Ollama => "Ollama",
        }
    }

    pub fn api_format(self) -> ApiFormat {
        match self {
            ProviderKind::Minimax => ApiFormat::Anthropic,
            ProviderKind::Deepseek => ApiFormat::Openai,
            ProviderKind::Ollama => ApiFormat::Ollama,
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            ProviderKind::Minimax => "MiniMax-M2.5",
            ProviderKind::Deepseek => "deepseek-chat",
            ProviderKind::Ollama => "gemma3:4b",
        }
    }

    pub fn default_endpoint(self) -> &'static str {
        match self {
            ProviderKind::Minimax => "https://api.minimaxi.com/anthropic/v1/messages",
            ProviderKind::Deepseek => "https://api.deepseek.com",
            ProviderKind::Ollama => "http://127.0.0.1:11434",
        }
    }

    pub fn requires_api_key(self) -> bool {
        !matches!(self, ProviderKind::Ollama)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_known_names_case_insensitively() {
        assert_eq!(ProviderKind::parse("MiniMax").unwrap(), ProviderKind::Minimax);
        assert_eq!(ProviderKind::parse(" ollama ").unwrap(), ProviderKind::Ollama);
    }

    #[test]
    fn parse_rejects_unknown_names() {
        let err = ProviderKind::parse("gpt-cloud").unwrap_err();
        assert!(err.to_string().contains("gpt-cloud"));
    }

    #[test]
    fn each_kind_maps_to_its_wire_format() {
        assert_eq!(ProviderKind::Minimax.api_format(), ApiFormat::Anthropic);
        assert_eq!(ProviderKind::Deepseek.api_format(), ApiFormat::Openai);
        assert_eq!(ProviderKind::Ollama.api_format(), ApiFormat::Ollama);
    }

    #[test]
    fn only_local_provider_runs_without_key() {
        assert!(ProviderKind::Minimax.requires_api_key());
        assert!(ProviderKind::Deepseek.requires_api_key());
        assert!(!ProviderKind::Ollama.requires_api_key());
    }
}
