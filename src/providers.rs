//! Provider dialects and built-in presets.
//!
//! A [`Dialect`] is the wire format a provider family speaks. It decides the
//! inbound chat path, how the upstream endpoint is derived from a base URL,
//! how the API key is attached, and how a terminal stream error is framed.
//! Presets fill in base URL, dialect and key variable for common providers.

use serde::{Deserialize, Serialize};

pub const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
}

impl Dialect {
    /// Inbound path of the chat endpoint for this dialect.
    #[must_use]
    pub fn chat_path(self) -> &'static str {
        match self {
            Self::Anthropic => "/v1/messages",
            Self::OpenAi => "/v1/chat/completions",
        }
    }

    /// Derive the upstream chat endpoint from a configured base URL.
    ///
    /// Anthropic bases may already include `/v1/messages`. OpenAI-style bases
    /// are normalized to end in `/v1` before `/chat/completions` is added.
    #[must_use]
    pub fn chat_endpoint(self, base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');
        match self {
            Self::Anthropic => {
                if base.ends_with("/v1/messages") {
                    base.to_string()
                } else {
                    format!("{base}/v1/messages")
                }
            }
            Self::OpenAi => {
                if base.ends_with("/v1") {
                    format!("{base}/chat/completions")
                } else {
                    format!("{base}/v1/chat/completions")
                }
            }
        }
    }

    /// A best-effort SSE event telling the client the stream was cut short.
    #[must_use]
    pub fn stream_error_frame(self, message: &str) -> String {
        match self {
            Self::Anthropic => {
                let data = serde_json::json!({
                    "type": "error",
                    "error": { "type": "stream_interrupted", "message": message },
                });
                format!("event: error\ndata: {data}\n\n")
            }
            Self::OpenAi => {
                let data = serde_json::json!({
                    "error": { "type": "stream_interrupted", "message": message },
                });
                format!("data: {data}\n\n")
            }
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Built-in provider presets so users only need to name a provider.
#[derive(Debug, Clone)]
pub struct ProviderPreset {
    pub name: &'static str,
    pub base_url: &'static str,
    pub dialect: Dialect,
    pub default_api_key_env: &'static str,
}

const PRESETS: &[ProviderPreset] = &[
    ProviderPreset {
        name: "anthropic",
        base_url: "https://api.anthropic.com",
        dialect: Dialect::Anthropic,
        default_api_key_env: "ANTHROPIC_API_KEY",
    },
    ProviderPreset {
        name: "openrouter",
        base_url: "https://openrouter.ai/api/v1",
        dialect: Dialect::OpenAi,
        default_api_key_env: "OPENROUTER_API_KEY",
    },
    ProviderPreset {
        name: "openai",
        base_url: "https://api.openai.com/v1",
        dialect: Dialect::OpenAi,
        default_api_key_env: "OPENAI_API_KEY",
    },
    ProviderPreset {
        name: "deepseek",
        base_url: "https://api.deepseek.com/v1",
        dialect: Dialect::OpenAi,
        default_api_key_env: "DEEPSEEK_API_KEY",
    },
];

impl ProviderPreset {
    #[must_use]
    pub fn from_name(name: &str) -> Option<&'static ProviderPreset> {
        PRESETS.iter().find(|p| p.name == name.to_lowercase())
    }

    #[must_use]
    pub fn all() -> &'static [ProviderPreset] {
        PRESETS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_providers() {
        assert!(ProviderPreset::from_name("anthropic").is_some());
        assert!(ProviderPreset::from_name("OpenRouter").is_some()); // case-insensitive
        assert!(ProviderPreset::from_name("unknown_provider").is_none());
    }

    #[test]
    fn test_only_anthropic_speaks_anthropic() {
        for preset in ProviderPreset::all() {
            let expected = if preset.name == "anthropic" {
                Dialect::Anthropic
            } else {
                Dialect::OpenAi
            };
            assert_eq!(preset.dialect, expected, "preset {}", preset.name);
        }
    }

    #[test]
    fn test_anthropic_endpoint() {
        let d = Dialect::Anthropic;
        assert_eq!(
            d.chat_endpoint("https://api.anthropic.com/"),
            "https://api.anthropic.com/v1/messages"
        );
        assert_eq!(
            d.chat_endpoint("https://gw.example.com/v1/messages"),
            "https://gw.example.com/v1/messages"
        );
    }

    #[test]
    fn test_openai_endpoint() {
        let d = Dialect::OpenAi;
        assert_eq!(
            d.chat_endpoint("https://openrouter.ai/api/v1"),
            "https://openrouter.ai/api/v1/chat/completions"
        );
        assert_eq!(
            d.chat_endpoint("http://localhost:9000"),
            "http://localhost:9000/v1/chat/completions"
        );
    }

    #[test]
    fn test_stream_error_frames() {
        let a = Dialect::Anthropic.stream_error_frame("reset");
        assert!(a.starts_with("event: error\ndata: "));
        assert!(a.ends_with("\n\n"));
        assert!(a.contains("\"stream_interrupted\""));

        let o = Dialect::OpenAi.stream_error_frame("reset");
        assert!(o.starts_with("data: {"));
        assert!(o.ends_with("\n\n"));
    }
}
