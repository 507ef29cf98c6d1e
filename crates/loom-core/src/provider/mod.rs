//! LLM provider adapter: one outbound call per invocation, raw text out.
//!
//! The backend is chosen once per request by resolving the stored project model string
//! into a [`ProviderConfig`]; nothing deeper in the call chain looks at the model name again.
//! Supports single-shot completion and streaming (SSE `data:` frames decoded incrementally).

mod http;
mod sse;

pub use http::HttpProvider;
pub use sse::SseLineDecoder;

use crate::error::LoomResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_MAX_TOKENS: u32 = 16384;

/// Closed set of supported API families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiFamily {
    Anthropic,
    Gemini,
    Xai,
}

impl ApiFamily {
    /// Prefix sniffing of a model name: `claude*`, `gemini*`, `grok*`.
    pub fn from_model(model: &str) -> Option<Self> {
        let lower = model.trim().to_ascii_lowercase();
        if lower.starts_with("claude") {
            Some(ApiFamily::Anthropic)
        } else if lower.starts_with("gemini") {
            Some(ApiFamily::Gemini)
        } else if lower.starts_with("grok") {
            Some(ApiFamily::Xai)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApiFamily::Anthropic => "anthropic",
            ApiFamily::Gemini => "gemini",
            ApiFamily::Xai => "xai",
        }
    }

    /// Hard ceiling on output tokens accepted by the family.
    pub fn max_output_tokens(&self) -> u32 {
        match self {
            ApiFamily::Anthropic => 64_000,
            ApiFamily::Gemini => 65_536,
            ApiFamily::Xai => 131_072,
        }
    }
}

/// Resolved backend selection for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub family: ApiFamily,
    pub model: String,
    pub max_tokens: u32,
}

impl ProviderConfig {
    /// Resolves a stored project model setting. Empty or unrecognized settings fall back to
    /// Gemini with [`DEFAULT_GEMINI_MODEL`].
    pub fn resolve(setting: Option<&str>, max_tokens: Option<u32>) -> Self {
        let setting = setting.map(str::trim).filter(|s| !s.is_empty());
        let (family, model) = match setting.and_then(|s| ApiFamily::from_model(s).map(|f| (f, s))) {
            Some((family, model)) => (family, model.to_string()),
            None => {
                if let Some(unknown) = setting {
                    tracing::warn!(
                        target: "loom::provider",
                        setting = unknown,
                        "unrecognized model setting, falling back to gemini"
                    );
                }
                (ApiFamily::Gemini, DEFAULT_GEMINI_MODEL.to_string())
            }
        };
        let max_tokens = max_tokens
            .unwrap_or(DEFAULT_MAX_TOKENS)
            .clamp(1, family.max_output_tokens());
        Self {
            family,
            model,
            max_tokens,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One role-tagged conversation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
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

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// Provider-neutral prompt: optional system instruction plus ordered history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptRequest {
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    /// Ask the backend for JSON output where the API supports it.
    pub json_output: bool,
}

impl PromptRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            messages: vec![ChatMessage::user(user)],
            temperature: None,
            json_output: true,
        }
    }

    pub fn from_history(system: Option<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            system,
            messages,
            temperature: None,
            json_output: true,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Character count of everything sent; logged instead of the prompt itself.
    pub fn prompt_len(&self) -> usize {
        self.system.as_deref().map(str::len).unwrap_or(0)
            + self.messages.iter().map(|m| m.content.len()).sum::<usize>()
    }

    /// System text merged from `system` and any system-role history entries.
    pub(crate) fn merged_system(&self) -> Option<String> {
        let mut parts: Vec<&str> = Vec::new();
        if let Some(s) = self.system.as_deref().filter(|s| !s.is_empty()) {
            parts.push(s);
        }
        parts.extend(
            self.messages
                .iter()
                .filter(|m| m.role == Role::System)
                .map(|m| m.content.as_str()),
        );
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    /// History without system-role entries.
    pub(crate) fn dialogue(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter().filter(|m| m.role != Role::System)
    }
}

/// Incremental text chunks from a streaming call. Transport failures mid-stream arrive
/// as `Err` items; the channel closes when the backend finishes.
pub type TextStream = mpsc::Receiver<LoomResult<String>>;

/// One backend call per invocation. No retries at this layer.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Single-shot completion returning the raw model text.
    async fn complete(&self, config: &ProviderConfig, request: &PromptRequest) -> LoomResult<String>;

    /// Streaming completion; the returned receiver yields text deltas.
    async fn stream(&self, config: &ProviderConfig, request: &PromptRequest) -> LoomResult<TextStream>;
}

/// Cuts an error body to `limit` characters (not bytes).
pub fn truncate_body(body: &str, limit: usize) -> String {
    match body.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}…", &body[..idx]),
        None => body.to_string(),
    }
}
