//! Error types for the Loom orchestration engine

use thiserror::Error;

/// Result type alias for engine operations
pub type LoomResult<T> = Result<T, LoomError>;

/// Errors that can occur while orchestrating LLM work
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoomError {
    /// Non-2xx from an LLM backend. `body` is already truncated.
    #[error("provider returned HTTP {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("provider transport error: {0}")]
    Transport(String),

    #[error("unparseable model output: {0}")]
    Parse(String),

    #[error("access denied: {0}")]
    Access(String),

    #[error("stream transport error: {0}")]
    StreamTransport(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// `status` is absent when the call never got an HTTP answer.
    #[error("rpc {name} failed: {message}")]
    Rpc {
        name: String,
        status: Option<u16>,
        message: String,
    },

    #[error("patch rejected: {0}")]
    Patch(String),
}

impl LoomError {
    /// Provider, transport and parse failures count as a failed attempt; everything else
    /// ends the retry loop immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LoomError::Provider { .. } | LoomError::Transport(_) | LoomError::Parse(_)
        )
    }

    pub fn rpc(name: &str, message: impl Into<String>) -> Self {
        LoomError::Rpc {
            name: name.to_string(),
            status: None,
            message: message.into(),
        }
    }

    /// RPC rejected with a non-2xx HTTP status.
    pub fn rpc_status(name: &str, status: u16, message: impl Into<String>) -> Self {
        LoomError::Rpc {
            name: name.to_string(),
            status: Some(status),
            message: message.into(),
        }
    }

    /// True for RPC rejections the caller caused (4xx), as opposed to outages.
    pub fn is_rpc_rejection(&self) -> bool {
        matches!(self, LoomError::Rpc { status: Some(s), .. } if (400..500).contains(s))
    }
}

impl From<reqwest::Error> for LoomError {
    fn from(err: reqwest::Error) -> Self {
        LoomError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for LoomError {
    fn from(err: serde_json::Error) -> Self {
        LoomError::Parse(err.to_string())
    }
}

impl From<config::ConfigError> for LoomError {
    fn from(err: config::ConfigError) -> Self {
        LoomError::Config(err.to_string())
    }
}
