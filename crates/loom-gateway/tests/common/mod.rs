//! In-memory collaborators for driving the router without a network.
#![allow(dead_code)]

use loom_core::provider::TextStream;
use loom_core::{Broadcaster, LlmProvider, LoomConfig, LoomError, LoomResult, Persistence, PromptRequest, ProviderConfig};
use loom_gateway::{build_app, AppState};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Answers every prompt with the same text and records the resolved model.
pub struct FixedProvider {
    pub reply: String,
    pub models: Mutex<Vec<String>>,
}

impl FixedProvider {
    pub fn new(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            models: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait::async_trait]
impl LlmProvider for FixedProvider {
    async fn complete(&self, config: &ProviderConfig, _request: &PromptRequest) -> LoomResult<String> {
        self.models.lock().unwrap().push(config.model.clone());
        Ok(self.reply.clone())
    }

    async fn stream(&self, config: &ProviderConfig, request: &PromptRequest) -> LoomResult<TextStream> {
        let text = self.complete(config, request).await?;
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(text)).await.unwrap();
        Ok(rx)
    }
}

#[derive(Default)]
pub struct FakeRpc {
    pub deny: bool,
    /// Role check fails with 503 instead of answering.
    pub outage: bool,
    pub model: Option<String>,
    pub calls: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl Persistence for FakeRpc {
    async fn call(&self, name: &str, _args: Value) -> LoomResult<Value> {
        self.calls.lock().unwrap().push(name.to_string());
        match name {
            "require_role" if self.outage => Err(LoomError::rpc_status(name, 503, "database unavailable")),
            "require_role" if self.deny => Err(LoomError::rpc_status(name, 403, "insufficient role")),
            "require_role" => Ok(Value::Bool(true)),
            "get_project_model_with_token" => Ok(self.model.clone().map(Value::String).unwrap_or(Value::Null)),
            _ => Ok(Value::Null),
        }
    }
}

#[async_trait::async_trait]
impl Broadcaster for FakeRpc {
    async fn broadcast(&self, _topic: &str, _event: &str, _payload: Value) -> LoomResult<()> {
        Ok(())
    }
}

pub fn app(provider: Arc<FixedProvider>, rpc: Arc<FakeRpc>) -> axum::Router {
    let mut config = LoomConfig::default();
    config.engine.retry_base_delay_ms = 1;
    build_app(AppState::new(config, provider, rpc.clone(), rpc))
}
