//! Fake collaborators shared by the integration tests.
#![allow(dead_code)]

use loom_core::provider::TextStream;
use loom_core::{
    Broadcaster, LlmProvider, LoomError, LoomResult, Persistence, PromptRequest, ProviderConfig,
};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

type Responder = Box<dyn Fn(&PromptRequest) -> LoomResult<String> + Send + Sync>;

/// Replies from a queue, or from a function of the prompt when one is set.
pub struct ScriptedProvider {
    queue: Mutex<VecDeque<LoomResult<String>>>,
    responder: Option<Responder>,
    pub requests: Mutex<Vec<PromptRequest>>,
}

impl ScriptedProvider {
    pub fn queue(replies: Vec<LoomResult<String>>) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(replies.into()),
            responder: None,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn responder<F>(f: F) -> Arc<Self>
    where
        F: Fn(&PromptRequest) -> LoomResult<String> + Send + Sync + 'static,
    {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            responder: Some(Box::new(f)),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn next(&self, request: &PromptRequest) -> LoomResult<String> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(responder) = &self.responder {
            return responder(request);
        }
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LoomError::Transport("script exhausted".into())))
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete(&self, _config: &ProviderConfig, request: &PromptRequest) -> LoomResult<String> {
        self.next(request)
    }

    async fn stream(&self, _config: &ProviderConfig, request: &PromptRequest) -> LoomResult<TextStream> {
        let text = self.next(request)?;
        let (tx, rx) = mpsc::channel(64);
        let chars: Vec<char> = text.chars().collect();
        for chunk in chars.chunks(16) {
            tx.send(Ok(chunk.iter().collect())).await.unwrap();
        }
        Ok(rx)
    }
}

/// Records every RPC and broadcast.
#[derive(Default)]
pub struct RecordingRpc {
    pub calls: Mutex<Vec<(String, Value)>>,
    pub broadcasts: Mutex<Vec<(String, String, Value)>>,
    pub deny: bool,
    pub model: Option<String>,
    pub fail_on: Option<&'static str>,
}

impl RecordingRpc {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn names(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn calls_named(&self, name: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, args)| args.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl Persistence for RecordingRpc {
    async fn call(&self, name: &str, args: Value) -> LoomResult<Value> {
        self.calls.lock().unwrap().push((name.to_string(), args));
        if self.fail_on == Some(name) {
            return Err(LoomError::rpc(name, "simulated failure"));
        }
        match name {
            "require_role" if self.deny => Err(LoomError::rpc_status(name, 403, "insufficient role")),
            "require_role" => Ok(Value::Bool(true)),
            "get_project_model_with_token" => Ok(self
                .model
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null)),
            _ => Ok(Value::Null),
        }
    }
}

#[async_trait::async_trait]
impl Broadcaster for RecordingRpc {
    async fn broadcast(&self, topic: &str, event: &str, payload: Value) -> LoomResult<()> {
        self.broadcasts
            .lock()
            .unwrap()
            .push((topic.to_string(), event.to_string(), payload));
        Ok(())
    }
}
