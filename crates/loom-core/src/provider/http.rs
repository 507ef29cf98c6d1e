//! reqwest-backed adapter for the three supported API families.

use super::{
    truncate_body, ApiFamily, LlmProvider, PromptRequest, ProviderConfig, Role, SseLineDecoder,
    TextStream,
};
use crate::config::ProviderSettings;
use crate::error::{LoomError, LoomResult};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Talks to Anthropic, Gemini and xAI over HTTPS. One request per call; retrying is the
/// caller's job.
#[derive(Clone)]
pub struct HttpProvider {
    client: reqwest::Client,
    settings: ProviderSettings,
    error_body_limit: usize,
}

impl HttpProvider {
    pub fn new(settings: ProviderSettings, error_body_limit: usize) -> LoomResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            settings,
            error_body_limit,
        })
    }

    fn api_key(&self, family: ApiFamily) -> LoomResult<&str> {
        let (key, var) = match family {
            ApiFamily::Anthropic => (&self.settings.anthropic_api_key, "ANTHROPIC_API_KEY"),
            ApiFamily::Gemini => (&self.settings.gemini_api_key, "GEMINI_API_KEY"),
            ApiFamily::Xai => (&self.settings.xai_api_key, "XAI_API_KEY"),
        };
        key.as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| LoomError::Config(format!("{} is not set", var)))
    }

    fn endpoint(&self, config: &ProviderConfig, streaming: bool) -> String {
        match config.family {
            ApiFamily::Anthropic => {
                format!("{}/v1/messages", self.settings.anthropic_base_url.trim_end_matches('/'))
            }
            ApiFamily::Gemini => {
                let base = self.settings.gemini_base_url.trim_end_matches('/');
                if streaming {
                    format!("{}/v1beta/models/{}:streamGenerateContent?alt=sse", base, config.model)
                } else {
                    format!("{}/v1beta/models/{}:generateContent", base, config.model)
                }
            }
            ApiFamily::Xai => {
                format!("{}/v1/chat/completions", self.settings.xai_base_url.trim_end_matches('/'))
            }
        }
    }

    async fn send(
        &self,
        config: &ProviderConfig,
        request: &PromptRequest,
        streaming: bool,
    ) -> LoomResult<reqwest::Response> {
        let key = self.api_key(config.family)?;
        let url = self.endpoint(config, streaming);
        let body = build_body(config, request, streaming);

        tracing::debug!(
            target: "loom::provider",
            family = config.family.as_str(),
            model = %config.model,
            prompt_chars = request.prompt_len(),
            streaming,
            "sending provider request"
        );

        let builder = self.client.post(&url).json(&body);
        let builder = match config.family {
            ApiFamily::Anthropic => builder
                .header("x-api-key", key)
                .header("anthropic-version", ANTHROPIC_VERSION),
            ApiFamily::Gemini => builder.header("x-goog-api-key", key),
            ApiFamily::Xai => builder.bearer_auth(key),
        };

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::error!(
                target: "loom::provider",
                family = config.family.as_str(),
                status = status.as_u16(),
                "provider returned an error status"
            );
            return Err(LoomError::Provider {
                status: status.as_u16(),
                body: truncate_body(&error_text, self.error_body_limit),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl LlmProvider for HttpProvider {
    async fn complete(&self, config: &ProviderConfig, request: &PromptRequest) -> LoomResult<String> {
        let response = self.send(config, request, false).await?;
        let payload: Value = response
            .json()
            .await
            .map_err(|e| LoomError::Transport(format!("invalid provider response body: {}", e)))?;
        extract_text(config.family, &payload).ok_or_else(|| {
            LoomError::Parse(format!("{} response carried no text", config.family.as_str()))
        })
    }

    async fn stream(&self, config: &ProviderConfig, request: &PromptRequest) -> LoomResult<TextStream> {
        let response = self.send(config, request, true).await?;
        let family = config.family;
        let (tx, rx) = mpsc::channel::<LoomResult<String>>(100);

        tokio::spawn(async move {
            use futures_util::TryStreamExt;
            let mut body = response.bytes_stream();
            let mut decoder = SseLineDecoder::new();

            loop {
                let chunk = match body.try_next().await {
                    Ok(Some(bytes)) => decoder.push(&bytes),
                    Ok(None) => {
                        let tail: Vec<String> = decoder.finish().into_iter().collect();
                        forward(family, &tx, tail).await;
                        break;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(LoomError::Transport(format!("stream interrupted: {}", e)))).await;
                        break;
                    }
                };
                if !forward(family, &tx, chunk).await {
                    tracing::debug!(target: "loom::provider", "stream receiver dropped");
                    break;
                }
            }
        });

        Ok(rx)
    }
}

/// Sends the text deltas found in `payloads`; false once the receiver is gone.
async fn forward(family: ApiFamily, tx: &mpsc::Sender<LoomResult<String>>, payloads: Vec<String>) -> bool {
    for data in payloads {
        let Ok(json) = serde_json::from_str::<Value>(&data) else {
            continue;
        };
        if let Some(delta) = extract_delta(family, &json) {
            if delta.is_empty() {
                continue;
            }
            if tx.send(Ok(delta)).await.is_err() {
                return false;
            }
        }
    }
    true
}

fn role_name(family: ApiFamily, role: Role) -> &'static str {
    match (family, role) {
        (ApiFamily::Gemini, Role::Assistant) => "model",
        (_, Role::Assistant) => "assistant",
        (_, Role::System) => "system",
        (_, Role::User) => "user",
    }
}

/// Request body in the family's wire format.
pub(crate) fn build_body(config: &ProviderConfig, request: &PromptRequest, streaming: bool) -> Value {
    let system = request.merged_system();
    match config.family {
        ApiFamily::Anthropic => {
            let messages: Vec<Value> = request
                .dialogue()
                .map(|m| json!({ "role": role_name(config.family, m.role), "content": m.content }))
                .collect();
            let mut body = json!({
                "model": config.model,
                "max_tokens": config.max_tokens,
                "messages": messages,
            });
            if let Some(system) = system {
                body["system"] = json!(system);
            }
            if let Some(t) = request.temperature {
                body["temperature"] = json!(t);
            }
            if streaming {
                body["stream"] = json!(true);
            }
            body
        }
        ApiFamily::Gemini => {
            let contents: Vec<Value> = request
                .dialogue()
                .map(|m| {
                    json!({
                        "role": role_name(config.family, m.role),
                        "parts": [{ "text": m.content }],
                    })
                })
                .collect();
            let mut generation = json!({ "maxOutputTokens": config.max_tokens });
            if let Some(t) = request.temperature {
                generation["temperature"] = json!(t);
            }
            if request.json_output {
                generation["responseMimeType"] = json!("application/json");
            }
            let mut body = json!({
                "contents": contents,
                "generationConfig": generation,
            });
            if let Some(system) = system {
                body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
            }
            body
        }
        ApiFamily::Xai => {
            let mut messages: Vec<Value> = Vec::new();
            if let Some(system) = system {
                messages.push(json!({ "role": "system", "content": system }));
            }
            messages.extend(
                request
                    .dialogue()
                    .map(|m| json!({ "role": role_name(config.family, m.role), "content": m.content })),
            );
            let mut body = json!({
                "model": config.model,
                "max_tokens": config.max_tokens,
                "messages": messages,
            });
            if let Some(t) = request.temperature {
                body["temperature"] = json!(t);
            }
            if request.json_output {
                body["response_format"] = json!({ "type": "json_object" });
            }
            if streaming {
                body["stream"] = json!(true);
            }
            body
        }
    }
}

/// Full text of a non-streaming response.
pub(crate) fn extract_text(family: ApiFamily, payload: &Value) -> Option<String> {
    match family {
        ApiFamily::Anthropic => {
            let blocks = payload.get("content")?.as_array()?;
            let text: String = blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect();
            Some(text)
        }
        ApiFamily::Gemini => gemini_parts_text(payload),
        ApiFamily::Xai => payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

/// Text carried by one streaming frame, if any.
pub(crate) fn extract_delta(family: ApiFamily, frame: &Value) -> Option<String> {
    match family {
        ApiFamily::Anthropic => {
            if frame.get("type").and_then(Value::as_str) != Some("content_block_delta") {
                return None;
            }
            frame
                .pointer("/delta/text")
                .and_then(Value::as_str)
                .map(str::to_string)
        }
        ApiFamily::Gemini => gemini_parts_text(frame),
        ApiFamily::Xai => frame
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

fn gemini_parts_text(payload: &Value) -> Option<String> {
    let parts = payload.pointer("/candidates/0/content/parts")?.as_array()?;
    Some(
        parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect(),
    )
}
