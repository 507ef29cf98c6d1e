//! External collaborators reached over REST RPC: authorization, persistence and
//! realtime broadcast.
//!
//! Every call is named (`{base_url}/rest/v1/rpc/{name}`) and takes the caller's project id
//! and share token so the database enforces access itself.

use crate::canvas::{CanvasChange, CanvasEdge, CanvasNode};
use crate::config::RpcSettings;
use crate::error::{LoomError, LoomResult};
use crate::provider::truncate_body;
use crate::unit::AnalysisResult;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use tokio_util::sync::CancellationToken;

pub const REQUIRE_ROLE: &str = "require_role";
pub const INSERT_TESSERACT_CELL: &str = "insert_audit_tesseract_cell_with_token";
pub const INSERT_BLACKBOARD: &str = "insert_audit_blackboard_with_token";
pub const INSERT_COLLABORATION_MESSAGE: &str = "insert_collaboration_message_with_token";
pub const UPDATE_COLLABORATION_DOCUMENT: &str = "update_collaboration_document_with_token";
pub const UPSERT_CANVAS_NODE: &str = "upsert_canvas_node_with_token";
pub const DELETE_CANVAS_NODE: &str = "delete_canvas_node_with_token";
pub const UPSERT_CANVAS_EDGE: &str = "upsert_canvas_edge_with_token";
pub const DELETE_CANVAS_EDGE: &str = "delete_canvas_edge_with_token";
pub const LOG_AUDIT_ACTIVITY: &str = "log_audit_activity_with_token";
pub const GET_PROJECT_MODEL: &str = "get_project_model_with_token";

/// Project roles, ordered by privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessRole {
    Viewer,
    Editor,
    Owner,
}

impl AccessRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessRole::Viewer => "viewer",
            AccessRole::Editor => "editor",
            AccessRole::Owner => "owner",
        }
    }
}

/// Identity and cancellation scope of one inbound request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Random id attached to log lines for this request.
    pub request_id: String,
    pub project_id: String,
    pub share_token: Option<String>,
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(project_id: impl Into<String>, share_token: Option<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            share_token,
            cancel: CancellationToken::new(),
        }
    }

    /// Races `fut` against the request's cancellation.
    pub async fn cancellable<T, F>(&self, fut: F) -> LoomResult<T>
    where
        F: Future<Output = LoomResult<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(LoomError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(LoomError::Cancelled),
            out = fut => out,
        }
    }

    fn base_args(&self) -> serde_json::Map<String, Value> {
        let mut args = serde_json::Map::new();
        args.insert("p_project_id".into(), json!(self.project_id));
        args.insert("p_token".into(), json!(self.share_token));
        args
    }
}

/// Named remote procedure calls.
#[async_trait::async_trait]
pub trait Persistence: Send + Sync {
    async fn call(&self, name: &str, args: Value) -> LoomResult<Value>;
}

/// Realtime fan-out so connected clients refresh.
#[async_trait::async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(&self, topic: &str, event: &str, payload: Value) -> LoomResult<()>;
}

/// Typed RPC helpers bound to one request.
pub struct ProjectStore<'a> {
    rpc: &'a dyn Persistence,
    ctx: &'a RequestContext,
}

impl<'a> ProjectStore<'a> {
    pub fn new(rpc: &'a dyn Persistence, ctx: &'a RequestContext) -> Self {
        Self { rpc, ctx }
    }

    async fn call(&self, name: &str, extra: Value) -> LoomResult<Value> {
        let mut args = self.ctx.base_args();
        if let Value::Object(extra) = extra {
            args.extend(extra);
        }
        self.ctx.cancellable(self.rpc.call(name, Value::Object(args))).await
    }

    /// Fails with [`LoomError::Access`] unless the caller holds at least `min_role`. Only a
    /// 4xx rejection counts as denial; transport failures and 5xx come back unchanged.
    pub async fn require_role(&self, min_role: AccessRole) -> LoomResult<()> {
        let outcome = self
            .call(REQUIRE_ROLE, json!({ "p_min_role": min_role.as_str() }))
            .await;
        match outcome {
            Ok(Value::Bool(false)) => Err(LoomError::Access(format!(
                "{} role required",
                min_role.as_str()
            ))),
            Ok(_) => Ok(()),
            Err(e) if e.is_rpc_rejection() => match e {
                LoomError::Rpc { message, .. } => Err(LoomError::Access(message)),
                other => Err(other),
            },
            Err(e) => {
                tracing::error!(target: "loom::rpc", project = %self.ctx.project_id, error = %e, "role check unavailable");
                Err(e)
            }
        }
    }

    /// Stored model setting for the project, if any.
    pub async fn project_model(&self) -> LoomResult<Option<String>> {
        let value = self.call(GET_PROJECT_MODEL, json!({})).await?;
        let model = match value {
            Value::String(s) => Some(s),
            Value::Object(ref map) => map
                .get("selected_model")
                .or_else(|| map.get("model"))
                .and_then(Value::as_str)
                .map(str::to_string),
            Value::Array(ref rows) => rows
                .first()
                .and_then(|r| r.get("selected_model").or_else(|| r.get("model")))
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        };
        Ok(model.filter(|m| !m.trim().is_empty()))
    }

    pub async fn insert_tesseract_cell(&self, session_id: &str, index: usize, cell: &AnalysisResult) -> LoomResult<()> {
        self.call(
            INSERT_TESSERACT_CELL,
            json!({
                "p_session_id": session_id,
                "p_cell_index": index,
                "p_concept_id": cell.unit_id,
                "p_concept_label": cell.label,
                "p_polarity": cell.polarity,
                "p_rationale": cell.rationale,
                "p_gaps": cell.gaps,
            }),
        )
        .await
        .map(|_| ())
    }

    pub async fn insert_blackboard(&self, session_id: &str, agent: &str, iteration: u32, content: &str) -> LoomResult<()> {
        self.call(
            INSERT_BLACKBOARD,
            json!({
                "p_session_id": session_id,
                "p_agent": agent,
                "p_iteration": iteration,
                "p_content": content,
            }),
        )
        .await
        .map(|_| ())
    }

    pub async fn insert_collaboration_message(&self, collaboration_id: &str, role: &str, content: &str) -> LoomResult<()> {
        self.call(
            INSERT_COLLABORATION_MESSAGE,
            json!({
                "p_collaboration_id": collaboration_id,
                "p_role": role,
                "p_content": content,
            }),
        )
        .await
        .map(|_| ())
    }

    pub async fn update_collaboration_document(&self, collaboration_id: &str, content: &str) -> LoomResult<()> {
        self.call(
            UPDATE_COLLABORATION_DOCUMENT,
            json!({
                "p_collaboration_id": collaboration_id,
                "p_content": content,
            }),
        )
        .await
        .map(|_| ())
    }

    pub async fn apply_canvas_change(&self, change: &CanvasChange) -> LoomResult<()> {
        match change {
            CanvasChange::UpsertNode(node) => self.upsert_node(node).await,
            CanvasChange::DeleteNode(id) => self.call(DELETE_CANVAS_NODE, json!({ "p_node_id": id })).await.map(|_| ()),
            CanvasChange::UpsertEdge(edge) => self.upsert_edge(edge).await,
            CanvasChange::DeleteEdge(id) => self.call(DELETE_CANVAS_EDGE, json!({ "p_edge_id": id })).await.map(|_| ()),
        }
    }

    async fn upsert_node(&self, node: &CanvasNode) -> LoomResult<()> {
        self.call(
            UPSERT_CANVAS_NODE,
            json!({
                "p_node_id": node.id,
                "p_type": node.node_type,
                "p_label": node.label,
                "p_data": node.data,
            }),
        )
        .await
        .map(|_| ())
    }

    async fn upsert_edge(&self, edge: &CanvasEdge) -> LoomResult<()> {
        self.call(
            UPSERT_CANVAS_EDGE,
            json!({
                "p_edge_id": edge.id,
                "p_source_id": edge.source,
                "p_target_id": edge.target,
                "p_label": edge.label,
            }),
        )
        .await
        .map(|_| ())
    }

    /// Best effort: failures are logged, never surfaced.
    pub async fn log_activity(&self, session_id: &str, action: &str, details: Value) {
        let outcome = self
            .call(
                LOG_AUDIT_ACTIVITY,
                json!({
                    "p_session_id": session_id,
                    "p_action": action,
                    "p_details": details,
                }),
            )
            .await;
        if let Err(e) = outcome {
            tracing::warn!(target: "loom::rpc", action, error = %e, "activity log failed");
        }
    }
}

/// Best-effort refresh notification; failures only log.
pub async fn notify(broadcaster: &dyn Broadcaster, topic: &str, event: &str, payload: Value) {
    if let Err(e) = broadcaster.broadcast(topic, event, payload).await {
        tracing::warn!(target: "loom::rpc", topic, event, error = %e, "broadcast failed");
    }
}

/// reqwest client for the hosted database REST API.
#[derive(Clone)]
pub struct RestRpcClient {
    client: reqwest::Client,
    base_url: String,
    service_key: Option<String>,
}

impl RestRpcClient {
    pub fn new(settings: &RpcSettings) -> LoomResult<Self> {
        if settings.base_url.trim().is_empty() {
            return Err(LoomError::Config("rpc.base_url is not set".into()));
        }
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            service_key: settings.service_key.clone().filter(|k| !k.trim().is_empty()),
        })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.service_key {
            Some(key) => builder.header("apikey", key).bearer_auth(key),
            None => builder,
        }
    }
}

#[async_trait::async_trait]
impl Persistence for RestRpcClient {
    async fn call(&self, name: &str, args: Value) -> LoomResult<Value> {
        let url = format!("{}/rest/v1/rpc/{}", self.base_url, name);
        let response = self
            .authorized(self.client.post(&url))
            .json(&args)
            .send()
            .await
            .map_err(|e| LoomError::rpc(name, e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| LoomError::rpc(name, e.to_string()))?;
        if !status.is_success() {
            tracing::warn!(target: "loom::rpc", rpc = name, status = status.as_u16(), "rpc failed");
            return Err(LoomError::rpc_status(name, status.as_u16(), truncate_body(&text, 300)));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| LoomError::rpc(name, format!("invalid response: {}", e)))
    }
}

#[async_trait::async_trait]
impl Broadcaster for RestRpcClient {
    async fn broadcast(&self, topic: &str, event: &str, payload: Value) -> LoomResult<()> {
        let url = format!("{}/realtime/v1/api/broadcast", self.base_url);
        let body = json!({ "messages": [{ "topic": topic, "event": event, "payload": payload }] });
        let response = self
            .authorized(self.client.post(&url))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(LoomError::rpc("broadcast", format!("HTTP {}", response.status().as_u16())));
        }
        Ok(())
    }
}
