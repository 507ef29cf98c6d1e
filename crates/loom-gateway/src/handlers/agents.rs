//! `orchestrate-agents`: agents take turns editing the project canvas.

use super::{authorize, processor, ProjectScope};
use crate::error::ApiError;
use crate::sse::{self, EVENT_BUFFER};
use crate::state::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::Response;
use axum::Json;
use loom_core::{
    channel, AccessRole, AgentJob, AgentOrchestrator, AgentSpec, CanvasState, ContinuationToken, ProjectStore,
    RunOutcome,
};
use serde::Deserialize;
use serde_json::json;
use tracing::Instrument;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentsRequest {
    #[serde(flatten)]
    pub scope: ProjectScope,
    pub session_id: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
    /// Current canvas for a fresh run.
    #[serde(default)]
    pub canvas: CanvasState,
    #[serde(default)]
    pub continuation: Option<ContinuationToken<CanvasState>>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
}

pub async fn orchestrate(
    State(state): State<AppState>,
    payload: Result<Json<AgentsRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    if request.agents.is_empty() {
        return Err(ApiError::BadRequest("at least one agent is required".into()));
    }
    let ctx = request.scope.context();
    let config = authorize(&state, &ctx, AccessRole::Editor).await?;

    let ceiling = state.config.engine.max_iterations;
    let budget = request.max_iterations.map_or(ceiling, |n| n.min(ceiling));
    let orchestrator = AgentOrchestrator::new(processor(&state, config), budget);
    let job = AgentJob {
        session_id: request.session_id,
        goal: request.goal,
        agents: request.agents,
    };
    let token = request
        .continuation
        .unwrap_or_else(|| ContinuationToken::fresh(request.canvas));

    let (emitter, events) = channel(EVENT_BUFFER, ctx.cancel.clone());
    let span = tracing::info_span!("agents", request_id = %ctx.request_id, session = %job.session_id);

    tokio::spawn(
        async move {
            let store = ProjectStore::new(state.rpc.as_ref(), &ctx);
            match orchestrator
                .run(&job, token, &store, state.broadcaster.as_ref(), &emitter, &ctx)
                .await
            {
                Ok((RunOutcome::Failed { iteration, message }, _)) => {
                    let _ = emitter
                        .error(format!("iteration {} failed: {}", iteration, message))
                        .await;
                }
                Ok((outcome, token)) => {
                    store
                        .log_activity(
                            &job.session_id,
                            "agents_orchestrated",
                            json!({ "status": outcome.status(), "iterations": token.iteration }),
                        )
                        .await;
                    let result = json!({
                        "status": outcome.status(),
                        "iterations": token.iteration,
                        "canvas": token.document,
                        "blackboard": token.blackboard,
                        "continuation": token,
                    });
                    sse::finish(&emitter, Ok(result)).await;
                }
                Err(e) => sse::finish(&emitter, Err(e)).await,
            }
        }
        .instrument(span),
    );

    Ok(sse::respond(events))
}
