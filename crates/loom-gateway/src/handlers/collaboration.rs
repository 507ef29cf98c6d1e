//! `collaboration-agent-orchestrator`: iterative document editing with heartbeats.
//!
//! A first call sends the task and the document; later calls send back the
//! `continuation` from the last `iteration_complete` event instead of the document.

use super::{authorize, ProjectScope};
use crate::error::ApiError;
use crate::sse::{self, EVENT_BUFFER};
use crate::state::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::Response;
use axum::Json;
use loom_core::{
    channel, AccessRole, CollaborationJob, CollaborationOrchestrator, ContinuationToken, ProjectStore, RunOutcome,
};
use serde::Deserialize;
use serde_json::json;
use tracing::Instrument;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationRequest {
    #[serde(flatten)]
    pub scope: ProjectScope,
    pub collaboration_id: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub document: String,
    #[serde(default)]
    pub expected_edits: Option<usize>,
    #[serde(default)]
    pub continuation: Option<ContinuationToken<String>>,
    /// Lower than the configured budget only; larger values are capped.
    #[serde(default)]
    pub max_iterations: Option<u32>,
}

pub async fn orchestrate(
    State(state): State<AppState>,
    payload: Result<Json<CollaborationRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    if request.continuation.is_none() && request.instructions.trim().is_empty() {
        return Err(ApiError::BadRequest("instructions are required to start a collaboration".into()));
    }
    let ctx = request.scope.context();
    let config = authorize(&state, &ctx, AccessRole::Editor).await?;

    let engine = &state.config.engine;
    let budget = request
        .max_iterations
        .map_or(engine.max_iterations, |n| n.min(engine.max_iterations));
    let orchestrator = CollaborationOrchestrator::new(
        state.provider.clone(),
        config,
        state.config.retry_policy(),
        budget,
        engine.verify_completion,
    );
    let job = CollaborationJob {
        collaboration_id: request.collaboration_id,
        instructions: request.instructions,
        expected_edits: request.expected_edits,
    };
    let token = request
        .continuation
        .unwrap_or_else(|| ContinuationToken::fresh(request.document));

    let (emitter, events) = channel(EVENT_BUFFER, ctx.cancel.clone());
    let heartbeat_every = state.config.heartbeat_interval();
    let span = tracing::info_span!("collaboration", request_id = %ctx.request_id, collaboration = %job.collaboration_id);

    tokio::spawn(
        async move {
            let _heartbeat = emitter.heartbeat(heartbeat_every);
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
                    let result = json!({
                        "status": outcome.status(),
                        "iterations": token.iteration,
                        "appliedEdits": token.applied_edits,
                        "document": token.document,
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
