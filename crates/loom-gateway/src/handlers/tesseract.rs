//! `audit-build-tesseract`: one streamed alignment cell per concept.

use super::{authorize, processor, ProjectScope};
use crate::error::ApiError;
use crate::sse::{self, EVENT_BUFFER};
use crate::state::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::Response;
use axum::Json;
use loom_core::pipeline::{Element, TesseractBuilder, TesseractTask};
use loom_core::{channel, AccessRole, ProjectStore, WorkUnit};
use serde::Deserialize;
use serde_json::json;
use tracing::Instrument;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TesseractRequest {
    #[serde(flatten)]
    pub scope: ProjectScope,
    pub session_id: String,
    #[serde(default)]
    pub concepts: Vec<WorkUnit>,
    /// Dataset 1 elements the concepts link to.
    #[serde(default)]
    pub requirements: Vec<Element>,
    /// Dataset 2 elements the concepts link to.
    #[serde(default)]
    pub implementation: Vec<Element>,
}

pub async fn build(
    State(state): State<AppState>,
    payload: Result<Json<TesseractRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let ctx = request.scope.context();
    let config = authorize(&state, &ctx, AccessRole::Editor).await?;

    let builder = TesseractBuilder::new(
        processor(&state, config),
        TesseractTask::new(request.requirements, request.implementation),
        state.config.engine.workers,
    );
    let (emitter, events) = channel(EVENT_BUFFER, ctx.cancel.clone());
    let span = tracing::info_span!("tesseract", request_id = %ctx.request_id, session = %request.session_id);

    tokio::spawn(
        async move {
            let store = ProjectStore::new(state.rpc.as_ref(), &ctx);
            let outcome = builder
                .run(
                    request.concepts,
                    &request.session_id,
                    &store,
                    state.broadcaster.as_ref(),
                    &emitter,
                    &ctx,
                )
                .await;
            if let Ok(cells) = &outcome {
                store
                    .log_activity(&request.session_id, "tesseract_built", json!({ "cells": cells.len() }))
                    .await;
            }
            let outcome = outcome.map(|cells| json!({ "sessionId": request.session_id, "cells": cells }));
            sse::finish(&emitter, outcome).await;
        }
        .instrument(span),
    );

    Ok(sse::respond(events))
}
