//! `audit-extract-concepts` and `audit-extract-d2-concepts`.
//!
//! Answers with a single JSON body (HTTP 200 even when extraction fails) unless the caller
//! asks for `stream: true`, in which case batches are reported over SSE.

use super::{authorize, processor, ProjectScope};
use crate::error::ApiError;
use crate::sse::{self, EVENT_BUFFER};
use crate::state::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use loom_core::pipeline::{ConceptExtractor, Dataset, Element, ExtractionOutcome, ExtractionTask, MappingMode};
use loom_core::{channel, AccessRole, ProjectStore, RequestContext};
use serde::Deserialize;
use serde_json::json;
use tracing::Instrument;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractRequest {
    #[serde(flatten)]
    pub scope: ProjectScope,
    pub session_id: String,
    #[serde(default)]
    pub elements: Vec<Element>,
    /// Overrides the dataset's default mapping rule.
    #[serde(default)]
    pub mapping: Option<MappingMode>,
    #[serde(default)]
    pub stream: bool,
}

pub async fn requirements(
    State(state): State<AppState>,
    payload: Result<Json<ExtractRequest>, JsonRejection>,
) -> Response {
    extract(state, Dataset::D1, payload).await
}

pub async fn implementation(
    State(state): State<AppState>,
    payload: Result<Json<ExtractRequest>, JsonRejection>,
) -> Response {
    extract(state, Dataset::D2, payload).await
}

fn failure(message: impl Into<String>) -> Response {
    Json(json!({ "success": false, "error": message.into() })).into_response()
}

fn summary(dataset: Dataset, outcome: &ExtractionOutcome) -> serde_json::Value {
    json!({
        "dataset": dataset,
        "concepts": outcome.concepts.len(),
        "orphans": outcome.orphans.len(),
        "failedBatches": outcome.failed_batches.len(),
    })
}

async fn extract(
    state: AppState,
    dataset: Dataset,
    payload: Result<Json<ExtractRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(body) => body,
        Err(rejection) => return failure(rejection.body_text()),
    };
    let ctx = request.scope.context();
    let config = match authorize(&state, &ctx, AccessRole::Editor).await {
        Ok(config) => config,
        Err(forbidden @ ApiError::Forbidden(_)) => return forbidden.into_response(),
        Err(e) => return failure(e.to_string()),
    };

    let task = ExtractionTask {
        dataset,
        mapping: request.mapping.unwrap_or_else(|| dataset.default_mapping()),
    };
    let extractor = ConceptExtractor::new(
        processor(&state, config),
        task,
        state.config.engine.extraction_batch_size,
        state.config.engine.workers,
    );

    if request.stream {
        return streamed(state, extractor, dataset, request, ctx);
    }

    match extractor.run(request.elements, None, &ctx.cancel).await {
        Ok(outcome) => {
            ProjectStore::new(state.rpc.as_ref(), &ctx)
                .log_activity(&request.session_id, "concepts_extracted", summary(dataset, &outcome))
                .await;
            Json(json!({
                "success": true,
                "concepts": outcome.concepts,
                "orphans": outcome.orphans,
                "failedBatches": outcome.failed_batches,
                "totalBatches": outcome.total_batches,
            }))
            .into_response()
        }
        Err(e) => {
            tracing::error!(target: "loom::gateway", request_id = %ctx.request_id, error = %e, "concept extraction failed");
            failure(e.to_string())
        }
    }
}

fn streamed(
    state: AppState,
    extractor: ConceptExtractor,
    dataset: Dataset,
    request: ExtractRequest,
    ctx: RequestContext,
) -> Response {
    let (emitter, events) = channel(EVENT_BUFFER, ctx.cancel.clone());
    let span = tracing::info_span!("extract", request_id = %ctx.request_id);

    tokio::spawn(
        async move {
            let outcome = extractor.run(request.elements, Some(&emitter), &ctx.cancel).await;
            if let Ok(outcome) = &outcome {
                ProjectStore::new(state.rpc.as_ref(), &ctx)
                    .log_activity(&request.session_id, "concepts_extracted", summary(dataset, outcome))
                    .await;
            }
            let outcome = outcome.and_then(|o| Ok(serde_json::to_value(o)?));
            sse::finish(&emitter, outcome).await;
        }
        .instrument(span),
    );

    sse::respond(events)
}
