//! Endpoint handlers. Each one authorizes the caller and resolves the project's model
//! before any stream is opened, then hands the work to a spawned engine task.

pub mod agents;
pub mod collaboration;
pub mod extract;
pub mod tesseract;

use crate::error::ApiError;
use crate::state::AppState;
use loom_core::{AccessRole, ProjectStore, ProviderConfig, RequestContext, UnitProcessor};

/// Identity fields every request body carries.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectScope {
    pub project_id: String,
    #[serde(default)]
    pub share_token: Option<String>,
}

impl ProjectScope {
    pub fn context(&self) -> RequestContext {
        RequestContext::new(self.project_id.clone(), self.share_token.clone())
    }
}

/// Checks `min_role` and resolves the provider from the stored project model, falling back
/// to the configured default when none is stored or the lookup fails.
pub async fn authorize(
    state: &AppState,
    ctx: &RequestContext,
    min_role: AccessRole,
) -> Result<ProviderConfig, ApiError> {
    let store = ProjectStore::new(state.rpc.as_ref(), ctx);
    store.require_role(min_role).await?;

    let stored = match store.project_model().await {
        Ok(model) => model,
        Err(e) => {
            tracing::warn!(target: "loom::gateway", request_id = %ctx.request_id, error = %e, "model lookup failed; using default");
            None
        }
    };
    let model = stored.unwrap_or_else(|| state.config.providers.default_model.clone());
    let config = ProviderConfig::resolve(Some(&model), None);
    tracing::info!(
        target: "loom::gateway",
        request_id = %ctx.request_id,
        project = %ctx.project_id,
        family = config.family.as_str(),
        model = %config.model,
        "request authorized"
    );
    Ok(config)
}

pub fn processor(state: &AppState, config: ProviderConfig) -> UnitProcessor {
    UnitProcessor::new(state.provider.clone(), config, state.config.retry_policy())
}
