//! Per-unit LLM processing: prompt, call, recover, interpret, with bounded retry.

use crate::error::LoomResult;
use crate::provider::{LlmProvider, PromptRequest, ProviderConfig};
use crate::recovery::recover_json;
use crate::retry::RetryPolicy;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What a pipeline does when one unit exhausts its attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Drop the unit, keep going, report the partial set.
    ContinueOnFailure,
    /// Surface the failure and stop dispatching further units.
    AbortRun,
}

/// Pipeline-specific behaviour for one kind of unit.
pub trait UnitTask: Send + Sync {
    type Unit: Send + Sync;
    type Output: Send;

    fn unit_id(&self, unit: &Self::Unit) -> String;

    /// Short-circuit without calling the model.
    fn precheck(&self, _unit: &Self::Unit) -> Option<Self::Output> {
        None
    }

    fn prompt(&self, unit: &Self::Unit) -> PromptRequest;

    /// Turn recovered JSON into the unit's output. Shape errors should be
    /// [`crate::LoomError::Parse`] so they count as a failed attempt.
    fn interpret(&self, unit: &Self::Unit, value: Value) -> LoomResult<Self::Output>;
}

/// Runs units against the request's provider with the configured retry policy.
#[derive(Clone)]
pub struct UnitProcessor {
    provider: Arc<dyn LlmProvider>,
    config: ProviderConfig,
    retry: RetryPolicy,
}

impl UnitProcessor {
    pub fn new(provider: Arc<dyn LlmProvider>, config: ProviderConfig, retry: RetryPolicy) -> Self {
        Self {
            provider,
            config,
            retry,
        }
    }

    /// One unit end to end. Provider and parse failures are retried; the last error is
    /// returned once attempts run out.
    pub async fn process<T: UnitTask>(
        &self,
        task: &T,
        unit: &T::Unit,
        cancel: &CancellationToken,
    ) -> LoomResult<T::Output> {
        let unit_id = task.unit_id(unit);
        if let Some(output) = task.precheck(unit) {
            tracing::debug!(target: "loom::pipeline", unit = %unit_id, "resolved without model call");
            return Ok(output);
        }

        let request = task.prompt(unit);
        let provider = &self.provider;
        let config = &self.config;
        let request = &request;

        self.retry
            .run(&unit_id, cancel, |_attempt| async move {
                let text = provider.complete(config, request).await?;
                let value = recover_json(&text).into_result()?;
                task.interpret(unit, value)
            })
            .await
            .map_err(|e| {
                tracing::warn!(target: "loom::pipeline", unit = %unit_id, error = %e, "unit failed");
                e
            })
    }
}
