//! Multi-iteration document collaboration.
//!
//! Each iteration streams one model turn, applies the line edits it returns, persists the
//! document and hands the caller a [`ContinuationToken`]. The loop ends when the model
//! reports `completed`, an iteration fails, or the budget runs out.

use crate::conversation::{ContinuationToken, IterationPhase, RunOutcome, TurnStatus};
use crate::emitter::EventEmitter;
use crate::error::{LoomError, LoomResult};
use crate::events::ProgressEvent;
use crate::patch::{apply_edit_values, number_lines};
use crate::provider::{ChatMessage, LlmProvider, PromptRequest, ProviderConfig};
use crate::recovery::recover_as;
use crate::retry::RetryPolicy;
use crate::rpc::{notify, Broadcaster, ProjectStore, RequestContext};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

const SYSTEM_PROMPT: &str = "You are a collaborative editor working on a shared document over several turns.\n\
The document is shown with line numbers. Line numbers always refer to the version you were shown.\n\
Respond with JSON only:\n\
{\"status\": \"in_progress\" | \"completed\", \"message\": string, \"operations\": [\n\
  {\"type\": \"edit_lines\", \"start_line\": number, \"end_line\": number, \"new_content\": string},\n\
  {\"type\": \"insert_lines\", \"after_line\": number, \"new_content\": string}\n\
]}\n\
An edit_lines with empty new_content deletes the range. Use \"completed\" only when the task is fully done.";

/// Per-request inputs that stay fixed across iterations.
#[derive(Debug, Clone)]
pub struct CollaborationJob {
    pub collaboration_id: String,
    pub instructions: String,
    /// Used by the completion check when enabled.
    pub expected_edits: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct TurnReply {
    #[serde(default)]
    status: Option<String>,
    #[serde(default, alias = "summary")]
    message: String,
    /// Decoded one by one when applied.
    #[serde(default)]
    operations: Vec<Value>,
}

pub struct CollaborationOrchestrator {
    provider: Arc<dyn LlmProvider>,
    config: ProviderConfig,
    retry: RetryPolicy,
    max_iterations: u32,
    verify_completion: bool,
}

impl CollaborationOrchestrator {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        config: ProviderConfig,
        retry: RetryPolicy,
        max_iterations: u32,
        verify_completion: bool,
    ) -> Self {
        Self {
            provider,
            config,
            retry,
            max_iterations: max_iterations.max(1),
            verify_completion,
        }
    }

    /// Runs iterations starting after `token.iteration`. Returns how the run ended and a
    /// token that agrees with what was persisted. Only cancellation and a dead stream come
    /// back as `Err`.
    pub async fn run(
        &self,
        job: &CollaborationJob,
        mut token: ContinuationToken<String>,
        store: &ProjectStore<'_>,
        broadcaster: &dyn Broadcaster,
        emitter: &EventEmitter,
        ctx: &RequestContext,
    ) -> LoomResult<(RunOutcome, ContinuationToken<String>)> {
        loop {
            let iteration = token.iteration + 1;
            if iteration > self.max_iterations {
                tracing::info!(target: "loom::orchestrator", collaboration = %job.collaboration_id, "iteration budget exhausted");
                return Ok((
                    RunOutcome::BudgetExhausted {
                        iterations: token.iteration,
                    },
                    token,
                ));
            }

            enter(iteration, IterationPhase::IterationStart);
            emitter
                .emit(ProgressEvent::IterationStart {
                    iteration,
                    max_iterations: self.max_iterations,
                })
                .await?;

            let mut draft = token.clone();
            match self.iterate(job, &mut draft, iteration, store, broadcaster, emitter, ctx).await {
                Ok(status) => {
                    token = draft;
                    enter(iteration, IterationPhase::IterationComplete);
                    emitter
                        .emit(ProgressEvent::IterationComplete {
                            iteration,
                            status,
                            continuation: serde_json::to_value(&token)?,
                        })
                        .await?;
                    if status == TurnStatus::Completed {
                        return Ok((RunOutcome::Completed { iterations: iteration }, token));
                    }
                }
                Err(e @ (LoomError::Cancelled | LoomError::StreamTransport(_))) => return Err(e),
                Err(e) => {
                    tracing::error!(target: "loom::orchestrator", iteration, error = %e, "iteration failed");
                    // The draft holds whatever already reached the store.
                    token = draft;
                    emitter
                        .emit(ProgressEvent::IterationComplete {
                            iteration,
                            status: TurnStatus::Failed,
                            continuation: serde_json::to_value(&token)?,
                        })
                        .await?;
                    return Ok((
                        RunOutcome::Failed {
                            iteration,
                            message: e.to_string(),
                        },
                        token,
                    ));
                }
            }
        }
    }

    /// Advances `draft` in place. The document moves forward as soon as it is persisted;
    /// iteration and history only once the whole iteration succeeds.
    #[allow(clippy::too_many_arguments)]
    async fn iterate(
        &self,
        job: &CollaborationJob,
        draft: &mut ContinuationToken<String>,
        iteration: u32,
        store: &ProjectStore<'_>,
        broadcaster: &dyn Broadcaster,
        emitter: &EventEmitter,
        ctx: &RequestContext,
    ) -> LoomResult<TurnStatus> {
        let user_message = if draft.is_resumed() {
            continuation_message(draft)
        } else {
            initial_message(job, &draft.document)
        };
        let mut history = draft.conversation_history.clone();
        history.push(ChatMessage::user(user_message));
        let request = PromptRequest::from_history(Some(SYSTEM_PROMPT.to_string()), history.clone());

        enter(iteration, IterationPhase::LlmCall);
        let label = format!("{}#{}", job.collaboration_id, iteration);
        let (text, reply) = self
            .retry
            .run(&label, &ctx.cancel, |attempt| self.stream_turn(&request, iteration, attempt, emitter))
            .await?;

        enter(iteration, IterationPhase::OperationsReturned);
        let report = apply_edit_values(&draft.document, &reply.operations);
        emitter
            .emit(ProgressEvent::Operations {
                iteration,
                applied: report.applied,
                skipped: report.skipped.clone(),
            })
            .await?;

        enter(iteration, IterationPhase::Persist);
        if report.applied > 0 {
            store
                .update_collaboration_document(&job.collaboration_id, &report.content)
                .await?;
            draft.document = report.content;
            draft.applied_edits += report.applied;
        }
        let summary = if reply.message.trim().is_empty() {
            format!("Applied {} edits", report.applied)
        } else {
            reply.message.clone()
        };
        store
            .insert_collaboration_message(&job.collaboration_id, "assistant", &summary)
            .await?;
        notify(
            broadcaster,
            &format!("collaboration-{}", job.collaboration_id),
            "document_updated",
            json!({ "iteration": iteration, "applied": report.applied }),
        )
        .await;

        history.push(ChatMessage::assistant(text));
        draft.iteration = iteration;
        draft.conversation_history = history;
        draft.pending_results = report
            .skipped
            .iter()
            .map(|s| json!({ "index": s.index, "reason": s.reason }))
            .collect();

        let mut status = TurnStatus::from_model(reply.status.as_deref());
        if status == TurnStatus::Completed && !self.completion_verified(job, draft.applied_edits) {
            tracing::warn!(
                target: "loom::orchestrator",
                iteration,
                applied_edits = draft.applied_edits,
                expected = ?job.expected_edits,
                "completion claim ignored"
            );
            status = TurnStatus::InProgress;
        }
        Ok(status)
    }

    /// One streamed model call, forwarding deltas tagged with `attempt`. Returns the raw
    /// text and parsed reply.
    async fn stream_turn(
        &self,
        request: &PromptRequest,
        iteration: u32,
        attempt: u32,
        emitter: &EventEmitter,
    ) -> LoomResult<(String, TurnReply)> {
        let mut chunks = self.provider.stream(&self.config, request).await?;
        let mut text = String::new();
        while let Some(chunk) = chunks.recv().await {
            let chunk = chunk?;
            emitter
                .emit(ProgressEvent::LlmDelta {
                    iteration,
                    attempt,
                    text: chunk.clone(),
                })
                .await?;
            text.push_str(&chunk);
        }
        enter(iteration, IterationPhase::Parse);
        let reply = recover_as::<TurnReply>(&text)?;
        Ok((text, reply))
    }

    fn completion_verified(&self, job: &CollaborationJob, applied_edits: usize) -> bool {
        match (self.verify_completion, job.expected_edits) {
            (true, Some(expected)) => applied_edits >= expected,
            _ => true,
        }
    }
}

fn enter(iteration: u32, phase: IterationPhase) {
    tracing::debug!(target: "loom::orchestrator", iteration, ?phase, "phase");
}

fn initial_message(job: &CollaborationJob, document: &str) -> String {
    let mut message = format!(
        "Task:\n{}\n\nDocument:\n{}",
        job.instructions,
        number_lines(document)
    );
    if let Some(expected) = job.expected_edits {
        message.push_str(&format!("\n\nExpected number of edits: {}", expected));
    }
    message
}

/// Short follow-up sent instead of the original task on later iterations.
fn continuation_message(token: &ContinuationToken<String>) -> String {
    let mut message = format!(
        "Continue. The document now reads:\n{}",
        number_lines(&token.document)
    );
    if !token.pending_results.is_empty() {
        let skipped = token
            .pending_results
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        message.push_str(&format!("\n\nThese operations from your last reply were not applied:\n{}", skipped));
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> CollaborationJob {
        CollaborationJob {
            collaboration_id: "c1".into(),
            instructions: "Rewrite the intro".into(),
            expected_edits: Some(2),
        }
    }

    #[test]
    fn continuation_omits_instructions() {
        let mut token = ContinuationToken::fresh("a\nb".to_string());
        token.iteration = 1;
        token.pending_results.push(json!({"index": 0, "reason": "overlap"}));
        let message = continuation_message(&token);
        assert!(!message.contains("Rewrite the intro"));
        assert!(message.contains("1: a\n2: b"));
        assert!(message.contains("overlap"));
    }

    #[test]
    fn initial_message_numbers_document() {
        let message = initial_message(&job(), "x");
        assert!(message.contains("Rewrite the intro"));
        assert!(message.contains("1: x"));
        assert!(message.contains("Expected number of edits: 2"));
    }

    #[test]
    fn reply_parses_with_summary_alias() {
        let reply: TurnReply = recover_as(
            "```json\n{\"status\":\"completed\",\"summary\":\"done\",\"operations\":[{\"type\":\"insert_lines\",\"after_line\":0,\"new_content\":\"x\"}]}\n```",
        )
        .unwrap();
        assert_eq!(reply.message, "done");
        assert_eq!(reply.operations.len(), 1);
    }
}
