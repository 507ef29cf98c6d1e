//! Multi-agent canvas editing over a shared blackboard.
//!
//! Agents run in their listed order, once per iteration, each seeing the canvas as the
//! previous agent left it. The run completes when every agent reports `completed` in the
//! same iteration.

use crate::canvas::CanvasState;
use crate::conversation::{BlackboardEntry, ContinuationToken, IterationPhase, RunOutcome, TurnStatus};
use crate::emitter::EventEmitter;
use crate::error::{LoomError, LoomResult};
use crate::events::ProgressEvent;
use crate::processor::{UnitProcessor, UnitTask};
use crate::provider::{ChatMessage, PromptRequest};
use crate::rpc::{notify, Broadcaster, ProjectStore, RequestContext};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Blackboard entries shown to an agent.
const BLACKBOARD_WINDOW: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub instructions: String,
}

#[derive(Debug, Clone)]
pub struct AgentJob {
    pub session_id: String,
    pub goal: String,
    pub agents: Vec<AgentSpec>,
}

/// Everything one agent sees on its turn.
#[derive(Debug, Clone)]
pub struct AgentTurn {
    pub agent: AgentSpec,
    pub iteration: u32,
    pub canvas: CanvasState,
    pub blackboard: Vec<BlackboardEntry>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentReply {
    #[serde(default)]
    pub status: Option<String>,
    /// Raw operations; each is decoded when applied so one bad entry only skips itself.
    #[serde(default)]
    pub operations: Vec<Value>,
    #[serde(default)]
    pub note: Option<String>,
}

pub struct AgentTask {
    goal: String,
}

impl AgentTask {
    pub fn new(goal: impl Into<String>) -> Self {
        Self { goal: goal.into() }
    }
}

impl UnitTask for AgentTask {
    type Unit = AgentTurn;
    type Output = AgentReply;

    fn unit_id(&self, turn: &AgentTurn) -> String {
        format!("{}#{}", turn.agent.id, turn.iteration)
    }

    fn prompt(&self, turn: &AgentTurn) -> PromptRequest {
        let system = format!(
            "You are {}, {}.\n{}\n\
             You edit a shared architecture canvas together with other agents.\n\
             Respond with JSON only:\n\
             {{\"status\": \"in_progress\" | \"completed\", \"note\": string, \"operations\": [\n\
               {{\"type\": \"add_node\", \"node\": {{\"id\", \"type\", \"label\", \"data\"}}}},\n\
               {{\"type\": \"update_node\", \"id\": string, \"label\"?: string, \"data\"?: object}},\n\
               {{\"type\": \"delete_node\", \"id\": string}},\n\
               {{\"type\": \"add_edge\", \"edge\": {{\"id\", \"source\", \"target\", \"label\"?}}}},\n\
               {{\"type\": \"delete_edge\", \"id\": string}}\n\
             ]}}\n\
             Report \"completed\" when you have nothing more to contribute.",
            turn.agent.name,
            if turn.agent.role.is_empty() { "a contributor" } else { turn.agent.role.as_str() },
            turn.agent.instructions,
        );

        let canvas = serde_json::to_string_pretty(&turn.canvas).unwrap_or_else(|_| "{}".to_string());
        let start = turn.blackboard.len().saturating_sub(BLACKBOARD_WINDOW);
        let notes = if turn.blackboard.is_empty() {
            "(empty)".to_string()
        } else {
            turn.blackboard[start..]
                .iter()
                .map(|e| format!("- [iteration {}] {}: {}", e.iteration, e.agent, e.content))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let mut request = PromptRequest::new(
            system,
            format!(
                "Goal:\n{}\n\nIteration {}.\n\nCanvas:\n{}\n\nBlackboard:\n{}",
                self.goal, turn.iteration, canvas, notes
            ),
        );
        request.messages.insert(0, ChatMessage::system("Never invent ids that collide with existing ones."));
        request
    }

    fn interpret(&self, _turn: &AgentTurn, value: Value) -> LoomResult<AgentReply> {
        Ok(serde_json::from_value(value)?)
    }
}

pub struct AgentOrchestrator {
    processor: UnitProcessor,
    max_iterations: u32,
}

impl AgentOrchestrator {
    pub fn new(processor: UnitProcessor, max_iterations: u32) -> Self {
        Self {
            processor,
            max_iterations: max_iterations.max(1),
        }
    }

    /// Runs iterations until all agents complete, one fails, or the budget runs out.
    pub async fn run(
        &self,
        job: &AgentJob,
        mut token: ContinuationToken<CanvasState>,
        store: &ProjectStore<'_>,
        broadcaster: &dyn Broadcaster,
        emitter: &EventEmitter,
        ctx: &RequestContext,
    ) -> LoomResult<(RunOutcome, ContinuationToken<CanvasState>)> {
        if job.agents.is_empty() {
            return Err(LoomError::InvalidRequest("at least one agent is required".into()));
        }
        let task = AgentTask::new(job.goal.clone());

        loop {
            let iteration = token.iteration + 1;
            if iteration > self.max_iterations {
                return Ok((
                    RunOutcome::BudgetExhausted {
                        iterations: token.iteration,
                    },
                    token,
                ));
            }

            tracing::debug!(target: "loom::orchestrator", iteration, phase = ?IterationPhase::IterationStart, "agents iteration");
            emitter
                .emit(ProgressEvent::IterationStart {
                    iteration,
                    max_iterations: self.max_iterations,
                })
                .await?;

            let mut draft = token.clone();
            match self.iterate(job, &task, &mut draft, iteration, store, emitter, ctx).await {
                Ok(all_completed) => {
                    draft.iteration = iteration;
                    token = draft;
                    notify(
                        broadcaster,
                        &format!("canvas-{}", ctx.project_id),
                        "canvas_updated",
                        json!({ "sessionId": job.session_id, "iteration": iteration }),
                    )
                    .await;
                    let status = if all_completed {
                        TurnStatus::Completed
                    } else {
                        TurnStatus::InProgress
                    };
                    emitter
                        .emit(ProgressEvent::IterationComplete {
                            iteration,
                            status,
                            continuation: serde_json::to_value(&token)?,
                        })
                        .await?;
                    if all_completed {
                        return Ok((RunOutcome::Completed { iterations: iteration }, token));
                    }
                }
                Err(e @ (LoomError::Cancelled | LoomError::StreamTransport(_))) => return Err(e),
                Err(e) => {
                    tracing::error!(target: "loom::orchestrator", iteration, error = %e, "agents iteration failed");
                    // Earlier agents' persisted edits stay in the token; the iteration reruns on resume.
                    token = draft;
                    if !token.pending_results.is_empty() {
                        notify(
                            broadcaster,
                            &format!("canvas-{}", ctx.project_id),
                            "canvas_updated",
                            json!({ "sessionId": job.session_id, "iteration": iteration }),
                        )
                        .await;
                    }
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

    /// Runs every agent once, folding each agent's persisted work into `draft` as soon as
    /// it is stored. Returns whether all agents reported `completed`.
    #[allow(clippy::too_many_arguments)]
    async fn iterate(
        &self,
        job: &AgentJob,
        task: &AgentTask,
        draft: &mut ContinuationToken<CanvasState>,
        iteration: u32,
        store: &ProjectStore<'_>,
        emitter: &EventEmitter,
        ctx: &RequestContext,
    ) -> LoomResult<bool> {
        let mut new_entries = Vec::new();
        let mut all_completed = true;
        draft.pending_results.clear();

        for agent in &job.agents {
            let turn = AgentTurn {
                agent: agent.clone(),
                iteration,
                canvas: draft.document.clone(),
                blackboard: draft.blackboard.clone(),
            };
            let reply = self.processor.process(task, &turn, &ctx.cancel).await?;

            let mut canvas = turn.canvas;
            let report = canvas.apply_values(&reply.operations);
            for change in &report.changes {
                store.apply_canvas_change(change).await?;
            }
            draft.document = canvas;
            draft.applied_edits += report.changes.len();

            let status = TurnStatus::from_model(reply.status.as_deref());
            all_completed &= status == TurnStatus::Completed;

            let note = reply.note.filter(|n| !n.trim().is_empty());
            if let Some(content) = &note {
                store
                    .insert_blackboard(&job.session_id, &agent.name, iteration, content)
                    .await?;
                let entry = BlackboardEntry {
                    agent: agent.name.clone(),
                    iteration,
                    content: content.clone(),
                };
                draft.blackboard.push(entry.clone());
                new_entries.push(entry);
            }

            draft.pending_results.push(json!({
                "agent": agent.id,
                "status": status,
                "skipped": report.skipped,
            }));

            emitter
                .emit(ProgressEvent::AgentResult {
                    iteration,
                    agent: agent.name.clone(),
                    status,
                    applied: report.changes.len(),
                    skipped: report.skipped,
                    note,
                })
                .await?;
        }

        if !new_entries.is_empty() {
            emitter
                .emit(ProgressEvent::Blackboard {
                    iteration,
                    entries: new_entries,
                })
                .await?;
        }

        Ok(all_completed)
    }
}
