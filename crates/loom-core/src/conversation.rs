//! State shared by the iterative orchestrators. The server keeps none of it between
//! requests: everything needed to resume travels in a [`ContinuationToken`].

use crate::provider::ChatMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status of one iteration as reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    InProgress,
    Completed,
    Failed,
}

impl TurnStatus {
    /// Reads a model-reported status. Anything but `completed` keeps the loop going.
    pub fn from_model(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()) {
            Some(s) if s == "completed" || s == "complete" => TurnStatus::Completed,
            _ => TurnStatus::InProgress,
        }
    }
}

/// Phases of one iteration, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationPhase {
    IterationStart,
    LlmCall,
    Parse,
    OperationsReturned,
    Persist,
    IterationComplete,
}

/// A note left by an agent for the others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlackboardEntry {
    pub agent: String,
    pub iteration: u32,
    pub content: String,
}

/// Caller-held resume state. `document` is whatever the flow edits: text for the
/// collaboration flow, a canvas for the multi-agent flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuationToken<D> {
    /// Last completed iteration; 0 before the first.
    pub iteration: u32,
    #[serde(default)]
    pub conversation_history: Vec<ChatMessage>,
    /// Feedback from the last iteration the model has not seen yet.
    #[serde(default)]
    pub pending_results: Vec<Value>,
    #[serde(default)]
    pub blackboard: Vec<BlackboardEntry>,
    pub document: D,
    /// Edits applied so far across all iterations.
    #[serde(default)]
    pub applied_edits: usize,
}

impl<D> ContinuationToken<D> {
    pub fn fresh(document: D) -> Self {
        Self {
            iteration: 0,
            conversation_history: Vec::new(),
            pending_results: Vec::new(),
            blackboard: Vec::new(),
            document,
            applied_edits: 0,
        }
    }

    pub fn is_resumed(&self) -> bool {
        self.iteration > 0 || !self.conversation_history.is_empty()
    }
}

/// How a multi-iteration run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed { iterations: u32 },
    BudgetExhausted { iterations: u32 },
    Failed { iteration: u32, message: String },
}

impl RunOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            RunOutcome::Completed { .. } => "completed",
            RunOutcome::BudgetExhausted { .. } => "budget_exhausted",
            RunOutcome::Failed { .. } => "failed",
        }
    }
}
