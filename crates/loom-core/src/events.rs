//! Wire vocabulary of progress streams.

use crate::conversation::{BlackboardEntry, TurnStatus};
use crate::patch::SkippedOperation;
use crate::unit::AnalysisResult;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ProgressEvent {
    Progress {
        current: usize,
        total: usize,
        percent: u8,
        message: String,
    },
    /// A batch or unit result from a non-cell pipeline.
    #[serde(rename = "result")]
    UnitResult { index: usize, data: Value },
    Cell { index: usize, cell: AnalysisResult },
    IterationStart { iteration: u32, max_iterations: u32 },
    /// `attempt` starts at 1; a higher value means earlier deltas of the iteration are void.
    LlmDelta { iteration: u32, attempt: u32, text: String },
    Operations {
        iteration: u32,
        applied: usize,
        skipped: Vec<SkippedOperation>,
    },
    AgentResult {
        iteration: u32,
        agent: String,
        status: TurnStatus,
        applied: usize,
        skipped: Vec<SkippedOperation>,
        #[serde(skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    Blackboard {
        iteration: u32,
        entries: Vec<BlackboardEntry>,
    },
    IterationComplete {
        iteration: u32,
        status: TurnStatus,
        continuation: Value,
    },
    Error { message: String },
    Done { result: Value },
    Heartbeat { timestamp: String },
}

impl ProgressEvent {
    pub fn progress(current: usize, total: usize, message: impl Into<String>) -> Self {
        let percent = if total == 0 {
            0
        } else {
            ((current.min(total) * 100) / total) as u8
        };
        ProgressEvent::Progress {
            current,
            total,
            percent,
            message: message.into(),
        }
    }

    /// `error` and `done` end a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Error { .. } | ProgressEvent::Done { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProgressEvent::Progress { .. } => "progress",
            ProgressEvent::UnitResult { .. } => "result",
            ProgressEvent::Cell { .. } => "cell",
            ProgressEvent::IterationStart { .. } => "iteration_start",
            ProgressEvent::LlmDelta { .. } => "llm_delta",
            ProgressEvent::Operations { .. } => "operations",
            ProgressEvent::AgentResult { .. } => "agent_result",
            ProgressEvent::Blackboard { .. } => "blackboard",
            ProgressEvent::IterationComplete { .. } => "iteration_complete",
            ProgressEvent::Error { .. } => "error",
            ProgressEvent::Done { .. } => "done",
            ProgressEvent::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// An event stamped with its position in the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedEvent {
    pub seq: u64,
    pub event: ProgressEvent,
}

impl SequencedEvent {
    /// JSON carried in the frame's `data:` line, with `seq` folded in.
    pub fn payload(&self) -> Value {
        let mut data = match serde_json::to_value(&self.event) {
            Ok(Value::Object(mut tagged)) => tagged.remove("data").unwrap_or(Value::Null),
            _ => Value::Null,
        };
        if let Value::Object(map) = &mut data {
            map.insert("seq".to_string(), Value::from(self.seq));
        }
        data
    }

    /// `event: <name>\ndata: <json>\n\n`
    pub fn to_frame(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event.name(), self.payload())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_percent() {
        assert!(matches!(
            ProgressEvent::progress(1, 3, "x"),
            ProgressEvent::Progress { percent: 33, .. }
        ));
        assert!(matches!(
            ProgressEvent::progress(0, 0, "empty"),
            ProgressEvent::Progress { percent: 0, .. }
        ));
    }

    #[test]
    fn serde_tag_matches_name() {
        let events = [
            ProgressEvent::progress(0, 1, "start"),
            ProgressEvent::LlmDelta { iteration: 1, attempt: 1, text: "x".into() },
            ProgressEvent::Error { message: "bad".into() },
            ProgressEvent::UnitResult { index: 0, data: Value::Null },
        ];
        for event in events {
            let tagged = serde_json::to_value(&event).unwrap();
            assert_eq!(tagged["event"], event.name());
        }
    }

    #[test]
    fn frame_format_carries_seq() {
        let frame = SequencedEvent {
            seq: 4,
            event: ProgressEvent::Error { message: "gone".into() },
        }
        .to_frame();
        assert_eq!(frame, "event: error\ndata: {\"message\":\"gone\",\"seq\":4}\n\n");
    }
}
