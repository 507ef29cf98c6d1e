//! Tesseract build: one alignment cell per concept.
//!
//! Each concept is scored on how well its linked implementation elements realize its
//! linked requirements. Cells are persisted and streamed in concept order.

use super::should_abort;
use crate::emitter::EventEmitter;
use crate::error::{LoomError, LoomResult};
use crate::events::ProgressEvent;
use crate::pipeline::Element;
use crate::pool::run_ordered;
use crate::processor::{FailurePolicy, UnitProcessor, UnitTask};
use crate::provider::PromptRequest;
use crate::rpc::{notify, Broadcaster, ProjectStore, RequestContext};
use crate::unit::{AnalysisResult, WorkUnit};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;

const SYSTEM_PROMPT: &str = "You audit whether an implementation realizes its requirements.\n\
For the concept below, compare the linked requirements with the linked implementation elements.\n\
Respond with JSON only: {\"polarity\": number, \"rationale\": string, \"gaps\": [string]}.\n\
polarity is 1 when the implementation fully satisfies the requirements, 0 when partially, \
-1 when it is missing or contradicts them. Use values in between as appropriate.";

/// Looks up linked element text for prompts.
#[derive(Debug, Clone, Default)]
pub struct TesseractTask {
    requirements: HashMap<String, Element>,
    implementation: HashMap<String, Element>,
}

impl TesseractTask {
    pub fn new(requirements: Vec<Element>, implementation: Vec<Element>) -> Self {
        let index = |elements: Vec<Element>| -> HashMap<String, Element> {
            elements.into_iter().map(|e| (e.id.clone(), e)).collect()
        };
        Self {
            requirements: index(requirements),
            implementation: index(implementation),
        }
    }

    fn render(ids: &[String], lookup: &HashMap<String, Element>) -> String {
        if ids.is_empty() {
            return "(none)".to_string();
        }
        ids.iter()
            .map(|id| match lookup.get(id) {
                Some(e) => format!("- [{}] {}: {}", id, e.label, e.content),
                None => format!("- [{}]", id),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl UnitTask for TesseractTask {
    type Unit = WorkUnit;
    type Output = AnalysisResult;

    fn unit_id(&self, unit: &WorkUnit) -> String {
        unit.id.clone()
    }

    fn precheck(&self, unit: &WorkUnit) -> Option<AnalysisResult> {
        unit.linked.is_empty().then(|| {
            AnalysisResult::new(
                unit,
                -1.0,
                "No requirements or implementation elements are linked to this concept.",
                vec!["Concept has no linked elements in either dataset".to_string()],
            )
        })
    }

    fn prompt(&self, unit: &WorkUnit) -> PromptRequest {
        let user = format!(
            "Concept: {}\nDescription: {}\n\nRequirements:\n{}\n\nImplementation:\n{}",
            unit.label,
            unit.content,
            Self::render(&unit.linked.requirements, &self.requirements),
            Self::render(&unit.linked.implementation, &self.implementation),
        );
        PromptRequest::new(SYSTEM_PROMPT, user).with_temperature(0.2)
    }

    fn interpret(&self, unit: &WorkUnit, value: Value) -> LoomResult<AnalysisResult> {
        let polarity = match value.get("polarity") {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .ok_or_else(|| LoomError::Parse("reply has no numeric polarity".into()))?;

        let rationale = value
            .get("rationale")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let gaps = value
            .get("gaps")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();

        Ok(AnalysisResult::new(unit, polarity, rationale, gaps))
    }
}

/// Runs the tesseract build for one audit session.
pub struct TesseractBuilder {
    processor: UnitProcessor,
    task: TesseractTask,
    workers: usize,
    policy: FailurePolicy,
}

impl TesseractBuilder {
    pub fn new(processor: UnitProcessor, task: TesseractTask, workers: usize) -> Self {
        Self {
            processor,
            task,
            workers: workers.max(1),
            policy: FailurePolicy::AbortRun,
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Scores every unit, persisting and emitting each cell in submission order. Emits only
    /// non-terminal events; the caller ends the stream.
    pub async fn run(
        &self,
        units: Vec<WorkUnit>,
        session_id: &str,
        store: &ProjectStore<'_>,
        broadcaster: &dyn Broadcaster,
        emitter: &EventEmitter,
        ctx: &RequestContext,
    ) -> LoomResult<Vec<AnalysisResult>> {
        let total = units.len();
        emitter
            .progress(0, total, format!("Building tesseract for {} concepts", total))
            .await?;
        if units.is_empty() {
            return Ok(Vec::new());
        }

        tracing::info!(target: "loom::pipeline", session = session_id, units = total, "tesseract build started");

        let cancel = &ctx.cancel;
        let results = run_ordered(units, self.workers, |_, unit| async move {
            let outcome = self.processor.process(&self.task, &unit, cancel).await;
            (unit.label, outcome)
        });
        futures_util::pin_mut!(results);

        let mut cells = Vec::with_capacity(total);
        while let Some((index, (label, outcome))) = results.next().await {
            match outcome {
                Ok(cell) => {
                    store.insert_tesseract_cell(session_id, index, &cell).await?;
                    emitter
                        .emit(ProgressEvent::Cell {
                            index,
                            cell: cell.clone(),
                        })
                        .await?;
                    cells.push(cell);
                }
                Err(e) if should_abort(self.policy, &e) => {
                    tracing::error!(target: "loom::pipeline", concept = %label, error = %e, "tesseract build aborted");
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(target: "loom::pipeline", concept = %label, error = %e, "skipping concept");
                }
            }
            emitter
                .progress(index + 1, total, format!("Analyzed {}", label))
                .await?;
        }

        notify(
            broadcaster,
            &format!("audit-session-{}", session_id),
            "tesseract_updated",
            json!({ "sessionId": session_id, "cells": cells.len() }),
        )
        .await;

        Ok(cells)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::LinkedElements;

    fn unit(reqs: &[&str], imps: &[&str]) -> WorkUnit {
        WorkUnit {
            id: "c1".into(),
            label: "Auth".into(),
            content: "Login and sessions".into(),
            linked: LinkedElements {
                requirements: reqs.iter().map(|s| s.to_string()).collect(),
                implementation: imps.iter().map(|s| s.to_string()).collect(),
            },
        }
    }

    #[test]
    fn empty_links_force_negative_one() {
        let cell = TesseractTask::default().precheck(&unit(&[], &[])).unwrap();
        assert_eq!(cell.polarity, -1.0);
        assert!(TesseractTask::default().precheck(&unit(&["r1"], &[])).is_none());
    }

    #[test]
    fn interpret_clamps_and_accepts_string_polarity() {
        let task = TesseractTask::default();
        let cell = task
            .interpret(&unit(&["r1"], &["i1"]), json!({"polarity": 5.0, "rationale": "ok", "gaps": ["a", 1]}))
            .unwrap();
        assert_eq!(cell.polarity, 1.0);
        assert_eq!(cell.gaps, vec!["a"]);

        let cell = task.interpret(&unit(&["r1"], &[]), json!({"polarity": "-99"})).unwrap();
        assert_eq!(cell.polarity, -1.0);

        assert!(matches!(task.interpret(&unit(&["r1"], &[]), json!({})), Err(LoomError::Parse(_))));
    }

    #[test]
    fn prompt_includes_linked_content() {
        let task = TesseractTask::new(
            vec![Element {
                id: "r1".into(),
                label: "Login".into(),
                content: "Users sign in with email".into(),
                category: None,
            }],
            vec![],
        );
        let prompt = task.prompt(&unit(&["r1"], &["i9"]));
        let user = &prompt.messages[0].content;
        assert!(user.contains("Users sign in with email"));
        assert!(user.contains("- [i9]"));
    }
}
