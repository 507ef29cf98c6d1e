//! Concept extraction: group dataset elements into named concepts.
//!
//! Elements are sent in batches; each batch is one unit. Concepts returned by different
//! batches merge by case-insensitive label. Ids the model invents are dropped, and elements
//! no concept claims are reported back as orphans.

use super::should_abort;
use crate::emitter::EventEmitter;
use crate::error::{LoomError, LoomResult};
use crate::events::ProgressEvent;
use crate::pool::run_ordered;
use crate::processor::{FailurePolicy, UnitProcessor, UnitTask};
use crate::provider::PromptRequest;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;

/// Which side of the audit the elements come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dataset {
    /// Requirements.
    D1,
    /// Implementation.
    D2,
}

impl Dataset {
    pub fn describe(&self) -> &'static str {
        match self {
            Dataset::D1 => "requirements",
            Dataset::D2 => "implementation artifacts",
        }
    }

    pub fn default_mapping(&self) -> MappingMode {
        match self {
            Dataset::D1 => MappingMode::ExactlyOne,
            Dataset::D2 => MappingMode::AtLeastOne,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingMode {
    ExactlyOne,
    AtLeastOne,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Concept {
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "element_ids")]
    pub element_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionOutcome {
    pub concepts: Vec<Concept>,
    pub orphans: Vec<String>,
    pub failed_batches: Vec<BatchFailure>,
    pub total_batches: usize,
}

#[derive(Deserialize)]
struct ConceptReply {
    #[serde(default)]
    concepts: Vec<Concept>,
}

/// Prompting and interpretation for one batch of elements.
#[derive(Debug, Clone)]
pub struct ExtractionTask {
    pub dataset: Dataset,
    pub mapping: MappingMode,
}

impl ExtractionTask {
    fn system_prompt(&self) -> String {
        let rule = match self.mapping {
            MappingMode::ExactlyOne => "Every element id must appear in exactly one concept.",
            MappingMode::AtLeastOne => "Every element id must appear in at least one concept; an element may belong to several.",
        };
        format!(
            "You group project {} into a small set of cohesive concepts.\n\
             {}\n\
             Use only the element ids you are given.\n\
             Respond with JSON only, shaped as:\n\
             {{\"concepts\": [{{\"label\": string, \"description\": string, \"elementIds\": [string]}}]}}",
            self.dataset.describe(),
            rule
        )
    }
}

impl UnitTask for ExtractionTask {
    type Unit = Vec<Element>;
    type Output = Vec<Concept>;

    fn unit_id(&self, batch: &Vec<Element>) -> String {
        match (batch.first(), batch.last()) {
            (Some(first), Some(last)) => format!("{}..{}", first.id, last.id),
            _ => "empty batch".to_string(),
        }
    }

    fn prompt(&self, batch: &Vec<Element>) -> PromptRequest {
        let listing = batch
            .iter()
            .map(|e| {
                let category = e.category.as_deref().map(|c| format!(" ({})", c)).unwrap_or_default();
                format!("- [{}] {}{}: {}", e.id, e.label, category, e.content)
            })
            .collect::<Vec<_>>()
            .join("\n");
        PromptRequest::new(
            self.system_prompt(),
            format!("Elements ({}):\n{}", batch.len(), listing),
        )
        .with_temperature(0.3)
    }

    fn interpret(&self, batch: &Vec<Element>, value: Value) -> LoomResult<Vec<Concept>> {
        let reply: ConceptReply = serde_json::from_value(value)?;
        let known: HashSet<&str> = batch.iter().map(|e| e.id.as_str()).collect();

        let concepts: Vec<Concept> = reply
            .concepts
            .into_iter()
            .filter(|c| !c.label.trim().is_empty())
            .map(|mut c| {
                let before = c.element_ids.len();
                c.element_ids.retain(|id| known.contains(id.as_str()));
                if c.element_ids.len() != before {
                    tracing::debug!(
                        target: "loom::pipeline",
                        concept = %c.label,
                        dropped = before - c.element_ids.len(),
                        "dropped unknown element ids"
                    );
                }
                c
            })
            .collect();

        if concepts.is_empty() && !batch.is_empty() {
            return Err(LoomError::Parse("reply contained no concepts".into()));
        }
        Ok(concepts)
    }
}

/// Merges concepts by case-insensitive label, keeping first-seen order.
pub fn merge_concepts(into: &mut Vec<Concept>, incoming: Vec<Concept>) {
    let mut by_label: HashMap<String, usize> = into
        .iter()
        .enumerate()
        .map(|(i, c)| (c.label.trim().to_lowercase(), i))
        .collect();

    for concept in incoming {
        let key = concept.label.trim().to_lowercase();
        match by_label.get(&key) {
            Some(&i) => {
                let existing = &mut into[i];
                if existing.description.is_empty() {
                    existing.description = concept.description;
                }
                for id in concept.element_ids {
                    if !existing.element_ids.contains(&id) {
                        existing.element_ids.push(id);
                    }
                }
            }
            None => {
                let mut concept = concept;
                let mut seen = HashSet::new();
                concept.element_ids.retain(|id| seen.insert(id.clone()));
                by_label.insert(key, into.len());
                into.push(concept);
            }
        }
    }
}

/// Runs batched extraction over a dataset.
pub struct ConceptExtractor {
    processor: UnitProcessor,
    task: ExtractionTask,
    batch_size: usize,
    workers: usize,
    policy: FailurePolicy,
}

impl ConceptExtractor {
    pub fn new(processor: UnitProcessor, task: ExtractionTask, batch_size: usize, workers: usize) -> Self {
        Self {
            processor,
            task,
            batch_size: batch_size.max(1),
            workers: workers.max(1),
            policy: FailurePolicy::ContinueOnFailure,
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Extracts concepts for `elements`. Batches that fail after retries are skipped and
    /// listed in the outcome; if every batch fails the last error is returned.
    pub async fn run(
        &self,
        elements: Vec<Element>,
        emitter: Option<&EventEmitter>,
        cancel: &CancellationToken,
    ) -> LoomResult<ExtractionOutcome> {
        let all_ids: Vec<String> = elements.iter().map(|e| e.id.clone()).collect();
        let batches: Vec<Vec<Element>> = elements.chunks(self.batch_size).map(<[Element]>::to_vec).collect();
        let total = batches.len();

        tracing::info!(
            target: "loom::pipeline",
            dataset = ?self.task.dataset,
            elements = all_ids.len(),
            batches = total,
            "concept extraction started"
        );
        if let Some(emitter) = emitter {
            emitter
                .progress(0, total, format!("Extracting concepts from {} elements", all_ids.len()))
                .await?;
        }

        let mut outcome = ExtractionOutcome {
            total_batches: total,
            ..Default::default()
        };
        let mut last_error = None;

        let results = run_ordered(batches, self.workers, |_, batch| async move {
            self.processor.process(&self.task, &batch, cancel).await
        });
        futures_util::pin_mut!(results);

        while let Some((index, result)) = results.next().await {
            match result {
                Ok(concepts) => {
                    if let Some(emitter) = emitter {
                        emitter
                            .emit(ProgressEvent::UnitResult {
                                index,
                                data: json!({ "concepts": concepts }),
                            })
                            .await?;
                    }
                    merge_concepts(&mut outcome.concepts, concepts);
                }
                Err(e) if should_abort(self.policy, &e) => return Err(e),
                Err(e) => {
                    outcome.failed_batches.push(BatchFailure {
                        index,
                        error: e.to_string(),
                    });
                    last_error = Some(e);
                }
            }
            if let Some(emitter) = emitter {
                emitter
                    .progress(index + 1, total, format!("Processed batch {} of {}", index + 1, total))
                    .await?;
            }
        }

        if total > 0 && outcome.failed_batches.len() == total {
            return Err(last_error.unwrap_or_else(|| LoomError::Parse("every batch failed".into())));
        }

        let claimed: HashSet<&str> = outcome
            .concepts
            .iter()
            .flat_map(|c| c.element_ids.iter().map(String::as_str))
            .collect();
        outcome.orphans = all_ids
            .iter()
            .filter(|id| !claimed.contains(id.as_str()))
            .cloned()
            .collect();

        tracing::info!(
            target: "loom::pipeline",
            concepts = outcome.concepts.len(),
            orphans = outcome.orphans.len(),
            failed = outcome.failed_batches.len(),
            "concept extraction finished"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concept(label: &str, ids: &[&str]) -> Concept {
        Concept {
            label: label.into(),
            description: String::new(),
            element_ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn element(id: &str) -> Element {
        Element {
            id: id.into(),
            label: id.into(),
            content: String::new(),
            category: None,
        }
    }

    #[test]
    fn merge_is_case_insensitive_and_dedupes() {
        let mut merged = vec![concept("Auth", &["r1"])];
        merge_concepts(&mut merged, vec![concept(" auth ", &["r2", "r1"]), concept("Billing", &["r3", "r3"])]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].element_ids, vec!["r1", "r2"]);
        assert_eq!(merged[1].element_ids, vec!["r3"]);
    }

    #[test]
    fn interpret_drops_unknown_ids() {
        let task = ExtractionTask {
            dataset: Dataset::D1,
            mapping: MappingMode::ExactlyOne,
        };
        let batch = vec![element("r1"), element("r2")];
        let out = task
            .interpret(
                &batch,
                json!({"concepts": [{"label": "Auth", "elementIds": ["r1", "ghost"]}, {"label": "", "elementIds": ["r2"]}]}),
            )
            .unwrap();
        assert_eq!(out, vec![concept("Auth", &["r1"])]);
    }

    #[test]
    fn interpret_rejects_empty_reply() {
        let task = ExtractionTask {
            dataset: Dataset::D2,
            mapping: MappingMode::AtLeastOne,
        };
        let err = task.interpret(&vec![element("i1")], json!({"concepts": []})).unwrap_err();
        assert!(matches!(err, LoomError::Parse(_)));
    }

    #[test]
    fn prompt_states_mapping_rule() {
        let task = ExtractionTask {
            dataset: Dataset::D1,
            mapping: MappingMode::ExactlyOne,
        };
        let prompt = task.prompt(&vec![element("r1")]);
        assert!(prompt.system.unwrap().contains("exactly one concept"));
        assert!(prompt.messages[0].content.contains("[r1]"));
    }
}
