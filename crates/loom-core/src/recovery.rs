//! Best-effort JSON recovery from free-form model output.
//!
//! Models wrap JSON in prose or markdown fences often enough that a plain parse is not
//! sufficient. The strategies below are tried in order and the first one that yields a
//! JSON object (or array, for the first two) wins.

use crate::error::{LoomError, LoomResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

const PREVIEW_CHARS: usize = 200;

static FENCE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").ok());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Whole trimmed text.
    Direct,
    /// Interior of a triple-backtick block, language tag optional.
    Fenced,
    /// First `{` through last `}`.
    BraceScan,
}

pub const STRATEGIES: [Strategy; 3] = [Strategy::Direct, Strategy::Fenced, Strategy::BraceScan];

impl Strategy {
    pub fn attempt(&self, text: &str) -> Option<Value> {
        match self {
            Strategy::Direct => parse_structured(text.trim()),
            Strategy::Fenced => {
                let fence = FENCE.as_ref()?;
                fence
                    .captures_iter(text)
                    .filter_map(|c| c.get(1))
                    .find_map(|m| parse_structured(m.as_str().trim()))
            }
            Strategy::BraceScan => {
                let start = text.find('{')?;
                let end = text.rfind('}')?;
                if start >= end {
                    return None;
                }
                serde_json::from_str::<Value>(&text[start..=end])
                    .ok()
                    .filter(Value::is_object)
            }
        }
    }
}

fn parse_structured(text: &str) -> Option<Value> {
    serde_json::from_str::<Value>(text)
        .ok()
        .filter(|v| v.is_object() || v.is_array())
}

#[derive(Debug, Clone, PartialEq)]
pub enum Recovered {
    Parsed { value: Value, strategy: Strategy },
    Unparseable { preview: String },
}

impl Recovered {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Recovered::Parsed { value, .. } => Some(value),
            Recovered::Unparseable { .. } => None,
        }
    }

    /// Converts to the retryable parse error used by the unit processor.
    pub fn into_result(self) -> LoomResult<Value> {
        match self {
            Recovered::Parsed { value, .. } => Ok(value),
            Recovered::Unparseable { preview } => {
                Err(LoomError::Parse(format!("no JSON found in: {}", preview)))
            }
        }
    }
}

/// Runs every strategy in order. Never fails past this boundary.
pub fn recover_json(text: &str) -> Recovered {
    for strategy in STRATEGIES {
        if let Some(value) = strategy.attempt(text) {
            if strategy != Strategy::Direct {
                tracing::debug!(target: "loom::recovery", ?strategy, "recovered JSON");
            }
            return Recovered::Parsed { value, strategy };
        }
    }

    let preview: String = text.chars().take(PREVIEW_CHARS).collect();
    tracing::warn!(
        target: "loom::recovery",
        chars = text.len(),
        "model output contained no recoverable JSON"
    );
    Recovered::Unparseable { preview }
}

/// Recovers and deserializes into `T`; shape mismatches are parse errors.
pub fn recover_as<T: DeserializeOwned>(text: &str) -> LoomResult<T> {
    let value = recover_json(text).into_result()?;
    serde_json::from_value(value).map_err(|e| LoomError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn direct_parse() {
        let out = recover_json("  {\"polarity\": 0.5}\n");
        assert_eq!(
            out,
            Recovered::Parsed { value: json!({"polarity": 0.5}), strategy: Strategy::Direct }
        );
    }

    #[test]
    fn fenced_equals_bare() {
        let bare = recover_json("{\"concepts\": [{\"label\": \"Auth\"}]}");
        let fenced = recover_json("Here you go:\n```json\n{\"concepts\": [{\"label\": \"Auth\"}]}\n```\nDone.");
        assert_eq!(bare.value(), fenced.value());
        assert!(matches!(fenced, Recovered::Parsed { strategy: Strategy::Fenced, .. }));
    }

    #[test]
    fn fence_without_language_tag() {
        let out = recover_json("```\n[1, 2]\n```");
        assert_eq!(out.value(), Some(&json!([1, 2])));
    }

    #[test]
    fn brace_scan_through_prose() {
        let out = recover_json("Sure! {\"status\": \"completed\"} Let me know.");
        assert!(matches!(out, Recovered::Parsed { strategy: Strategy::BraceScan, .. }));
        assert_eq!(out.value(), Some(&json!({"status": "completed"})));
    }

    #[test]
    fn unparseable_keeps_preview() {
        let text = "x".repeat(500);
        match recover_json(&text) {
            Recovered::Unparseable { preview } => assert_eq!(preview.len(), 200),
            other => panic!("expected unparseable, got {:?}", other),
        }
        assert!(matches!(recover_json("} backwards {").into_result(), Err(LoomError::Parse(_))));
    }

    #[test]
    fn recovery_is_idempotent() {
        let inputs = [
            "{\"a\": {\"b\": [1, 2, 3]}}",
            "prefix ```json\n{\"k\": \"v\"}\n``` suffix",
            "noise {\"x\": null, \"y\": true} noise",
        ];
        for input in inputs {
            let first = recover_json(input).into_result().unwrap();
            let again = recover_json(&serde_json::to_string(&first).unwrap())
                .into_result()
                .unwrap();
            assert_eq!(first, again);
        }
    }

    #[test]
    fn recover_as_typed() {
        #[derive(serde::Deserialize)]
        struct Out {
            polarity: f64,
        }
        let out: Out = recover_as("```json\n{\"polarity\": -0.25}\n```").unwrap();
        assert_eq!(out.polarity, -0.25);
        assert!(matches!(recover_as::<Out>("{\"other\": 1}"), Err(LoomError::Parse(_))));
    }
}
