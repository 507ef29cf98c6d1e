//! Line-range edits against a line-numbered document.
//!
//! The model sees the document with 1-based line numbers and answers with
//! `edit_lines` / `insert_lines` operations that all refer to that same numbering.
//! Accepted operations are applied bottom-to-top so earlier line numbers stay valid.

use crate::error::{LoomError, LoomResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EditOperation {
    /// Replace lines `start_line..=end_line`; empty `new_content` deletes them.
    EditLines {
        #[serde(alias = "startLine")]
        start_line: usize,
        #[serde(alias = "endLine")]
        end_line: usize,
        #[serde(default, alias = "newContent")]
        new_content: String,
    },
    /// Insert after `after_line`; 0 inserts at the top.
    InsertLines {
        #[serde(alias = "afterLine")]
        after_line: usize,
        #[serde(alias = "newContent")]
        new_content: String,
    },
}

/// An operation that was not applied, by position in the submitted batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedOperation {
    pub index: usize,
    pub reason: String,
}

/// Operations decoded from a model reply, each with its position in the reply.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBatch<T> {
    pub operations: Vec<(usize, T)>,
    pub rejected: Vec<SkippedOperation>,
}

/// Decodes each element on its own so one malformed operation does not sink the batch.
pub fn decode_operations<T: DeserializeOwned>(raw: &[Value]) -> DecodedBatch<T> {
    let mut batch = DecodedBatch {
        operations: Vec::with_capacity(raw.len()),
        rejected: Vec::new(),
    };
    for (index, value) in raw.iter().enumerate() {
        match T::deserialize(value) {
            Ok(op) => batch.operations.push((index, op)),
            Err(e) => batch.rejected.push(SkippedOperation {
                index,
                reason: format!("malformed operation: {}", e),
            }),
        }
    }
    batch
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub content: String,
    pub applied: usize,
    pub skipped: Vec<SkippedOperation>,
}

/// Footprint of an operation in 0-based line indices of the original document.
#[derive(Debug, Clone, Copy)]
enum Span {
    Replace { start: usize, end: usize },
    Insert { at: usize },
}

impl Span {
    fn position(&self) -> usize {
        match *self {
            Span::Replace { start, .. } => start,
            Span::Insert { at } => at,
        }
    }

    fn conflicts_with(&self, other: &Span) -> bool {
        match (*self, *other) {
            (Span::Replace { start: a, end: b }, Span::Replace { start: c, end: d }) => a < d && c < b,
            (Span::Replace { start, end }, Span::Insert { at })
            | (Span::Insert { at }, Span::Replace { start, end }) => start < at && at < end,
            (Span::Insert { .. }, Span::Insert { .. }) => false,
        }
    }
}

impl EditOperation {
    fn span(&self, line_count: usize) -> LoomResult<Span> {
        match *self {
            EditOperation::EditLines { start_line, end_line, .. } => {
                if start_line == 0 || start_line > end_line || end_line > line_count {
                    return Err(LoomError::Patch(format!(
                        "edit_lines {}-{} outside document of {} lines",
                        start_line, end_line, line_count
                    )));
                }
                Ok(Span::Replace {
                    start: start_line - 1,
                    end: end_line,
                })
            }
            EditOperation::InsertLines { after_line, ref new_content } => {
                if after_line > line_count {
                    return Err(LoomError::Patch(format!(
                        "insert_lines after {} outside document of {} lines",
                        after_line, line_count
                    )));
                }
                if new_content.is_empty() {
                    return Err(LoomError::Patch("insert_lines with empty content".into()));
                }
                Ok(Span::Insert { at: after_line })
            }
        }
    }

    fn new_content(&self) -> &str {
        match self {
            EditOperation::EditLines { new_content, .. }
            | EditOperation::InsertLines { new_content, .. } => new_content,
        }
    }
}

/// Renders `document` as `N: line` rows, numbering from 1.
pub fn number_lines(document: &str) -> String {
    document
        .lines()
        .enumerate()
        .map(|(i, line)| format!("{}: {}", i + 1, line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Applies every valid, non-overlapping operation; the rest are reported as skipped.
pub fn apply_edits(document: &str, operations: &[EditOperation]) -> ApplyReport {
    let indexed: Vec<(usize, &EditOperation)> = operations.iter().enumerate().collect();
    apply_indexed(document, &indexed, Vec::new())
}

/// [`apply_edits`] over raw model output. Elements that do not decode are skipped with the
/// rest; indices refer to positions in `raw`.
pub fn apply_edit_values(document: &str, raw: &[Value]) -> ApplyReport {
    let batch = decode_operations::<EditOperation>(raw);
    let indexed: Vec<(usize, &EditOperation)> = batch.operations.iter().map(|(i, op)| (*i, op)).collect();
    apply_indexed(document, &indexed, batch.rejected)
}

fn apply_indexed(
    document: &str,
    operations: &[(usize, &EditOperation)],
    mut skipped: Vec<SkippedOperation>,
) -> ApplyReport {
    let mut lines: Vec<String> = document.lines().map(str::to_string).collect();
    let line_count = lines.len();
    let mut accepted: Vec<(usize, Span, &EditOperation)> = Vec::new();

    for &(index, op) in operations {
        let span = match op.span(line_count) {
            Ok(span) => span,
            Err(e) => {
                skipped.push(SkippedOperation { index, reason: e.to_string() });
                continue;
            }
        };
        if let Some((other, _, _)) = accepted.iter().find(|(_, s, _)| s.conflicts_with(&span)) {
            skipped.push(SkippedOperation {
                index,
                reason: format!("overlaps operation {}", other),
            });
            continue;
        }
        accepted.push((index, span, op));
    }

    // Bottom-to-top; at equal positions replacements go before inserts, and inserts at the
    // same point in reverse submission order so they end up in submission order.
    let mut ordered = accepted.clone();
    ordered.sort_by(|(ia, a, _), (ib, b, _)| {
        b.position()
            .cmp(&a.position())
            .then_with(|| matches!(a, Span::Insert { .. }).cmp(&matches!(b, Span::Insert { .. })))
            .then_with(|| ib.cmp(ia))
    });

    for (_, span, op) in &ordered {
        let replacement: Vec<String> = op.new_content().lines().map(str::to_string).collect();
        match *span {
            Span::Replace { start, end } => {
                lines.splice(start..end, replacement);
            }
            Span::Insert { at } => {
                lines.splice(at..at, replacement);
            }
        }
    }

    skipped.sort_by_key(|s| s.index);
    let mut content = lines.join("\n");
    if document.ends_with('\n') && !content.is_empty() {
        content.push('\n');
    }

    ApplyReport {
        content,
        applied: accepted.len(),
        skipped,
    }
}
