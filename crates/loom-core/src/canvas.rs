//! Working copy of a project canvas and the operations agents may apply to it.

use crate::error::{LoomError, LoomResult};
use crate::patch::{decode_operations, SkippedOperation};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasNode {
    pub id: String,
    #[serde(rename = "type", default = "default_node_type")]
    pub node_type: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub data: Value,
}

fn default_node_type() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanvasState {
    #[serde(default)]
    pub nodes: Vec<CanvasNode>,
    #[serde(default)]
    pub edges: Vec<CanvasEdge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanvasOperation {
    AddNode { node: CanvasNode },
    /// Merges the given fields into an existing node.
    UpdateNode {
        id: String,
        #[serde(default)]
        label: Option<String>,
        #[serde(default)]
        data: Option<Value>,
    },
    DeleteNode { id: String },
    AddEdge { edge: CanvasEdge },
    DeleteEdge { id: String },
}

/// Net effect of one applied operation, for persistence.
#[derive(Debug, Clone, PartialEq)]
pub enum CanvasChange {
    UpsertNode(CanvasNode),
    DeleteNode(String),
    UpsertEdge(CanvasEdge),
    DeleteEdge(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanvasReport {
    pub changes: Vec<CanvasChange>,
    pub skipped: Vec<SkippedOperation>,
}

impl CanvasState {
    pub fn node(&self, id: &str) -> Option<&CanvasNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Applies operations in order. Invalid ones are skipped; the rest still apply.
    pub fn apply(&mut self, operations: &[CanvasOperation]) -> CanvasReport {
        self.apply_indexed(operations.iter().enumerate(), Vec::new())
    }

    /// [`CanvasState::apply`] over raw model output; elements that do not decode are skipped.
    pub fn apply_values(&mut self, raw: &[Value]) -> CanvasReport {
        let batch = decode_operations::<CanvasOperation>(raw);
        let mut report = self.apply_indexed(batch.operations.iter().map(|(i, op)| (*i, op)), batch.rejected);
        report.skipped.sort_by_key(|s| s.index);
        report
    }

    fn apply_indexed<'o>(
        &mut self,
        operations: impl Iterator<Item = (usize, &'o CanvasOperation)>,
        skipped: Vec<SkippedOperation>,
    ) -> CanvasReport {
        let mut report = CanvasReport {
            changes: Vec::new(),
            skipped,
        };
        for (index, op) in operations {
            match self.apply_one(op) {
                Ok(mut changes) => report.changes.append(&mut changes),
                Err(e) => report.skipped.push(SkippedOperation {
                    index,
                    reason: e.to_string(),
                }),
            }
        }
        report
    }

    fn apply_one(&mut self, op: &CanvasOperation) -> LoomResult<Vec<CanvasChange>> {
        match op {
            CanvasOperation::AddNode { node } => {
                if node.id.trim().is_empty() {
                    return Err(LoomError::Patch("node id is empty".into()));
                }
                if self.node(&node.id).is_some() {
                    return Err(LoomError::Patch(format!("node {} already exists", node.id)));
                }
                self.nodes.push(node.clone());
                Ok(vec![CanvasChange::UpsertNode(node.clone())])
            }
            CanvasOperation::UpdateNode { id, label, data } => {
                let node = self
                    .nodes
                    .iter_mut()
                    .find(|n| &n.id == id)
                    .ok_or_else(|| LoomError::Patch(format!("node {} not found", id)))?;
                if let Some(label) = label {
                    node.label = label.clone();
                }
                if let Some(data) = data {
                    merge_data(&mut node.data, data);
                }
                Ok(vec![CanvasChange::UpsertNode(node.clone())])
            }
            CanvasOperation::DeleteNode { id } => {
                if self.node(id).is_none() {
                    return Err(LoomError::Patch(format!("node {} not found", id)));
                }
                self.nodes.retain(|n| &n.id != id);
                // Edges touching the node go with it.
                let mut changes = Vec::new();
                self.edges.retain(|e| {
                    let attached = &e.source == id || &e.target == id;
                    if attached {
                        changes.push(CanvasChange::DeleteEdge(e.id.clone()));
                    }
                    !attached
                });
                changes.push(CanvasChange::DeleteNode(id.clone()));
                Ok(changes)
            }
            CanvasOperation::AddEdge { edge } => {
                if self.edges.iter().any(|e| e.id == edge.id) {
                    return Err(LoomError::Patch(format!("edge {} already exists", edge.id)));
                }
                for end in [&edge.source, &edge.target] {
                    if self.node(end).is_none() {
                        return Err(LoomError::Patch(format!(
                            "edge {} references unknown node {}",
                            edge.id, end
                        )));
                    }
                }
                self.edges.push(edge.clone());
                Ok(vec![CanvasChange::UpsertEdge(edge.clone())])
            }
            CanvasOperation::DeleteEdge { id } => {
                let before = self.edges.len();
                self.edges.retain(|e| &e.id != id);
                if self.edges.len() == before {
                    return Err(LoomError::Patch(format!("edge {} not found", id)));
                }
                Ok(vec![CanvasChange::DeleteEdge(id.clone())])
            }
        }
    }
}

/// Shallow merge for objects; anything else replaces.
fn merge_data(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(into), Value::Object(from)) => {
            for (k, v) in from {
                into.insert(k.clone(), v.clone());
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}
