use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::RequestId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjacencyNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub props: Map<String, Value>,
    #[serde(default)]
    pub children: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GraphOperation {
    Insert {
        node: AdjacencyNode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
    },
    Update {
        id: String,
        #[serde(default)]
        props: Map<String, Value>,
    },
    Delete {
        id: String,
    },
}

/// Graph-shaped UI: nodes keyed by id plus pending patch operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdjacencyList {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_id: Option<String>,
    #[serde(default)]
    pub nodes: BTreeMap<String, AdjacencyNode>,
    #[serde(default)]
    pub operations: Vec<GraphOperation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphPatchError {
    #[error("node `{0}` already exists")]
    DuplicateNode(String),
    #[error("parent node `{0}` does not exist")]
    UnknownParent(String),
    #[error("{op} targets unknown node `{id}`")]
    UnknownNode { op: &'static str, id: String },
}

impl AdjacencyList {
    pub fn apply(&mut self, operation: &GraphOperation) -> Result<(), GraphPatchError> {
        match operation {
            GraphOperation::Insert {
                node,
                parent_id,
                index,
            } => {
                if self.nodes.contains_key(&node.id) {
                    return Err(GraphPatchError::DuplicateNode(node.id.clone()));
                }
                match parent_id {
                    Some(parent_id) => {
                        let parent = self
                            .nodes
                            .get_mut(parent_id)
                            .ok_or_else(|| GraphPatchError::UnknownParent(parent_id.clone()))?;
                        let at = index.unwrap_or(parent.children.len()).min(parent.children.len());
                        parent.children.insert(at, node.id.clone());
                    }
                    None if self.root_id.is_none() => self.root_id = Some(node.id.clone()),
                    None => {}
                }
                self.nodes.insert(node.id.clone(), node.clone());
            }
            GraphOperation::Update { id, props } => {
                let target = self.nodes.get_mut(id).ok_or_else(|| GraphPatchError::UnknownNode {
                    op: "update",
                    id: id.clone(),
                })?;
                target
                    .props
                    .extend(props.iter().map(|(key, value)| (key.clone(), value.clone())));
            }
            GraphOperation::Delete { id } => {
                if !self.nodes.contains_key(id) {
                    return Err(GraphPatchError::UnknownNode {
                        op: "delete",
                        id: id.clone(),
                    });
                }
                let removed = self.subtree_ids(id);
                self.nodes.retain(|node_id, _| !removed.contains(node_id));
                for node in self.nodes.values_mut() {
                    node.children.retain(|child| !removed.contains(child));
                }
                if self
                    .root_id
                    .as_ref()
                    .is_some_and(|root| removed.contains(root))
                {
                    self.root_id = None;
                }
            }
        }
        Ok(())
    }

    /// Folds the pending operations into `nodes`. On failure the failing
    /// operation and everything after it stay in `operations`.
    pub fn apply_operations(&mut self) -> Result<usize, GraphPatchError> {
        let pending = std::mem::take(&mut self.operations);
        for (applied, operation) in pending.iter().enumerate() {
            if let Err(err) = self.apply(operation) {
                self.operations = pending[applied..].to_vec();
                return Err(err);
            }
        }
        Ok(pending.len())
    }

    /// Depth-first walk from the root in child order. Dangling child ids and
    /// cycles are skipped.
    pub fn walk(&self) -> Vec<&AdjacencyNode> {
        let mut ordered = Vec::new();
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = self.root_id.iter().map(String::as_str).collect();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            ordered.push(node);
            stack.extend(node.children.iter().rev().map(String::as_str));
        }
        ordered
    }

    fn subtree_ids(&self, id: &str) -> HashSet<String> {
        let mut removed = HashSet::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            if !removed.insert(current.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                stack.extend(node.children.iter().cloned());
            }
        }
        removed
    }
}
