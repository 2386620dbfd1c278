use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::node::{RenderNode, RenderTree};

/// A node present in both versions whose type or property mapping differs.
/// Carries the full new node rather than a nested diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifiedNode {
    pub id: String,
    pub changed_props: Vec<String>,
    pub node: RenderNode,
}

/// Minimal edit set between two tree versions. The id sets partition:
/// no id appears in more than one bucket, unchanged nodes in none.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeDelta {
    pub added: Vec<RenderNode>,
    pub removed: Vec<String>,
    pub modified: Vec<ModifiedNode>,
}

impl TreeDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    /// Total number of changed nodes, the input to the full-vs-incremental
    /// size policy.
    pub fn change_count(&self) -> usize {
        self.added.len() + self.removed.len() + self.modified.len()
    }
}

/// Structural diff of two tree versions, walking by node id.
///
/// Added and modified entries follow the new tree's document order, removed
/// ids the old tree's. Added nodes are carried whole so the receiver can
/// materialize them without a second round trip.
pub fn diff(old: &RenderTree, new: &RenderTree) -> TreeDelta {
    let old_index = old.index();
    let new_index = new.index();

    let mut delta = TreeDelta::default();

    for node in new.walk() {
        match old_index.get(node.id.as_str()) {
            None => delta.added.push(node.clone()),
            Some(old_node) => {
                let changed_props = changed_props(old_node, node);
                if old_node.kind != node.kind || !changed_props.is_empty() {
                    delta.modified.push(ModifiedNode {
                        id: node.id.clone(),
                        changed_props,
                        node: node.clone(),
                    });
                }
            }
        }
    }

    for node in old.walk() {
        if !new_index.contains_key(node.id.as_str()) {
            delta.removed.push(node.id.clone());
        }
    }

    delta
}

/// Property names added, removed, or changed in value between two versions
/// of the same node, in a stable order.
fn changed_props(old: &RenderNode, new: &RenderNode) -> Vec<String> {
    let names: BTreeSet<&str> = old
        .props
        .keys()
        .chain(new.props.keys())
        .map(String::as_str)
        .collect();

    names
        .into_iter()
        .filter(|name| old.props.get(*name) != new.props.get(*name))
        .map(str::to_string)
        .collect()
}
