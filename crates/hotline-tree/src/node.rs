use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("duplicate node id {0:?}")]
    DuplicateNodeId(String),
}

/// One node of a render tree. Property order is irrelevant; child order
/// determines render order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderNode {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub props: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<RenderNode>,
}

impl RenderNode {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            props: HashMap::new(),
            children: Vec::new(),
        }
    }

    pub fn with_prop(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.props.insert(name.into(), value.into());
        self
    }

    pub fn with_child(mut self, child: RenderNode) -> Self {
        self.children.push(child);
        self
    }

    /// Preorder walk of this node and its subtree.
    pub fn walk(&self) -> Walk<'_> {
        Walk { stack: vec![self] }
    }
}

pub struct Walk<'a> {
    stack: Vec<&'a RenderNode>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = &'a RenderNode;

    fn next(&mut self) -> Option<&'a RenderNode> {
        let node = self.stack.pop()?;
        // Reverse so children pop in document order.
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}

/// A rooted render tree, treated as an immutable snapshot per version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderTree {
    pub root: RenderNode,
}

impl RenderTree {
    pub fn new(root: RenderNode) -> Self {
        Self { root }
    }

    /// Preorder walk over every node in the tree.
    pub fn walk(&self) -> Walk<'_> {
        self.root.walk()
    }

    /// Id → node lookup table for the whole tree.
    pub fn index(&self) -> HashMap<&str, &RenderNode> {
        self.walk().map(|node| (node.id.as_str(), node)).collect()
    }

    pub fn find(&self, id: &str) -> Option<&RenderNode> {
        self.walk().find(|node| node.id == id)
    }

    pub fn node_count(&self) -> usize {
        self.walk().count()
    }

    /// Node ids must be unique within a tree version.
    pub fn validate(&self) -> Result<(), TreeError> {
        let mut seen = HashSet::new();
        for node in self.walk() {
            if !seen.insert(node.id.as_str()) {
                return Err(TreeError::DuplicateNodeId(node.id.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> RenderTree {
        RenderTree::new(
            RenderNode::new("root", "page")
                .with_prop("title", "home")
                .with_child(RenderNode::new("header", "label").with_prop("text", "hi"))
                .with_child(
                    RenderNode::new("list", "stack")
                        .with_child(RenderNode::new("row-1", "label"))
                        .with_child(RenderNode::new("row-2", "label")),
                ),
        )
    }

    #[test]
    fn walk_is_preorder_document_order() {
        let tree = sample();
        let ids: Vec<&str> = tree.walk().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, ["root", "header", "list", "row-1", "row-2"]);
    }

    #[test]
    fn index_covers_every_node() {
        let tree = sample();
        let index = tree.index();
        assert_eq!(index.len(), 5);
        assert_eq!(index["row-2"].kind, "label");
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let tree = RenderTree::new(
            RenderNode::new("root", "page")
                .with_child(RenderNode::new("a", "label"))
                .with_child(RenderNode::new("a", "label")),
        );
        assert_eq!(
            tree.validate(),
            Err(TreeError::DuplicateNodeId("a".to_string()))
        );
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn node_serializes_with_wire_field_names() {
        let node = RenderNode::new("root", "page").with_prop("color", json!("red"));
        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["id"], "root");
        assert_eq!(value["type"], "page");
        assert_eq!(value["props"]["color"], "red");
        // Empty children are omitted from the wire form.
        assert!(value.get("children").is_none());
    }
}
