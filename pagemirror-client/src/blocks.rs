//! Breadth-first block-tree fetching.
//!
//! Child blocks are fetched with an explicit worklist of `(block_id,
//! depth)` pairs under hard node-count and depth budgets — never by naive
//! recursion into `has_children`.

use crate::client::ApiClient;
use crate::error::ClientResult;
use pagemirror_types::Block;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

/// Budgets for one block-tree fetch.
#[derive(Debug, Clone)]
pub struct BlockTreeBudget {
    /// Total blocks fetched across the whole tree.
    pub max_nodes: usize,
    /// Maximum nesting depth; children below this are not fetched.
    pub max_depth: usize,
}

impl Default for BlockTreeBudget {
    fn default() -> Self {
        Self {
            max_nodes: 2000,
            max_depth: 10,
        }
    }
}

/// Decodes one raw block object. The remote nests the payload under a key
/// named after the block type.
fn parse_block(value: &Value) -> Option<Block> {
    let id = value.get("id")?.as_str()?.to_string();
    let kind = value.get("type")?.as_str()?.to_string();
    let payload = value.get(&kind).cloned().unwrap_or(Value::Null);
    let has_children = value
        .get("has_children")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Some(Block {
        id,
        kind,
        payload,
        has_children,
        children: Vec::new(),
    })
}

impl ApiClient {
    /// Fetches the full block tree under `root_id`, breadth-first.
    ///
    /// Stops expanding once either budget is reached; already-fetched
    /// blocks are still returned, so a budgeted fetch yields a truncated
    /// but well-formed tree. The node budget is hard: a listing page that
    /// would overshoot it is truncated mid-page.
    pub async fn fetch_block_tree(
        &self,
        root_id: &str,
        budget: &BlockTreeBudget,
    ) -> ClientResult<Vec<Block>> {
        let mut children_of: HashMap<String, Vec<Block>> = HashMap::new();
        let mut worklist: VecDeque<(String, usize)> = VecDeque::new();
        worklist.push_back((root_id.to_string(), 0));
        let mut fetched = 0usize;

        while let Some((parent_id, depth)) = worklist.pop_front() {
            if depth >= budget.max_depth {
                warn!("block tree for {root_id}: depth budget {} reached", budget.max_depth);
                continue;
            }
            if fetched >= budget.max_nodes {
                warn!("block tree for {root_id}: node budget {} reached", budget.max_nodes);
                break;
            }

            let endpoint = format!("/blocks/{parent_id}/children");
            let raw = self.get_paginated(&endpoint, &Value::Null).await?;

            let mut children = Vec::with_capacity(raw.len());
            for value in &raw {
                let Some(block) = parse_block(value) else {
                    debug!("skipping malformed block under {parent_id}");
                    continue;
                };
                if fetched >= budget.max_nodes {
                    warn!(
                        "block tree for {root_id}: node budget {} reached, truncating page under {parent_id}",
                        budget.max_nodes
                    );
                    break;
                }
                fetched += 1;
                if block.has_children && fetched < budget.max_nodes {
                    worklist.push_back((block.id.clone(), depth + 1));
                }
                children.push(block);
            }
            children_of.insert(parent_id, children);
        }

        Ok(assemble(root_id, &mut children_of, budget.max_depth))
    }
}

/// Stitches fetched children back into nested blocks, bounded by the same
/// depth budget used while fetching.
fn assemble(
    parent_id: &str,
    children_of: &mut HashMap<String, Vec<Block>>,
    depth_left: usize,
) -> Vec<Block> {
    if depth_left == 0 {
        return Vec::new();
    }
    let Some(mut children) = children_of.remove(parent_id) else {
        return Vec::new();
    };
    for child in &mut children {
        if child.has_children {
            let id = child.id.clone();
            child.children = assemble(&id, children_of, depth_left - 1);
        }
    }
    children
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_remote_block_shape() {
        let raw = json!({
            "id": "b1",
            "type": "paragraph",
            "has_children": true,
            "paragraph": { "rich_text": [{ "plain_text": "hi" }] }
        });
        let block = parse_block(&raw).unwrap();
        assert_eq!(block.id, "b1");
        assert_eq!(block.kind, "paragraph");
        assert!(block.has_children);
        assert!(block.payload.get("rich_text").is_some());
    }

    #[test]
    fn rejects_blocks_without_id_or_type() {
        assert!(parse_block(&json!({ "type": "paragraph" })).is_none());
        assert!(parse_block(&json!({ "id": "b1" })).is_none());
    }

    #[test]
    fn assemble_nests_children_and_honors_depth() {
        let mut children_of = HashMap::new();
        let mut parent = Block::leaf("b1", "toggle", Value::Null);
        parent.has_children = true;
        children_of.insert("root".to_string(), vec![parent]);
        children_of.insert(
            "b1".to_string(),
            vec![Block::leaf("b2", "paragraph", Value::Null)],
        );

        let tree = assemble("root", &mut children_of.clone(), 5);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].children.len(), 1);
        assert_eq!(tree[0].children[0].id, "b2");

        // Depth 1 keeps the top level but cannot descend.
        let shallow = assemble("root", &mut children_of, 1);
        assert_eq!(shallow.len(), 1);
        assert!(shallow[0].children.is_empty());
    }
}
