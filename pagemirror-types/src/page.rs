//! Remote page and block snapshots.
//!
//! A `RemotePage` is an immutable snapshot of a document fetched from the
//! remote API. The engine only reads these (for hashing and classification);
//! it never mutates or interprets block payloads.

use crate::ids::PageId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A typed property value on a remote page.
///
/// The remote API types properties (title, select, date, ...); we keep the
/// kind tag and the raw JSON value without interpreting either.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyValue {
    /// Property type tag as reported by the remote API.
    #[serde(rename = "type")]
    pub kind: String,
    /// Raw property payload.
    #[serde(default)]
    pub value: Value,
}

impl PropertyValue {
    /// Creates a property value from a kind tag and raw payload.
    pub fn new(kind: impl Into<String>, value: Value) -> Self {
        Self {
            kind: kind.into(),
            value,
        }
    }

    /// Extracts plain text from a title-like property, if this is one.
    ///
    /// Title payloads are arrays of rich-text fragments; we concatenate the
    /// `plain_text` of each fragment.
    #[must_use]
    pub fn as_title_text(&self) -> Option<String> {
        if self.kind != "title" {
            return None;
        }
        let fragments = self.value.as_array()?;
        let text: String = fragments
            .iter()
            .filter_map(|f| f.get("plain_text").and_then(Value::as_str))
            .collect();
        Some(text)
    }
}

/// A recursive content node within a page.
///
/// Blocks are opaque to the engine: only `id`, `has_children` and the raw
/// payload (used for hashing) matter here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Remote block id.
    pub id: String,
    /// Block type tag (paragraph, heading_1, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// Raw block payload.
    #[serde(default)]
    pub payload: Value,
    /// Whether the remote reports nested children for this block.
    #[serde(default)]
    pub has_children: bool,
    /// Resolved children, populated by the block-tree fetch.
    #[serde(default)]
    pub children: Vec<Block>,
}

impl Block {
    /// Creates a leaf block with no children.
    pub fn leaf(id: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            payload,
            has_children: false,
            children: Vec::new(),
        }
    }

    /// Counts this block plus all nested descendants.
    #[must_use]
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(Block::node_count).sum::<usize>()
    }
}

/// An immutable snapshot of a remote page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotePage {
    /// Remote page id.
    pub id: PageId,
    /// Typed properties keyed by property name.
    ///
    /// `BTreeMap` keeps serialization order-deterministic, which the content
    /// hashing depends on.
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
    /// Top-level blocks in document order.
    #[serde(default)]
    pub blocks: Vec<Block>,
    /// Creation time reported by the remote, if present.
    pub created_time: Option<DateTime<Utc>>,
    /// Last-edited time reported by the remote, if present.
    pub last_edited_time: Option<DateTime<Utc>>,
}

impl RemotePage {
    /// Creates an empty page snapshot with the given id.
    pub fn new(id: impl Into<PageId>) -> Self {
        Self {
            id: id.into(),
            properties: BTreeMap::new(),
            blocks: Vec::new(),
            created_time: None,
            last_edited_time: None,
        }
    }

    /// Returns the page title text, if a title property exists.
    #[must_use]
    pub fn title_text(&self) -> Option<String> {
        self.properties.values().find_map(PropertyValue::as_title_text)
    }
}
