//! Structured query filters.
//!
//! The remote query endpoint accepts predicate objects: `{and|or: [...]}`
//! with leaf predicates keyed by property type, e.g.
//! `{"last_edited_time": {"after": "2024-01-01T00:00:00Z"}}`. An empty or
//! key-less filter object is invalid and must be omitted from the request
//! body rather than sent as `{}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A query filter: either a leaf predicate or a boolean combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Filter {
    /// Conjunction of sub-filters.
    And {
        /// Sub-filters, all of which must match.
        and: Vec<Filter>,
    },
    /// Disjunction of sub-filters.
    Or {
        /// Sub-filters, any of which may match.
        or: Vec<Filter>,
    },
    /// A leaf predicate, kept as raw JSON keyed by property type.
    Leaf(Value),
}

impl Filter {
    /// A conjunction. Collapses to the single member when given one.
    #[must_use]
    pub fn and(filters: Vec<Filter>) -> Option<Filter> {
        match filters.len() {
            0 => None,
            1 => filters.into_iter().next(),
            _ => Some(Filter::And { and: filters }),
        }
    }

    /// A `last_edited_time after` leaf predicate.
    #[must_use]
    pub fn edited_after(when: DateTime<Utc>) -> Filter {
        Filter::Leaf(serde_json::json!({
            "timestamp": "last_edited_time",
            "last_edited_time": { "after": when.to_rfc3339() }
        }))
    }

    /// A property leaf predicate.
    #[must_use]
    pub fn property(name: &str, kind: &str, condition: Value) -> Filter {
        Filter::Leaf(serde_json::json!({
            "property": name,
            kind: condition
        }))
    }

    /// True for timestamp-based leaves (the conditions stripped by
    /// [`Filter::simplify`]).
    #[must_use]
    pub fn is_timestamp_condition(&self) -> bool {
        match self {
            Filter::Leaf(value) => {
                value.get("timestamp").is_some()
                    || value.get("last_edited_time").is_some()
                    || value.get("created_time").is_some()
            }
            _ => false,
        }
    }

    /// Strips timestamp conditions, keeping property conditions.
    ///
    /// Returns `None` when nothing remains — the caller must then omit the
    /// filter entirely.
    #[must_use]
    pub fn simplify(&self) -> Option<Filter> {
        match self {
            Filter::And { and } => {
                let kept: Vec<Filter> =
                    and.iter().filter_map(Filter::simplify).collect();
                Filter::and(kept)
            }
            Filter::Or { or } => {
                let kept: Vec<Filter> = or.iter().filter_map(Filter::simplify).collect();
                match kept.len() {
                    0 => None,
                    1 => kept.into_iter().next(),
                    _ => Some(Filter::Or { or: kept }),
                }
            }
            leaf if leaf.is_timestamp_condition() => None,
            leaf => Some(leaf.clone()),
        }
    }
}
