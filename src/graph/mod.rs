//! Relationship graph: items (nodes) with open attribute maps and typed edges.
//!
//! The graph owns every item and edge. Adjacency is an id-indexed set, so cycles
//! need no back-pointers.

mod collection;

pub use collection::{CollectionGraph, PendingChanges};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable external id of an item.
pub type ItemId = u64;

/// Free-form metadata returned by the source (name, tags, owner, collection, counters...).
pub type Attributes = serde_json::Map<String, Value>;

/// Kind of relationship between two items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelationKind {
    /// Source-reported similarity, directed from the expanded item to its neighbour.
    Similarity,
    /// Both items belong to the same owning user.
    SameOwner,
    /// Both items belong to the same collection.
    SameCollection,
}

impl RelationKind {
    pub fn is_directed(self) -> bool {
        matches!(self, RelationKind::Similarity)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RelationKind::Similarity => "similarity",
            RelationKind::SameOwner => "same-owner",
            RelationKind::SameCollection => "same-collection",
        }
    }
}

/// A single edge (source --kind--> target).
///
/// Undirected kinds are stored with `source < target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Relationship {
    pub source: ItemId,
    pub target: ItemId,
    pub kind: RelationKind,
}

impl Relationship {
    /// Build an edge in canonical orientation.
    pub fn new(source: ItemId, target: ItemId, kind: RelationKind) -> Self {
        if kind.is_directed() || source <= target {
            Self { source, target, kind }
        } else {
            Self { source: target, target: source, kind }
        }
    }
}

/// One collected item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub attributes: Attributes,
    /// Distance from the seed it was discovered through.
    pub depth: u32,
    /// Last expansion produced nothing new.
    pub dormant: bool,
    pub discovered_at: DateTime<Utc>,
    pub last_existence_check_at: Option<DateTime<Utc>>,
    pub last_metadata_update_at: Option<DateTime<Utc>>,
}

impl Item {
    pub fn new(id: ItemId, attributes: Attributes, depth: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            attributes,
            depth,
            dormant: false,
            discovered_at: now,
            last_existence_check_at: None,
            last_metadata_update_at: None,
        }
    }

    /// Attribute value rendered as a grouping key (strings verbatim, numbers as text).
    pub fn attribute_key(&self, field: &str) -> Option<String> {
        attribute_key(self.attributes.get(field)?)
    }

    /// Numeric attribute, accepting numbers and numeric strings.
    pub fn attribute_f64(&self, field: &str) -> Option<f64> {
        match self.attributes.get(field)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Render a JSON value as a grouping key. Null, empty strings and composites have no key.
pub fn attribute_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
