use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use super::{Attributes, Item, ItemId, RelationKind, Relationship};
use crate::error::{HarvestError, Result};

/// Changes accumulated since the last successful checkpoint.
#[derive(Debug, Clone, Default)]
pub struct PendingChanges {
    /// Items whose metadata row must be (re)written.
    pub upserts: Vec<Item>,
    /// Items deleted from the graph since the last checkpoint.
    pub removed: Vec<ItemId>,
    /// Nodes or edges were added/removed, so the topology must be rewritten.
    pub topology_changed: bool,
}

impl PendingChanges {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removed.is_empty() && !self.topology_changed
    }
}

/// In-memory graph with change tracking for incremental checkpoints.
#[derive(Debug, Clone, Default)]
pub struct CollectionGraph {
    items: BTreeMap<ItemId, Item>,
    edges: BTreeSet<Relationship>,
    adjacency: HashMap<ItemId, BTreeSet<ItemId>>,
    dirty: BTreeSet<ItemId>,
    removed: BTreeSet<ItemId>,
    topology_changed: bool,
}

impl PartialEq for CollectionGraph {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items && self.edges == other.edges
    }
}

impl CollectionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a graph from persisted items and edges. Nothing is marked pending.
    ///
    /// Fails when an edge references an item that is not present.
    pub fn from_parts(items: Vec<Item>, edges: Vec<Relationship>) -> Result<Self> {
        let mut graph = Self::new();
        for item in items {
            graph.items.insert(item.id, item);
        }
        for edge in edges {
            if !graph.items.contains_key(&edge.source) || !graph.items.contains_key(&edge.target) {
                return Err(HarvestError::CorruptCheckpoint(format!(
                    "edge {} -> {} ({}) references an unknown item",
                    edge.source,
                    edge.target,
                    edge.kind.as_str()
                )));
            }
            graph.link(edge);
        }
        Ok(graph)
    }

    pub fn node_count(&self) -> usize {
        self.items.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.items.contains_key(&id)
    }

    pub fn item(&self, id: ItemId) -> Option<&Item> {
        self.items.get(&id)
    }

    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.items.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Relationship> {
        self.edges.iter()
    }

    pub fn has_edge(&self, source: ItemId, target: ItemId, kind: RelationKind) -> bool {
        self.edges.contains(&Relationship::new(source, target, kind))
    }

    /// Number of distinct neighbours, regardless of edge kind or direction.
    pub fn degree(&self, id: ItemId) -> usize {
        self.adjacency.get(&id).map(|n| n.len()).unwrap_or(0)
    }

    /// Insert a fully-formed item. Returns false (and changes nothing) if the id exists.
    pub fn insert_item(&mut self, item: Item) -> bool {
        if self.items.contains_key(&item.id) {
            return false;
        }
        let id = item.id;
        self.items.insert(id, item);
        self.dirty.insert(id);
        self.removed.remove(&id);
        self.topology_changed = true;
        true
    }

    /// Record fresh metadata for an item, creating it if unseen.
    ///
    /// Existing items keep their other attributes (the new map is merged over the
    /// old one) and their depth shrinks to `depth` if that is shallower.
    /// Returns true when the item was newly created.
    pub fn upsert_attributes(
        &mut self,
        id: ItemId,
        attributes: Attributes,
        depth: u32,
        now: DateTime<Utc>,
    ) -> bool {
        if let Some(item) = self.items.get_mut(&id) {
            item.attributes.extend(attributes);
            item.depth = item.depth.min(depth);
            item.last_metadata_update_at = Some(now);
            self.dirty.insert(id);
            return false;
        }

        let mut item = Item::new(id, attributes, depth, now);
        item.last_metadata_update_at = Some(now);
        self.insert_item(item)
    }

    /// Merge fresh metadata into an existing item without touching topology.
    pub fn refresh_attributes(&mut self, id: ItemId, attributes: Attributes, now: DateTime<Utc>) -> bool {
        match self.items.get_mut(&id) {
            Some(item) => {
                item.attributes.extend(attributes);
                item.last_metadata_update_at = Some(now);
                self.dirty.insert(id);
                true
            }
            None => false,
        }
    }

    /// Add an edge if both endpoints exist and the edge is not already present.
    ///
    /// Returns true only when a new edge was created. Self-loops are ignored.
    pub fn add_edge(&mut self, source: ItemId, target: ItemId, kind: RelationKind) -> bool {
        if source == target || !self.contains(source) || !self.contains(target) {
            return false;
        }
        let edge = Relationship::new(source, target, kind);
        if self.edges.contains(&edge) {
            return false;
        }
        self.link(edge);
        self.topology_changed = true;
        true
    }

    /// Delete an item and every edge touching it.
    pub fn remove_item(&mut self, id: ItemId) -> bool {
        if self.items.remove(&id).is_none() {
            return false;
        }
        self.edges.retain(|e| e.source != id && e.target != id);
        if let Some(neighbours) = self.adjacency.remove(&id) {
            for n in neighbours {
                if let Some(set) = self.adjacency.get_mut(&n) {
                    set.remove(&id);
                }
            }
        }
        self.dirty.remove(&id);
        self.removed.insert(id);
        self.topology_changed = true;
        true
    }

    /// Set the dormant flag. Returns true if it changed.
    pub fn set_dormant(&mut self, id: ItemId, dormant: bool) -> bool {
        match self.items.get_mut(&id) {
            Some(item) if item.dormant != dormant => {
                item.dormant = dormant;
                self.dirty.insert(id);
                true
            }
            _ => false,
        }
    }

    pub fn stamp_existence_check(&mut self, id: ItemId, now: DateTime<Utc>) -> bool {
        match self.items.get_mut(&id) {
            Some(item) => {
                item.last_existence_check_at = Some(now);
                self.dirty.insert(id);
                true
            }
            None => false,
        }
    }

    pub fn dormant_ids(&self) -> impl Iterator<Item = ItemId> + '_ {
        self.items.values().filter(|i| i.dormant).map(|i| i.id)
    }

    /// Snapshot of everything changed since the last `clear_pending`.
    pub fn pending(&self) -> PendingChanges {
        PendingChanges {
            upserts: self
                .dirty
                .iter()
                .filter_map(|id| self.items.get(id).cloned())
                .collect(),
            removed: self.removed.iter().copied().collect(),
            topology_changed: self.topology_changed,
        }
    }

    pub fn has_structural_changes(&self) -> bool {
        self.topology_changed || !self.removed.is_empty()
    }

    pub fn clear_pending(&mut self) {
        self.dirty.clear();
        self.removed.clear();
        self.topology_changed = false;
    }

    /// Mark every item dirty, forcing a full rewrite on the next save.
    pub fn mark_all_pending(&mut self) {
        self.dirty = self.items.keys().copied().collect();
        self.topology_changed = true;
    }

    fn link(&mut self, edge: Relationship) {
        self.adjacency.entry(edge.source).or_default().insert(edge.target);
        self.adjacency.entry(edge.target).or_default().insert(edge.source);
        self.edges.insert(edge);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(v: serde_json::Value) -> Attributes {
        v.as_object().unwrap().clone()
    }

    fn graph_with(ids: &[ItemId]) -> CollectionGraph {
        let mut g = CollectionGraph::new();
        for id in ids {
            g.upsert_attributes(*id, attrs(json!({"name": format!("item-{}", id)})), 0, Utc::now());
        }
        g
    }

    #[test]
    fn test_add_edge_is_check_before_insert() {
        let mut g = graph_with(&[1, 2]);
        assert!(g.add_edge(1, 2, RelationKind::SameOwner));
        assert!(!g.add_edge(2, 1, RelationKind::SameOwner));
        assert!(g.add_edge(1, 2, RelationKind::Similarity));
        assert!(g.add_edge(2, 1, RelationKind::Similarity));
        assert_eq!(g.edge_count(), 3);
        assert_eq!(g.degree(1), 1);
    }

    #[test]
    fn test_add_edge_requires_endpoints() {
        let mut g = graph_with(&[1]);
        assert!(!g.add_edge(1, 99, RelationKind::Similarity));
        assert!(!g.add_edge(1, 1, RelationKind::Similarity));
        assert_eq!(g.edge_count(), 0);
    }

    #[test]
    fn test_upsert_merges_and_keeps_shallowest_depth() {
        let mut g = CollectionGraph::new();
        let now = Utc::now();
        assert!(g.upsert_attributes(5, attrs(json!({"name": "a", "tags": ["x"]})), 3, now));
        assert!(!g.upsert_attributes(5, attrs(json!({"name": "b"})), 1, now));
        let item = g.item(5).unwrap();
        assert_eq!(item.attributes["name"], "b");
        assert_eq!(item.attributes["tags"], json!(["x"]));
        assert_eq!(item.depth, 1);
        assert_eq!(item.last_metadata_update_at, Some(now));
    }

    #[test]
    fn test_remove_item_drops_incident_edges() {
        let mut g = graph_with(&[1, 2, 3]);
        g.add_edge(1, 2, RelationKind::Similarity);
        g.add_edge(2, 3, RelationKind::SameCollection);
        g.clear_pending();

        assert!(g.remove_item(2));
        assert_eq!(g.edge_count(), 0);
        assert_eq!(g.degree(1), 0);
        assert_eq!(g.degree(3), 0);

        let pending = g.pending();
        assert_eq!(pending.removed, vec![2]);
        assert!(pending.topology_changed);
        assert!(!g.remove_item(2));
    }

    #[test]
    fn test_pending_tracks_metadata_only_changes() {
        let mut g = graph_with(&[1, 2]);
        g.clear_pending();
        assert!(g.pending().is_empty());

        g.refresh_attributes(1, attrs(json!({"num_downloads": 10})), Utc::now());
        g.set_dormant(2, true);
        let pending = g.pending();
        assert_eq!(pending.upserts.len(), 2);
        assert!(!pending.topology_changed);
        assert!(!g.has_structural_changes());
    }

    #[test]
    fn test_from_parts_rejects_dangling_edge() {
        let item = Item::new(1, Attributes::new(), 0, Utc::now());
        let edges = vec![Relationship::new(1, 2, RelationKind::Similarity)];
        let err = CollectionGraph::from_parts(vec![item], edges).unwrap_err();
        assert!(err.is_corruption());
    }
}
