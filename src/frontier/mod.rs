//! Max-priority frontier of items (and keyword seeds) awaiting expansion.
//!
//! Ties on priority pop in insertion order. Dormant items carry a fixed penalty
//! but stay poppable. Entries that must wait for a later run are parked; parked
//! entries are part of the snapshot and return to the heap on restore.

mod priority;

pub use priority::{normalize, PriorityScorer, SEED_PRIORITY};

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use serde::{Deserialize, Serialize};

use crate::graph::ItemId;

/// What an entry expands: a known item, or a keyword search seed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FrontierTarget {
    Item(ItemId),
    Query(String),
}

impl FrontierTarget {
    pub fn item_id(&self) -> Option<ItemId> {
        match self {
            FrontierTarget::Item(id) => Some(*id),
            FrontierTarget::Query(_) => None,
        }
    }
}

impl std::fmt::Display for FrontierTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrontierTarget::Item(id) => write!(f, "item:{}", id),
            FrontierTarget::Query(q) => write!(f, "query:{:?}", q),
        }
    }
}

/// One queued expansion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontierEntry {
    /// Effective priority (dormancy penalty already applied).
    pub priority: f64,
    /// Monotonic insertion counter, the FIFO tie-breaker.
    pub sequence: u64,
    pub target: FrontierTarget,
    pub depth: u32,
}

impl PartialEq for FrontierEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority.total_cmp(&other.priority) == Ordering::Equal
            && self.sequence == other.sequence
            && self.target == other.target
            && self.depth == other.depth
    }
}

impl Eq for FrontierEntry {}

impl Ord for FrontierEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for FrontierEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Persistable form of the frontier, stored in the progress record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrontierSnapshot {
    pub next_sequence: u64,
    pub entries: Vec<FrontierEntry>,
}

/// Priority queue driving expansion order.
#[derive(Debug, Clone)]
pub struct PriorityFrontier {
    heap: BinaryHeap<FrontierEntry>,
    parked: Vec<FrontierEntry>,
    queued: HashSet<FrontierTarget>,
    dormant: HashSet<ItemId>,
    next_sequence: u64,
    penalty: f64,
}

impl PriorityFrontier {
    pub fn new(dormant_penalty: f64) -> Self {
        Self {
            heap: BinaryHeap::new(),
            parked: Vec::new(),
            queued: HashSet::new(),
            dormant: HashSet::new(),
            next_sequence: 0,
            penalty: dormant_penalty,
        }
    }

    /// Rebuild from a snapshot. Stored priorities already include any penalty;
    /// `dormant` only seeds the bookkeeping for later state changes.
    pub fn from_snapshot(
        snapshot: FrontierSnapshot,
        dormant_penalty: f64,
        dormant: impl IntoIterator<Item = ItemId>,
    ) -> Self {
        let mut frontier = Self::new(dormant_penalty);
        frontier.dormant = dormant.into_iter().collect();
        let max_seq = snapshot.entries.iter().map(|e| e.sequence + 1).max().unwrap_or(0);
        frontier.next_sequence = snapshot.next_sequence.max(max_seq);
        for entry in snapshot.entries {
            if frontier.queued.insert(entry.target.clone()) {
                frontier.heap.push(entry);
            }
        }
        frontier
    }

    /// Queue a target. Returns false if it is already queued or parked.
    pub fn push(&mut self, target: FrontierTarget, priority: f64, depth: u32) -> bool {
        if self.queued.contains(&target) {
            return false;
        }
        let entry = self.new_entry(target, priority, depth);
        self.queued.insert(entry.target.clone());
        self.heap.push(entry);
        true
    }

    /// Remove and return the highest-priority entry.
    pub fn pop(&mut self) -> Option<FrontierEntry> {
        let entry = self.heap.pop()?;
        self.queued.remove(&entry.target);
        Some(entry)
    }

    /// Keep a popped entry for a later run without making it poppable now.
    pub fn park(&mut self, entry: FrontierEntry) {
        if self.queued.insert(entry.target.clone()) {
            self.parked.push(entry);
        }
    }

    /// Park a fresh entry (new sequence, penalty applied if dormant).
    pub fn park_new(&mut self, target: FrontierTarget, priority: f64, depth: u32) {
        if self.queued.contains(&target) {
            return;
        }
        let entry = self.new_entry(target, priority, depth);
        self.park(entry);
    }

    /// Demote an item. Queued entries for it drop by the penalty. Returns false if
    /// it was already dormant.
    pub fn mark_dormant(&mut self, id: ItemId) -> bool {
        if !self.dormant.insert(id) {
            return false;
        }
        self.adjust(id, -self.penalty);
        true
    }

    /// Lift the penalty from an item that was referenced with new context.
    pub fn clear_dormant(&mut self, id: ItemId) -> bool {
        if !self.dormant.remove(&id) {
            return false;
        }
        self.adjust(id, self.penalty);
        true
    }

    /// Drop a queued or parked target. Returns false if it was not queued.
    pub fn remove(&mut self, target: &FrontierTarget) -> bool {
        if !self.queued.remove(target) {
            return false;
        }
        self.parked.retain(|e| &e.target != target);
        self.heap.retain(|e| &e.target != target);
        true
    }

    pub fn is_dormant(&self, id: ItemId) -> bool {
        self.dormant.contains(&id)
    }

    pub fn contains(&self, target: &FrontierTarget) -> bool {
        self.queued.contains(target)
    }

    /// Entries poppable in this run.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }

    pub fn peek(&self) -> Option<&FrontierEntry> {
        self.heap.peek()
    }

    /// Heap entries in pop order followed by parked entries.
    pub fn snapshot(&self) -> FrontierSnapshot {
        let mut entries = self.heap.clone().into_sorted_vec();
        entries.reverse();
        entries.extend(self.parked.iter().cloned());
        FrontierSnapshot {
            next_sequence: self.next_sequence,
            entries,
        }
    }

    fn new_entry(&mut self, target: FrontierTarget, priority: f64, depth: u32) -> FrontierEntry {
        let penalised = match target.item_id() {
            Some(id) if self.dormant.contains(&id) => priority - self.penalty,
            _ => priority,
        };
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        FrontierEntry {
            priority: penalised,
            sequence,
            target,
            depth,
        }
    }

    fn adjust(&mut self, id: ItemId, delta: f64) {
        let target = FrontierTarget::Item(id);
        if !self.queued.contains(&target) {
            return;
        }
        for entry in self.parked.iter_mut().filter(|e| e.target == target) {
            entry.priority += delta;
        }
        let mut entries = std::mem::take(&mut self.heap).into_vec();
        for entry in entries.iter_mut().filter(|e| e.target == target) {
            entry.priority += delta;
        }
        self.heap = BinaryHeap::from(entries);
    }
}
