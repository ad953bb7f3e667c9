//! Expansion of a single frontier entry.

use chrono::{DateTime, Utc};

use super::CollectionEngine;
use crate::error::Result;
use crate::frontier::FrontierTarget;
use crate::graph::{ItemId, RelationKind};
use crate::source::{RemoteItem, SourceClient};

/// What one expansion changed.
#[derive(Debug, Default, Clone, Copy)]
struct Growth {
    items: u64,
    edges: u64,
}

impl Growth {
    fn is_empty(&self) -> bool {
        self.items == 0 && self.edges == 0
    }
}

impl<C: SourceClient> CollectionEngine<C> {
    /// Fetch an item's metadata (when unknown) and its similarity neighbours.
    ///
    /// An expansion that yields no new item and no new edge marks the item
    /// dormant; it is parked with the penalty for a later run.
    pub(super) async fn expand_item(&mut self, id: ItemId, depth: u32, priority: f64) -> Result<()> {
        let needs_fetch = self
            .graph
            .item(id)
            .map(|item| item.attributes.is_empty())
            .unwrap_or(true);
        if needs_fetch {
            let client = &self.client;
            let remote = self.limiter.call("fetch_item", || client.fetch_item(id)).await?;
            if self.graph.upsert_attributes(id, remote.attributes, depth, Utc::now()) {
                self.summary.items_added += 1;
            }
        }

        let mut growth = Growth::default();
        let mut page = 1u32;
        for _ in 0..self.config.expansion.neighbor_pages.max(1) {
            let client = &self.client;
            let results = self
                .limiter
                .call("fetch_neighbors", || client.fetch_neighbors(id, page))
                .await?;
            let now = Utc::now();
            for neighbor in results.items {
                self.link_neighbor(id, depth, neighbor, now, &mut growth);
            }
            match results.next_page {
                Some(next) if !self.limiter.should_stop() => page = next,
                _ => break,
            }
        }

        self.summary.edges_added += growth.edges;
        let was_dormant = self.graph.item(id).is_some_and(|item| item.dormant);
        if growth.is_empty() {
            if self.graph.set_dormant(id, true) {
                self.summary.dormant_marked += 1;
            }
            self.frontier.mark_dormant(id);
            let score = self.score_of(id, Utc::now()).unwrap_or(priority);
            self.frontier.park_new(FrontierTarget::Item(id), score, depth);
            log::debug!("Item {} produced nothing new, dormant", id);
        } else {
            if was_dormant {
                self.graph.set_dormant(id, false);
                self.frontier.clear_dormant(id);
                log::debug!("Dormant item {} produced new data, reactivated", id);
            }
            log::debug!("Item {}: {} new items, {} new edges", id, growth.items, growth.edges);
        }
        Ok(())
    }

    /// Run a keyword seed. Results join the graph at the seed's depth.
    pub(super) async fn expand_query(&mut self, query: &str, depth: u32) -> Result<()> {
        let max_depth = self.config.expansion.max_expansion_depth;
        let mut page = 1u32;
        let mut found = 0usize;
        for _ in 0..self.config.expansion.seed_pages.max(1) {
            let client = &self.client;
            let results = self.limiter.call("search", || client.search(query, page)).await?;
            let now = Utc::now();
            for remote in results.items {
                found += 1;
                let id = remote.id;
                // known items were queued when first seen
                if self.graph.upsert_attributes(id, remote.attributes, depth, now) {
                    self.summary.items_added += 1;
                    if depth < max_depth {
                        self.enqueue(id, depth, now);
                    }
                }
            }
            match results.next_page {
                Some(next) if !self.limiter.should_stop() => page = next,
                _ => break,
            }
        }
        log::info!("Query {:?} returned {} items", query, found);
        Ok(())
    }

    fn link_neighbor(&mut self, source: ItemId, depth: u32, neighbor: RemoteItem, now: DateTime<Utc>, growth: &mut Growth) {
        let max_depth = self.config.expansion.max_expansion_depth;
        let id = neighbor.id;
        if id == source {
            return;
        }
        let created = self.graph.upsert_attributes(id, neighbor.attributes, depth + 1, now);
        let new_edge = self.graph.add_edge(source, id, RelationKind::Similarity);
        if created {
            growth.items += 1;
            self.summary.items_added += 1;
        }
        if new_edge {
            growth.edges += 1;
        }

        if created {
            if depth + 1 < max_depth {
                self.enqueue(id, depth + 1, now);
            }
        } else if new_edge && self.graph.item(id).is_some_and(|item| item.dormant) {
            // referenced with new context: give it another chance
            self.graph.set_dormant(id, false);
            self.frontier.clear_dormant(id);
            let item_depth = self.graph.item(id).map(|item| item.depth).unwrap_or(depth + 1);
            if item_depth < max_depth {
                self.enqueue(id, item_depth, now);
            }
        }
    }

    fn enqueue(&mut self, id: ItemId, depth: u32, now: DateTime<Utc>) {
        if let Some(score) = self.score_of(id, now) {
            self.frontier.push(FrontierTarget::Item(id), score, depth);
        }
    }

    fn score_of(&self, id: ItemId, now: DateTime<Utc>) -> Option<f64> {
        let item = self.graph.item(id)?;
        Some(self.scorer.score(item, self.graph.degree(id), now))
    }
}
