//! Batched discovery of auxiliary edges (same owner, same collection).
//!
//! Values are queried in OR-filter groups of `batch_size`, so linking n groups
//! costs about n / batch_size requests instead of one per item.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::Utc;

use crate::config::DiscoveryConfig;
use crate::error::{HarvestError, Result};
use crate::graph::{attribute_key, CollectionGraph, ItemId, RelationKind};
use crate::limiter::{classify, FailureClass, RateLimiter};
use crate::source::SourceClient;
use crate::state::ProgressRecord;

/// Result of one `discover_by_attribute` pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryOutcome {
    pub edges_added: usize,
    /// Values whose lookup finished (all requested pages fetched).
    pub completed: Vec<String>,
    pub failed_batches: usize,
    /// The pass stopped early because the request budget ran out.
    pub budget_exhausted: bool,
}

#[derive(Debug, Clone)]
pub struct BatchDiscoverer {
    batch_size: usize,
    max_pages: u32,
}

impl BatchDiscoverer {
    pub fn new(batch_size: usize, max_pages: u32) -> Self {
        Self {
            batch_size: batch_size.max(1),
            max_pages: max_pages.max(1),
        }
    }

    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self::new(config.batch_size, config.max_pages)
    }

    /// Values of `field` worth querying now, with the number of graph items carrying each.
    ///
    /// A value qualifies when at least two items carry it and that number grew
    /// since the value was last queried.
    pub fn candidate_values(graph: &CollectionGraph, progress: &ProgressRecord, field: &str) -> Vec<(String, usize)> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for item in graph.items() {
            if let Some(key) = item.attribute_key(field) {
                *counts.entry(key).or_default() += 1;
            }
        }
        counts
            .into_iter()
            .filter(|(value, count)| *count >= 2 && *count > progress.discovered_count(field, value))
            .collect()
    }

    /// Link graph items that share a value of `field`.
    ///
    /// Items returned by the source but absent from the graph are ignored;
    /// returned items already in the graph get their metadata refreshed. Edges
    /// are check-before-insert, so repeating a pass adds nothing. Per-batch
    /// failures are logged and skipped; only a fatal failure is returned.
    /// A value is reported completed only once its last page was read.
    pub async fn discover_by_attribute<C>(
        &self,
        client: &C,
        limiter: &mut RateLimiter,
        graph: &mut CollectionGraph,
        field: &str,
        kind: RelationKind,
        values: &[String],
    ) -> Result<DiscoveryOutcome>
    where
        C: SourceClient + ?Sized,
    {
        let mut outcome = DiscoveryOutcome::default();
        let unique: Vec<String> = values
            .iter()
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        for batch in unique.chunks(self.batch_size) {
            let wanted: HashSet<&str> = batch.iter().map(String::as_str).collect();
            let mut groups: BTreeMap<String, BTreeSet<ItemId>> = BTreeMap::new();
            let mut page = 1u32;
            let mut pages_fetched = 0u32;
            let mut batch_ok = true;
            let mut truncated = false;

            loop {
                if limiter.should_stop() {
                    outcome.budget_exhausted = true;
                    break;
                }
                let result = limiter
                    .call("lookup_by_attribute", || client.lookup_by_attribute(field, batch, page))
                    .await;
                let results = match result {
                    Ok(results) => results,
                    Err(HarvestError::BudgetExhausted(_)) => {
                        outcome.budget_exhausted = true;
                        break;
                    }
                    Err(err) => match classify(&err) {
                        FailureClass::Fatal => return Err(err),
                        class => {
                            log::warn!(
                                "Discovery on {} failed for a batch of {} values ({:?}), skipping: {}",
                                field,
                                batch.len(),
                                class,
                                err
                            );
                            outcome.failed_batches += 1;
                            batch_ok = false;
                            break;
                        }
                    },
                };
                pages_fetched += 1;

                let now = Utc::now();
                for remote in results.items {
                    let Some(key) = remote.attributes.get(field).and_then(attribute_key) else {
                        continue;
                    };
                    if !wanted.contains(key.as_str()) || !graph.contains(remote.id) {
                        continue;
                    }
                    graph.refresh_attributes(remote.id, remote.attributes, now);
                    groups.entry(key).or_default().insert(remote.id);
                }

                match results.next_page {
                    Some(next) if pages_fetched < self.max_pages && next > page => page = next,
                    Some(_) => {
                        truncated = true;
                        break;
                    }
                    None => break,
                }
            }

            for ids in groups.values() {
                outcome.edges_added += link_group(graph, ids, kind);
            }
            if outcome.budget_exhausted {
                log::info!("Discovery on {} stopped: request budget exhausted", field);
                break;
            }
            if truncated {
                // unseen pages remain, so these values stay eligible
                log::info!(
                    "Discovery on {} hit the {}-page cap for a batch of {} values",
                    field,
                    self.max_pages,
                    batch.len()
                );
            } else if batch_ok {
                outcome.completed.extend(batch.iter().cloned());
            }
        }

        log::debug!(
            "Discovery on {}: {} values queried, {} edges added",
            field,
            outcome.completed.len(),
            outcome.edges_added
        );
        Ok(outcome)
    }
}

/// Add every missing pairwise edge within one group.
fn link_group(graph: &mut CollectionGraph, ids: &BTreeSet<ItemId>, kind: RelationKind) -> usize {
    let ids: Vec<ItemId> = ids.iter().copied().collect();
    let mut added = 0;
    for (i, a) in ids.iter().enumerate() {
        for b in &ids[i + 1..] {
            if graph.add_edge(*a, *b, kind) {
                added += 1;
            }
        }
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Attributes;
    use crate::limiter::RetryPolicy;
    use crate::testing::MockSource;
    use serde_json::json;

    fn attrs(v: serde_json::Value) -> Attributes {
        v.as_object().unwrap().clone()
    }

    fn setup() -> (MockSource, CollectionGraph) {
        let source = MockSource::new();
        let mut graph = CollectionGraph::new();
        let now = Utc::now();
        for (id, user) in [(1, "ana"), (2, "ana"), (3, "ana"), (4, "bo"), (5, "bo"), (6, "cy")] {
            let a = attrs(json!({"id": id, "username": user}));
            source.add_item(id, a.clone());
            graph.upsert_attributes(id, a, 0, now);
        }
        // known to the source but not collected yet
        source.add_item(7, attrs(json!({"id": 7, "username": "ana"})));
        (source, graph)
    }

    fn limiter(budget: u32) -> RateLimiter {
        RateLimiter::new(1000, budget, RetryPolicy::immediate(0))
    }

    #[tokio::test]
    async fn test_discovery_links_groups_in_batches() {
        let (source, mut graph) = setup();
        let mut limiter = limiter(100);
        let discoverer = BatchDiscoverer::new(2, 3);
        let values = vec!["ana".to_string(), "bo".to_string(), "cy".to_string()];

        let outcome = discoverer
            .discover_by_attribute(&source, &mut limiter, &mut graph, "username", RelationKind::SameOwner, &values)
            .await
            .unwrap();

        // ana: 3 pairs, bo: 1 pair, cy alone
        assert_eq!(outcome.edges_added, 4);
        assert_eq!(outcome.completed.len(), 3);
        assert!(graph.has_edge(3, 1, RelationKind::SameOwner));
        assert!(!graph.contains(7));
        // two batches, one page each
        assert_eq!(source.calls(), 2);
        assert_eq!(limiter.session_requests(), 2);
    }

    #[tokio::test]
    async fn test_discovery_is_idempotent() {
        let (source, mut graph) = setup();
        let mut limiter = limiter(100);
        let discoverer = BatchDiscoverer::new(20, 1);
        let values = vec!["ana".to_string(), "bo".to_string()];

        let first = discoverer
            .discover_by_attribute(&source, &mut limiter, &mut graph, "username", RelationKind::SameOwner, &values)
            .await
            .unwrap();
        let edges = graph.edge_count();
        let second = discoverer
            .discover_by_attribute(&source, &mut limiter, &mut graph, "username", RelationKind::SameOwner, &values)
            .await
            .unwrap();

        assert_eq!(first.edges_added, 4);
        assert_eq!(second.edges_added, 0);
        assert_eq!(graph.edge_count(), edges);
    }

    #[tokio::test]
    async fn test_discovery_stops_on_budget() {
        let (source, mut graph) = setup();
        let mut limiter = limiter(1);
        let discoverer = BatchDiscoverer::new(1, 1);
        let values = vec!["ana".to_string(), "bo".to_string()];

        let outcome = discoverer
            .discover_by_attribute(&source, &mut limiter, &mut graph, "username", RelationKind::SameOwner, &values)
            .await
            .unwrap();

        assert!(outcome.budget_exhausted);
        assert_eq!(outcome.completed, vec!["ana".to_string()]);
        assert_eq!(outcome.edges_added, 3);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_batch_is_skipped() {
        let (source, mut graph) = setup();
        source.fail_lookups(503);
        let mut limiter = limiter(100);
        let discoverer = BatchDiscoverer::new(20, 1);
        let values = vec!["ana".to_string()];

        let outcome = discoverer
            .discover_by_attribute(&source, &mut limiter, &mut graph, "username", RelationKind::SameOwner, &values)
            .await
            .unwrap();
        assert_eq!(outcome.failed_batches, 1);
        assert!(outcome.completed.is_empty());
        assert_eq!(graph.edge_count(), 0);
    }

    fn crowded(count: u64) -> (MockSource, CollectionGraph) {
        let source = MockSource::new();
        let mut graph = CollectionGraph::new();
        let now = Utc::now();
        for id in 1..=count {
            let a = attrs(json!({"id": id, "username": "ana"}));
            source.add_item(id, a.clone());
            graph.upsert_attributes(id, a, 0, now);
        }
        (source, graph)
    }

    #[tokio::test]
    async fn test_page_cap_leaves_value_eligible() {
        // 60 matches span two pages of 50
        let (source, mut graph) = crowded(60);
        let mut limiter = limiter(100);
        let discoverer = BatchDiscoverer::new(20, 1);
        let values = vec!["ana".to_string()];

        let outcome = discoverer
            .discover_by_attribute(&source, &mut limiter, &mut graph, "username", RelationKind::SameOwner, &values)
            .await
            .unwrap();

        assert!(outcome.completed.is_empty());
        assert_eq!(outcome.edges_added, 50 * 49 / 2);
        assert_eq!(graph.degree(60), 0);

        let mut progress = ProgressRecord::default();
        for value in &outcome.completed {
            progress.mark_discovered("username", value.clone(), 60);
        }
        let candidates = BatchDiscoverer::candidate_values(&graph, &progress, "username");
        assert_eq!(candidates, vec![("ana".to_string(), 60)]);
    }

    #[tokio::test]
    async fn test_all_pages_complete_value() {
        let (source, mut graph) = crowded(60);
        let mut limiter = limiter(100);
        let discoverer = BatchDiscoverer::new(20, 2);
        let values = vec!["ana".to_string()];

        let outcome = discoverer
            .discover_by_attribute(&source, &mut limiter, &mut graph, "username", RelationKind::SameOwner, &values)
            .await
            .unwrap();

        assert_eq!(outcome.completed, vec!["ana".to_string()]);
        assert_eq!(outcome.edges_added, 60 * 59 / 2);
        assert_eq!(graph.degree(60), 59);
        assert_eq!(source.calls(), 2);
    }

    #[test]
    fn test_candidate_values_require_growth() {
        let (_, graph) = setup();
        let mut progress = ProgressRecord::default();
        let candidates = BatchDiscoverer::candidate_values(&graph, &progress, "username");
        assert_eq!(candidates, vec![("ana".to_string(), 3), ("bo".to_string(), 2)]);

        progress.mark_discovered("username", "ana".into(), 3);
        let candidates = BatchDiscoverer::candidate_values(&graph, &progress, "username");
        assert_eq!(candidates, vec![("bo".to_string(), 2)]);
    }
}
