//! Collection engine: `Init -> LoadState -> ExpandLoop -> Finalize`.
//!
//! The engine is the only writer of the checkpoint and the frontier. Each
//! popped entry is expanded through the rate limiter, then the checkpoint is
//! saved before anything else happens, so a crash loses at most one item.

mod expand;
mod maintenance;

pub use maintenance::MaintenanceReport;

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use serde::Serialize;

use crate::backup::BackupManager;
use crate::config::Config;
use crate::discovery::BatchDiscoverer;
use crate::error::{HarvestError, Result};
use crate::frontier::{FrontierEntry, FrontierTarget, PriorityFrontier, PriorityScorer, SEED_PRIORITY};
use crate::graph::{CollectionGraph, RelationKind};
use crate::limiter::{classify, FailureClass, RateLimiter, RetryPolicy};
use crate::source::SourceClient;
use crate::state::{ProgressRecord, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    LoadState,
    ExpandLoop,
    Finalize,
}

/// Why a run ended normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    BudgetExhausted,
    FrontierExhausted,
}

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub stop_reason: Option<StopReason>,
    pub items_expanded: u64,
    pub items_added: u64,
    pub edges_added: u64,
    pub discovery_edges: u64,
    pub requests_made: u32,
    pub transient_failures: u64,
    pub rejected_items: u64,
    pub items_removed: u64,
    pub dormant_marked: u64,
    pub depth_skipped: u64,
    pub backups_created: u64,
    pub backups_rejected: u64,
}

pub struct CollectionEngine<C: SourceClient> {
    client: C,
    store: StateStore,
    backups: Option<BackupManager>,
    config: Config,
    limiter: RateLimiter,
    frontier: PriorityFrontier,
    scorer: PriorityScorer,
    discoverer: BatchDiscoverer,
    graph: CollectionGraph,
    progress: ProgressRecord,
    summary: RunSummary,
    processed_this_run: HashSet<FrontierTarget>,
    items_since_discovery: u32,
    phase: Phase,
}

impl<C: SourceClient> CollectionEngine<C> {
    /// Engine over the configured state directory and (if enabled) local backup archive.
    pub fn new(client: C, config: Config) -> Result<Self> {
        let store = StateStore::open(config.state_dir())?;
        let backups = if config.backup.enabled {
            Some(BackupManager::local(&config.backup)?)
        } else {
            None
        };
        Ok(Self::with_parts(client, store, backups, config))
    }

    pub fn with_parts(client: C, store: StateStore, backups: Option<BackupManager>, config: Config) -> Self {
        Self {
            limiter: RateLimiter::from_config(&config.api),
            frontier: PriorityFrontier::new(config.expansion.dormant_penalty),
            scorer: PriorityScorer::new(&config.expansion),
            discoverer: BatchDiscoverer::from_config(&config.discovery),
            graph: CollectionGraph::new(),
            progress: ProgressRecord::default(),
            summary: RunSummary::default(),
            processed_this_run: HashSet::new(),
            items_since_discovery: 0,
            phase: Phase::Init,
            client,
            store,
            backups,
            config,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn graph(&self) -> &CollectionGraph {
        &self.graph
    }

    pub fn progress(&self) -> &ProgressRecord {
        &self.progress
    }

    pub fn frontier(&self) -> &PriorityFrontier {
        &self.frontier
    }

    /// Run until the budget or the frontier is exhausted.
    ///
    /// A corrupt checkpoint fails the run before any request is made and is
    /// left untouched. Any other fatal error triggers a best-effort checkpoint
    /// before it is returned.
    pub async fn run(&mut self) -> Result<RunSummary> {
        self.phase = Phase::LoadState;
        self.open_state(true).await?;

        self.phase = Phase::ExpandLoop;
        let stop = match self.expand_loop().await {
            Ok(stop) => stop,
            Err(e) => {
                log::error!("Run aborted: {}", e);
                if !e.is_corruption() {
                    self.emergency_checkpoint().await;
                }
                return Err(e);
            }
        };

        self.phase = Phase::Finalize;
        self.finalize(stop).await
    }

    /// Load the checkpoint (or restore / cold start) and start the run's request accounting.
    async fn open_state(&mut self, seed_on_cold_start: bool) -> Result<()> {
        let now = Utc::now();
        let mut checkpoint = self.store.load().await?;

        if checkpoint.is_none() && self.config.backup.restore_on_cold_start {
            if let Some(backups) = &self.backups {
                match backups.restore_latest(&self.store).await {
                    Ok(Some(restored)) => {
                        log::warn!("No checkpoint found, restored the latest backup");
                        checkpoint = Some(restored);
                    }
                    Ok(None) => {}
                    Err(e) => log::warn!("Backup restore on cold start failed: {}", e),
                }
            }
        }

        let penalty = self.config.expansion.dormant_penalty;
        match checkpoint {
            Some(checkpoint) => {
                self.graph = checkpoint.graph;
                self.progress = checkpoint.progress;
                self.frontier = PriorityFrontier::from_snapshot(
                    self.progress.frontier.clone(),
                    penalty,
                    self.graph.dormant_ids(),
                );
                log::info!(
                    "Resuming: {} items, {} edges, {} frontier entries",
                    self.graph.node_count(),
                    self.graph.edge_count(),
                    self.frontier.len()
                );
            }
            None => {
                log::info!("No checkpoint found, cold start");
                self.graph = CollectionGraph::new();
                self.progress = ProgressRecord::default();
                self.frontier = PriorityFrontier::new(penalty);
                if seed_on_cold_start {
                    self.seed();
                }
            }
        }

        self.progress.begin_run(now);
        let api = &self.config.api;
        self.limiter = RateLimiter::new(api.requests_per_minute, api.request_budget_per_run, RetryPolicy::from_config(api))
            .with_daily_usage(api.daily_quota, self.progress.requests_used_on(now.date_naive()));
        log::info!("{} requests available this run", self.limiter.remaining());
        self.processed_this_run.clear();
        self.summary = RunSummary::default();
        Ok(())
    }

    fn seed(&mut self) {
        for id in &self.config.harvest.seed_items {
            self.frontier.push(FrontierTarget::Item(*id), SEED_PRIORITY, 0);
        }
        for query in &self.config.harvest.seed_queries {
            self.frontier.push(FrontierTarget::Query(query.clone()), SEED_PRIORITY, 0);
        }
        log::info!("Seeded frontier with {} entries", self.frontier.len());
    }

    async fn expand_loop(&mut self) -> Result<StopReason> {
        let max_depth = self.config.expansion.max_expansion_depth;
        loop {
            if self.limiter.should_stop() {
                log::info!("Request budget exhausted after {} requests", self.limiter.session_requests());
                return Ok(StopReason::BudgetExhausted);
            }
            let Some(entry) = self.frontier.pop() else {
                log::info!("Frontier exhausted");
                return Ok(StopReason::FrontierExhausted);
            };
            if self.processed_this_run.contains(&entry.target) {
                self.frontier.park(entry);
                continue;
            }
            if entry.depth >= max_depth {
                log::debug!("Not expanding {} at depth {}", entry.target, entry.depth);
                self.summary.depth_skipped += 1;
                continue;
            }
            self.processed_this_run.insert(entry.target.clone());

            if let Some(stop) = self.process(entry).await? {
                return Ok(stop);
            }
            self.after_item().await?;
        }
    }

    /// Expand one entry and checkpoint. Returns a stop reason when the budget
    /// ran out mid-expansion.
    async fn process(&mut self, entry: FrontierEntry) -> Result<Option<StopReason>> {
        let result = match &entry.target {
            FrontierTarget::Item(id) => self.expand_item(*id, entry.depth, entry.priority).await,
            FrontierTarget::Query(query) => self.expand_query(query, entry.depth).await,
        };

        let mut stop = None;
        match result {
            Ok(()) => {
                self.summary.items_expanded += 1;
                self.progress.items_expanded += 1;
            }
            Err(HarvestError::BudgetExhausted(n)) => {
                log::info!("Budget ran out while expanding {} ({} requests)", entry.target, n);
                self.frontier.park(entry);
                stop = Some(StopReason::BudgetExhausted);
            }
            Err(e) => match classify(&e) {
                FailureClass::Gone => {
                    if let Some(id) = entry.target.item_id() {
                        log::info!("Item {} no longer exists upstream, removing", id);
                        self.graph.remove_item(id);
                        self.frontier.clear_dormant(id);
                        self.summary.items_removed += 1;
                    } else {
                        log::warn!("Skipping {}: {}", entry.target, e);
                        self.summary.rejected_items += 1;
                    }
                }
                FailureClass::Transient | FailureClass::RateLimited => {
                    log::warn!("Skipping {} after retries, kept for a later run: {}", entry.target, e);
                    self.summary.transient_failures += 1;
                    self.frontier.park(entry);
                }
                FailureClass::Rejected => {
                    log::warn!("Dropping {}: {}", entry.target, e);
                    self.summary.rejected_items += 1;
                }
                FailureClass::Fatal => {
                    self.frontier.park(entry);
                    return Err(e);
                }
            },
        }

        self.checkpoint().await?;
        Ok(stop)
    }

    /// Backup and discovery hooks run after every processed item.
    async fn after_item(&mut self) -> Result<()> {
        self.maybe_backup().await;

        let interval = self.config.discovery.interval_items;
        if interval == 0 {
            return Ok(());
        }
        self.items_since_discovery += 1;
        if self.items_since_discovery >= interval {
            self.items_since_discovery = 0;
            if self.run_discovery().await? > 0 {
                self.checkpoint().await?;
            }
        }
        Ok(())
    }

    async fn maybe_backup(&mut self) {
        let Some(backups) = &self.backups else {
            return;
        };
        match backups
            .maybe_create_backup(&self.store, self.graph.node_count(), Utc::now())
            .await
        {
            Ok(report) => {
                self.summary.backups_created += report.created.len() as u64;
                self.summary.backups_rejected += report.rejected.len() as u64;
            }
            Err(e) => {
                log::warn!("Backup attempt failed, continuing: {}", e);
                self.summary.backups_rejected += 1;
            }
        }
    }

    /// Batch discovery over the owner and collection fields. Returns edges added.
    pub async fn run_discovery(&mut self) -> Result<usize> {
        let fields = [
            (self.config.discovery.owner_field.clone(), RelationKind::SameOwner),
            (self.config.discovery.collection_field.clone(), RelationKind::SameCollection),
        ];
        let mut added = 0;
        for (field, kind) in fields {
            if field.is_empty() || self.limiter.should_stop() {
                continue;
            }
            let candidates = BatchDiscoverer::candidate_values(&self.graph, &self.progress, &field);
            if candidates.is_empty() {
                continue;
            }
            let values: Vec<String> = candidates.iter().map(|(v, _)| v.clone()).collect();
            let outcome = self
                .discoverer
                .discover_by_attribute(&self.client, &mut self.limiter, &mut self.graph, &field, kind, &values)
                .await?;

            let counts: HashMap<String, usize> = candidates.into_iter().collect();
            for value in outcome.completed {
                if let Some(count) = counts.get(&value) {
                    self.progress.mark_discovered(&field, value, *count);
                }
            }
            added += outcome.edges_added;
            if outcome.budget_exhausted {
                break;
            }
        }
        self.summary.discovery_edges += added as u64;
        if added > 0 {
            log::info!("Discovery added {} edges", added);
        }
        Ok(added)
    }

    /// Save graph, frontier and request counters as the current checkpoint.
    async fn checkpoint(&mut self) -> Result<u64> {
        self.progress
            .sync_requests(self.limiter.session_requests(), Utc::now().date_naive());
        self.progress.frontier = self.frontier.snapshot();
        self.store.save(&mut self.graph, &mut self.progress).await
    }

    async fn emergency_checkpoint(&mut self) {
        match self.checkpoint().await {
            Ok(generation) => log::warn!("Emergency checkpoint saved (generation {})", generation),
            Err(e) => log::error!("Emergency checkpoint failed: {}", e),
        }
    }

    async fn finalize(&mut self, stop: StopReason) -> Result<RunSummary> {
        self.checkpoint().await?;
        if let Some(backups) = &self.backups {
            if let Err(e) = backups.compress_old(Utc::now()) {
                log::warn!("Backup compression failed: {}", e);
            }
        }
        self.summary.stop_reason = Some(stop);
        self.summary.requests_made = self.limiter.session_requests();
        log::info!(
            "Run finished ({:?}): {} expanded, {} items added, {} edges added, {} requests, {} items total",
            stop,
            self.summary.items_expanded,
            self.summary.items_added,
            self.summary.edges_added,
            self.summary.requests_made,
            self.graph.node_count()
        );
        Ok(self.summary.clone())
    }
}
