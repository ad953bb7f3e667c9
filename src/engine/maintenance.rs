//! Out-of-band passes over already collected items.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::CollectionEngine;
use crate::error::{HarvestError, Result};
use crate::frontier::FrontierTarget;
use crate::graph::{Item, ItemId};
use crate::limiter::{classify, FailureClass};
use crate::source::{SourceClient, MAX_PAGE_SIZE};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MaintenanceReport {
    pub checked: usize,
    pub removed: usize,
    pub refreshed: usize,
    pub failed_batches: usize,
    pub requests_made: u32,
}

/// Up to `max` item ids, least recently stamped first (never-stamped first of all).
fn stalest<'a, F>(items: impl Iterator<Item = &'a Item>, max: usize, stamp: F) -> Vec<ItemId>
where
    F: Fn(&Item) -> Option<DateTime<Utc>>,
{
    let mut keyed: Vec<(Option<DateTime<Utc>>, ItemId)> = items.map(|i| (stamp(i), i.id)).collect();
    keyed.sort();
    keyed.into_iter().take(max).map(|(_, id)| id).collect()
}

impl<C: SourceClient> CollectionEngine<C> {
    /// Ask the source which collected items still exist and drop the rest.
    ///
    /// Checks up to `max_items`, oldest check first, in batches of the
    /// discovery batch size (never more than one page of ids). A failed batch
    /// removes nothing.
    pub async fn validate_existence(&mut self, max_items: usize) -> Result<MaintenanceReport> {
        self.open_state(false).await?;
        if self.graph.is_empty() {
            log::info!("Nothing collected yet");
            return Ok(MaintenanceReport::default());
        }
        let ids = stalest(self.graph.items(), max_items, |i| i.last_existence_check_at);
        let mut report = MaintenanceReport::default();

        for chunk in ids.chunks(self.config.discovery.batch_size.clamp(1, MAX_PAGE_SIZE)) {
            let client = &self.client;
            let found = match self
                .limiter
                .call("check_existence", || client.check_existence(chunk))
                .await
            {
                Ok(found) => found,
                Err(e) => {
                    if self.batch_failed(e, &mut report).await? {
                        break;
                    }
                    continue;
                }
            };

            let now = Utc::now();
            for &id in chunk {
                report.checked += 1;
                if found.contains(&id) {
                    self.graph.stamp_existence_check(id, now);
                } else {
                    log::info!("Item {} no longer exists upstream, removing", id);
                    self.graph.remove_item(id);
                    self.frontier.remove(&FrontierTarget::Item(id));
                    self.frontier.clear_dormant(id);
                    report.removed += 1;
                }
            }
        }

        self.checkpoint().await?;
        report.requests_made = self.limiter.session_requests();
        log::info!(
            "Existence check: {} checked, {} removed, {} failed batches",
            report.checked,
            report.removed,
            report.failed_batches
        );
        Ok(report)
    }

    /// Re-fetch metadata for up to `max_items` items, stalest first.
    ///
    /// Only attributes change; graph topology is left alone, so the metadata
    /// cache is updated in place.
    pub async fn refresh_metadata(&mut self, max_items: usize) -> Result<MaintenanceReport> {
        self.open_state(false).await?;
        if self.graph.is_empty() {
            log::info!("Nothing collected yet");
            return Ok(MaintenanceReport::default());
        }
        let ids = stalest(self.graph.items(), max_items, |i| i.last_metadata_update_at);
        let mut report = MaintenanceReport::default();

        for chunk in ids.chunks(self.config.discovery.batch_size.clamp(1, MAX_PAGE_SIZE)) {
            let client = &self.client;
            let remote = match self.limiter.call("lookup_by_ids", || client.lookup_by_ids(chunk)).await {
                Ok(remote) => remote,
                Err(e) => {
                    if self.batch_failed(e, &mut report).await? {
                        break;
                    }
                    continue;
                }
            };
            report.checked += chunk.len();
            let now = Utc::now();
            for item in remote {
                if chunk.contains(&item.id) && self.graph.refresh_attributes(item.id, item.attributes, now) {
                    report.refreshed += 1;
                }
            }
        }

        let written = self.store.update_metadata(&mut self.graph).await?;
        log::debug!("Metadata cache: {} rows updated", written);
        self.checkpoint().await?;
        report.requests_made = self.limiter.session_requests();
        log::info!("Metadata refresh: {} of {} items updated", report.refreshed, report.checked);
        Ok(report)
    }

    /// Handle a failed maintenance batch. `Ok(true)` means stop the pass.
    async fn batch_failed(&mut self, err: HarvestError, report: &mut MaintenanceReport) -> Result<bool> {
        if let HarvestError::BudgetExhausted(n) = &err {
            log::info!("Request budget exhausted after {} requests", n);
            return Ok(true);
        }
        match classify(&err) {
            FailureClass::Fatal => {
                self.emergency_checkpoint().await;
                Err(err)
            }
            class => {
                log::warn!("Maintenance batch failed ({:?}), skipping: {}", class, err);
                report.failed_batches += 1;
                Ok(false)
            }
        }
    }
}
