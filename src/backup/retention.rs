//! Per-tier retention rules and the global recent-backup guard.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};

use super::manifest::{BackupTier, Manifest};
use crate::config::BackupConfig;

/// Entries protected regardless of tier policy.
pub const PROTECTED_RECENT: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct RetentionPolicy {
    pub frequent_keep: usize,
    pub frequent_max_age: Duration,
    pub moderate_keep: usize,
    pub daily_keep: usize,
}

impl RetentionPolicy {
    pub fn from_config(config: &BackupConfig) -> Self {
        Self {
            frequent_keep: config.backup_retention_count,
            frequent_max_age: Duration::days(config.frequent_max_age_days),
            moderate_keep: config.moderate_retention_count,
            daily_keep: config.daily_retention_count,
        }
    }

    /// Whether the entry at `rank` (0 = newest of its tier) survives.
    fn keeps(&self, tier: BackupTier, rank: usize, age: Duration) -> bool {
        match tier {
            // count and age both apply; the stricter one wins
            BackupTier::Frequent => rank < self.frequent_keep && age <= self.frequent_max_age,
            BackupTier::Moderate => rank < self.moderate_keep,
            BackupTier::Milestone => true,
            BackupTier::Daily => rank < self.daily_keep,
        }
    }

    /// Ids of `tier` entries that policy says to delete.
    ///
    /// Milestones are never selected, and neither are the
    /// [`PROTECTED_RECENT`] newest entries across all tiers.
    pub fn select_expired(&self, manifest: &Manifest, tier: BackupTier, now: DateTime<Utc>) -> Vec<String> {
        let protected: HashSet<String> = manifest.most_recent_ids(PROTECTED_RECENT);
        manifest
            .by_recency()
            .into_iter()
            .filter(|e| e.tier == tier)
            .enumerate()
            .filter(|(rank, e)| !self.keeps(tier, *rank, now - e.timestamp))
            .filter(|(_, e)| !protected.contains(&e.backup_id))
            .map(|(_, e)| e.backup_id.clone())
            .collect()
    }
}
