//! Tiered snapshots of the checkpoint with retention, compression and restore.
//!
//! The manager reads the state store and writes only to the archive. A snapshot
//! is accepted into the manifest only after it has been uploaded, read back and
//! checked, and never when it holds zero items.

pub mod archive;
pub mod manifest;
pub mod retention;

pub use archive::{ArchiveStore, LocalArchive};
pub use manifest::{object_name, BackupTier, Manifest, ManifestEntry};
pub use retention::RetentionPolicy;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::BackupConfig;
use crate::error::{HarvestError, Result};
use crate::graph::{CollectionGraph, Item, Relationship};
use crate::state::{Checkpoint, ProgressRecord, StateStore};

const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Self-contained copy of one checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotBundle {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub generation: u64,
    pub progress: ProgressRecord,
    pub nodes: Vec<Item>,
    pub edges: Vec<Relationship>,
}

/// What one `maybe_create_backup` call did.
#[derive(Debug, Clone, Default)]
pub struct BackupReport {
    pub created: Vec<ManifestEntry>,
    pub rejected: Vec<(BackupTier, String)>,
    pub removed: Vec<String>,
}

pub struct BackupManager {
    archive: Box<dyn ArchiveStore>,
    config: BackupConfig,
    policy: RetentionPolicy,
}

impl BackupManager {
    pub fn new(archive: Box<dyn ArchiveStore>, config: BackupConfig) -> Self {
        let policy = RetentionPolicy::from_config(&config);
        Self { archive, config, policy }
    }

    /// Manager over a [`LocalArchive`] at `config.archive_dir`.
    pub fn local(config: &BackupConfig) -> Result<Self> {
        let archive = LocalArchive::open(&config.archive_dir)?;
        Ok(Self::new(Box::new(archive), config.clone()))
    }

    pub fn manifest(&self) -> Result<Manifest> {
        Manifest::load(self.archive.as_ref())
    }

    /// Tiers whose trigger fires for `node_count` at `now`.
    ///
    /// A count tier fires when the node count has crossed a multiple of its
    /// interval beyond the count recorded by that tier's newest entry. The daily
    /// tier fires when no daily entry exists for the current UTC date. Triggers
    /// are independent; several may fire at once.
    pub fn due_tiers(&self, manifest: &Manifest, node_count: usize, now: DateTime<Utc>) -> Vec<BackupTier> {
        let mut due = Vec::new();
        let intervals = [
            (BackupTier::Frequent, self.config.backup_interval_nodes),
            (BackupTier::Moderate, self.config.moderate_interval_nodes),
            (BackupTier::Milestone, self.config.milestone_interval_nodes),
        ];
        for (tier, interval) in intervals {
            if interval == 0 {
                continue;
            }
            let last = manifest.latest(tier).map(|e| e.node_count).unwrap_or(0);
            if node_count / interval > last / interval {
                due.push(tier);
            }
        }
        if self.config.daily_enabled {
            let today = now.date_naive();
            let has_today = manifest
                .entries
                .iter()
                .any(|e| e.tier == BackupTier::Daily && e.timestamp.date_naive() == today);
            if !has_today {
                due.push(BackupTier::Daily);
            }
        }
        due
    }

    /// Snapshot the committed checkpoint into every tier whose trigger fires.
    ///
    /// Rejected snapshots are logged and reported, never recorded. Each created
    /// tier is cleaned up afterwards.
    pub async fn maybe_create_backup(
        &self,
        store: &StateStore,
        current_node_count: usize,
        now: DateTime<Utc>,
    ) -> Result<BackupReport> {
        let mut report = BackupReport::default();
        if !self.config.enabled {
            return Ok(report);
        }
        let mut manifest = self.manifest()?;
        let due = self.due_tiers(&manifest, current_node_count, now);
        if due.is_empty() {
            return Ok(report);
        }

        let bundle = match self.snapshot_source(store, current_node_count, now).await {
            Ok(bundle) => bundle,
            Err(HarvestError::BackupRejected(reason)) => {
                for tier in due {
                    log::warn!("Rejected {} backup: {}", tier, reason);
                    report.rejected.push((tier, reason.clone()));
                }
                return Ok(report);
            }
            Err(e) => return Err(e),
        };
        let bytes = serde_json::to_vec(&bundle)?;
        let checksum = sha256_hex(&bytes);

        for tier in due {
            match self.upload(tier, &bundle, &bytes, &checksum, now) {
                Ok(entry) => {
                    log::info!(
                        "Created {} backup {} ({} items, {} edges, {} bytes)",
                        tier,
                        entry.backup_id,
                        entry.node_count,
                        entry.edge_count,
                        entry.size_bytes
                    );
                    manifest.entries.push(entry.clone());
                    report.created.push(entry);
                }
                Err(e) => {
                    log::warn!("Rejected {} backup: {}", tier, e);
                    report.rejected.push((tier, e.to_string()));
                }
            }
        }

        if !report.created.is_empty() {
            manifest.save(self.archive.as_ref())?;
            let tiers: Vec<BackupTier> = report.created.iter().map(|e| e.tier).collect();
            for tier in tiers {
                report.removed.extend(self.cleanup(tier, now)?);
            }
        }
        Ok(report)
    }

    async fn snapshot_source(
        &self,
        store: &StateStore,
        expected_nodes: usize,
        now: DateTime<Utc>,
    ) -> Result<SnapshotBundle> {
        if expected_nodes == 0 {
            return Err(HarvestError::BackupRejected("graph holds zero items".to_string()));
        }
        let checkpoint = store
            .load()
            .await?
            .ok_or_else(|| HarvestError::BackupRejected("no checkpoint to back up".to_string()))?;
        let nodes = checkpoint.graph.node_count();
        if nodes == 0 {
            return Err(HarvestError::BackupRejected("checkpoint holds zero items".to_string()));
        }
        if nodes != expected_nodes {
            return Err(HarvestError::BackupRejected(format!(
                "checkpoint holds {} items but {} were expected",
                nodes, expected_nodes
            )));
        }
        Ok(bundle_from(checkpoint, now))
    }

    /// Upload one tier's copy and verify it before it may enter the manifest.
    fn upload(
        &self,
        tier: BackupTier,
        bundle: &SnapshotBundle,
        bytes: &[u8],
        checksum: &str,
        now: DateTime<Utc>,
    ) -> Result<ManifestEntry> {
        let simple = Uuid::new_v4().simple().to_string();
        let backup_id = format!("{}-{}-{}", now.format("%Y%m%dT%H%M%SZ"), tier, &simple[..8]);
        let entry = ManifestEntry {
            backup_id,
            timestamp: now,
            tier,
            node_count: bundle.nodes.len(),
            edge_count: bundle.edges.len(),
            size_bytes: bytes.len() as u64,
            compressed: false,
            checksum: checksum.to_string(),
        };
        let name = entry.object_name();
        self.archive.put(&name, bytes)?;

        let stored = self.archive.get(&name)?.unwrap_or_default();
        if stored.len() as u64 != entry.size_bytes || sha256_hex(&stored) != entry.checksum {
            self.archive.delete(&name)?;
            return Err(HarvestError::BackupRejected(format!(
                "stored object {} does not match the snapshot ({} of {} bytes)",
                name,
                stored.len(),
                entry.size_bytes
            )));
        }
        Ok(entry)
    }

    /// Apply the tier's retention policy. Returns the removed backup ids.
    pub fn cleanup(&self, tier: BackupTier, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut manifest = self.manifest()?;
        let expired = self.policy.select_expired(&manifest, tier, now);
        if expired.is_empty() {
            return Ok(expired);
        }
        let removed: Vec<ManifestEntry> = expired.iter().filter_map(|id| manifest.remove(id)).collect();
        // manifest first, so it never lists a deleted object
        manifest.save(self.archive.as_ref())?;
        for entry in &removed {
            if let Err(e) = self.archive.delete(&entry.object_name()) {
                log::warn!("Failed to delete backup object {}: {}", entry.object_name(), e);
            }
        }
        log::info!("Retention removed {} {} backups", removed.len(), tier);
        Ok(expired)
    }

    /// Compress uncompressed snapshots older than `compression_age_days`.
    ///
    /// Only `size_bytes` and `compressed` of the manifest entry change.
    pub fn compress_old(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut manifest = self.manifest()?;
        let max_age = chrono::Duration::days(self.config.compression_age_days);
        let mut compressed = 0;

        for i in 0..manifest.entries.len() {
            let entry = &manifest.entries[i];
            if entry.compressed || now - entry.timestamp <= max_age {
                continue;
            }
            let plain_name = entry.object_name();
            let Some(plain) = self.archive.get(&plain_name)? else {
                log::warn!("Backup object {} is missing, not compressing", plain_name);
                continue;
            };
            let zipped = archive::compress(&plain)?;
            let zip_name = object_name(&entry.backup_id, true);
            self.archive.put(&zip_name, &zipped)?;

            let entry = &mut manifest.entries[i];
            entry.compressed = true;
            entry.size_bytes = zipped.len() as u64;
            manifest.save(self.archive.as_ref())?;
            self.archive.delete(&plain_name)?;
            compressed += 1;
        }
        if compressed > 0 {
            log::info!("Compressed {} backups", compressed);
        }
        Ok(compressed)
    }

    /// Fetch a snapshot and check it against its manifest entry.
    pub fn load_snapshot(&self, entry: &ManifestEntry) -> Result<SnapshotBundle> {
        let name = entry.object_name();
        let stored = self
            .archive
            .get(&name)?
            .ok_or_else(|| HarvestError::Archive(format!("backup object {} is missing", name)))?;
        let bytes = if entry.compressed {
            archive::decompress(&stored)?
        } else {
            stored
        };
        if sha256_hex(&bytes) != entry.checksum {
            return Err(HarvestError::BackupRejected(format!("checksum mismatch for {}", entry.backup_id)));
        }
        let bundle: SnapshotBundle = serde_json::from_slice(&bytes)?;
        if bundle.nodes.len() != entry.node_count || bundle.edges.len() != entry.edge_count {
            return Err(HarvestError::BackupRejected(format!(
                "{} holds {} items / {} edges, manifest says {} / {}",
                entry.backup_id,
                bundle.nodes.len(),
                bundle.edges.len(),
                entry.node_count,
                entry.edge_count
            )));
        }
        if bundle.nodes.is_empty() {
            return Err(HarvestError::BackupRejected(format!("{} holds zero items", entry.backup_id)));
        }
        Ok(bundle)
    }

    /// Replace the current checkpoint with the contents of `backup_id`.
    pub async fn restore(&self, backup_id: &str, store: &StateStore) -> Result<Checkpoint> {
        let manifest = self.manifest()?;
        let entry = manifest
            .find(backup_id)
            .ok_or_else(|| HarvestError::InvalidInput(format!("unknown backup: {}", backup_id)))?;
        let bundle = self.load_snapshot(entry)?;

        let mut graph = CollectionGraph::from_parts(bundle.nodes, bundle.edges)?;
        let mut progress = bundle.progress;
        let generation = store.replace_all(&mut graph, &mut progress).await?;
        log::info!(
            "Restored backup {} ({} items, {} edges) as checkpoint generation {}",
            backup_id,
            graph.node_count(),
            graph.edge_count(),
            generation
        );
        Ok(Checkpoint {
            graph,
            progress,
            generation,
        })
    }

    /// Restore the newest backup that passes verification. `None` if none does.
    pub async fn restore_latest(&self, store: &StateStore) -> Result<Option<Checkpoint>> {
        let manifest = self.manifest()?;
        for entry in manifest.by_recency() {
            match self.restore(&entry.backup_id, store).await {
                Ok(checkpoint) => return Ok(Some(checkpoint)),
                Err(e) if is_unusable_snapshot(&e) => {
                    log::warn!("Skipping backup {}: {}", entry.backup_id, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

fn bundle_from(checkpoint: Checkpoint, now: DateTime<Utc>) -> SnapshotBundle {
    SnapshotBundle {
        format_version: SNAPSHOT_FORMAT_VERSION,
        created_at: now,
        generation: checkpoint.generation,
        nodes: checkpoint.graph.items().cloned().collect(),
        edges: checkpoint.graph.edges().copied().collect(),
        progress: checkpoint.progress,
    }
}

/// Failures that disqualify one snapshot but say nothing about the others.
fn is_unusable_snapshot(err: &HarvestError) -> bool {
    err.is_corruption()
        || matches!(
            err,
            HarvestError::BackupRejected(_) | HarvestError::Archive(_) | HarvestError::Serialization(_)
        )
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Attributes, RelationKind};
    use chrono::Duration;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: StateStore,
        manager: BackupManager,
        graph: CollectionGraph,
        progress: ProgressRecord,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path().join("state")).unwrap();
        let config = BackupConfig {
            archive_dir: dir.path().join("backups"),
            backup_interval_nodes: 5,
            moderate_interval_nodes: 10,
            milestone_interval_nodes: 20,
            ..BackupConfig::default()
        };
        let manager = BackupManager::local(&config).unwrap();
        Fixture {
            _dir: dir,
            store,
            manager,
            graph: CollectionGraph::new(),
            progress: ProgressRecord::default(),
        }
    }

    impl Fixture {
        async fn grow_to(&mut self, n: u64) {
            let now = Utc::now();
            let start = self.graph.node_count() as u64 + 1;
            for id in start..=n {
                let attrs: Attributes = json!({"name": format!("s{}", id)}).as_object().unwrap().clone();
                self.graph.upsert_attributes(id, attrs, 1, now);
                if id > 1 {
                    self.graph.add_edge(id - 1, id, RelationKind::Similarity);
                }
            }
            self.store.save(&mut self.graph, &mut self.progress).await.unwrap();
        }
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        chrono::NaiveDate::from_ymd_opt(2024, 3, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
            .and_utc()
    }

    #[tokio::test]
    async fn test_due_tiers_fire_independently() {
        let mut f = fixture();
        f.grow_to(10).await;
        let report = f.manager.maybe_create_backup(&f.store, 10, at(1, 12)).await.unwrap();
        let tiers: Vec<BackupTier> = report.created.iter().map(|e| e.tier).collect();
        assert_eq!(tiers, vec![BackupTier::Frequent, BackupTier::Moderate, BackupTier::Daily]);
        assert_eq!(f.manager.manifest().unwrap().entries.len(), 3);

        // nothing new the same day at the same count
        let again = f.manager.maybe_create_backup(&f.store, 10, at(1, 13)).await.unwrap();
        assert!(again.created.is_empty());

        // next multiple of 5 only fires the frequent tier
        f.grow_to(15).await;
        let report = f.manager.maybe_create_backup(&f.store, 15, at(1, 14)).await.unwrap();
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.created[0].tier, BackupTier::Frequent);
        assert_eq!(report.created[0].node_count, 15);
    }

    #[tokio::test]
    async fn test_zero_content_backup_is_rejected() {
        let f = fixture();
        let report = f.manager.maybe_create_backup(&f.store, 0, at(1, 12)).await.unwrap();
        assert!(report.created.is_empty());
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].0, BackupTier::Daily);
        assert!(f.manager.manifest().unwrap().entries.is_empty());
    }

    #[tokio::test]
    async fn test_rejection_keeps_prior_manifest() {
        let mut f = fixture();
        f.grow_to(5).await;
        f.manager.maybe_create_backup(&f.store, 5, at(1, 12)).await.unwrap();
        let before = f.manager.manifest().unwrap();

        // caller claims more items than the checkpoint holds
        let report = f.manager.maybe_create_backup(&f.store, 12, at(2, 12)).await.unwrap();
        assert!(report.created.is_empty());
        assert!(!report.rejected.is_empty());
        assert_eq!(f.manager.manifest().unwrap(), before);
    }

    #[tokio::test]
    async fn test_retention_across_many_backups() {
        let mut f = fixture();
        for step in 1..=12u32 {
            f.grow_to(step as u64 * 5).await;
            f.manager
                .maybe_create_backup(&f.store, step as usize * 5, at(step, 12))
                .await
                .unwrap();

            let manifest = f.manager.manifest().unwrap();
            let milestones = manifest.entries.iter().filter(|e| e.tier == BackupTier::Milestone).count();
            assert_eq!(milestones, step as usize * 5 / 20);
            let frequent = manifest.entries.iter().filter(|e| e.tier == BackupTier::Frequent).count();
            assert!(frequent <= 5);
        }
        let manifest = f.manager.manifest().unwrap();
        let daily = manifest.entries.iter().filter(|e| e.tier == BackupTier::Daily).count();
        assert_eq!(daily, 12);
        for entry in &manifest.entries {
            assert!(f.manager.archive.get(&entry.object_name()).unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_compress_old_only_changes_size_and_flag() {
        let mut f = fixture();
        f.grow_to(5).await;
        f.manager.maybe_create_backup(&f.store, 5, at(1, 12)).await.unwrap();
        let before = f.manager.manifest().unwrap();

        assert_eq!(f.manager.compress_old(at(3, 12)).unwrap(), 0);
        let compressed = f.manager.compress_old(at(1, 12) + Duration::days(8)).unwrap();
        assert_eq!(compressed, before.entries.len());

        let after = f.manager.manifest().unwrap();
        for (old, new) in before.entries.iter().zip(&after.entries) {
            assert!(new.compressed);
            assert_eq!(old.backup_id, new.backup_id);
            assert_eq!(old.checksum, new.checksum);
            assert_eq!(old.node_count, new.node_count);
            assert!(f.manager.archive.get(&old.object_name()).unwrap().is_none());
            assert!(f.manager.load_snapshot(new).is_ok());
        }
    }

    #[tokio::test]
    async fn test_restore_replaces_checkpoint() {
        let mut f = fixture();
        f.grow_to(5).await;
        let report = f.manager.maybe_create_backup(&f.store, 5, at(1, 12)).await.unwrap();
        let backup_id = report.created[0].backup_id.clone();
        let expected = f.graph.clone();

        f.grow_to(9).await;
        let restored = f.manager.restore(&backup_id, &f.store).await.unwrap();
        assert_eq!(restored.graph, expected);

        let loaded = f.store.load().await.unwrap().unwrap();
        assert_eq!(loaded.graph, expected);
        assert_eq!(loaded.progress.total_nodes, 5);
    }

    #[tokio::test]
    async fn test_restore_rejects_tampered_snapshot() {
        let mut f = fixture();
        f.grow_to(5).await;
        let report = f.manager.maybe_create_backup(&f.store, 5, at(1, 12)).await.unwrap();
        let entry = report.created[0].clone();
        f.manager.archive.put(&entry.object_name(), b"{\"tampered\": true}").unwrap();

        let err = f.manager.restore(&entry.backup_id, &f.store).await.unwrap_err();
        assert!(matches!(err, HarvestError::BackupRejected(_)));
        assert_eq!(f.store.load().await.unwrap().unwrap().graph.node_count(), 5);
    }

    #[tokio::test]
    async fn test_restore_latest_into_empty_store() {
        let mut f = fixture();
        f.grow_to(5).await;
        f.manager.maybe_create_backup(&f.store, 5, at(1, 12)).await.unwrap();

        let dir = TempDir::new().unwrap();
        let fresh = StateStore::open(dir.path()).unwrap();
        let restored = f.manager.restore_latest(&fresh).await.unwrap().unwrap();
        assert_eq!(restored.graph.node_count(), 5);
        assert_eq!(fresh.load().await.unwrap().unwrap().graph, restored.graph);
    }
}
