use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::archive::ArchiveStore;
use crate::error::{HarvestError, Result};

pub const MANIFEST_NAME: &str = "manifest.json";
const MANIFEST_VERSION: u32 = 1;

/// Retention class of a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupTier {
    Frequent,
    Moderate,
    Milestone,
    Daily,
}

impl BackupTier {
    pub const ALL: [BackupTier; 4] = [
        BackupTier::Frequent,
        BackupTier::Moderate,
        BackupTier::Milestone,
        BackupTier::Daily,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BackupTier::Frequent => "frequent",
            BackupTier::Moderate => "moderate",
            BackupTier::Milestone => "milestone",
            BackupTier::Daily => "daily",
        }
    }
}

impl fmt::Display for BackupTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackupTier {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self> {
        BackupTier::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| HarvestError::InvalidInput(format!("unknown backup tier: {}", s)))
    }
}

/// One accepted backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub backup_id: String,
    pub timestamp: DateTime<Utc>,
    pub tier: BackupTier,
    pub node_count: usize,
    pub edge_count: usize,
    /// Stored object size; changes when the snapshot is compressed.
    pub size_bytes: u64,
    pub compressed: bool,
    /// SHA-256 of the uncompressed snapshot JSON.
    pub checksum: String,
}

impl ManifestEntry {
    /// Archive object holding this snapshot.
    pub fn object_name(&self) -> String {
        object_name(&self.backup_id, self.compressed)
    }
}

pub fn object_name(backup_id: &str, compressed: bool) -> String {
    if compressed {
        format!("{}.zip", backup_id)
    } else {
        format!("{}.json", backup_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub entries: Vec<ManifestEntry>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            entries: Vec::new(),
        }
    }
}

impl Manifest {
    /// Read the manifest from the archive; an absent manifest is empty.
    pub fn load(archive: &dyn ArchiveStore) -> Result<Self> {
        match archive.get(MANIFEST_NAME)? {
            None => Ok(Self::default()),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| HarvestError::Archive(format!("manifest is unreadable: {}", e))),
        }
    }

    pub fn save(&self, archive: &dyn ArchiveStore) -> Result<()> {
        archive.put(MANIFEST_NAME, &serde_json::to_vec_pretty(self)?)
    }

    pub fn find(&self, backup_id: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.backup_id == backup_id)
    }

    /// Newest entry of `tier`.
    pub fn latest(&self, tier: BackupTier) -> Option<&ManifestEntry> {
        self.entries
            .iter()
            .filter(|e| e.tier == tier)
            .max_by(|a, b| recency(a, b))
    }

    /// All entries, newest first.
    pub fn by_recency(&self) -> Vec<&ManifestEntry> {
        let mut entries: Vec<&ManifestEntry> = self.entries.iter().collect();
        entries.sort_by(|a, b| recency(b, a));
        entries
    }

    /// Ids of the `n` newest entries across every tier.
    pub fn most_recent_ids(&self, n: usize) -> HashSet<String> {
        self.by_recency()
            .into_iter()
            .take(n)
            .map(|e| e.backup_id.clone())
            .collect()
    }

    pub fn remove(&mut self, backup_id: &str) -> Option<ManifestEntry> {
        let pos = self.entries.iter().position(|e| e.backup_id == backup_id)?;
        Some(self.entries.remove(pos))
    }
}

/// Older-before-newer ordering; ids break timestamp ties.
fn recency(a: &ManifestEntry, b: &ManifestEntry) -> std::cmp::Ordering {
    a.timestamp.cmp(&b.timestamp).then_with(|| a.backup_id.cmp(&b.backup_id))
}
