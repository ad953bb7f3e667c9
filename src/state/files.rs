//! On-disk layout of the JSON halves of a checkpoint and the pending/commit
//! protocol used to replace them.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ProgressRecord;
use crate::error::{HarvestError, Result};
use crate::graph::{ItemId, Relationship};

pub const TOPOLOGY_FILE: &str = "topology.json";
pub const PROGRESS_FILE: &str = "progress.json";
pub const METADATA_FILE: &str = "metadata.db";
const PENDING_SUFFIX: &str = "pending";

/// Nodes and edges only.
#[derive(Debug, Serialize, Deserialize)]
pub struct TopologyFile {
    pub generation: u64,
    pub nodes: Vec<ItemId>,
    pub edges: Vec<Relationship>,
}

/// Progress record plus the generations it vouches for.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProgressFile {
    pub generation: u64,
    pub topology_generation: u64,
    pub written_at: DateTime<Utc>,
    pub record: ProgressRecord,
}

/// Minimal view used to decide whether a pending file belongs to the committed generation.
#[derive(Deserialize)]
struct GenerationHeader {
    generation: u64,
}

pub fn pending_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(PENDING_SUFFIX);
    path.with_file_name(name)
}

/// Write `bytes` to the pending sibling of `path` and flush it to disk.
pub fn write_pending(path: &Path, bytes: &[u8]) -> Result<()> {
    let pending = pending_path(path);
    let mut file = File::create(&pending)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Move the pending sibling over `path`.
pub fn commit_pending(path: &Path) -> Result<()> {
    fs::rename(pending_path(path), path)?;
    Ok(())
}

/// Flush directory entries so completed renames survive a power loss.
#[cfg(unix)]
pub fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Directories cannot be opened for syncing here; renames are left to the OS.
#[cfg(not(unix))]
pub fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

/// Finish or discard a pending file left by an interrupted save.
///
/// A pending file whose generation equals `committed` was fully written before
/// the metadata transaction committed, so it is moved into place. Anything else
/// predates the commit and is removed. Returns true if the file was rolled forward.
pub fn recover_pending(path: &Path, committed: u64) -> Result<bool> {
    let pending = pending_path(path);
    if !pending.exists() {
        return Ok(false);
    }
    let header = fs::read(&pending)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<GenerationHeader>(&bytes).ok());
    match header {
        Some(h) if h.generation == committed => {
            log::warn!(
                "Rolling forward {} (generation {}) left by an interrupted save",
                path.display(),
                committed
            );
            fs::rename(&pending, path)?;
            Ok(true)
        }
        _ => {
            log::warn!("Discarding uncommitted {}", pending.display());
            fs::remove_file(&pending)?;
            Ok(false)
        }
    }
}

/// Read and decode a JSON artifact. Undecodable content is reported as corruption.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| HarvestError::CorruptCheckpoint(format!("{} is unreadable: {}", what, e)))
}
