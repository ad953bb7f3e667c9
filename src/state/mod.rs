//! Checkpoint persistence: topology file, metadata cache and progress record.
//!
//! A save writes both JSON files as `.pending` siblings, then commits the
//! metadata rows and the new generation number in one SQLite transaction, then
//! renames the pending files into place. The SQLite commit is the commit point:
//! on load, pending files carrying the committed generation are rolled forward
//! and any others are discarded, so the three artifacts always describe the
//! same generation.

mod files;
mod metadata;
mod progress;

pub use files::{METADATA_FILE, PROGRESS_FILE, TOPOLOGY_FILE};
pub use progress::ProgressRecord;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::db::{migrate, Db};
use crate::error::{HarvestError, Result};
use crate::graph::{CollectionGraph, Item, ItemId, Relationship};
use files::{ProgressFile, TopologyFile};
use metadata::Generations;

/// A loaded checkpoint.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub graph: CollectionGraph,
    pub progress: ProgressRecord,
    pub generation: u64,
}

/// Reads and writes the checkpoint triple under one state directory.
pub struct StateStore {
    dir: PathBuf,
    db: Db,
}

/// Everything a save needs, detached from the graph so it can move to a blocking task.
struct SaveJob {
    dir: PathBuf,
    topology: Option<(Vec<ItemId>, Vec<Relationship>)>,
    upserts: Vec<Item>,
    removed: Vec<ItemId>,
    replace_all: bool,
    progress: ProgressRecord,
}

impl StateStore {
    /// Open (creating if needed) the state directory.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let db = Db::new(dir.join(METADATA_FILE));
        Ok(Self { dir, db })
    }

    /// True if any checkpoint artifact (committed or pending) is present.
    pub fn exists(&self) -> bool {
        [TOPOLOGY_FILE, PROGRESS_FILE, METADATA_FILE].iter().any(|name| {
            let path = self.dir.join(name);
            path.exists() || files::pending_path(&path).exists()
        })
    }

    /// Load the last committed checkpoint.
    ///
    /// Returns `Ok(None)` when the directory holds no checkpoint at all, and
    /// `CorruptCheckpoint` when artifacts exist but disagree with each other.
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        if !self.exists() {
            return Ok(None);
        }
        let dir = self.dir.clone();
        let checkpoint = match self
            .db
            .with_connection(move |conn| load_checkpoint(&dir, conn))
            .await?
        {
            Some(checkpoint) => checkpoint,
            None => return Ok(None),
        };
        log::info!(
            "Loaded checkpoint generation {}: {} items, {} edges",
            checkpoint.generation,
            checkpoint.graph.node_count(),
            checkpoint.graph.edge_count()
        );
        Ok(Some(checkpoint))
    }

    /// Persist the graph's pending changes and the progress record atomically.
    ///
    /// The node and edge totals in `progress` are refreshed from the graph.
    /// The topology file is rewritten only when nodes or edges changed. On
    /// success the graph's pending changes are cleared and the new generation
    /// is returned.
    pub async fn save(&self, graph: &mut CollectionGraph, progress: &mut ProgressRecord) -> Result<u64> {
        self.commit(graph, progress, false).await
    }

    /// Rewrite every artifact from `graph`, dropping rows for items it does not hold.
    pub async fn replace_all(&self, graph: &mut CollectionGraph, progress: &mut ProgressRecord) -> Result<u64> {
        graph.mark_all_pending();
        self.commit(graph, progress, true).await
    }

    /// Write metadata-only changes straight to the cache.
    ///
    /// Only rows that already exist are touched and neither the topology file
    /// nor the progress record changes. Structural changes (new or removed
    /// items, new edges) must go through [`StateStore::save`].
    pub async fn update_metadata(&self, graph: &mut CollectionGraph) -> Result<usize> {
        if graph.has_structural_changes() {
            return Err(HarvestError::InvalidInput(
                "graph has structural changes; use a full save".to_string(),
            ));
        }
        let upserts = graph.pending().upserts;
        if upserts.is_empty() {
            return Ok(0);
        }
        let updated = self
            .db
            .with_connection(move |conn| {
                migrate::run_migrations(conn)?;
                let tx = conn.transaction()?;
                let n = metadata::update_items(&tx, &upserts)?;
                tx.commit()?;
                Ok(n)
            })
            .await?;
        graph.clear_pending();
        log::debug!("Updated metadata for {} items", updated);
        Ok(updated)
    }

    async fn commit(&self, graph: &mut CollectionGraph, progress: &mut ProgressRecord, replace_all: bool) -> Result<u64> {
        progress.total_nodes = graph.node_count();
        progress.total_edges = graph.edge_count();

        let pending = graph.pending();
        let topology = pending.topology_changed.then(|| {
            (
                graph.items().map(|i| i.id).collect::<Vec<_>>(),
                graph.edges().copied().collect::<Vec<_>>(),
            )
        });
        let job = SaveJob {
            dir: self.dir.clone(),
            topology,
            upserts: pending.upserts,
            removed: pending.removed,
            replace_all,
            progress: progress.clone(),
        };

        let generation = self.db.with_connection(move |conn| run_save(job, conn)).await?;
        graph.clear_pending();
        log::debug!(
            "Checkpoint generation {} saved ({} items, {} edges)",
            generation,
            progress.total_nodes,
            progress.total_edges
        );
        Ok(generation)
    }
}

fn run_save(job: SaveJob, conn: &mut rusqlite::Connection) -> Result<u64> {
    migrate::run_migrations(conn)?;
    let current = metadata::read_generations(conn)?;
    let topology_path = job.dir.join(TOPOLOGY_FILE);
    let progress_path = job.dir.join(PROGRESS_FILE);

    // Leftovers from an interrupted save must not be mistaken for this one.
    files::recover_pending(&topology_path, current.topology)?;
    files::recover_pending(&progress_path, current.generation)?;

    let next = Generations {
        generation: current.generation + 1,
        topology: if job.topology.is_some() {
            current.generation + 1
        } else {
            current.topology
        },
    };

    if let Some((nodes, edges)) = job.topology {
        let file = TopologyFile {
            generation: next.topology,
            nodes,
            edges,
        };
        files::write_pending(&topology_path, &serde_json::to_vec(&file)?)?;
    }
    let file = ProgressFile {
        generation: next.generation,
        topology_generation: next.topology,
        written_at: Utc::now(),
        record: job.progress,
    };
    files::write_pending(&progress_path, &serde_json::to_vec_pretty(&file)?)?;

    let tx = conn.transaction()?;
    if job.replace_all {
        metadata::clear_items(&tx)?;
    } else {
        metadata::delete_items(&tx, &job.removed)?;
    }
    metadata::upsert_items(&tx, &job.upserts)?;
    metadata::write_generations(&tx, next)?;
    tx.commit()?;

    if next.topology == next.generation {
        files::commit_pending(&topology_path)?;
    }
    files::commit_pending(&progress_path)?;
    files::sync_dir(&job.dir)?;
    Ok(next.generation)
}

fn load_checkpoint(dir: &Path, conn: &mut rusqlite::Connection) -> Result<Option<Checkpoint>> {
    migrate::run_migrations(conn)?;
    let gens = metadata::read_generations(conn)?;
    let topology_path = dir.join(TOPOLOGY_FILE);
    let progress_path = dir.join(PROGRESS_FILE);

    files::recover_pending(&topology_path, gens.topology)?;
    files::recover_pending(&progress_path, gens.generation)?;

    // The very first save died before its commit: nothing was ever checkpointed.
    if gens.generation == 0
        && !progress_path.exists()
        && !topology_path.exists()
        && metadata::count_items(conn)? == 0
    {
        log::warn!("Ignoring an empty metadata cache left by an interrupted first save");
        return Ok(None);
    }

    if !progress_path.exists() {
        return Err(HarvestError::CorruptCheckpoint(
            "progress record is missing while other artifacts exist".to_string(),
        ));
    }
    if !topology_path.exists() {
        return Err(HarvestError::CorruptCheckpoint(
            "topology file is missing while other artifacts exist".to_string(),
        ));
    }

    let progress: ProgressFile = files::read_json(&progress_path, "progress record")?;
    let topology: TopologyFile = files::read_json(&topology_path, "topology file")?;

    if progress.generation != gens.generation || progress.topology_generation != gens.topology {
        return Err(HarvestError::CorruptCheckpoint(format!(
            "progress record is generation {}/{} but metadata cache is {}/{}",
            progress.generation, progress.topology_generation, gens.generation, gens.topology
        )));
    }
    if topology.generation != gens.topology {
        return Err(HarvestError::CorruptCheckpoint(format!(
            "topology file is generation {} but metadata cache expects {}",
            topology.generation, gens.topology
        )));
    }

    let rows = metadata::count_items(conn)?;
    if rows != topology.nodes.len() {
        return Err(HarvestError::CorruptCheckpoint(format!(
            "topology has {} nodes but metadata cache has {} rows",
            topology.nodes.len(),
            rows
        )));
    }
    let record = progress.record;
    if record.total_nodes != topology.nodes.len() || record.total_edges != topology.edges.len() {
        return Err(HarvestError::CorruptCheckpoint(format!(
            "progress record counts {} nodes / {} edges, topology holds {} / {}",
            record.total_nodes,
            record.total_edges,
            topology.nodes.len(),
            topology.edges.len()
        )));
    }

    let items = metadata::load_items(conn)?;
    let node_ids: BTreeSet<ItemId> = topology.nodes.iter().copied().collect();
    let row_ids: BTreeSet<ItemId> = items.iter().map(|i| i.id).collect();
    if node_ids != row_ids {
        let missing = node_ids.difference(&row_ids).next().or_else(|| row_ids.difference(&node_ids).next());
        return Err(HarvestError::CorruptCheckpoint(format!(
            "topology and metadata cache disagree on item {:?}",
            missing
        )));
    }

    let graph = CollectionGraph::from_parts(items, topology.edges)?;
    Ok(Some(Checkpoint {
        graph,
        progress: record,
        generation: gens.generation,
    }))
}
