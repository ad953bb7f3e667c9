//! Row-level access to the metadata cache (`items` and `checkpoint_meta`).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{HarvestError, Result};
use crate::graph::{Attributes, Item, ItemId};

const GENERATION_KEY: &str = "generation";
const TOPOLOGY_GENERATION_KEY: &str = "topology_generation";

/// Committed generations recorded in `checkpoint_meta`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Generations {
    pub generation: u64,
    pub topology: u64,
}

pub fn read_generations(conn: &Connection) -> Result<Generations> {
    Ok(Generations {
        generation: read_meta_u64(conn, GENERATION_KEY)?,
        topology: read_meta_u64(conn, TOPOLOGY_GENERATION_KEY)?,
    })
}

pub fn write_generations(conn: &Connection, gens: Generations) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO checkpoint_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )?;
    stmt.execute(params![GENERATION_KEY, gens.generation.to_string()])?;
    stmt.execute(params![TOPOLOGY_GENERATION_KEY, gens.topology.to_string()])?;
    Ok(())
}

fn read_meta_u64(conn: &Connection, key: &str) -> Result<u64> {
    let value: Option<String> = conn
        .query_row("SELECT value FROM checkpoint_meta WHERE key = ?1", [key], |row| row.get(0))
        .optional()?;
    match value {
        None => Ok(0),
        Some(v) => v
            .parse()
            .map_err(|_| HarvestError::CorruptCheckpoint(format!("checkpoint_meta.{} is not a number: {}", key, v))),
    }
}

/// Insert or overwrite full rows.
pub fn upsert_items(conn: &Connection, items: &[Item]) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO items (id, attributes_json, depth, dormant, discovered_at,
                            last_existence_check_at, last_metadata_update_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
            attributes_json = excluded.attributes_json,
            depth = excluded.depth,
            dormant = excluded.dormant,
            discovered_at = excluded.discovered_at,
            last_existence_check_at = excluded.last_existence_check_at,
            last_metadata_update_at = excluded.last_metadata_update_at",
    )?;
    for item in items {
        stmt.execute(params![
            to_sql_id(item.id)?,
            serde_json::to_string(&item.attributes)?,
            item.depth,
            item.dormant,
            item.discovered_at.to_rfc3339(),
            item.last_existence_check_at.map(|t| t.to_rfc3339()),
            item.last_metadata_update_at.map(|t| t.to_rfc3339()),
        ])?;
    }
    Ok(())
}

/// Overwrite rows that already exist; ids without a row are skipped.
pub fn update_items(conn: &Connection, items: &[Item]) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "UPDATE items SET attributes_json = ?2, depth = ?3, dormant = ?4,
                last_existence_check_at = ?5, last_metadata_update_at = ?6
         WHERE id = ?1",
    )?;
    let mut updated = 0;
    for item in items {
        updated += stmt.execute(params![
            to_sql_id(item.id)?,
            serde_json::to_string(&item.attributes)?,
            item.depth,
            item.dormant,
            item.last_existence_check_at.map(|t| t.to_rfc3339()),
            item.last_metadata_update_at.map(|t| t.to_rfc3339()),
        ])?;
    }
    Ok(updated)
}

pub fn delete_items(conn: &Connection, ids: &[ItemId]) -> Result<()> {
    let mut stmt = conn.prepare_cached("DELETE FROM items WHERE id = ?1")?;
    for id in ids {
        stmt.execute([to_sql_id(*id)?])?;
    }
    Ok(())
}

pub fn clear_items(conn: &Connection) -> Result<()> {
    conn.execute("DELETE FROM items", [])?;
    Ok(())
}

pub fn count_items(conn: &Connection) -> Result<usize> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?;
    Ok(count as usize)
}

pub fn load_items(conn: &Connection) -> Result<Vec<Item>> {
    let mut stmt = conn.prepare(
        "SELECT id, attributes_json, depth, dormant, discovered_at,
                last_existence_check_at, last_metadata_update_at
         FROM items ORDER BY id",
    )?;
    let rows = stmt
        .query_map([], read_row)?
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
    rows.into_iter().map(RawRow::into_item).collect()
}

struct RawRow {
    id: i64,
    attributes_json: String,
    depth: u32,
    dormant: bool,
    discovered_at: String,
    last_existence_check_at: Option<String>,
    last_metadata_update_at: Option<String>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        attributes_json: row.get(1)?,
        depth: row.get(2)?,
        dormant: row.get(3)?,
        discovered_at: row.get(4)?,
        last_existence_check_at: row.get(5)?,
        last_metadata_update_at: row.get(6)?,
    })
}

impl RawRow {
    fn into_item(self) -> Result<Item> {
        let id = self.id as ItemId;
        let attributes: Attributes = serde_json::from_str(&self.attributes_json)
            .map_err(|e| HarvestError::CorruptCheckpoint(format!("item {} has unreadable attributes: {}", id, e)))?;
        Ok(Item {
            id,
            attributes,
            depth: self.depth,
            dormant: self.dormant,
            discovered_at: parse_time(id, &self.discovered_at)?,
            last_existence_check_at: self.last_existence_check_at.as_deref().map(|t| parse_time(id, t)).transpose()?,
            last_metadata_update_at: self.last_metadata_update_at.as_deref().map(|t| parse_time(id, t)).transpose()?,
        })
    }
}

fn parse_time(id: ItemId, text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| HarvestError::CorruptCheckpoint(format!("item {} has bad timestamp {}: {}", id, text, e)))
}

fn to_sql_id(id: ItemId) -> Result<i64> {
    i64::try_from(id).map_err(|_| HarvestError::InvalidInput(format!("item id {} exceeds the storable range", id)))
}
