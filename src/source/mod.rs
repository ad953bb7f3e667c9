//! Upstream data source seam.
//!
//! The engine only sees [`SourceClient`]; the concrete protocol lives in
//! [`http::HttpSourceClient`]. Every call made through this trait is one request
//! against the external quota.

pub mod http;

pub use http::HttpSourceClient;

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::{HarvestError, Result};
use crate::graph::{Attributes, ItemId};

/// Largest page the source will serve. A batched id lookup must fit in one.
pub const MAX_PAGE_SIZE: usize = 150;

/// One item as returned by the source: id plus the requested field set.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteItem {
    pub id: ItemId,
    pub attributes: Attributes,
}

impl RemoteItem {
    /// Build from a JSON object carrying an integer `id` field.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let attributes = match value {
            serde_json::Value::Object(map) => map,
            other => {
                return Err(HarvestError::Parse(format!("expected object, got {}", other)));
            }
        };
        let id = attributes
            .get("id")
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .ok_or_else(|| HarvestError::Parse("result without integer id".to_string()))?;
        Ok(Self { id, attributes })
    }
}

/// One page of a paginated result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchPage {
    pub items: Vec<RemoteItem>,
    /// Page number to request next, if any.
    pub next_page: Option<u32>,
    /// Total result count reported by the source, if any.
    pub total: Option<u64>,
}

/// Operations the engine needs from the upstream API.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Keyword search, one page.
    async fn search(&self, query: &str, page: u32) -> Result<SearchPage>;

    /// Metadata for a single item. A vanished item surfaces as an API 404.
    async fn fetch_item(&self, id: ItemId) -> Result<RemoteItem>;

    /// Items the source considers similar to `id`, one page.
    async fn fetch_neighbors(&self, id: ItemId, page: u32) -> Result<SearchPage>;

    /// Items whose `field` equals any of `values` (one OR-filter request), one page.
    async fn lookup_by_attribute(&self, field: &str, values: &[String], page: u32) -> Result<SearchPage>;

    /// Batched metadata lookup by id, at most [`MAX_PAGE_SIZE`] ids per call.
    async fn lookup_by_ids(&self, ids: &[ItemId]) -> Result<Vec<RemoteItem>>;

    /// Which of `ids` still exist, in one request.
    async fn check_existence(&self, ids: &[ItemId]) -> Result<HashSet<ItemId>> {
        Ok(self.lookup_by_ids(ids).await?.into_iter().map(|i| i.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_remote_item_from_json() {
        let item = RemoteItem::from_json(json!({"id": 12, "name": "rain", "username": "ana"})).unwrap();
        assert_eq!(item.id, 12);
        assert_eq!(item.attributes["name"], "rain");

        let string_id = RemoteItem::from_json(json!({"id": "77"})).unwrap();
        assert_eq!(string_id.id, 77);
    }

    #[test]
    fn test_remote_item_requires_id() {
        assert!(matches!(RemoteItem::from_json(json!({"name": "x"})), Err(HarvestError::Parse(_))));
        assert!(matches!(RemoteItem::from_json(json!([1, 2])), Err(HarvestError::Parse(_))));
    }
}
