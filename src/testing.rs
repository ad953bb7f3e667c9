//! In-memory `SourceClient` for tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{HarvestError, Result};
use crate::graph::{attribute_key, Attributes, ItemId};
use crate::source::{RemoteItem, SearchPage, SourceClient, MAX_PAGE_SIZE};

const PAGE_SIZE: usize = 50;

#[derive(Default)]
struct MockState {
    items: BTreeMap<ItemId, Attributes>,
    neighbors: HashMap<ItemId, Vec<ItemId>>,
    queries: HashMap<String, Vec<ItemId>>,
    /// Statuses returned, in order, by the next calls touching an item.
    scripted: HashMap<ItemId, VecDeque<u16>>,
    lookup_failure: Option<u16>,
}

/// Source double with call counting and scripted failures.
#[derive(Default)]
pub struct MockSource {
    state: Mutex<MockState>,
    calls: AtomicU32,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_item(&self, id: ItemId, attributes: Attributes) {
        self.state.lock().unwrap().items.insert(id, attributes);
    }

    pub fn set_neighbors(&self, id: ItemId, neighbors: Vec<ItemId>) {
        self.state.lock().unwrap().neighbors.insert(id, neighbors);
    }

    pub fn set_query(&self, query: &str, ids: Vec<ItemId>) {
        self.state.lock().unwrap().queries.insert(query.to_string(), ids);
    }

    /// Drop an item so later lookups answer 404.
    pub fn remove_item(&self, id: ItemId) {
        self.state.lock().unwrap().items.remove(&id);
    }

    /// Fail the next calls on `id` with the given statuses, one per call.
    pub fn script_errors(&self, id: ItemId, statuses: &[u16]) {
        self.state
            .lock()
            .unwrap()
            .scripted
            .entry(id)
            .or_default()
            .extend(statuses.iter().copied());
    }

    /// Fail every attribute and id lookup with `status`.
    pub fn fail_lookups(&self, status: u16) {
        self.state.lock().unwrap().lookup_failure = Some(status);
    }

    /// Number of calls made so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn begin(&self, id: Option<ItemId>) -> Result<std::sync::MutexGuard<'_, MockState>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if let Some(id) = id {
            if let Some(status) = state.scripted.get_mut(&id).and_then(|q| q.pop_front()) {
                return Err(HarvestError::Api {
                    status,
                    message: "scripted".to_string(),
                });
            }
        }
        Ok(state)
    }
}

fn remote(state: &MockState, id: ItemId) -> Option<RemoteItem> {
    state.items.get(&id).map(|attributes| RemoteItem {
        id,
        attributes: attributes.clone(),
    })
}

fn paginate(items: Vec<RemoteItem>, page: u32) -> SearchPage {
    let total = items.len();
    let start = (page.max(1) as usize - 1) * PAGE_SIZE;
    let page_items: Vec<RemoteItem> = items.into_iter().skip(start).take(PAGE_SIZE).collect();
    SearchPage {
        next_page: (start + PAGE_SIZE < total).then_some(page.max(1) + 1),
        total: Some(total as u64),
        items: page_items,
    }
}

fn not_found(id: ItemId) -> HarvestError {
    HarvestError::Api {
        status: 404,
        message: format!("item {} not found", id),
    }
}

#[async_trait]
impl SourceClient for MockSource {
    async fn search(&self, query: &str, page: u32) -> Result<SearchPage> {
        let state = self.begin(None)?;
        let ids = state.queries.get(query).cloned().unwrap_or_default();
        let items = ids.into_iter().filter_map(|id| remote(&state, id)).collect();
        Ok(paginate(items, page))
    }

    async fn fetch_item(&self, id: ItemId) -> Result<RemoteItem> {
        let state = self.begin(Some(id))?;
        remote(&state, id).ok_or_else(|| not_found(id))
    }

    async fn fetch_neighbors(&self, id: ItemId, page: u32) -> Result<SearchPage> {
        let state = self.begin(Some(id))?;
        if !state.items.contains_key(&id) {
            return Err(not_found(id));
        }
        let ids = state.neighbors.get(&id).cloned().unwrap_or_default();
        let items = ids.into_iter().filter_map(|n| remote(&state, n)).collect();
        Ok(paginate(items, page))
    }

    async fn lookup_by_attribute(&self, field: &str, values: &[String], page: u32) -> Result<SearchPage> {
        let state = self.begin(None)?;
        if let Some(status) = state.lookup_failure {
            return Err(HarvestError::Api {
                status,
                message: "lookup failed".to_string(),
            });
        }
        let wanted: HashSet<&str> = values.iter().map(String::as_str).collect();
        let items = state
            .items
            .iter()
            .filter(|(_, attrs)| {
                attrs
                    .get(field)
                    .and_then(attribute_key)
                    .is_some_and(|k| wanted.contains(k.as_str()))
            })
            .map(|(id, attrs)| RemoteItem {
                id: *id,
                attributes: attrs.clone(),
            })
            .collect();
        Ok(paginate(items, page))
    }

    async fn lookup_by_ids(&self, ids: &[ItemId]) -> Result<Vec<RemoteItem>> {
        let state = self.begin(None)?;
        if let Some(status) = state.lookup_failure {
            return Err(HarvestError::Api {
                status,
                message: "lookup failed".to_string(),
            });
        }
        if ids.len() > MAX_PAGE_SIZE {
            return Err(HarvestError::InvalidInput(format!("{} ids exceed one page", ids.len())));
        }
        Ok(ids.iter().filter_map(|id| remote(&state, *id)).collect())
    }
}
