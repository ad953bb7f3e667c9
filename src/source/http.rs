use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use super::{RemoteItem, SearchPage, SourceClient, MAX_PAGE_SIZE};
use crate::config::ApiConfig;
use crate::error::{HarvestError, Result};
use crate::graph::ItemId;

/// Paginated list response from the search-style endpoints
#[derive(Deserialize)]
struct PageResponse {
    #[serde(default)]
    count: Option<u64>,
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    results: Vec<serde_json::Value>,
}

/// REST client for a Freesound-style API (`/search/text/`, `/sounds/{id}/`,
/// `/sounds/{id}/similar/`), token-authenticated.
///
/// Does no retrying or throttling of its own; callers go through the rate limiter.
pub struct HttpSourceClient {
    client: Client,
    base_url: Url,
    api_key: String,
    fields: String,
    page_size: u32,
}

impl HttpSourceClient {
    /// Create a new client
    ///
    /// # Arguments
    ///
    /// * `config` - API section of the configuration (base URL, timeout, fields, page size)
    /// * `api_key` - Token sent in the `Authorization` header
    pub fn new(config: &ApiConfig, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| HarvestError::Config(format!("Failed to build HTTP client: {}", e)))?;

        let mut base = config.base_url.trim_end_matches('/').to_string();
        base.push('/');
        let base_url = Url::parse(&base)
            .map_err(|e| HarvestError::Config(format!("Invalid api.base_url {}: {}", config.base_url, e)))?;

        Ok(Self {
            client,
            base_url,
            api_key,
            fields: config.fields.clone(),
            page_size: config.page_size.clamp(1, MAX_PAGE_SIZE as u32),
        })
    }

    fn endpoint(&self, path: &str, query: &[(&str, String)]) -> Result<Url> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|e| HarvestError::Config(format!("Invalid endpoint {}: {}", path, e)))?;
        url.query_pairs_mut()
            .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        Ok(url)
    }

    async fn get_json(&self, url: Url) -> Result<serde_json::Value> {
        let start = std::time::Instant::now();
        let response = self
            .client
            .get(url.clone())
            .header("Authorization", format!("Token {}", self.api_key))
            .send()
            .await
            .map_err(|e| HarvestError::Network(format!("{}: {}", url.path(), e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(HarvestError::Api {
                status: status.as_u16(),
                message: truncate(&body, 300),
            });
        }

        let value = response
            .json()
            .await
            .map_err(|e| HarvestError::Parse(format!("Failed to parse response: {}", e)))?;
        log::debug!("GET {} took {:?}", url.path(), start.elapsed());
        Ok(value)
    }

    async fn get_page(&self, url: Url, page: u32) -> Result<SearchPage> {
        let value = self.get_json(url).await?;
        parse_page(value, page)
    }

    fn list_query(&self, page: u32, page_size: u32) -> Vec<(&'static str, String)> {
        vec![
            ("fields", self.fields.clone()),
            ("page", page.max(1).to_string()),
            ("page_size", page_size.to_string()),
        ]
    }
}

#[async_trait]
impl SourceClient for HttpSourceClient {
    async fn search(&self, query: &str, page: u32) -> Result<SearchPage> {
        let mut params = self.list_query(page, self.page_size);
        params.push(("query", query.to_string()));
        let url = self.endpoint("search/text/", &params)?;
        self.get_page(url, page).await
    }

    async fn fetch_item(&self, id: ItemId) -> Result<RemoteItem> {
        let url = self.endpoint(&format!("sounds/{}/", id), &[("fields", self.fields.clone())])?;
        RemoteItem::from_json(self.get_json(url).await?)
    }

    async fn fetch_neighbors(&self, id: ItemId, page: u32) -> Result<SearchPage> {
        let url = self.endpoint(&format!("sounds/{}/similar/", id), &self.list_query(page, self.page_size))?;
        self.get_page(url, page).await
    }

    async fn lookup_by_attribute(&self, field: &str, values: &[String], page: u32) -> Result<SearchPage> {
        if values.is_empty() {
            return Ok(SearchPage::default());
        }
        let mut params = self.list_query(page, self.page_size);
        params.push(("filter", or_filter(field, values)));
        let url = self.endpoint("search/text/", &params)?;
        self.get_page(url, page).await
    }

    async fn lookup_by_ids(&self, ids: &[ItemId]) -> Result<Vec<RemoteItem>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        if ids.len() > MAX_PAGE_SIZE {
            return Err(HarvestError::InvalidInput(format!(
                "{} ids in one lookup, at most {} fit in a page",
                ids.len(),
                MAX_PAGE_SIZE
            )));
        }
        let values: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        let mut params = self.list_query(1, ids.len() as u32);
        params.push(("filter", or_filter("id", &values)));
        let url = self.endpoint("search/text/", &params)?;
        single_page(self.get_page(url, 1).await?)
    }
}

/// `field:("a" OR "b")` with embedded quotes escaped. Purely numeric values stay bare.
pub fn or_filter(field: &str, values: &[String]) -> String {
    let terms: Vec<String> = values
        .iter()
        .map(|v| {
            if !v.is_empty() && v.chars().all(|c| c.is_ascii_digit()) {
                v.clone()
            } else {
                format!("\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\""))
            }
        })
        .collect();
    format!("{}:({})", field, terms.join(" OR "))
}

/// Decode a list response. The next page comes from the `page` parameter of the
/// `next` link, falling back to `page + 1` when the link has none.
pub fn parse_page(value: serde_json::Value, page: u32) -> Result<SearchPage> {
    let response: PageResponse = serde_json::from_value(value)
        .map_err(|e| HarvestError::Parse(format!("Unexpected list response: {}", e)))?;

    let items = response
        .results
        .into_iter()
        .map(RemoteItem::from_json)
        .collect::<Result<Vec<_>>>()?;

    let next_page = response.next.map(|link| {
        Url::parse(&link)
            .ok()
            .and_then(|u| {
                u.query_pairs()
                    .find(|(k, _)| k == "page")
                    .and_then(|(_, v)| v.parse().ok())
            })
            .unwrap_or(page.max(1) + 1)
    });

    Ok(SearchPage {
        items,
        next_page,
        total: response.count,
    })
}

/// Items of a response that must fit in one page. A `next` link means some
/// ids went unanswered, so absence from the items would prove nothing.
fn single_page(page: SearchPage) -> Result<Vec<RemoteItem>> {
    if page.next_page.is_some() {
        return Err(HarvestError::Parse(format!(
            "id lookup spilled past one page ({} of {:?} results)",
            page.items.len(),
            page.total
        )));
    }
    Ok(page.items)
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
