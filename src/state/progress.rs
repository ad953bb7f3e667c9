use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::frontier::FrontierSnapshot;

/// Counters, cursors and timestamps of the collection effort.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub total_nodes: usize,
    pub total_edges: usize,
    /// Requests issued by the most recent (or current) run.
    pub session_request_count: u32,
    pub last_run_timestamp: Option<DateTime<Utc>>,
    pub frontier: FrontierSnapshot,
    #[serde(default)]
    pub lifetime_request_count: u64,
    #[serde(default)]
    pub daily_request_date: Option<NaiveDate>,
    #[serde(default)]
    pub daily_request_count: u32,
    #[serde(default)]
    pub items_expanded: u64,
    #[serde(default)]
    pub run_count: u64,
    /// Per discovery field: value -> number of graph items carrying it when last queried.
    #[serde(default)]
    pub discovered_values: BTreeMap<String, BTreeMap<String, usize>>,
}

impl ProgressRecord {
    /// Requests already spent on `day` by earlier runs.
    pub fn requests_used_on(&self, day: NaiveDate) -> u32 {
        if self.daily_request_date == Some(day) {
            self.daily_request_count
        } else {
            0
        }
    }

    /// Reset per-run counters at the start of a run.
    pub fn begin_run(&mut self, now: DateTime<Utc>) {
        self.session_request_count = 0;
        self.run_count += 1;
        self.last_run_timestamp = Some(now);
    }

    /// Bring request counters in line with the limiter's session total.
    pub fn sync_requests(&mut self, session_total: u32, day: NaiveDate) {
        let delta = session_total.saturating_sub(self.session_request_count);
        self.session_request_count = session_total;
        self.lifetime_request_count += u64::from(delta);
        if self.daily_request_date != Some(day) {
            self.daily_request_date = Some(day);
            self.daily_request_count = 0;
        }
        self.daily_request_count = self.daily_request_count.saturating_add(delta);
    }

    /// Item count recorded for `value` of `field` at its last discovery query.
    pub fn discovered_count(&self, field: &str, value: &str) -> usize {
        self.discovered_values
            .get(field)
            .and_then(|m| m.get(value))
            .copied()
            .unwrap_or(0)
    }

    pub fn mark_discovered(&mut self, field: &str, value: String, count: usize) {
        self.discovered_values
            .entry(field.to_string())
            .or_default()
            .insert(value, count);
    }
}
