//! Priority formula for frontier entries.
//!
//! `priority = w_pop * norm(popularity) + w_deg * norm(degree) - w_age * norm(age)`
//! where `norm(v) = v / (v + scale)` maps `[0, inf)` onto `[0, 1)`.

use chrono::{DateTime, Utc};

use crate::config::{ExpansionConfig, PriorityWeights};
use crate::graph::Item;

/// Priority given to keyword seeds so they run before any item.
pub const SEED_PRIORITY: f64 = 10.0;

/// Scores items for the frontier.
#[derive(Debug, Clone)]
pub struct PriorityScorer {
    weights: PriorityWeights,
    popularity_field: String,
    created_field: String,
    popularity_scale: f64,
    degree_scale: f64,
    age_scale_days: f64,
}

impl PriorityScorer {
    pub fn new(config: &ExpansionConfig) -> Self {
        Self {
            weights: config.priority_weights,
            popularity_field: config.popularity_field.clone(),
            created_field: config.created_field.clone(),
            popularity_scale: config.popularity_scale.max(f64::EPSILON),
            degree_scale: config.degree_scale.max(f64::EPSILON),
            age_scale_days: config.age_scale_days.max(f64::EPSILON),
        }
    }

    /// Score an item given its current degree in the graph.
    pub fn score(&self, item: &Item, degree: usize, now: DateTime<Utc>) -> f64 {
        let popularity = item.attribute_f64(&self.popularity_field).unwrap_or(0.0);
        let age_days = self.age_days(item, now);
        self.combine(popularity, degree as f64, age_days)
    }

    /// Weighted sum of the three normalized signals.
    pub fn combine(&self, popularity: f64, degree: f64, age_days: f64) -> f64 {
        self.weights.popularity * normalize(popularity, self.popularity_scale)
            + self.weights.degree * normalize(degree, self.degree_scale)
            - self.weights.age * normalize(age_days, self.age_scale_days)
    }

    fn age_days(&self, item: &Item, now: DateTime<Utc>) -> f64 {
        let created = item
            .attributes
            .get(&self.created_field)
            .and_then(|v| v.as_str())
            .and_then(parse_timestamp);
        match created {
            Some(ts) => (now - ts).num_seconds().max(0) as f64 / 86_400.0,
            None => 0.0,
        }
    }
}

/// Saturating normalization into `[0, 1)`. Negative and NaN inputs count as zero.
pub fn normalize(value: f64, scale: f64) -> f64 {
    if value.is_nan() || value <= 0.0 {
        return 0.0;
    }
    value / (value + scale)
}

/// Accept RFC 3339 as well as the naive `YYYY-MM-DDTHH:MM:SS[.f]` form many APIs emit.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
