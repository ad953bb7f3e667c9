pub mod config;
pub mod error;
pub mod db;
pub mod graph;
pub mod frontier;
pub mod limiter;
pub mod source;
pub mod state;
pub mod discovery;
pub mod backup;
pub mod engine;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use engine::{CollectionEngine, RunSummary, StopReason};
pub use error::{HarvestError, Result};
