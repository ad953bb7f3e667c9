use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::source::MAX_PAGE_SIZE;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub harvest: HarvestConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub expansion: ExpansionConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub backup: BackupConfig,
}

/// Where collection state lives and what it starts from
#[derive(Debug, Clone, Deserialize)]
pub struct HarvestConfig {
    /// Directory holding the checkpoint triple (topology, metadata cache, progress record).
    pub state_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Item ids expanded first on a cold start.
    #[serde(default)]
    pub seed_items: Vec<u64>,
    /// Keyword searches expanded on a cold start.
    #[serde(default)]
    pub seed_queries: Vec<String>,
}

/// Upstream API and request budget
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub api_key_env: String,
    pub requests_per_minute: u32,
    pub request_budget_per_run: u32,
    /// External quota per UTC day shared by every run. 0 disables the daily check.
    pub daily_quota: u32,
    pub max_retries: u32,
    pub backoff_base_secs: u64,
    pub rate_limit_backoff_secs: u64,
    pub backoff_cap_secs: u64,
    pub timeout_secs: u64,
    pub page_size: u32,
    pub fields: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://freesound.org/apiv2".to_string(),
            api_key_env: "HARVEST_API_KEY".to_string(),
            requests_per_minute: 60,
            request_budget_per_run: 1950,
            daily_quota: 2000,
            max_retries: 3,
            backoff_base_secs: 2,
            rate_limit_backoff_secs: 30,
            backoff_cap_secs: 300,
            timeout_secs: 30,
            page_size: 50,
            fields: "id,name,tags,username,pack,num_downloads,created".to_string(),
        }
    }
}

/// Weights of the frontier priority formula
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(default)]
pub struct PriorityWeights {
    pub popularity: f64,
    pub degree: f64,
    pub age: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            popularity: 0.5,
            degree: 0.3,
            age: 0.2,
        }
    }
}

/// Frontier expansion tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExpansionConfig {
    pub max_expansion_depth: u32,
    pub neighbor_pages: u32,
    pub seed_pages: u32,
    pub dormant_penalty: f64,
    pub popularity_field: String,
    pub created_field: String,
    pub popularity_scale: f64,
    pub degree_scale: f64,
    pub age_scale_days: f64,
    pub priority_weights: PriorityWeights,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            max_expansion_depth: 3,
            neighbor_pages: 1,
            seed_pages: 1,
            dormant_penalty: 1000.0,
            popularity_field: "num_downloads".to_string(),
            created_field: "created".to_string(),
            popularity_scale: 1000.0,
            degree_scale: 10.0,
            age_scale_days: 365.0,
            priority_weights: PriorityWeights::default(),
        }
    }
}

/// Batch relationship discovery
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Run discovery after this many expanded items. 0 disables discovery.
    pub interval_items: u32,
    /// Maximum values per OR-filter request, and ids per maintenance lookup.
    pub batch_size: usize,
    pub max_pages: u32,
    pub owner_field: String,
    pub collection_field: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval_items: 10,
            batch_size: 20,
            max_pages: 3,
            owner_field: "username".to_string(),
            collection_field: "pack".to_string(),
        }
    }
}

/// Tiered backup archive
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub enabled: bool,
    pub archive_dir: PathBuf,
    pub backup_interval_nodes: usize,
    pub moderate_interval_nodes: usize,
    pub milestone_interval_nodes: usize,
    pub daily_enabled: bool,
    pub backup_retention_count: usize,
    pub frequent_max_age_days: i64,
    pub moderate_retention_count: usize,
    pub daily_retention_count: usize,
    pub compression_age_days: i64,
    pub restore_on_cold_start: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            archive_dir: PathBuf::from("backups"),
            backup_interval_nodes: 25,
            moderate_interval_nodes: 100,
            milestone_interval_nodes: 500,
            daily_enabled: true,
            backup_retention_count: 5,
            frequent_max_age_days: 14,
            moderate_retention_count: 10,
            daily_retention_count: 30,
            compression_age_days: 7,
            restore_on_cold_start: true,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file
    ///
    /// Loads environment variables from .env file (if present) before loading config.
    /// Looks for config file in this order:
    /// 1. Path specified in HARVEST_CONFIG environment variable
    /// 2. ./config.toml in current directory
    pub fn load() -> Result<Self> {
        // .env is optional
        let _ = dotenv::dotenv();

        let config_path = std::env::var("HARVEST_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        Self::load_from(&config_path)
    }

    /// Load configuration from an explicit path, after reading `.env`.
    ///
    /// The API key is not required here; commands that call the API read it
    /// when they build the client.
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let _ = dotenv::dotenv();

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        Self::from_toml_str(&config_str)
    }

    /// Parse and validate a TOML document without touching the environment.
    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        let config: Config = toml::from_str(config_str).context("Failed to parse config.toml")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.api.requests_per_minute == 0 {
            anyhow::bail!("api.requests_per_minute must be greater than 0");
        }

        if self.api.request_budget_per_run == 0 {
            anyhow::bail!("api.request_budget_per_run must be greater than 0");
        }

        if self.api.daily_quota > 0 && self.api.request_budget_per_run > self.api.daily_quota {
            anyhow::bail!(
                "api.request_budget_per_run ({}) must not exceed api.daily_quota ({})",
                self.api.request_budget_per_run,
                self.api.daily_quota
            );
        }

        if self.expansion.max_expansion_depth == 0 {
            anyhow::bail!("expansion.max_expansion_depth must be at least 1");
        }

        let w = &self.expansion.priority_weights;
        if w.popularity < 0.0 || w.degree < 0.0 || w.age < 0.0 {
            anyhow::bail!("expansion.priority_weights must be non-negative");
        }

        if self.expansion.dormant_penalty <= 0.0 {
            anyhow::bail!("expansion.dormant_penalty must be positive");
        }

        if self.discovery.batch_size == 0 || self.discovery.batch_size > MAX_PAGE_SIZE {
            anyhow::bail!(
                "discovery.batch_size must be between 1 and {} (got {})",
                MAX_PAGE_SIZE,
                self.discovery.batch_size
            );
        }

        let b = &self.backup;
        if b.backup_interval_nodes == 0
            || b.moderate_interval_nodes <= b.backup_interval_nodes
            || b.milestone_interval_nodes <= b.moderate_interval_nodes
        {
            anyhow::bail!(
                "backup tier intervals must be increasing and non-zero (got {}/{}/{})",
                b.backup_interval_nodes,
                b.moderate_interval_nodes,
                b.milestone_interval_nodes
            );
        }

        Ok(())
    }

    /// Get the checkpoint directory
    pub fn state_dir(&self) -> &Path {
        &self.harvest.state_dir
    }

    /// Get the backup archive directory
    pub fn archive_dir(&self) -> &Path {
        &self.backup.archive_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serialize config tests that mutate process-wide env so they don't race.
    static CONFIG_TEST_LOCK: Mutex<()> = Mutex::new(());

    fn minimal_config(state_dir: &Path) -> String {
        let dir = state_dir.to_str().unwrap().replace('\\', "\\\\");
        format!(
            r#"
[harvest]
state_dir = "{}"
seed_items = [42]

[api]
api_key_env = "HARVEST_TEST_KEY"
request_budget_per_run = 100
"#,
            dir
        )
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::from_toml_str(&minimal_config(temp_dir.path())).unwrap();
        assert_eq!(config.harvest.seed_items, vec![42]);
        assert_eq!(config.api.request_budget_per_run, 100);
        assert_eq!(config.api.requests_per_minute, 60);
        assert_eq!(config.api.rate_limit_backoff_secs, 30);
        assert_eq!(config.api.backoff_cap_secs, 300);
        assert_eq!(config.expansion.max_expansion_depth, 3);
        assert_eq!(config.backup.backup_interval_nodes, 25);
        assert_eq!(config.backup.milestone_interval_nodes, 500);
        assert_eq!(config.backup.compression_age_days, 7);
        assert_eq!(config.expansion.priority_weights, PriorityWeights::default());
    }

    #[test]
    fn test_rejects_zero_depth() {
        let temp_dir = TempDir::new().unwrap();
        let toml = format!(
            "{}\n[expansion]\nmax_expansion_depth = 0\n",
            minimal_config(temp_dir.path())
        );
        let err = Config::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("max_expansion_depth"));
    }

    #[test]
    fn test_rejects_budget_above_daily_quota() {
        let toml = r#"
[harvest]
state_dir = "./state"

[api]
request_budget_per_run = 2500
daily_quota = 2000
"#;
        let err = Config::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("daily_quota"));
    }

    #[test]
    fn test_rejects_unordered_tiers() {
        let toml = r#"
[harvest]
state_dir = "./state"

[backup]
backup_interval_nodes = 100
moderate_interval_nodes = 100
"#;
        assert!(Config::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_rejects_batch_larger_than_a_page() {
        let temp_dir = TempDir::new().unwrap();
        let toml = format!("{}\n[discovery]\nbatch_size = 200\n", minimal_config(temp_dir.path()));
        let err = Config::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("batch_size"));

        let toml = format!("{}\n[discovery]\nbatch_size = 150\n", minimal_config(temp_dir.path()));
        assert_eq!(Config::from_toml_str(&toml).unwrap().discovery.batch_size, 150);
    }

    #[test]
    fn test_load_without_api_key() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, minimal_config(temp_dir.path())).unwrap();

        std::env::set_var("HARVEST_CONFIG", &config_path);
        std::env::remove_var("HARVEST_TEST_KEY");
        let config = Config::load();
        std::env::remove_var("HARVEST_CONFIG");

        let config = config.unwrap();
        assert_eq!(config.state_dir(), temp_dir.path());
        assert_eq!(config.api.api_key_env, "HARVEST_TEST_KEY");
    }

    #[test]
    fn test_config_invalid_path() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        std::env::set_var("HARVEST_CONFIG", "nonexistent.toml");
        let config = Config::load();
        std::env::remove_var("HARVEST_CONFIG");
        assert!(config.is_err());
    }
}
