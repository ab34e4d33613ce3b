use anyhow::{Context, Result};
use confyg::{env, Confygery};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use prospect_core::model::{EntityColumns, OutputSchema};

use crate::enrich::resilience::{AdaptiveRateLimiter, AdaptiveSettings};
use crate::enrich::sources::CacheTtls;
use crate::pipeline::RunOptions;

/// Configuration for prospect.
///
/// Configuration is loaded from multiple sources with the following priority:
/// 1. CLI arguments (highest priority)
/// 2. Environment variables (PROSPECT_* prefix)
/// 3. Config file (~/.config/prospect/config.toml)
/// 4. Built-in defaults (lowest priority)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Companies House REST API key (required for profiles, filings and headcount).
    ///
    /// Can be set via:
    /// - ENV: PROSPECT_COMPANIES_HOUSE_KEY
    /// - Config: companies_house_key = "..."
    pub companies_house_key: Option<String>,

    /// OpenCage geocoding key. Without it geocoding uses Nominatim only.
    pub opencage_key: Option<String>,

    pub companies_house_base_url: String,
    pub document_base_url: String,

    /// Per-request HTTP timeout, in seconds.
    pub http_timeout_secs: u64,

    /// Rows enriched concurrently.
    ///
    /// Can be set via:
    /// - CLI: --concurrency 10
    /// - ENV: PROSPECT_MAX_CONCURRENCY
    pub max_concurrency: usize,

    /// Rows per durable flush of the output file.
    pub checkpoint_interval: usize,

    /// Deadline for one row's upstream calls, in seconds. A call still
    /// pending then leaves only its own fields empty. 0 disables the limit.
    pub row_timeout_secs: u64,

    /// Seconds rows in flight may take to finish after Ctrl-C.
    pub drain_grace_secs: u64,

    /// Path to the SQLite response cache.
    ///
    /// Default: ~/.cache/prospect/cache.db (or platform equivalent)
    pub cache_path: PathBuf,

    /// Input column holding the company number.
    pub id_column: String,

    /// Input column holding the company name.
    pub name_column: String,

    /// Reporting periods that get an `employees_<period>` output column.
    pub headcount_periods: Vec<String>,

    /// Rate limiting of web search.
    pub search: LimiterConfig,

    /// Cache lifetimes per source.
    pub cache_ttl: CacheTtls,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            companies_house_key: None,
            opencage_key: None,
            companies_house_base_url: "https://api.company-information.service.gov.uk".to_string(),
            document_base_url: "https://document-api.company-information.service.gov.uk"
                .to_string(),
            http_timeout_secs: 30,
            max_concurrency: 10,
            checkpoint_interval: 500,
            row_timeout_secs: 120,
            drain_grace_secs: 30,
            cache_path: default_cache_path(),
            id_column: "CompanyNumber".to_string(),
            name_column: "CompanyName".to_string(),
            headcount_periods: vec!["2024".to_string(), "2023".to_string(), "2022".to_string()],
            search: LimiterConfig::default(),
            cache_ttl: CacheTtls::default(),
        }
    }
}

/// Token-bucket settings for one rate-sensitive source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Starting rate, in requests per second.
    pub rate: f64,
    /// Burst capacity. Defaults to `max(1, 2 * rate)`.
    pub burst: Option<u32>,
    pub floor: f64,
    pub ceiling: f64,
    pub success_threshold: u32,
    pub failure_threshold: u32,
    pub increase_factor: f64,
    pub decrease_factor: f64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        let adaptive = AdaptiveSettings::default();
        Self {
            rate: 0.3,
            burst: None,
            floor: 0.05,
            ceiling: 2.0,
            success_threshold: adaptive.success_threshold,
            failure_threshold: adaptive.failure_threshold,
            increase_factor: adaptive.increase_factor,
            decrease_factor: adaptive.decrease_factor,
        }
    }
}

impl LimiterConfig {
    pub fn settings(&self) -> AdaptiveSettings {
        AdaptiveSettings {
            floor: self.floor,
            ceiling: self.ceiling,
            success_threshold: self.success_threshold,
            failure_threshold: self.failure_threshold,
            increase_factor: self.increase_factor,
            decrease_factor: self.decrease_factor,
        }
    }

    pub fn build(&self) -> AdaptiveRateLimiter {
        AdaptiveRateLimiter::new(self.rate, self.burst, self.settings())
    }
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Searches for config file at: ~/.config/prospect/config.toml
    /// Reads environment variables with PROSPECT_ prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_path = config_file_path();

        let mut builder = Confygery::new().context("Failed to create config builder")?;

        if config_path.exists() {
            let path_str = config_path
                .to_str()
                .ok_or_else(|| anyhow::anyhow!("Config path contains invalid UTF-8"))?;
            builder
                .add_file(path_str)
                .context("Failed to load config file")?;
        }

        let env_opts = env::Options::with_top_level("prospect");
        builder
            .add_env(env_opts)
            .context("Failed to load environment variables")?;

        let config: Self = builder
            .build()
            .context("Failed to build configuration")?;

        Ok(config)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn entity_columns(&self) -> EntityColumns {
        EntityColumns::new(&self.id_column, &self.name_column)
    }

    pub fn output_schema(&self) -> OutputSchema {
        OutputSchema::new(self.headcount_periods.iter().cloned())
    }

    /// Explicit run settings for the batch driver.
    pub fn engine_options(&self, resume: bool) -> RunOptions {
        RunOptions {
            concurrency: self.max_concurrency,
            checkpoint_interval: self.checkpoint_interval,
            resume,
            row_timeout: (self.row_timeout_secs > 0)
                .then(|| Duration::from_secs(self.row_timeout_secs)),
            drain_grace: Duration::from_secs(self.drain_grace_secs),
            ..RunOptions::default()
        }
    }
}

/// Get the default cache path.
///
/// Returns: ~/.cache/prospect/cache.db (or platform equivalent)
fn default_cache_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("prospect")
        .join("cache.db")
}

/// Get the config file path.
///
/// Returns:
/// - Linux: ~/.config/prospect/config.toml
/// - macOS: ~/Library/Application Support/prospect/config.toml
/// - Windows: %APPDATA%\prospect\config.toml
pub fn config_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("prospect")
        .join("config.toml")
}

/// Get the example config file content.
pub fn example_config() -> &'static str {
    r#"# Prospect Configuration File
#
# Configuration is loaded from multiple sources with the following priority:
# 1. CLI arguments (highest priority)
# 2. Environment variables (PROSPECT_* prefix)
# 3. This config file
# 4. Built-in defaults (lowest priority)

# Companies House API key
# Required for company profiles, filing history and headcount figures
#
# Register at: https://developer.company-information.service.gov.uk/
#
# Can also be set via:
# - Environment: PROSPECT_COMPANIES_HOUSE_KEY=your-key-here
companies_house_key = "your-companies-house-key-here"

# OpenCage geocoding key (optional)
# Without it addresses are geocoded through Nominatim at 1 request/second
#opencage_key = "your-opencage-key-here"

# Rows enriched concurrently
#
# Can also be set via:
# - CLI: prospect enrich --concurrency 10 companies.csv
max_concurrency = 10

# Rows per durable flush of the output file; also the resume granularity
checkpoint_interval = 500

# Seconds before a row's pending upstream calls give up (0 = no limit)
row_timeout_secs = 120

# Seconds rows in flight may take to finish after Ctrl-C
drain_grace_secs = 30

http_timeout_secs = 30

# Input columns identifying each company
id_column = "CompanyNumber"
name_column = "CompanyName"

# Reporting periods written as employees_<period> columns
headcount_periods = ["2024", "2023", "2022"]

# Path to the response cache
#
# Default: Platform-specific cache directory
#cache_path = "/path/to/custom/cache.db"

# Web search rate limiting. The rate adapts between floor and ceiling:
# it rises by increase_factor after success_threshold successes in a row
# and falls by decrease_factor on a rate-limit response or after
# failure_threshold recent failures.
[search]
rate = 0.3
floor = 0.05
ceiling = 2.0
success_threshold = 10
failure_threshold = 3
increase_factor = 1.1
decrease_factor = 0.5

# Cache lifetimes, in seconds
[cache_ttl]
profile_secs = 604800
filings_secs = 604800
headcount_secs = 604800
search_secs = 86400
description_secs = 604800
geocode_secs = 2592000
"#
}

/// Create default config file if it doesn't exist.
///
/// Returns true if a new file was created, false if it already existed.
pub fn ensure_config_file() -> Result<bool> {
    let config_path = config_file_path();

    if config_path.exists() {
        return Ok(false);
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create config directory")?;
    }

    std::fs::write(&config_path, example_config()).context("Failed to write config file")?;

    Ok(true)
}
