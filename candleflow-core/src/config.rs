//! Pipeline configuration.
//!
//! A `PipelineConfig` is built once at startup (defaults, then an optional
//! TOML file, then CLI overrides) and passed by reference to every stage.
//! `prepare()` must succeed before any stage runs: it validates the values and
//! makes sure the storage layout exists and is writable.
//!
//! Storage layout under `storage_root`:
//! - `data/crypto.sqlite`: the price store (raw + aggregate tables)
//! - `staging/extracted_{entity}.json`: the staging artifact (+ `.meta.json`)
//! - `charts/`: rendered charts
//! - `runs/`: run reports and `history.jsonl`
//! - `locks/`: per-entity run locks

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Durable raw table written by the loader.
pub const RAW_TABLE: &str = "raw_crypto_prices";

/// Derived daily OHLC table read by the visualizer.
pub const AGGREGATE_TABLE: &str = "daily_candlestick";

/// Longest trailing window accepted, in days.
pub const MAX_WINDOW_DAYS: u32 = 36_500;

/// Environment variable consulted when no API key is configured.
pub const API_KEY_ENV: &str = "COINGECKO_API_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("storage root {path} is not writable: {reason}")]
    StorageNotWritable { path: PathBuf, reason: String },
}

/// Everything a run needs to know, resolved before the first stage starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Tracked entity (CoinGecko coin id, e.g. `bitcoin`).
    pub entity_id: String,
    /// Quote currency for prices.
    pub vs_currency: String,
    /// Trailing lookback window in days (must be positive).
    pub window_days: u32,
    /// Root directory for every file the pipeline owns.
    pub storage_root: PathBuf,
    /// Override for the staging artifact path.
    pub staging_file: Option<PathBuf>,
    /// Override for the SQLite database path.
    pub database_file: Option<PathBuf>,
    /// Override for the chart output directory.
    pub charts_dir: Option<PathBuf>,
    pub source: SourceConfig,
    pub transform: TransformConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            entity_id: "bitcoin".into(),
            vs_currency: "usd".into(),
            window_days: 30,
            storage_root: PathBuf::from("."),
            staging_file: None,
            database_file: None,
            charts_dir: None,
            source: SourceConfig::default(),
            transform: TransformConfig::default(),
        }
    }
}

/// Market-data source settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceConfig {
    pub base_url: String,
    /// Demo API key; falls back to `COINGECKO_API_KEY`.
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.coingecko.com/api/v3".into(),
            api_key: None,
            timeout_secs: 30,
            max_retries: 3,
            base_delay_ms: 500,
        }
    }
}

impl SourceConfig {
    /// Configured key, or the environment fallback.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .filter(|k| !k.trim().is_empty())
    }
}

/// How the transform and test stages are executed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TransformConfig {
    /// Built-in SQL models run inside the price store.
    Builtin,

    /// External declarative transform tool (dbt by default).
    Command {
        program: String,
        project_dir: PathBuf,
        run_args: Vec<String>,
        test_args: Vec<String>,
    },
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self::Builtin
    }
}

impl TransformConfig {
    /// `dbt run` / `dbt test` with profiles read from the project directory.
    pub fn dbt(project_dir: impl Into<PathBuf>) -> Self {
        Self::Command {
            program: "dbt".into(),
            project_dir: project_dir.into(),
            run_args: vec!["run".into(), "--profiles-dir".into(), ".".into()],
            test_args: vec!["test".into(), "--profiles-dir".into(), ".".into()],
        }
    }
}

impl PipelineConfig {
    /// Parse a config from a TOML string. Missing fields take defaults.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Load a config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Check values without touching the filesystem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_entity_id(&self.entity_id)?;

        if self.window_days == 0 {
            return Err(ConfigError::Invalid(
                "window_days must be a positive integer".into(),
            ));
        }
        if self.window_days > MAX_WINDOW_DAYS {
            return Err(ConfigError::Invalid(format!(
                "window_days must be at most {MAX_WINDOW_DAYS}, got {}",
                self.window_days
            )));
        }
        if self.vs_currency.trim().is_empty() {
            return Err(ConfigError::Invalid("vs_currency must not be empty".into()));
        }
        if self.storage_root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("storage_root must not be empty".into()));
        }
        if let TransformConfig::Command { program, .. } = &self.transform {
            if program.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "transform.program must not be empty".into(),
                ));
            }
        }
        Ok(())
    }

    /// Validate, create the storage layout, and prove the root is writable.
    ///
    /// Failure here is fatal for the process: no stage may start.
    pub fn prepare(&self) -> Result<(), ConfigError> {
        self.validate()?;

        let not_writable = |path: &Path, e: std::io::Error| ConfigError::StorageNotWritable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };

        let mut dirs = vec![
            self.storage_root.clone(),
            self.charts_dir(),
            self.runs_dir(),
            self.locks_dir(),
        ];
        for file in [self.staging_path(), self.database_path()] {
            if let Some(parent) = file.parent() {
                dirs.push(parent.to_path_buf());
            }
        }

        for dir in &dirs {
            if dir.as_os_str().is_empty() {
                continue;
            }
            if !dir.exists() {
                log::info!("creating directory {}", dir.display());
            }
            fs::create_dir_all(dir).map_err(|e| not_writable(dir, e))?;
        }

        let probe = self
            .storage_root
            .join(format!(".candleflow-probe-{}", std::process::id()));
        fs::write(&probe, b"ok").map_err(|e| not_writable(&self.storage_root, e))?;
        let _ = fs::remove_file(&probe);

        Ok(())
    }

    /// Path of the staging artifact for this run's entity.
    pub fn staging_path(&self) -> PathBuf {
        self.staging_file.clone().unwrap_or_else(|| {
            self.storage_root
                .join("staging")
                .join(format!("extracted_{}.json", self.entity_id))
        })
    }

    /// Path of the SQLite price store.
    pub fn database_path(&self) -> PathBuf {
        self.database_file
            .clone()
            .unwrap_or_else(|| self.storage_root.join("data").join("crypto.sqlite"))
    }

    pub fn charts_dir(&self) -> PathBuf {
        self.charts_dir
            .clone()
            .unwrap_or_else(|| self.storage_root.join("charts"))
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.storage_root.join("runs")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.storage_root.join("locks")
    }

    /// Log the effective configuration at startup.
    pub fn log_effective(&self) {
        log::info!("effective configuration:");
        log::info!("  entity:        {}", self.entity_id);
        log::info!("  vs currency:   {}", self.vs_currency);
        log::info!("  window (days): {}", self.window_days);
        log::info!("  raw table:     {RAW_TABLE}");
        log::info!("  database:      {}", self.database_path().display());
        log::info!("  staging file:  {}", self.staging_path().display());
        log::info!("  charts dir:    {}", self.charts_dir().display());
        match &self.transform {
            TransformConfig::Builtin => log::info!("  transform:     builtin SQL models"),
            TransformConfig::Command {
                program,
                project_dir,
                ..
            } => log::info!(
                "  transform:     `{program}` in {}",
                project_dir.display()
            ),
        }
    }
}

/// Entity ids end up in file names and SQL parameters.
fn validate_entity_id(entity_id: &str) -> Result<(), ConfigError> {
    if entity_id.is_empty() {
        return Err(ConfigError::Invalid("entity_id must not be empty".into()));
    }
    let ok = entity_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if !ok || entity_id.starts_with('.') {
        return Err(ConfigError::Invalid(format!(
            "entity_id '{entity_id}' may only contain ASCII letters, digits, '-', '_' and '.'"
        )));
    }
    Ok(())
}
