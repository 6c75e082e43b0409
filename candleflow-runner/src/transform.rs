//! Transform and data-test runners.
//!
//! The transform stage rebuilds `daily_candlestick` from the raw table; the
//! test stage checks it. Neither rolls back the other: a failing test leaves
//! the rebuilt model in place.
//!
//! Two runners:
//! - `CommandTransform` shells out to an external tool (dbt by default)
//! - `SqlTransform` runs the same model as SQL inside the price store

use candleflow_core::config::{AGGREGATE_TABLE, RAW_TABLE};
use candleflow_core::{PipelineConfig, PriceStore, StoreError, TransformConfig};
use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("failed to start `{program}` in {dir}: {source}")]
    Spawn {
        program: String,
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{step} exited with status {code:?}: {summary}")]
    Failed {
        step: &'static str,
        code: Option<i32>,
        summary: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for TransformError {
    fn from(e: rusqlite::Error) -> Self {
        TransformError::Store(StoreError::Sql(e))
    }
}

/// Exit status of one transform or test invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformStatus {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub summary: String,
}

impl TransformStatus {
    pub fn ok(summary: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            summary: summary.into(),
        }
    }

    pub fn failed(code: Option<i32>, summary: impl Into<String>) -> Self {
        Self {
            code,
            summary: summary.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// `Ok(summary)` on a zero exit, otherwise the stage failure.
    pub fn into_result(self, step: &'static str) -> Result<String, TransformError> {
        if self.success() {
            Ok(self.summary)
        } else {
            Err(TransformError::Failed {
                step,
                code: self.code,
                summary: self.summary,
            })
        }
    }
}

pub trait TransformRunner: Send + Sync {
    fn name(&self) -> &str;

    /// Build the derived models.
    fn run_transform(&self, config: &PipelineConfig) -> Result<TransformStatus, TransformError>;

    /// Run the data tests against the derived models.
    fn run_tests(&self, config: &PipelineConfig) -> Result<TransformStatus, TransformError>;
}

/// Runner for the configured transform mode.
pub fn runner_for(config: &TransformConfig) -> Arc<dyn TransformRunner> {
    match config {
        TransformConfig::Builtin => Arc::new(SqlTransform),
        TransformConfig::Command {
            program,
            project_dir,
            run_args,
            test_args,
        } => Arc::new(CommandTransform {
            program: program.clone(),
            project_dir: project_dir.clone(),
            run_args: run_args.clone(),
            test_args: test_args.clone(),
        }),
    }
}

// ─── External command ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CommandTransform {
    pub program: String,
    pub project_dir: PathBuf,
    pub run_args: Vec<String>,
    pub test_args: Vec<String>,
}

impl CommandTransform {
    fn invoke(&self, args: &[String]) -> Result<TransformStatus, TransformError> {
        log::info!(
            "running `{} {}` in {}",
            self.program,
            args.join(" "),
            self.project_dir.display()
        );

        let output = Command::new(&self.program)
            .args(args)
            .current_dir(&self.project_dir)
            .output()
            .map_err(|source| TransformError::Spawn {
                program: self.program.clone(),
                dir: self.project_dir.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stdout.lines() {
            log::info!("[{}] {line}", self.program);
        }
        for line in stderr.lines() {
            log::warn!("[{}] {line}", self.program);
        }

        let summary = stdout
            .lines()
            .chain(stderr.lines())
            .filter(|l| !l.trim().is_empty())
            .last()
            .unwrap_or("")
            .trim()
            .to_string();

        Ok(TransformStatus {
            code: output.status.code(),
            summary,
        })
    }
}

impl TransformRunner for CommandTransform {
    fn name(&self) -> &str {
        &self.program
    }

    fn run_transform(&self, _config: &PipelineConfig) -> Result<TransformStatus, TransformError> {
        self.invoke(&self.run_args)
    }

    fn run_tests(&self, _config: &PipelineConfig) -> Result<TransformStatus, TransformError> {
        self.invoke(&self.test_args)
    }
}

// ─── Built-in SQL ───────────────────────────────────────────────────

/// Daily OHLC per entity. Timestamps are stored as UTC text, so the first
/// ten characters are the UTC trade date.
const DAILY_CANDLESTICK_SQL: &str = r#"
DROP TABLE IF EXISTS daily_candlestick;
CREATE TABLE daily_candlestick (
    trade_date DATE NOT NULL,
    entity_id TEXT NOT NULL,
    open DOUBLE,
    high DOUBLE,
    low DOUBLE,
    close DOUBLE
);
WITH ranked AS (
    SELECT
        entity_id,
        substr(timestamp, 1, 10) AS trade_date,
        price,
        ROW_NUMBER() OVER (
            PARTITION BY entity_id, substr(timestamp, 1, 10) ORDER BY timestamp ASC
        ) AS first_rank,
        ROW_NUMBER() OVER (
            PARTITION BY entity_id, substr(timestamp, 1, 10) ORDER BY timestamp DESC
        ) AS last_rank
    FROM raw_crypto_prices
)
INSERT INTO daily_candlestick (trade_date, entity_id, open, high, low, close)
SELECT
    trade_date,
    entity_id,
    MAX(CASE WHEN first_rank = 1 THEN price END),
    MAX(price),
    MIN(price),
    MAX(CASE WHEN last_rank = 1 THEN price END)
FROM ranked
GROUP BY entity_id, trade_date
ORDER BY entity_id, trade_date;
"#;

/// Data tests: each query counts offending rows.
const DATA_TESTS: &[(&str, &str)] = &[
    (
        "not_null_daily_candlestick_keys",
        "SELECT COUNT(*) FROM daily_candlestick
         WHERE trade_date IS NULL OR entity_id IS NULL",
    ),
    (
        "not_null_daily_candlestick_prices",
        "SELECT COUNT(*) FROM daily_candlestick
         WHERE open IS NULL OR high IS NULL OR low IS NULL OR close IS NULL",
    ),
    (
        "unique_daily_candlestick_entity_trade_date",
        "SELECT COUNT(*) FROM (
             SELECT entity_id, trade_date FROM daily_candlestick
             GROUP BY entity_id, trade_date HAVING COUNT(*) > 1
         )",
    ),
    (
        "daily_candlestick_range_is_consistent",
        "SELECT COUNT(*) FROM daily_candlestick
         WHERE low > open OR low > close OR high < open OR high < close",
    ),
    (
        "daily_candlestick_prices_non_negative",
        "SELECT COUNT(*) FROM daily_candlestick WHERE low < 0",
    ),
    (
        "not_null_raw_crypto_prices",
        "SELECT COUNT(*) FROM raw_crypto_prices
         WHERE timestamp IS NULL OR price IS NULL OR entity_id IS NULL",
    ),
];

#[derive(Debug, Clone, Copy, Default)]
pub struct SqlTransform;

impl TransformRunner for SqlTransform {
    fn name(&self) -> &str {
        "builtin-sql"
    }

    fn run_transform(&self, config: &PipelineConfig) -> Result<TransformStatus, TransformError> {
        let mut store = PriceStore::open(&config.database_path())?;
        store.ensure_raw_table()?;

        let tx = store.connection_mut().transaction()?;
        tx.execute_batch(DAILY_CANDLESTICK_SQL)?;
        let rows: i64 = tx.query_row("SELECT COUNT(*) FROM daily_candlestick", [], |r| r.get(0))?;
        tx.commit()?;

        log::info!("built {AGGREGATE_TABLE} from {RAW_TABLE}: {rows} rows");
        Ok(TransformStatus::ok(format!("{AGGREGATE_TABLE}: {rows} rows")))
    }

    fn run_tests(&self, config: &PipelineConfig) -> Result<TransformStatus, TransformError> {
        let store = PriceStore::open(&config.database_path())?;
        for table in [RAW_TABLE, AGGREGATE_TABLE] {
            if !store.table_exists(table)? {
                log::error!("data tests cannot run: table {table} does not exist");
                return Ok(TransformStatus::failed(
                    Some(1),
                    format!("missing table {table}"),
                ));
            }
        }

        let mut failed = Vec::new();
        for (name, sql) in DATA_TESTS {
            let offending: i64 = store.connection().query_row(sql, [], |r| r.get(0))?;
            if offending > 0 {
                log::error!("data test {name} failed: {offending} offending rows");
                failed.push(*name);
            } else {
                log::debug!("data test {name} passed");
            }
        }

        let total = DATA_TESTS.len();
        if failed.is_empty() {
            log::info!("all {total} data tests passed");
            Ok(TransformStatus::ok(format!("{total}/{total} data tests passed")))
        } else {
            Ok(TransformStatus::failed(
                Some(1),
                format!(
                    "{}/{total} data tests failed: {}",
                    failed.len(),
                    failed.join(", ")
                ),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rusqlite::params;

    fn config_in(dir: &std::path::Path) -> PipelineConfig {
        PipelineConfig {
            storage_root: dir.to_path_buf(),
            ..PipelineConfig::default()
        }
    }

    fn insert(config: &PipelineConfig, entity: &str, rows: &[(u32, u32, f64)]) {
        let store = PriceStore::open(&config.database_path()).unwrap();
        store.ensure_raw_table().unwrap();
        for &(day, hour, price) in rows {
            let ts = Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap();
            store
                .connection()
                .execute(
                    "INSERT INTO raw_crypto_prices (timestamp, price, entity_id) VALUES (?1, ?2, ?3)",
                    params![ts, price, entity],
                )
                .unwrap();
        }
    }

    #[test]
    fn builds_ohlc_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        // Inserted out of order on purpose.
        insert(
            &config,
            "bitcoin",
            &[(1, 12, 120.0), (1, 0, 100.0), (1, 23, 90.0), (1, 6, 130.0), (2, 0, 95.0)],
        );
        insert(&config, "ethereum", &[(1, 0, 5.0)]);

        let status = SqlTransform.run_transform(&config).unwrap();
        assert!(status.success());

        let store = PriceStore::open(&config.database_path()).unwrap();
        let days = store.daily_aggregates("bitcoin").unwrap();
        assert_eq!(days.len(), 2);
        assert_eq!(
            (days[0].open, days[0].high, days[0].low, days[0].close),
            (100.0, 130.0, 90.0, 90.0)
        );
        assert_eq!(days[0].trade_date.to_string(), "2024-01-01");
        assert_eq!((days[1].open, days[1].close), (95.0, 95.0));
        assert_eq!(store.daily_aggregates("ethereum").unwrap().len(), 1);
    }

    #[test]
    fn data_tests_pass_on_fresh_model() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        insert(&config, "bitcoin", &[(1, 0, 100.0), (2, 0, 110.0)]);

        SqlTransform.run_transform(&config).unwrap();
        let status = SqlTransform.run_tests(&config).unwrap();
        assert!(status.success(), "{}", status.summary);
    }

    #[test]
    fn data_tests_catch_inconsistent_rows() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        insert(&config, "bitcoin", &[(1, 0, 100.0)]);
        SqlTransform.run_transform(&config).unwrap();

        let store = PriceStore::open(&config.database_path()).unwrap();
        store
            .connection()
            .execute("UPDATE daily_candlestick SET high = 1.0", [])
            .unwrap();
        drop(store);

        let status = SqlTransform.run_tests(&config).unwrap();
        assert!(!status.success());
        assert!(status.summary.contains("daily_candlestick_range_is_consistent"));
        assert!(status.into_result("test").is_err());
    }

    #[test]
    fn data_tests_fail_without_model() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        insert(&config, "bitcoin", &[(1, 0, 100.0)]);

        let status = SqlTransform.run_tests(&config).unwrap();
        assert!(!status.success());
    }

    #[cfg(unix)]
    #[test]
    fn command_exit_code_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let runner = CommandTransform {
            program: "sh".into(),
            project_dir: dir.path().to_path_buf(),
            run_args: vec!["-c".into(), "echo building; exit 0".into()],
            test_args: vec!["-c".into(), "echo 1 of 2 failed >&2; exit 3".into()],
        };
        let config = config_in(dir.path());

        let ok = runner.run_transform(&config).unwrap();
        assert!(ok.success());
        assert_eq!(ok.summary, "building");

        let failed = runner.run_tests(&config).unwrap();
        assert_eq!(failed.code, Some(3));
        assert_eq!(failed.summary, "1 of 2 failed");
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = CommandTransform {
            program: "candleflow-no-such-tool".into(),
            project_dir: dir.path().to_path_buf(),
            run_args: vec![],
            test_args: vec![],
        };
        assert!(matches!(
            runner.run_transform(&config_in(dir.path())),
            Err(TransformError::Spawn { .. })
        ));
    }

    #[test]
    fn runner_for_follows_config() {
        assert_eq!(runner_for(&TransformConfig::Builtin).name(), "builtin-sql");
        assert_eq!(runner_for(&TransformConfig::dbt("dbt_project")).name(), "dbt");
    }
}
