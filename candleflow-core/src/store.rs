//! SQLite price store.
//!
//! Owns one connection for the lifetime of a stage. The connection is closed
//! when the `PriceStore` is dropped, so every exit path of a stage releases it.
//!
//! Tables:
//! - `raw_crypto_prices`: written by the loader (delete-then-insert per entity)
//! - `daily_candlestick`: written by the transform, read by the visualizer

use crate::config::{AGGREGATE_TABLE, RAW_TABLE};
use crate::domain::{DailyAggregate, RawPriceRecord};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Canonical raw table. Safe to run on every invocation.
const RAW_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS raw_crypto_prices (
    timestamp TIMESTAMP NOT NULL,
    price DOUBLE NOT NULL,
    entity_id TEXT NOT NULL,
    loaded_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_raw_crypto_prices_entity
    ON raw_crypto_prices (entity_id);
"#;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open store {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to create store directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store query failed: {0}")]
    Sql(#[from] rusqlite::Error),
}

/// Per-entity row counts for status reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySummary {
    pub entity_id: String,
    pub raw_rows: usize,
    pub first_timestamp: Option<String>,
    pub last_timestamp: Option<String>,
    pub daily_rows: usize,
}

pub struct PriceStore {
    conn: Connection,
    path: PathBuf,
}

impl PriceStore {
    /// Open (or create) the store read-write.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        log::debug!("opened store {}", path.display());

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing store read-only. `Ok(None)` if the file does not exist.
    pub fn open_read_only(path: &Path) -> Result<Option<Self>, StoreError> {
        if !path.is_file() {
            return Ok(None);
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        log::debug!("opened store {} read-only", path.display());

        Ok(Some(Self {
            conn,
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn ensure_raw_table(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(RAW_TABLE_DDL)?;
        Ok(())
    }

    pub fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Number of raw rows held for `entity_id`.
    pub fn count_for(&self, entity_id: &str) -> Result<usize, StoreError> {
        if !self.table_exists(RAW_TABLE)? {
            return Ok(0);
        }
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM raw_crypto_prices WHERE entity_id = ?1",
            params![entity_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Raw rows for `entity_id`, oldest first.
    pub fn records_for(&self, entity_id: &str) -> Result<Vec<RawPriceRecord>, StoreError> {
        if !self.table_exists(RAW_TABLE)? {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(
            "SELECT timestamp, price, entity_id, loaded_at
             FROM raw_crypto_prices
             WHERE entity_id = ?1
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![entity_id], |row| {
            Ok(RawPriceRecord {
                timestamp: row.get(0)?,
                price: row.get(1)?,
                entity_id: row.get(2)?,
                loaded_at: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Daily candles for `entity_id`, ordered by date. Empty if the model was never built.
    pub fn daily_aggregates(&self, entity_id: &str) -> Result<Vec<DailyAggregate>, StoreError> {
        if !self.table_exists(AGGREGATE_TABLE)? {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(
            "SELECT trade_date, entity_id, open, high, low, close
             FROM daily_candlestick
             WHERE entity_id = ?1
             ORDER BY trade_date ASC",
        )?;
        let rows = stmt.query_map(params![entity_id], |row| {
            Ok(DailyAggregate {
                trade_date: row.get(0)?,
                entity_id: row.get(1)?,
                open: row.get(2)?,
                high: row.get(3)?,
                low: row.get(4)?,
                close: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Row counts per entity across both tables.
    pub fn summaries(&self) -> Result<Vec<EntitySummary>, StoreError> {
        if !self.table_exists(RAW_TABLE)? {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(
            "SELECT entity_id, COUNT(*), MIN(timestamp), MAX(timestamp)
             FROM raw_crypto_prices
             GROUP BY entity_id
             ORDER BY entity_id",
        )?;
        let mut summaries = stmt
            .query_map([], |row| {
                Ok(EntitySummary {
                    entity_id: row.get(0)?,
                    raw_rows: row.get::<_, i64>(1)? as usize,
                    first_timestamp: row.get(2)?,
                    last_timestamp: row.get(3)?,
                    daily_rows: 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        if self.table_exists(AGGREGATE_TABLE)? {
            for summary in &mut summaries {
                let days: i64 = self.conn.query_row(
                    "SELECT COUNT(*) FROM daily_candlestick WHERE entity_id = ?1",
                    params![summary.entity_id],
                    |row| row.get(0),
                )?;
                summary.daily_rows = days as usize;
            }
        }

        Ok(summaries)
    }
}

impl Drop for PriceStore {
    fn drop(&mut self) {
        log::debug!("closing store connection {}", self.path.display());
    }
}
