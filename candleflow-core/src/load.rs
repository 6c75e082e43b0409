//! Load stage: idempotent, entity-scoped replace of the raw table.
//!
//! Every load deletes all rows for the entity and inserts the staged points
//! inside one `BEGIN IMMEDIATE` transaction. Running the same artifact twice
//! leaves the same row set, rows for other entities are never touched, and
//! an insert failure rolls the delete back with it.

use crate::domain::PricePoint;
use crate::staging::{StagingArtifact, StagingError};
use crate::store::{PriceStore, StoreError};
use rusqlite::{params, Transaction, TransactionBehavior};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    /// The artifact does not exist. The store is not opened.
    #[error("staging artifact not found: {path}")]
    MissingInput { path: PathBuf },

    #[error(transparent)]
    Staging(StagingError),

    #[error("staged point for '{found}' in a load for '{expected}'")]
    EntityMismatch { expected: String, found: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// An insert or the commit failed after the delete ran.
    #[error(
        "partial load for {entity_id}: {inserted}/{expected} rows inserted, \
         rolled back: {rolled_back}: {source}"
    )]
    PartialLoad {
        entity_id: String,
        inserted: usize,
        expected: usize,
        rolled_back: bool,
        #[source]
        source: rusqlite::Error,
    },
}

impl From<StagingError> for LoadError {
    fn from(e: StagingError) -> Self {
        match e {
            StagingError::Missing { path } => LoadError::MissingInput { path },
            other => LoadError::Staging(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoadOutcome {
    /// Existing rows for the entity were replaced by the staged points.
    Replaced,
    /// Artifact was empty; the store was left as it was.
    NothingToLoad,
    /// Artifact was written by a degraded extract; the store was left as it was.
    SkippedDegraded { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadResult {
    pub entity_id: String,
    pub records_written: usize,
    pub deleted: usize,
    pub outcome: LoadOutcome,
}

impl LoadResult {
    fn untouched(entity_id: &str, outcome: LoadOutcome) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            records_written: 0,
            deleted: 0,
            outcome,
        }
    }
}

/// Replace the stored rows for `entity_id` with the staged points.
pub fn load(
    artifact: &StagingArtifact,
    entity_id: &str,
    database: &Path,
) -> Result<LoadResult, LoadError> {
    if !artifact.exists() {
        log::error!(
            "staging artifact {} not found; nothing loaded",
            artifact.path().display()
        );
        return Err(LoadError::MissingInput {
            path: artifact.path().to_path_buf(),
        });
    }

    let batch = artifact.read_batch()?;

    if batch.points.is_empty() {
        if let Some(reason) = batch.meta.as_ref().and_then(|m| m.degraded.clone()) {
            log::warn!("staging for {entity_id} is degraded ({reason}); keeping existing rows");
            return Ok(LoadResult::untouched(
                entity_id,
                LoadOutcome::SkippedDegraded { reason },
            ));
        }
        log::info!("staging for {entity_id} is empty; nothing to load");
        return Ok(LoadResult::untouched(entity_id, LoadOutcome::NothingToLoad));
    }

    if let Some(stray) = batch.points.iter().find(|p| p.entity_id != entity_id) {
        return Err(LoadError::EntityMismatch {
            expected: entity_id.to_string(),
            found: stray.entity_id.clone(),
        });
    }

    let mut store = PriceStore::open(database)?;
    store.ensure_raw_table()?;

    let (deleted, written) = replace_entity_rows(&mut store, entity_id, &batch.points)?;
    log::info!(
        "loaded {written} rows for {entity_id} into {} (replaced {deleted})",
        store.path().display()
    );

    Ok(LoadResult {
        entity_id: entity_id.to_string(),
        records_written: written,
        deleted,
        outcome: LoadOutcome::Replaced,
    })
}

fn replace_entity_rows(
    store: &mut PriceStore,
    entity_id: &str,
    points: &[PricePoint],
) -> Result<(usize, usize), LoadError> {
    let conn = store.connection_mut();
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(StoreError::from)?;

    let deleted = tx
        .execute(
            "DELETE FROM raw_crypto_prices WHERE entity_id = ?1",
            params![entity_id],
        )
        .map_err(StoreError::from)?;

    let mut inserted = 0;
    if let Err(source) = insert_points(&tx, points, &mut inserted) {
        // Dropping the transaction also rolls back; do it explicitly to report it.
        let rolled_back = tx.rollback().is_ok();
        log::error!(
            "insert failed for {entity_id} after {inserted}/{} rows: {source}",
            points.len()
        );
        return Err(LoadError::PartialLoad {
            entity_id: entity_id.to_string(),
            inserted,
            expected: points.len(),
            rolled_back,
            source,
        });
    }

    if let Err(source) = tx.commit() {
        let rolled_back = conn.is_autocommit();
        log::error!("commit failed for {entity_id} after inserting {inserted} rows: {source}");
        return Err(LoadError::PartialLoad {
            entity_id: entity_id.to_string(),
            inserted,
            expected: points.len(),
            rolled_back,
            source,
        });
    }

    Ok((deleted, inserted))
}

fn insert_points(
    tx: &Transaction<'_>,
    points: &[PricePoint],
    inserted: &mut usize,
) -> Result<(), rusqlite::Error> {
    let mut stmt = tx.prepare(
        "INSERT INTO raw_crypto_prices (timestamp, price, entity_id) VALUES (?1, ?2, ?3)",
    )?;
    for point in points {
        stmt.execute(params![point.timestamp, point.price, point.entity_id])?;
        *inserted += 1;
    }
    Ok(())
}
