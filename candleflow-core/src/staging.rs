//! Staging artifact: the JSON hand-off between extract and load.
//!
//! Layout:
//! - `{path}`: JSON array of `{timestamp, price, entity_id}` records
//! - `{stem}.meta.json`: sidecar with provenance, BLAKE3 data hash and the
//!   degraded flag
//!
//! Both files are replaced whole on every write. The sidecar is written after
//! the artifact and carries the artifact's hash, so a sidecar left over from
//! an earlier run is detected and ignored instead of mislabelling new data.

use crate::atomic::write_atomic;
use crate::domain::PricePoint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("staging artifact not found: {path}")]
    Missing { path: PathBuf },

    #[error("staging I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed staging artifact {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

/// Provenance sidecar for a staging artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingMeta {
    pub entity_id: String,
    pub window_days: u32,
    pub extracted_at: DateTime<Utc>,
    pub point_count: usize,
    pub data_hash: String,
    pub source: String,
    /// Set when the extract degraded to an empty result; holds the reason.
    pub degraded: Option<String>,
}

impl StagingMeta {
    pub fn new(entity_id: &str, window_days: u32, source: &str, degraded: Option<String>) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            window_days,
            extracted_at: Utc::now(),
            point_count: 0,
            data_hash: String::new(),
            source: source.to_string(),
            degraded,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}

/// Points read back from an artifact, with the sidecar if it matches.
#[derive(Debug, Clone)]
pub struct StagedBatch {
    pub points: Vec<PricePoint>,
    pub meta: Option<StagingMeta>,
}

#[derive(Debug, Clone)]
pub struct StagingArtifact {
    path: PathBuf,
}

impl StagingArtifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `{dir}/{stem}.meta.json`
    pub fn meta_path(&self) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "staging".into());
        self.path.with_file_name(format!("{stem}.meta.json"))
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Replace the artifact and its sidecar. `meta` gets the count and hash filled in.
    pub fn write(&self, points: &[PricePoint], mut meta: StagingMeta) -> Result<StagingMeta, StagingError> {
        let body = serde_json::to_vec_pretty(points).map_err(|e| StagingError::Malformed {
            path: self.path.clone(),
            reason: format!("serialization: {e}"),
        })?;

        meta.point_count = points.len();
        meta.data_hash = blake3::hash(&body).to_hex().to_string();

        write_atomic(&self.path, &body).map_err(|source| StagingError::Io {
            path: self.path.clone(),
            source,
        })?;

        let meta_path = self.meta_path();
        let meta_body = serde_json::to_vec_pretty(&meta).map_err(|e| StagingError::Malformed {
            path: meta_path.clone(),
            reason: format!("serialization: {e}"),
        })?;
        write_atomic(&meta_path, &meta_body).map_err(|source| StagingError::Io {
            path: meta_path,
            source,
        })?;

        Ok(meta)
    }

    /// Read every point. A missing file is `StagingError::Missing`.
    pub fn read(&self) -> Result<Vec<PricePoint>, StagingError> {
        let body = self.read_body()?;
        self.parse_points(&body)
    }

    /// Read points plus the sidecar, dropping the sidecar if its hash does not match.
    pub fn read_batch(&self) -> Result<StagedBatch, StagingError> {
        let body = self.read_body()?;
        let points = self.parse_points(&body)?;

        let meta = match self.read_meta()? {
            Some(meta) if meta.data_hash == blake3::hash(&body).to_hex().as_str() => Some(meta),
            Some(_) => {
                log::warn!(
                    "ignoring stale staging sidecar {} (hash mismatch)",
                    self.meta_path().display()
                );
                None
            }
            None => None,
        };

        Ok(StagedBatch { points, meta })
    }

    /// Read the sidecar as-is. Missing or unparsable sidecars read as `None`.
    pub fn read_meta(&self) -> Result<Option<StagingMeta>, StagingError> {
        let meta_path = self.meta_path();
        let content = match fs::read_to_string(&meta_path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StagingError::Io {
                    path: meta_path,
                    source,
                })
            }
        };
        match serde_json::from_str(&content) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                log::warn!("unreadable staging sidecar {}: {e}", meta_path.display());
                Ok(None)
            }
        }
    }

    fn read_body(&self) -> Result<Vec<u8>, StagingError> {
        fs::read(&self.path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                StagingError::Missing {
                    path: self.path.clone(),
                }
            } else {
                StagingError::Io {
                    path: self.path.clone(),
                    source,
                }
            }
        })
    }

    fn parse_points(&self, body: &[u8]) -> Result<Vec<PricePoint>, StagingError> {
        serde_json::from_slice(body).map_err(|e| StagingError::Malformed {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }
}
