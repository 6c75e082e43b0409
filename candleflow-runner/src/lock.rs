//! Per-entity run lock.
//!
//! `{locks_dir}/{entity}.lock` is created with `create_new`, so exactly one
//! process can hold it. The file records the holder and is removed when the
//! guard drops. A lock left behind by a crashed run is reported with its
//! holder and has to be removed by hand.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("a run for {entity_id} is already in progress ({holder}); remove {path} if it is stale")]
    Held {
        entity_id: String,
        path: PathBuf,
        holder: String,
    },

    #[error("failed to create lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct EntityLock {
    path: PathBuf,
    entity_id: String,
}

impl EntityLock {
    pub fn acquire(locks_dir: &Path, entity_id: &str) -> Result<Self, LockError> {
        let path = locks_dir.join(format!("{entity_id}.lock"));
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(locks_dir).map_err(io_err)?;

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(LockError::Held {
                    entity_id: entity_id.to_string(),
                    holder: describe_holder(&path),
                    path: path.clone(),
                });
            }
            Err(e) => return Err(io_err(e)),
        };

        let holder = LockHolder {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let body = serde_json::to_string(&holder)
            .map_err(|e| io_err(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        if let Err(e) = file.write_all(body.as_bytes()) {
            let _ = fs::remove_file(&path);
            return Err(io_err(e));
        }

        log::debug!("acquired run lock {}", path.display());
        Ok(Self {
            path,
            entity_id: entity_id.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }
}

impl Drop for EntityLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => log::debug!("released run lock {}", self.path.display()),
            Err(e) => log::warn!("failed to remove run lock {}: {e}", self.path.display()),
        }
    }
}

fn describe_holder(path: &Path) -> String {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str::<LockHolder>(&s).ok())
        .map(|h| format!("pid {} since {}", h.pid, h.acquired_at.to_rfc3339()))
        .unwrap_or_else(|| "unknown holder".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let dir = tempfile::tempdir().unwrap();

        let first = EntityLock::acquire(dir.path(), "bitcoin").unwrap();
        let err = EntityLock::acquire(dir.path(), "bitcoin").unwrap_err();
        match err {
            LockError::Held { holder, .. } => {
                assert!(holder.contains(&format!("pid {}", std::process::id())))
            }
            other => panic!("expected Held, got {other:?}"),
        }

        drop(first);
        assert!(EntityLock::acquire(dir.path(), "bitcoin").is_ok());
    }

    #[test]
    fn entities_lock_independently() {
        let dir = tempfile::tempdir().unwrap();
        let _btc = EntityLock::acquire(dir.path(), "bitcoin").unwrap();
        let eth = EntityLock::acquire(dir.path(), "ethereum").unwrap();
        assert_eq!(eth.entity_id(), "ethereum");
    }

    #[test]
    fn drop_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let lock = EntityLock::acquire(dir.path(), "bitcoin").unwrap();
            assert!(lock.path().exists());
            lock.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
