//! Durable sled-backed checkpoint store.
//!
//! One JSON document per run id. Every write replaces the whole document in a
//! single insert, so a reader never observes a mix of old and new fields.

use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use sled::{Db, Tree};
use tracing::{debug, warn};

use crate::checkpoint::run::GenerationRun;
use crate::error::StorageError;

const TREE_RUNS: &str = "generation_runs";
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Key-value persistence of run documents.
pub trait CheckpointStore: Send + Sync {
    /// Persist the full run document, replacing any previous version.
    fn put(&self, run: &GenerationRun) -> Result<(), StorageError>;

    fn get(&self, run_id: &str) -> Result<Option<GenerationRun>, StorageError>;

    /// All readable runs, most recently updated first.
    fn list(&self) -> Result<Vec<GenerationRun>, StorageError>;
}

#[derive(Clone)]
pub struct SledCheckpointStore {
    db: Db,
    runs: Tree,
}

impl SledCheckpointStore {
    pub fn new(db: Db) -> Result<Self, StorageError> {
        let runs = db.open_tree(TREE_RUNS).map_err(to_storage_io)?;
        Ok(Self { db, runs })
    }

    /// Open (or create) a sled database at `path`.
    ///
    /// sled locks the directory for the lifetime of the handle; a second
    /// opener gets [`StorageError::Locked`].
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let db = sled::open(path).map_err(|e| open_error(path, e))?;
        Self::new(db)
    }

    /// [`open`](Self::open), retrying for up to `wait` while another process
    /// holds the lock.
    pub fn open_waiting<P: AsRef<Path>>(path: P, wait: Duration) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let deadline = Instant::now() + wait;
        loop {
            match Self::open(path) {
                Err(StorageError::Locked(_)) if Instant::now() < deadline => {
                    debug!(path = %path.display(), "Checkpoint store locked, retrying");
                    std::thread::sleep(LOCK_RETRY_INTERVAL);
                }
                other => return other,
            }
        }
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map_err(to_storage_io)?;
        Ok(())
    }

    fn decode(run_id: &str, raw: &[u8]) -> Result<GenerationRun, StorageError> {
        let mut run: GenerationRun =
            serde_json::from_slice(raw).map_err(|e| StorageError::CorruptDocument {
                run_id: run_id.to_string(),
                message: e.to_string(),
            })?;
        run.normalize();
        Ok(run)
    }
}

impl CheckpointStore for SledCheckpointStore {
    fn put(&self, run: &GenerationRun) -> Result<(), StorageError> {
        let value = serde_json::to_vec(run).map_err(to_storage_data)?;
        self.runs
            .insert(run.run_id.as_bytes(), value)
            .map_err(to_storage_io)?;
        self.flush()
    }

    fn get(&self, run_id: &str) -> Result<Option<GenerationRun>, StorageError> {
        let Some(raw) = self.runs.get(run_id.as_bytes()).map_err(to_storage_io)? else {
            return Ok(None);
        };
        Self::decode(run_id, &raw).map(Some)
    }

    fn list(&self) -> Result<Vec<GenerationRun>, StorageError> {
        let mut out = Vec::new();
        for result in self.runs.iter() {
            let (key, value) = result.map_err(to_storage_io)?;
            let run_id = String::from_utf8_lossy(&key);
            match Self::decode(&run_id, &value) {
                Ok(run) => out.push(run),
                Err(error) => warn!(run_id = %run_id, error = %error, "Skipping unreadable checkpoint"),
            }
        }
        out.sort_by_key(|r| std::cmp::Reverse(r.updated_at));
        Ok(out)
    }
}

fn open_error(path: &Path, err: sled::Error) -> StorageError {
    if err.to_string().contains("could not acquire lock") {
        return StorageError::Locked(path.display().to_string());
    }
    StorageError::IoError(io::Error::new(
        io::ErrorKind::Other,
        format!("Failed to open checkpoint database: {}", err),
    ))
}

fn to_storage_io(err: sled::Error) -> StorageError {
    StorageError::IoError(io::Error::new(io::ErrorKind::Other, err.to_string()))
}

fn to_storage_data(err: serde_json::Error) -> StorageError {
    StorageError::Serialization(err.to_string())
}
