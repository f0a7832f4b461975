//! Where the monitor reads run documents from.
//!
//! A running worker holds the sled lock on its checkpoint store for as long as
//! it lives. [`WorkspaceRunSource`] opens the store only for the duration of
//! one read, and asks the worker's `/runs` endpoints whenever the store is
//! locked, so the monitor can follow a live run and never keeps a worker from
//! starting.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::checkpoint::{CheckpointStore, GenerationRun, SledCheckpointStore};
use crate::error::StorageError;

const WORKER_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const WORKER_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Read-only access to persisted runs.
#[async_trait]
pub trait RunSource: Send + Sync {
    async fn get_run(&self, run_id: &str) -> Result<Option<GenerationRun>, StorageError>;

    /// Most recently updated first.
    async fn list_runs(&self) -> Result<Vec<GenerationRun>, StorageError>;
}

/// An already opened store, typically shared with the writer in-process.
pub struct StoreRunSource {
    store: Arc<dyn CheckpointStore>,
}

impl StoreRunSource {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RunSource for StoreRunSource {
    async fn get_run(&self, run_id: &str) -> Result<Option<GenerationRun>, StorageError> {
        self.store.get(run_id)
    }

    async fn list_runs(&self) -> Result<Vec<GenerationRun>, StorageError> {
        self.store.list()
    }
}

/// Run documents served by a live worker.
pub struct WorkerRunSource {
    client: Client,
    base_url: String,
}

fn map_http_error(base_url: &str, error: reqwest::Error) -> StorageError {
    if error.is_connect() {
        StorageError::Remote(format!("worker at {} is unreachable: {}", base_url, error))
    } else if error.is_timeout() {
        StorageError::Remote(format!("worker at {} timed out: {}", base_url, error))
    } else if error.is_decode() {
        StorageError::Remote(format!("worker at {} sent an unreadable run: {}", base_url, error))
    } else {
        StorageError::Remote(format!("request to {} failed: {}", base_url, error))
    }
}

impl WorkerRunSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self, StorageError> {
        let client = Client::builder()
            .no_proxy()
            .connect_timeout(WORKER_CONNECT_TIMEOUT)
            .timeout(WORKER_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StorageError::Remote(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl RunSource for WorkerRunSource {
    async fn get_run(&self, run_id: &str) -> Result<Option<GenerationRun>, StorageError> {
        let resp = self
            .client
            .get(format!("{}/runs/{}", self.base_url, run_id))
            .send()
            .await
            .map_err(|e| map_http_error(&self.base_url, e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let mut run: GenerationRun = resp
            .error_for_status()
            .map_err(|e| map_http_error(&self.base_url, e))?
            .json()
            .await
            .map_err(|e| map_http_error(&self.base_url, e))?;
        run.normalize();
        Ok(Some(run))
    }

    async fn list_runs(&self) -> Result<Vec<GenerationRun>, StorageError> {
        let mut runs: Vec<GenerationRun> = self
            .client
            .get(format!("{}/runs", self.base_url))
            .send()
            .await
            .map_err(|e| map_http_error(&self.base_url, e))?
            .error_for_status()
            .map_err(|e| map_http_error(&self.base_url, e))?
            .json()
            .await
            .map_err(|e| map_http_error(&self.base_url, e))?;
        for run in &mut runs {
            run.normalize();
        }
        Ok(runs)
    }
}

/// The workspace's checkpoint store, or the worker holding it.
pub struct WorkspaceRunSource {
    checkpoint_dir: PathBuf,
    worker: WorkerRunSource,
}

impl WorkspaceRunSource {
    pub fn new(checkpoint_dir: impl AsRef<Path>, worker: WorkerRunSource) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.as_ref().to_path_buf(),
            worker,
        }
    }

    /// Run `read` against a freshly opened store. `None` means the store is
    /// locked by someone else.
    async fn read_local<T, F>(&self, read: F) -> Result<Option<T>, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&SledCheckpointStore) -> Result<T, StorageError> + Send + 'static,
    {
        let dir = self.checkpoint_dir.clone();
        let result = tokio::task::spawn_blocking(move || {
            if !dir.exists() {
                return Err(StorageError::IoError(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no checkpoint store at {}", dir.display()),
                )));
            }
            let store = SledCheckpointStore::open(&dir)?;
            read(&store)
        })
        .await
        .map_err(|e| StorageError::IoError(io::Error::new(io::ErrorKind::Other, e.to_string())))?;

        match result {
            Ok(value) => Ok(Some(value)),
            Err(StorageError::Locked(path)) => {
                debug!(path = %path, worker = %self.worker.base_url(), "Checkpoint store in use, asking the worker");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl RunSource for WorkspaceRunSource {
    async fn get_run(&self, run_id: &str) -> Result<Option<GenerationRun>, StorageError> {
        let id = run_id.to_string();
        match self.read_local(move |store| store.get(&id)).await? {
            Some(found) => Ok(found),
            None => self.worker.get_run(run_id).await,
        }
    }

    async fn list_runs(&self) -> Result<Vec<GenerationRun>, StorageError> {
        match self.read_local(|store| store.list()).await? {
            Some(runs) => Ok(runs),
            None => self.worker.list_runs().await,
        }
    }
}
