//! CLI output: error mapping from domain errors to stable CLI surface.

use crate::error::{StorageError, WorkerError};

/// Map domain/service errors to a string for CLI output.
pub fn map_error(e: &WorkerError) -> String {
    match e {
        WorkerError::StorageError(StorageError::RunNotFound(run_id)) => {
            format!("No run with id '{}' in the checkpoint store", run_id)
        }
        other => other.to_string(),
    }
}
