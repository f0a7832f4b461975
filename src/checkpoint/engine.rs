//! Stage checkpoint and resume engine.
//!
//! The engine owns no state of its own: every operation reads or writes the
//! run document through the [`CheckpointStore`]. A single worker drives a
//! given run at a time; concurrent writers on one run id are last-writer-wins.

use std::sync::Arc;

use tracing::{debug, info};

use crate::checkpoint::run::{GenerationRun, StageUpdate};
use crate::checkpoint::store::CheckpointStore;
use crate::error::{PipelineError, StorageError};

#[derive(Clone)]
pub struct CheckpointEngine {
    store: Arc<dyn CheckpointStore>,
    stages: Vec<String>,
}

impl CheckpointEngine {
    /// `stages` is the pipeline definition, in execution order.
    pub fn new(store: Arc<dyn CheckpointStore>, stages: Vec<String>) -> Self {
        Self { store, stages }
    }

    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Create and immediately persist a run with every stage `NotStarted`.
    pub fn create(&self, target_name: &str, request: &str) -> Result<GenerationRun, StorageError> {
        let run = GenerationRun::new(target_name, request, &self.stages);
        self.store.put(&run)?;
        info!(
            run_id = %run.run_id,
            target = %target_name,
            stages = self.stages.len(),
            "Created generation run"
        );
        Ok(run)
    }

    /// Apply `update` to one stage and persist the entire run document.
    ///
    /// The update is applied to a copy; `run` is replaced only after the copy
    /// has been written, so a rejected stage or a failed write leaves it as it
    /// was.
    pub fn update_stage(
        &self,
        run: &mut GenerationRun,
        stage_name: &str,
        update: StageUpdate,
    ) -> Result<(), PipelineError> {
        let mut next = run.clone();
        if !next.apply(stage_name, &update) {
            return Err(PipelineError::UnknownStage {
                run_id: run.run_id.clone(),
                stage: stage_name.to_string(),
            });
        }
        self.store.put(&next)?;
        *run = next;
        debug!(
            run_id = %run.run_id,
            stage = %stage_name,
            status = ?update.status,
            total_cost = run.total_cost(),
            "Stage checkpoint written"
        );
        Ok(())
    }

    /// Next stage to execute, in declaration order; `None` once all completed.
    pub fn get_next_stage<'a>(&self, run: &'a GenerationRun) -> Option<&'a str> {
        run.next_stage()
    }

    pub fn can_resume(&self, run: &GenerationRun) -> bool {
        run.can_resume()
    }

    /// Most recently updated run for `target_name`; ties go to the greater
    /// run id.
    pub fn find_latest(&self, target_name: &str) -> Result<Option<GenerationRun>, StorageError> {
        Ok(self
            .store
            .list()?
            .into_iter()
            .filter(|r| r.target_name == target_name)
            .max_by(|a, b| {
                a.updated_at
                    .cmp(&b.updated_at)
                    .then_with(|| a.run_id.cmp(&b.run_id))
            }))
    }

    pub fn load(&self, run_id: &str) -> Result<GenerationRun, StorageError> {
        self.store
            .get(run_id)?
            .ok_or_else(|| StorageError::RunNotFound(run_id.to_string()))
    }

    pub fn list_runs(&self) -> Result<Vec<GenerationRun>, StorageError> {
        self.store.list()
    }

    pub fn list_runs_for(&self, target_name: &str) -> Result<Vec<GenerationRun>, StorageError> {
        Ok(self
            .store
            .list()?
            .into_iter()
            .filter(|r| r.target_name == target_name)
            .collect())
    }

    pub fn list_resumable(&self) -> Result<Vec<GenerationRun>, StorageError> {
        Ok(self
            .store
            .list()?
            .into_iter()
            .filter(|r| r.can_resume())
            .collect())
    }
}
