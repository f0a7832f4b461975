//! Resumable pipeline checkpoints.

pub mod engine;
pub mod run;
pub mod store;

pub use engine::CheckpointEngine;
pub use run::{new_run_id, GenerationRun, StageMap, StageRecord, StageStatus, StageUpdate};
pub use store::{CheckpointStore, SledCheckpointStore};
