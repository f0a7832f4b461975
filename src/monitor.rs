//! Progress monitor: a read-only polling view over persisted runs.
//!
//! Works against any [`RunSource`], with or without a live worker attached.
//! It only reads run documents and never writes a checkpoint.

pub mod source;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use owo_colors::OwoColorize;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::checkpoint::{CheckpointStore, GenerationRun, StageStatus};
use crate::error::StorageError;

pub use source::{RunSource, StoreRunSource, WorkerRunSource, WorkspaceRunSource};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRow {
    pub name: String,
    pub status: StageStatus,
    pub cost: f64,
    pub iterations: u32,
    pub elapsed_secs: Option<i64>,
    pub error: Option<String>,
}

/// Point-in-time view of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub run_id: String,
    pub target_name: String,
    pub completed_stages: usize,
    pub total_stages: usize,
    /// `completed_stages / total_stages`
    pub progress: f64,
    pub total_cost: f64,
    pub current_stage: Option<String>,
    pub current_elapsed_secs: Option<i64>,
    pub failed_stage: Option<String>,
    pub resumable: bool,
    pub updated_at: DateTime<Utc>,
    pub stages: Vec<StageRow>,
}

impl ProgressSnapshot {
    pub fn from_run(run: &GenerationRun, now: DateTime<Utc>) -> Self {
        let current = run.in_progress_stage();
        Self {
            run_id: run.run_id.clone(),
            target_name: run.target_name.clone(),
            completed_stages: run.completed_stages(),
            total_stages: run.stages().len(),
            progress: run.progress(),
            total_cost: run.total_cost(),
            current_stage: current.map(|s| s.name.clone()),
            current_elapsed_secs: current.and_then(|s| s.elapsed_secs(now)),
            failed_stage: run.failed_stage().map(|s| s.name.clone()),
            resumable: run.can_resume(),
            updated_at: run.updated_at,
            stages: run
                .stages()
                .iter()
                .map(|s| StageRow {
                    name: s.name.clone(),
                    status: s.status,
                    cost: s.cost,
                    iterations: s.iterations,
                    elapsed_secs: s.elapsed_secs(now),
                    error: s.error.clone(),
                })
                .collect(),
        }
    }

    /// Every stage completed; a failed run stays open for its resume.
    pub fn settled(&self) -> bool {
        !self.resumable
    }
}

pub struct ProgressMonitor {
    source: Arc<dyn RunSource>,
    poll_interval: Duration,
}

impl ProgressMonitor {
    pub fn new(source: Arc<dyn RunSource>, poll_interval: Duration) -> Self {
        Self {
            source,
            poll_interval,
        }
    }

    /// Monitor an already opened store.
    pub fn from_store(store: Arc<dyn CheckpointStore>, poll_interval: Duration) -> Self {
        Self::new(Arc::new(StoreRunSource::new(store)), poll_interval)
    }

    pub async fn snapshot(&self, run_id: &str) -> Result<ProgressSnapshot, StorageError> {
        let run = self
            .source
            .get_run(run_id)
            .await?
            .ok_or_else(|| StorageError::RunNotFound(run_id.to_string()))?;
        Ok(ProgressSnapshot::from_run(&run, Utc::now()))
    }

    /// Snapshots of every run that is still resumable, most recent first.
    pub async fn poll_once(&self) -> Result<Vec<ProgressSnapshot>, StorageError> {
        let now = Utc::now();
        Ok(self
            .source
            .list_runs()
            .await?
            .iter()
            .filter(|run| run.can_resume())
            .map(|run| ProgressSnapshot::from_run(run, now))
            .collect())
    }

    /// Every persisted run, resumable or not, most recent first.
    pub async fn all_runs(&self) -> Result<Vec<ProgressSnapshot>, StorageError> {
        let now = Utc::now();
        Ok(self
            .source
            .list_runs()
            .await?
            .iter()
            .map(|run| ProgressSnapshot::from_run(run, now))
            .collect())
    }

    /// Poll one run until it can no longer be resumed; returns the final
    /// snapshot.
    pub async fn watch_run<F>(&self, run_id: &str, mut on_update: F) -> Result<ProgressSnapshot, StorageError>
    where
        F: FnMut(&ProgressSnapshot),
    {
        loop {
            let snapshot = self.snapshot(run_id).await?;
            on_update(&snapshot);
            if snapshot.settled() {
                debug!(run_id = %run_id, "Run finished, stop watching");
                return Ok(snapshot);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Poll every resumable run until none is left.
    pub async fn watch_all<F>(&self, mut on_update: F) -> Result<(), StorageError>
    where
        F: FnMut(&[ProgressSnapshot]),
    {
        loop {
            let active = self.poll_once().await?;
            on_update(&active);
            if active.is_empty() {
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

fn styled_status(status: StageStatus) -> String {
    match status {
        StageStatus::Completed => status.as_str().green().to_string(),
        StageStatus::InProgress => status.as_str().yellow().bold().to_string(),
        StageStatus::Failed => status.as_str().red().to_string(),
        StageStatus::NotStarted => status.as_str().dimmed().to_string(),
    }
}

fn format_elapsed(secs: Option<i64>) -> String {
    match secs {
        Some(s) if s >= 3600 => format!("{}h{:02}m", s / 3600, (s % 3600) / 60),
        Some(s) if s >= 60 => format!("{}m{:02}s", s / 60, s % 60),
        Some(s) => format!("{s}s"),
        None => "-".to_string(),
    }
}

/// Stage table for one run, with a heading line.
pub fn render_snapshot(snapshot: &ProgressSnapshot) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{} {} ({})\n",
        snapshot.target_name.bold().underline(),
        snapshot.run_id.dimmed(),
        snapshot.updated_at.to_rfc3339()
    ));
    out.push_str(&format!(
        "  Progress: {}/{} stages ({:.0}%)  Cost: {:.4}\n",
        snapshot.completed_stages,
        snapshot.total_stages,
        snapshot.progress * 100.0,
        snapshot.total_cost
    ));
    if let Some(stage) = &snapshot.current_stage {
        out.push_str(&format!(
            "  Running: {} for {}\n",
            stage.yellow(),
            format_elapsed(snapshot.current_elapsed_secs)
        ));
    }

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Stage", "Status", "Cost", "Iterations", "Elapsed", "Error"]);
    for row in &snapshot.stages {
        table.add_row(vec![
            row.name.clone(),
            styled_status(row.status),
            format!("{:.4}", row.cost),
            row.iterations.to_string(),
            format_elapsed(row.elapsed_secs),
            row.error.clone().unwrap_or_else(|| "-".to_string()),
        ]);
    }
    out.push_str(&format!("{}\n", table));
    out
}

/// One line per run.
pub fn render_run_list(snapshots: &[ProgressSnapshot]) -> String {
    if snapshots.is_empty() {
        return "No runs recorded.\n".to_string();
    }
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Run", "Target", "Progress", "Cost", "Next", "Updated"]);
    for snap in snapshots {
        let next = snap
            .stages
            .iter()
            .find(|s| s.status != StageStatus::Completed)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| "done".to_string());
        table.add_row(vec![
            snap.run_id.clone(),
            snap.target_name.clone(),
            format!("{}/{}", snap.completed_stages, snap.total_stages),
            format!("{:.4}", snap.total_cost),
            next,
            snap.updated_at.to_rfc3339(),
        ]);
    }
    format!("{}\n", table)
}
