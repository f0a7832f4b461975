//! Run document: the durable record of one pipeline execution.
//!
//! A `GenerationRun` is written as a whole on every mutation. Stage keys are
//! fixed when the run is created and keep their declaration order on disk.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

static RUN_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Status of a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::NotStarted => "not_started",
            StageStatus::InProgress => "in_progress",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Failed)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status and bookkeeping for one stage of a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StageRecord {
    /// Filled from the map key when the document is read.
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cost: f64,
    /// Internal refine/retry loops the stage itself reported.
    #[serde(default)]
    pub iterations: u32,
    /// Logical output name to artifact reference.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Seconds spent in the stage, measured up to `now` while it is still running.
    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> Option<i64> {
        let start = self.start_time?;
        let end = self.end_time.unwrap_or(now);
        Some(end.signed_duration_since(start).num_seconds().max(0))
    }
}

/// Partial update applied to one stage by the checkpoint engine.
///
/// Every field is optional; absent fields leave the stage untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageUpdate {
    pub status: Option<StageStatus>,
    /// Added to the stage cost. Negative deltas are ignored.
    pub cost_delta: Option<f64>,
    /// Raises the stage cost to at least this value. Repeating it is a no-op.
    pub cost: Option<f64>,
    pub iterations: Option<u32>,
    pub outputs: Option<BTreeMap<String, String>>,
    pub metadata: Option<BTreeMap<String, Value>>,
    pub error: Option<String>,
}

impl StageUpdate {
    pub fn status(status: StageStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn in_progress() -> Self {
        Self::status(StageStatus::InProgress)
    }

    pub fn completed() -> Self {
        Self::status(StageStatus::Completed)
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(StageStatus::Failed),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_cost_delta(mut self, delta: f64) -> Self {
        self.cost_delta = Some(delta);
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = Some(iterations);
        self
    }

    pub fn with_outputs(mut self, outputs: BTreeMap<String, String>) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Ordered stage map. Serialized as a JSON object whose keys follow
/// declaration order, not alphabetical order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StageMap(Vec<StageRecord>);

impl StageMap {
    pub fn iter(&self) -> impl Iterator<Item = &StageRecord> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&StageRecord> {
        self.0.iter().find(|s| s.name == name)
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut StageRecord> {
        self.0.iter_mut().find(|s| s.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.0.iter().map(|s| s.name.as_str()).collect()
    }
}

impl Serialize for StageMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for record in &self.0 {
            map.serialize_entry(&record.name, record)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for StageMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct StageMapVisitor;

        impl<'de> Visitor<'de> for StageMapVisitor {
            type Value = StageMap;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of stage name to stage record")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<StageMap, A::Error> {
                let mut records = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, mut record)) = access.next_entry::<String, StageRecord>()? {
                    record.name = name;
                    records.push(record);
                }
                Ok(StageMap(records))
            }
        }

        deserializer.deserialize_map(StageMapVisitor)
    }
}

/// Durable top-level record of one pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRun {
    pub run_id: String,
    pub target_name: String,
    #[serde(default)]
    pub original_request: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    stages: StageMap,
    /// Derived from stage costs. The stored value is ignored on read.
    #[serde(default)]
    total_cost: f64,
}

impl GenerationRun {
    /// Build a fresh run with every declared stage `NotStarted`.
    pub fn new<S: AsRef<str>>(target_name: &str, request: &str, stages: &[S]) -> Self {
        let now = Utc::now();
        Self {
            run_id: new_run_id(now),
            target_name: target_name.to_string(),
            original_request: request.to_string(),
            created_at: now,
            updated_at: now,
            stages: StageMap(stages.iter().map(|s| StageRecord::new(s.as_ref())).collect()),
            total_cost: 0.0,
        }
    }

    pub fn stages(&self) -> &StageMap {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.get(name)
    }

    pub fn total_cost(&self) -> f64 {
        self.total_cost
    }

    /// First stage in declaration order that still needs work.
    ///
    /// `Failed` and `InProgress` count as "not done": a stage is always redone
    /// from scratch.
    pub fn next_stage(&self) -> Option<&str> {
        self.stages
            .iter()
            .find(|s| s.status != StageStatus::Completed)
            .map(|s| s.name.as_str())
    }

    pub fn can_resume(&self) -> bool {
        self.stages.iter().any(|s| s.status != StageStatus::Completed)
    }

    pub fn completed_stages(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Completed)
            .count()
    }

    /// Completed fraction in `[0.0, 1.0]`. An empty pipeline counts as done.
    pub fn progress(&self) -> f64 {
        if self.stages.is_empty() {
            return 1.0;
        }
        self.completed_stages() as f64 / self.stages.len() as f64
    }

    pub fn in_progress_stage(&self) -> Option<&StageRecord> {
        self.stages
            .iter()
            .find(|s| s.status == StageStatus::InProgress)
    }

    pub fn failed_stage(&self) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.status == StageStatus::Failed)
    }

    /// Apply `update` to `stage`. Returns false if the stage is not declared.
    pub(crate) fn apply(&mut self, stage: &str, update: &StageUpdate) -> bool {
        let now = Utc::now();
        let Some(record) = self.stages.get_mut(stage) else {
            return false;
        };

        if let Some(status) = update.status {
            let changed = record.status != status;
            if status == StageStatus::InProgress {
                if record.start_time.is_none() {
                    record.start_time = Some(now);
                }
                if changed {
                    record.end_time = None;
                }
            }
            if changed && status.is_terminal() {
                record.end_time = Some(now);
            }
            record.status = status;
            if status != StageStatus::Failed {
                record.error = None;
            }
        }
        if let Some(delta) = update.cost_delta {
            if delta > 0.0 {
                record.cost += delta;
            }
        }
        if let Some(cost) = update.cost {
            if cost > record.cost {
                record.cost = cost;
            }
        }
        if let Some(iterations) = update.iterations {
            record.iterations = iterations;
        }
        if let Some(outputs) = &update.outputs {
            record.outputs.extend(outputs.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if let Some(metadata) = &update.metadata {
            record.metadata.extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if record.status == StageStatus::Failed {
            if let Some(error) = &update.error {
                record.error = Some(error.clone());
            }
        }

        self.recompute_total_cost();
        self.touch(now);
        true
    }

    /// Restore invariants after reading a document from disk.
    pub(crate) fn normalize(&mut self) {
        self.recompute_total_cost();
        if self.updated_at < self.created_at {
            self.updated_at = self.created_at;
        }
    }

    fn recompute_total_cost(&mut self) {
        self.total_cost = self.stages.iter().map(|s| s.cost).sum();
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}

/// Generate a unique, time-derived run id.
pub fn new_run_id(now: DateTime<Utc>) -> String {
    let pid = std::process::id();
    let seq = RUN_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!(
        "run-{}-{:03}-{pid}-{seq}",
        now.format("%Y%m%dT%H%M%S"),
        now.timestamp_subsec_millis()
    )
}
