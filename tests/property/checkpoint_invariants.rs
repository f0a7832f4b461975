//! Property-based tests for checkpoint invariants

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use stagehand::checkpoint::{
    CheckpointEngine, CheckpointStore, GenerationRun, StageStatus, StageUpdate,
};
use stagehand::error::StorageError;

const STAGES: [&str; 4] = ["plan", "design", "build", "verify"];

/// Store backed by a map so each proptest case stays cheap.
#[derive(Default)]
struct MemoryStore {
    runs: Mutex<HashMap<String, GenerationRun>>,
}

impl CheckpointStore for MemoryStore {
    fn put(&self, run: &GenerationRun) -> Result<(), StorageError> {
        self.runs
            .lock()
            .unwrap()
            .insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    fn get(&self, run_id: &str) -> Result<Option<GenerationRun>, StorageError> {
        Ok(self.runs.lock().unwrap().get(run_id).cloned())
    }

    fn list(&self) -> Result<Vec<GenerationRun>, StorageError> {
        let mut runs: Vec<_> = self.runs.lock().unwrap().values().cloned().collect();
        runs.sort_by_key(|r| std::cmp::Reverse(r.updated_at));
        Ok(runs)
    }
}

fn engine() -> CheckpointEngine {
    CheckpointEngine::new(
        Arc::new(MemoryStore::default()),
        STAGES.iter().map(|s| s.to_string()).collect(),
    )
}

fn status_strategy() -> impl Strategy<Value = StageStatus> {
    prop_oneof![
        Just(StageStatus::NotStarted),
        Just(StageStatus::InProgress),
        Just(StageStatus::Completed),
        Just(StageStatus::Failed),
    ]
}

fn update_strategy() -> impl Strategy<Value = (usize, StageUpdate)> {
    (
        0..STAGES.len(),
        proptest::option::of(status_strategy()),
        proptest::option::of(-1.0f64..5.0),
        proptest::option::of(0.0f64..5.0),
    )
        .prop_map(|(stage, status, delta, cost)| {
            let mut update = match status {
                Some(StageStatus::Failed) => StageUpdate::failed("generated failure"),
                Some(status) => StageUpdate::status(status),
                None => StageUpdate::default(),
            };
            update.cost_delta = delta;
            update.cost = cost;
            (stage, update)
        })
}

/// Total cost always equals the sum of stage costs, in memory and once stored.
#[test]
fn test_total_cost_matches_stage_sum() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &proptest::collection::vec(update_strategy(), 0..40),
            |updates| {
                let engine = engine();
                let mut run = engine.create("app", "req").unwrap();
                for (stage, update) in updates {
                    engine.update_stage(&mut run, STAGES[stage], update).unwrap();
                    let sum: f64 = run.stages().iter().map(|s| s.cost).sum();
                    prop_assert_eq!(run.total_cost(), sum);
                    prop_assert!(run.stages().iter().all(|s| s.cost >= 0.0));
                }

                let stored = engine.load(&run.run_id).unwrap();
                prop_assert_eq!(stored.total_cost(), run.total_cost());
                Ok(())
            },
        )
        .unwrap();
}

/// Costs never decrease, whatever the update sequence.
#[test]
fn test_stage_cost_is_monotonic() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &proptest::collection::vec(update_strategy(), 1..40),
            |updates| {
                let engine = engine();
                let mut run = engine.create("app", "req").unwrap();
                let mut previous = 0.0;
                for (stage, update) in updates {
                    engine.update_stage(&mut run, STAGES[stage], update).unwrap();
                    prop_assert!(run.total_cost() >= previous);
                    previous = run.total_cost();
                }
                Ok(())
            },
        )
        .unwrap();
}

proptest! {
    /// The next stage is the first non-completed one in declaration order.
    #[test]
    fn test_next_stage_is_first_incomplete(
        statuses in proptest::collection::vec(status_strategy(), STAGES.len())
    ) {
        let engine = engine();
        let mut run = engine.create("app", "req").unwrap();
        for (name, status) in STAGES.iter().zip(&statuses) {
            engine.update_stage(&mut run, name, StageUpdate::status(*status)).unwrap();
        }

        let expected = STAGES
            .iter()
            .zip(&statuses)
            .find(|(_, status)| **status != StageStatus::Completed)
            .map(|(name, _)| *name);
        prop_assert_eq!(engine.get_next_stage(&run), expected);
        prop_assert_eq!(engine.can_resume(&run), expected.is_some());

        let reloaded = engine.load(&run.run_id).unwrap();
        prop_assert_eq!(engine.get_next_stage(&reloaded), expected);
    }

    /// Repeating an identical update leaves the document unchanged apart from `updated_at`.
    #[test]
    fn test_repeated_update_is_idempotent((stage, update) in update_strategy()) {
        // Deltas accumulate by definition; idempotence holds for absolute updates.
        let update = StageUpdate { cost_delta: None, ..update };
        let engine = engine();
        let mut run = engine.create("app", "req").unwrap();

        engine.update_stage(&mut run, STAGES[stage], update.clone()).unwrap();
        let mut first = run.clone();
        engine.update_stage(&mut run, STAGES[stage], update).unwrap();

        first.updated_at = run.updated_at;
        prop_assert_eq!(first, run);
    }
}
