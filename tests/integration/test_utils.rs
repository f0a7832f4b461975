//! Shared test utilities for integration tests
//!
//! Environment isolation for config loading and a scripted stage runner for
//! pipeline scenarios.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use stagehand::error::PipelineError;
use stagehand::pipeline::{StageContext, StageOutcome, StageRunner};
use tempfile::TempDir;

/// Global mutex to serialize environment variable access across all tests
static ENV_MUTEX: Mutex<()> = Mutex::new(());

const ISOLATED_VARS: &[&str] = &[
    "HOME",
    "XDG_CONFIG_HOME",
    "STAGEHAND_ENV",
    "STAGEHAND__RETRY__MAX_RETRIES",
    "STAGEHAND__SESSION__URL",
    "STAGEHAND__PIPELINE__STAGES",
];

/// Environment variable state to restore after test
struct EnvState(Vec<(&'static str, Option<String>)>);

impl EnvState {
    fn capture() -> Self {
        Self(
            ISOLATED_VARS
                .iter()
                .map(|name| (*name, std::env::var(name).ok()))
                .collect(),
        )
    }

    fn restore(self) {
        for (name, value) in self.0 {
            match value {
                Some(orig) => std::env::set_var(name, orig),
                None => std::env::remove_var(name),
            }
        }
    }
}

/// Run `f` with `XDG_CONFIG_HOME` and `HOME` pointed inside `test_dir` and
/// every `STAGEHAND*` override cleared, then restore the environment.
///
/// `vars` are set for the duration of the call.
pub fn with_isolated_env<F, R>(test_dir: &TempDir, vars: &[(&str, &str)], f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    let env_state = EnvState::capture();

    let config_home = test_dir.path().join("xdg-config");
    let home = test_dir.path().join("home");
    std::fs::create_dir_all(&config_home).unwrap();
    std::fs::create_dir_all(&home).unwrap();

    for name in ISOLATED_VARS {
        std::env::remove_var(name);
    }
    std::env::set_var("HOME", &home);
    std::env::set_var("XDG_CONFIG_HOME", &config_home);
    for (name, value) in vars {
        std::env::set_var(name, value);
    }

    let result = f();

    env_state.restore();

    result
}

/// Stage runner that replays queued results per stage and otherwise succeeds
/// with a fixed cost.
#[derive(Default)]
pub struct ScriptedRunner {
    script: Mutex<HashMap<String, VecDeque<Result<StageOutcome, PipelineError>>>>,
    calls: Mutex<Vec<String>>,
    pub cost_per_stage: f64,
}

impl ScriptedRunner {
    pub fn with_cost(cost_per_stage: f64) -> Self {
        Self {
            cost_per_stage,
            ..Default::default()
        }
    }

    pub fn push(&self, stage: &str, result: Result<StageOutcome, PipelineError>) {
        self.script
            .lock()
            .unwrap()
            .entry(stage.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl StageRunner for ScriptedRunner {
    async fn run_stage(&self, ctx: &StageContext) -> Result<StageOutcome, PipelineError> {
        self.calls.lock().unwrap().push(ctx.stage.clone());
        let scripted = self
            .script
            .lock()
            .unwrap()
            .get_mut(&ctx.stage)
            .and_then(|queue| queue.pop_front());
        scripted.unwrap_or_else(|| {
            let mut outputs = BTreeMap::new();
            outputs.insert("artifact".to_string(), format!("{}.out", ctx.stage));
            Ok(StageOutcome {
                cost: self.cost_per_stage,
                iterations: 1,
                outputs,
                metadata: BTreeMap::new(),
            })
        })
    }
}
