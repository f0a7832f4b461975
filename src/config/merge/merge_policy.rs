//! Merge rules: defaults, override order, conflict handling.
//!
//! Defaults are registered on the builder so that a file setting only one key
//! of a table still produces a complete table. Later sources override earlier
//! ones key by key; arrays are replaced, never concatenated.

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment};

use crate::config::{WorkerConfig, DEFAULT_STAGES};

/// Prefix for environment overrides, e.g. `STAGEHAND__SESSION__URL`.
pub const ENV_PREFIX: &str = "STAGEHAND";
pub const ENV_SEPARATOR: &str = "__";

/// Create a Config builder with merge policy defaults applied.
pub fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let defaults = WorkerConfig::default();
    Config::builder()
        .set_default("pipeline.stages", DEFAULT_STAGES.to_vec())?
        .set_default("retry.max_retries", defaults.retry.max_retries as u64)?
        .set_default("retry.delay_schedule_secs", defaults.retry.delay_schedule_secs)?
        .set_default("retry.sleep_chunk_secs", defaults.retry.sleep_chunk_secs)?
        .set_default("session.url", defaults.session.url)?
        .set_default("session.worker_id", defaults.session.worker_id)?
        .set_default(
            "session.max_consecutive_failures",
            defaults.session.max_consecutive_failures as u64,
        )?
        .set_default(
            "session.reconnect_schedule_secs",
            defaults.session.reconnect_schedule_secs,
        )?
        .set_default(
            "session.heartbeat_interval_secs",
            defaults.session.heartbeat_interval_secs,
        )?
        .set_default("session.heartbeat_stale_secs", defaults.session.heartbeat_stale_secs)?
        .set_default("session.outbound_queue", defaults.session.outbound_queue as u64)?
        .set_default("http.listen", defaults.http.listen)?
        .set_default(
            "generator.stage_timeout_secs",
            defaults.generator.stage_timeout_secs,
        )?
        .set_default("monitor.poll_interval_secs", defaults.monitor.poll_interval_secs)?
        .set_default(
            "storage.checkpoint_path",
            defaults.storage.checkpoint_path.to_string_lossy().into_owned(),
        )
}

/// Highest-precedence source: `STAGEHAND__<TABLE>__<KEY>` variables.
pub fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_SEPARATOR)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("pipeline.stages")
        .with_list_parse_key("retry.delay_schedule_secs")
        .with_list_parse_key("session.reconnect_schedule_secs")
        .with_list_parse_key("generator.command")
}
