//! Builds a [`WorkerConfig`] from every configured source.

use std::path::Path;

use config::{Config, File, FileFormat};
use tracing::debug;

use crate::config::merge::merge_policy;
use crate::config::sources::{global_file, workspace_file};
use crate::config::WorkerConfig;
use crate::error::WorkerError;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Defaults, global file, workspace files, then environment overrides.
    pub fn load(workspace_root: &Path) -> Result<WorkerConfig, WorkerError> {
        let builder = merge_policy::builder_with_defaults()?;
        let builder = global_file::add_to_builder(builder)?;
        let builder = workspace_file::add_to_builder(builder, workspace_root)?;
        let builder = builder.add_source(merge_policy::environment());

        let mut config: WorkerConfig = builder.build()?.try_deserialize()?;
        if config.workspace_root.is_none() {
            config.workspace_root = Some(workspace_root.to_path_buf());
        }
        debug!(workspace = %workspace_root.display(), "Configuration loaded");
        Ok(config)
    }

    /// Defaults plus one explicit file. Global and workspace files are skipped.
    pub fn load_from_file(path: &Path) -> Result<WorkerConfig, WorkerError> {
        if !path.exists() {
            return Err(WorkerError::ConfigError(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        let config = merge_policy::builder_with_defaults()?
            .add_source(File::from(path).format(FileFormat::Toml).required(true))
            .add_source(merge_policy::environment())
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Built-in defaults only.
    pub fn defaults() -> Result<WorkerConfig, WorkerError> {
        Ok(merge_policy::builder_with_defaults()?
            .build()
            .and_then(Config::try_deserialize)?)
    }
}
