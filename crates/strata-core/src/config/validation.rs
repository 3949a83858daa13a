//! Configuration validation

use std::path::{Component, Path};

use tracing::debug;

use crate::error::{ConfigError, Result};

use super::types::Config;

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    debug!("validating configuration");
    validate_engine(config)?;
    validate_paths(config)?;
    validate_hooks(config)?;
    debug!("configuration validation passed");
    Ok(())
}

fn validate_engine(config: &Config) -> Result<()> {
    if config.engine.concurrency == 0 {
        return Err(ConfigError::InvalidValue {
            field: "engine.concurrency".to_string(),
            message: "must be at least 1".to_string(),
        }
        .into());
    }
    Ok(())
}

fn validate_paths(config: &Config) -> Result<()> {
    let paths = [
        ("paths.definition", &config.paths.definition),
        ("paths.cache_dir", &config.paths.cache_dir),
        ("paths.runs_dir", &config.paths.runs_dir),
        ("paths.output_dir", &config.paths.output_dir),
    ];

    for (field, path) in paths {
        if path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: field.to_string(),
                message: "path cannot be empty".to_string(),
            }
            .into());
        }
    }

    // Artifacts are materialized into output_dir and must never alias engine state.
    if same_location(&config.paths.output_dir, &config.paths.cache_dir)
        || same_location(&config.paths.output_dir, &config.paths.runs_dir)
    {
        return Err(ConfigError::InvalidValue {
            field: "paths.output_dir".to_string(),
            message: "must differ from cache_dir and runs_dir".to_string(),
        }
        .into());
    }

    Ok(())
}

fn same_location(a: &Path, b: &Path) -> bool {
    let normalize = |p: &Path| -> Vec<String> {
        p.components()
            .filter(|c| !matches!(c, Component::CurDir))
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect()
    };
    normalize(a) == normalize(b)
}

fn validate_hooks(config: &Config) -> Result<()> {
    let stages = [
        ("hooks.before-run", &config.hooks.before_run),
        ("hooks.before-task", &config.hooks.before_task),
        ("hooks.after-task", &config.hooks.after_task),
        ("hooks.after-run", &config.hooks.after_run),
    ];

    for (field, commands) in stages {
        if let Some(i) = commands.iter().position(|c| c.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: format!("{}[{}]", field, i),
                message: "hook command cannot be empty".to_string(),
            }
            .into());
        }
    }
    Ok(())
}
