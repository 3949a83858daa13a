//! Configuration loading

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{ConfigError, Result};

use super::defaults::config_file_names;
use super::types::Config;
use super::validation::validate_config;

/// Load configuration from a file
pub fn load_config(path: &Path) -> Result<Config> {
    let format = if path.extension().is_some_and(|e| e == "toml") {
        "TOML"
    } else {
        "YAML"
    };
    info!(path = %path.display(), format, "loading config");

    let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;

    let config: Config = if format == "TOML" {
        toml::from_str(&content).map_err(ConfigError::TomlError)?
    } else {
        serde_yaml::from_str(&content).map_err(ConfigError::YamlError)?
    };

    validate_config(&config)?;
    debug!(path = %path.display(), "config loaded and validated");
    Ok(config)
}

/// Find a configuration file in the given directory.
///
/// Only the directory itself is searched; the first name in
/// [`config_file_names`] that exists wins.
pub fn find_config(dir: &Path) -> Option<PathBuf> {
    debug!(dir = %dir.display(), "searching for config file");
    let found = config_file_names()
        .into_iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file());

    match &found {
        Some(path) => info!(path = %path.display(), "found config file"),
        None => debug!("no config file found"),
    }
    found
}

/// Load configuration from a directory
pub fn load_config_from_dir(dir: &Path) -> Result<(Config, PathBuf)> {
    let config_path = find_config(dir).ok_or_else(|| ConfigError::NotFound(dir.to_path_buf()))?;

    let config = load_config(&config_path)?;
    Ok((config, config_path))
}

/// Load configuration or use defaults.
///
/// A file that exists but fails to parse or validate is still an error;
/// only a missing file falls back to defaults.
pub fn load_config_or_default(dir: &Path) -> Result<(Config, Option<PathBuf>)> {
    match find_config(dir) {
        Some(path) => {
            let config = load_config(&path)?;
            Ok((config, Some(path)))
        }
        None => {
            warn!(dir = %dir.display(), "no config found, using defaults");
            Ok((Config::default(), None))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IsolationMode, NetworkPolicy};
    use crate::types::ExecutionMode;
    use tempfile::TempDir;

    #[test]
    fn test_find_config_toml() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("strata.toml");
        std::fs::write(&config_path, "[engine]\nconcurrency = 2\n").unwrap();

        let found = find_config(temp.path());
        assert_eq!(found, Some(config_path));
    }

    #[test]
    fn test_find_config_prefers_toml_over_yaml() {
        let temp = TempDir::new().unwrap();
        let toml_path = temp.path().join("strata.toml");
        let yaml_path = temp.path().join("strata.yaml");
        std::fs::write(&toml_path, "[engine]\nconcurrency = 2\n").unwrap();
        std::fs::write(&yaml_path, "engine:\n  concurrency: 3\n").unwrap();

        assert_eq!(find_config(temp.path()).unwrap(), toml_path);
    }

    #[test]
    fn test_find_config_does_not_walk_parents() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("strata.toml"), "").unwrap();
        let child = temp.path().join("child");
        std::fs::create_dir_all(&child).unwrap();

        assert!(find_config(&child).is_none());
    }

    #[test]
    fn test_load_config_toml() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("strata.toml");
        std::fs::write(
            &config_path,
            "[engine]\nconcurrency = 3\nmode = \"clean\"\n\n[sandbox]\nnetwork = \"allow\"\nisolation = \"none\"\n",
        )
        .unwrap();

        let config = load_config(&config_path).unwrap();
        assert_eq!(config.engine.concurrency, 3);
        assert_eq!(config.engine.mode, ExecutionMode::Clean);
        assert_eq!(config.sandbox.network, NetworkPolicy::Allow);
        assert_eq!(config.sandbox.isolation, IsolationMode::None);
    }

    #[test]
    fn test_load_config_yaml_hooks() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("strata.yaml");
        std::fs::write(
            &config_path,
            "hooks:\n  after-run:\n    - echo done\npaths:\n  output_dir: dist\n",
        )
        .unwrap();

        let config = load_config(&config_path).unwrap();
        assert_eq!(config.hooks.after_run, vec!["echo done"]);
        assert_eq!(config.paths.output_dir, PathBuf::from("dist"));
    }

    #[test]
    fn test_load_config_rejects_zero_concurrency() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("strata.toml");
        std::fs::write(&config_path, "[engine]\nconcurrency = 0\n").unwrap();

        assert!(load_config(&config_path).is_err());
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let (config, path) = load_config_or_default(temp.path()).unwrap();
        assert!(path.is_none());
        assert!(config.engine.concurrency >= 1);
    }
}
