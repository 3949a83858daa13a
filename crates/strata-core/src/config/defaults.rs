//! Default configuration values

use super::types::Config;

/// Default configuration file name (TOML)
pub const DEFAULT_CONFIG_TOML: &str = "strata.toml";

/// Default configuration file name (YAML)
pub const DEFAULT_CONFIG_YAML: &str = "strata.yaml";

/// Default task definition file
pub const DEFAULT_DEFINITION_FILE: &str = "strata.tasks.yaml";

/// Default cache root
pub const DEFAULT_CACHE_DIR: &str = ".strata/cache";

/// Default run records root
pub const DEFAULT_RUNS_DIR: &str = ".strata/runs";

/// Default artifact output directory
pub const DEFAULT_OUTPUT_DIR: &str = ".strata/out";

/// Get list of config file names to search for
pub fn config_file_names() -> Vec<&'static str> {
    vec![
        DEFAULT_CONFIG_TOML,
        DEFAULT_CONFIG_YAML,
        ".strata.toml",
        ".strata.yaml",
    ]
}

/// Generate default configuration TOML
pub fn default_config_toml() -> String {
    let config = Config::default();
    toml::to_string_pretty(&config).unwrap_or_else(|_| DEFAULT_CONFIG_TEMPLATE.to_string())
}

/// Default configuration template
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# strata configuration

[engine]
mode = "incremental"

[paths]
definition = "strata.tasks.yaml"
cache_dir = ".strata/cache"
runs_dir = ".strata/runs"
output_dir = ".strata/out"

[sandbox]
network = "deny"
isolation = "auto"

[hooks]
before-run = []
after-run = []
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_parses() {
        let config: Config = toml::from_str(DEFAULT_CONFIG_TEMPLATE).unwrap();
        assert_eq!(config.paths.cache_dir.to_str(), Some(DEFAULT_CACHE_DIR));
        assert!(config.hooks.is_empty());
    }

    #[test]
    fn test_default_config_toml_roundtrips() {
        let rendered = default_config_toml();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.engine.concurrency, Config::default().engine.concurrency);
    }
}
