//! Task definition files
//!
//! A definition file is a YAML or JSON mapping of task name to [`TaskSpec`].
//! Decoding is strict: unknown fields and duplicate task names are rejected
//! before anything else happens, so a malformed file can never produce a
//! partially loaded graph.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Component, Path};

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info};

use crate::error::DefinitionError;

/// Declarative description of one task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSpec {
    /// Input glob patterns, relative to the working directory
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Shell command
    pub run: String,

    /// Declared environment; nothing else is visible to the command
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Tasks that must complete successfully first
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Output glob patterns captured as artifacts
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Tool-version references folded into the task hash
    #[serde(default)]
    pub tools: BTreeMap<String, String>,

    /// Opt in to network access
    #[serde(default)]
    pub allow_network: bool,
}

impl TaskSpec {
    /// Create a spec with just a command
    pub fn new(run: impl Into<String>) -> Self {
        Self {
            run: run.into(),
            ..Self::default()
        }
    }

    /// Add an input pattern
    pub fn with_input(mut self, pattern: impl Into<String>) -> Self {
        self.inputs.push(pattern.into());
        self
    }

    /// Add an output pattern
    pub fn with_output(mut self, pattern: impl Into<String>) -> Self {
        self.outputs.push(pattern.into());
        self
    }

    /// Add a dependency
    pub fn with_depends_on(mut self, task: impl Into<String>) -> Self {
        self.depends_on.push(task.into());
        self
    }

    /// Declare an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Reference a tool version
    pub fn with_tool(mut self, tool: impl Into<String>, version: impl Into<String>) -> Self {
        self.tools.insert(tool.into(), version.into());
        self
    }
}

/// Supported definition encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionFormat {
    /// `.yaml` / `.yml`
    Yaml,
    /// `.json`
    Json,
}

impl DefinitionFormat {
    /// Pick the format from a file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Some(Self::Yaml),
            Some("json") => Some(Self::Json),
            _ => None,
        }
    }
}

/// All tasks from a definition file, in file order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskDefinitions {
    tasks: Vec<(String, TaskSpec)>,
}

impl TaskDefinitions {
    /// Create an empty set of definitions
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task (builder style, used by tests and embedders)
    pub fn with_task(mut self, name: impl Into<String>, spec: TaskSpec) -> Self {
        self.tasks.push((name.into(), spec));
        self
    }

    /// Iterate over tasks in file order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TaskSpec)> {
        self.tasks.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    /// Look up a task by name
    pub fn get(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, spec)| spec)
    }

    /// Number of tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether there are no tasks
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Validate every field. Structural checks that need the whole graph
    /// (missing dependencies, cycles) belong to graph loading.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        let mut seen = BTreeSet::new();
        for (name, spec) in &self.tasks {
            if !seen.insert(name.as_str()) {
                return Err(DefinitionError::DuplicateTask(name.clone()));
            }
            validate_task(name, spec)?;
        }
        Ok(())
    }
}

impl<'de> Deserialize<'de> for TaskDefinitions {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DefinitionsVisitor;

        impl<'de> Visitor<'de> for DefinitionsVisitor {
            type Value = TaskDefinitions;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of task name to task definition")
            }

            // Keys are collected verbatim so duplicates surface in `validate`
            // instead of being silently overwritten by a map type.
            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut tasks = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(name) = map.next_key::<String>()? {
                    let spec = map.next_value::<TaskSpec>()?;
                    tasks.push((name, spec));
                }
                Ok(TaskDefinitions { tasks })
            }
        }

        deserializer.deserialize_map(DefinitionsVisitor)
    }
}

/// Decode and validate definition text
pub fn parse_definition(
    content: &str,
    format: DefinitionFormat,
) -> Result<TaskDefinitions, DefinitionError> {
    let definitions: TaskDefinitions = match format {
        DefinitionFormat::Yaml => {
            serde_yaml::from_str(content).map_err(|e| DefinitionError::Parse(e.to_string()))?
        }
        DefinitionFormat::Json => {
            serde_json::from_str(content).map_err(|e| DefinitionError::Parse(e.to_string()))?
        }
    };
    definitions.validate()?;
    Ok(definitions)
}

/// Load a definition file from disk
pub fn load_definition(path: &Path) -> Result<TaskDefinitions, DefinitionError> {
    if !path.is_file() {
        return Err(DefinitionError::NotFound(path.to_path_buf()));
    }
    let format = DefinitionFormat::from_path(path)
        .ok_or_else(|| DefinitionError::UnsupportedFormat(path.to_path_buf()))?;

    info!(path = %path.display(), ?format, "loading task definition");
    let content = std::fs::read_to_string(path)?;
    let definitions = parse_definition(&content, format)?;
    debug!(tasks = definitions.len(), "task definition validated");
    Ok(definitions)
}

fn invalid(task: &str, field: &str, message: impl Into<String>) -> DefinitionError {
    DefinitionError::InvalidTask {
        task: task.to_string(),
        field: field.to_string(),
        message: message.into(),
    }
}

/// Task names double as file names for checkpoints
pub fn is_valid_task_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn validate_pattern(task: &str, field: &str, pattern: &str) -> Result<(), DefinitionError> {
    if pattern.trim().is_empty() {
        return Err(invalid(task, field, "pattern cannot be empty"));
    }
    if let Err(e) = glob::Pattern::new(pattern) {
        return Err(invalid(task, field, format!("invalid glob '{}': {}", pattern, e)));
    }
    let path = Path::new(pattern);
    if path.is_absolute() || pattern.starts_with('/') {
        return Err(invalid(task, field, format!("'{}' must be relative", pattern)));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(invalid(
            task,
            field,
            format!("'{}' must not leave the working directory", pattern),
        ));
    }
    Ok(())
}

fn validate_task(name: &str, spec: &TaskSpec) -> Result<(), DefinitionError> {
    if !is_valid_task_name(name) {
        return Err(invalid(
            name,
            "name",
            "must be non-empty and use only [A-Za-z0-9_.-]",
        ));
    }

    if spec.run.trim().is_empty() {
        return Err(invalid(name, "run", "command cannot be empty"));
    }

    for key in spec.env.keys() {
        if !is_valid_env_key(key) {
            return Err(invalid(
                name,
                "env",
                format!("'{}' is not a valid variable name", key),
            ));
        }
    }

    for pattern in &spec.inputs {
        validate_pattern(name, "inputs", pattern)?;
    }
    for pattern in &spec.outputs {
        validate_pattern(name, "outputs", pattern)?;
    }

    let mut deps = BTreeSet::new();
    for dep in &spec.depends_on {
        if dep == name {
            return Err(invalid(name, "depends_on", "a task cannot depend on itself"));
        }
        if !deps.insert(dep.as_str()) {
            return Err(invalid(
                name,
                "depends_on",
                format!("'{}' is listed more than once", dep),
            ));
        }
    }

    if spec.tools.keys().any(|k| k.trim().is_empty()) {
        return Err(invalid(name, "tools", "tool name cannot be empty"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const YAML: &str = r#"
compile:
  inputs: ["src/**/*.c"]
  run: "cc -o out/app src/main.c"
  env:
    CC: gcc
  outputs: ["out/app"]
  tools:
    gcc: "13.2"
test:
  run: "./out/app --test"
  depends_on: [compile]
"#;

    #[test]
    fn test_parse_yaml_preserves_order() {
        let defs = parse_definition(YAML, DefinitionFormat::Yaml).unwrap();
        let names: Vec<&str> = defs.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["compile", "test"]);

        let compile = defs.get("compile").unwrap();
        assert_eq!(compile.env.get("CC").map(String::as_str), Some("gcc"));
        assert_eq!(compile.outputs, vec!["out/app"]);
        assert!(!compile.allow_network);
        assert_eq!(defs.get("test").unwrap().depends_on, vec!["compile"]);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = parse_definition(
            "build:\n  run: make\n  retries: 3\n",
            DefinitionFormat::Yaml,
        )
        .unwrap_err();
        assert!(matches!(err, DefinitionError::Parse(_)));
        assert!(err.to_string().contains("retries"));
    }

    #[test]
    fn test_missing_run_rejected() {
        let err = parse_definition(r#"{"build": {"inputs": []}}"#, DefinitionFormat::Json)
            .unwrap_err();
        assert!(matches!(err, DefinitionError::Parse(_)));
    }

    #[test]
    fn test_duplicate_task_rejected_in_json() {
        let err = parse_definition(
            r#"{"build": {"run": "a"}, "build": {"run": "b"}}"#,
            DefinitionFormat::Json,
        )
        .unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateTask(ref n) if n == "build"));
    }

    #[test]
    fn test_duplicate_task_rejected_in_yaml() {
        let result = parse_definition("a:\n  run: x\na:\n  run: y\n", DefinitionFormat::Yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_names_and_fields() {
        let cases = [
            ("bad name", TaskSpec::new("true")),
            ("ok", TaskSpec::new("   ")),
            ("ok", TaskSpec::new("true").with_env("1BAD", "x")),
            ("ok", TaskSpec::new("true").with_input("../secret")),
            ("ok", TaskSpec::new("true").with_output("/abs/path")),
            ("ok", TaskSpec::new("true").with_input("[unclosed")),
            ("ok", TaskSpec::new("true").with_depends_on("ok")),
            (
                "ok",
                TaskSpec::new("true")
                    .with_depends_on("a")
                    .with_depends_on("a"),
            ),
        ];

        for (name, spec) in cases {
            let defs = TaskDefinitions::new().with_task(name, spec.clone());
            assert!(
                defs.validate().is_err(),
                "expected {:?} / {:?} to be rejected",
                name,
                spec
            );
        }
    }

    #[test]
    fn test_task_name_rules() {
        assert!(is_valid_task_name("build.release-x_1"));
        assert!(!is_valid_task_name(""));
        assert!(!is_valid_task_name(".."));
        assert!(!is_valid_task_name("a/b"));
    }

    #[test]
    fn test_load_definition_from_disk() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tasks.yaml");
        std::fs::write(&path, YAML).unwrap();

        let defs = load_definition(&path).unwrap();
        assert_eq!(defs.len(), 2);
    }

    #[test]
    fn test_load_definition_errors() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("missing.yaml");
        assert!(matches!(
            load_definition(&missing),
            Err(DefinitionError::NotFound(_))
        ));

        let toml = temp.path().join("tasks.toml");
        std::fs::write(&toml, "").unwrap();
        assert!(matches!(
            load_definition(&toml),
            Err(DefinitionError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_empty_mapping_is_valid() {
        let defs = parse_definition("{}", DefinitionFormat::Json).unwrap();
        assert!(defs.is_empty());
    }
}
