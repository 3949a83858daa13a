//! Content-derived task and graph identities
//!
//! Everything here is a pure function of declared data: file contents found
//! by the task's input globs, the command text, declared environment values,
//! declared outputs and tool versions. File metadata, timestamps and the
//! ambient environment never reach a digest.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strata_core::TaskSpec;
use tracing::{debug, instrument};

use crate::dag::{NodeIndex, TaskGraph};

/// Digest of a task's complete input state
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHash(String);

impl TaskHash {
    /// Wrap an existing hex digest
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Hex representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, for display
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for TaskHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Digest of the whole graph: structure plus every task hash
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphHash(String);

impl GraphHash {
    /// Wrap an existing hex digest
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Hex representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GraphHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SHA-256 of raw bytes, lowercase hex
pub fn digest_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// SHA-256 over length-framed fields, so `("ab", "c")` and `("a", "bc")`
/// never collide
struct FieldHasher(Sha256);

impl FieldHasher {
    fn new(domain: &str) -> Self {
        let mut hasher = Self(Sha256::new());
        hasher.field("domain", domain.as_bytes());
        hasher
    }

    fn field(&mut self, tag: &str, value: &[u8]) {
        self.0.update((tag.len() as u64).to_le_bytes());
        self.0.update(tag.as_bytes());
        self.0.update((value.len() as u64).to_le_bytes());
        self.0.update(value);
    }

    fn finish(self) -> String {
        format!("{:x}", self.0.finalize())
    }
}

/// Per-component digests, persisted so a later run can tell which part of
/// a task changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashComponents {
    /// Sorted input paths and their contents
    pub inputs: String,
    /// Command text and network permission
    pub command: String,
    /// Declared environment
    pub env: String,
    /// Declared output patterns
    pub outputs: String,
    /// Tool-version references
    pub tools: String,
}

impl HashComponents {
    /// Compute component digests from a task and its resolved input files.
    ///
    /// `files` maps normalized relative paths to contents; the map's order is
    /// the canonical lexicographic order.
    pub fn compute(spec: &TaskSpec, files: &BTreeMap<String, Vec<u8>>) -> Self {
        let mut inputs = FieldHasher::new("inputs");
        for (path, contents) in files {
            inputs.field("path", path.as_bytes());
            inputs.field("content", digest_bytes(contents).as_bytes());
        }

        let mut command = FieldHasher::new("command");
        command.field("run", spec.run.as_bytes());
        let network = if spec.allow_network { "allow" } else { "deny" };
        command.field("network", network.as_bytes());

        let mut env = FieldHasher::new("env");
        for (key, value) in &spec.env {
            env.field("key", key.as_bytes());
            env.field("value", value.as_bytes());
        }

        let mut declared: Vec<&str> = spec.outputs.iter().map(String::as_str).collect();
        declared.sort_unstable();
        let mut outputs = FieldHasher::new("outputs");
        for pattern in declared {
            outputs.field("pattern", pattern.as_bytes());
        }

        let mut tools = FieldHasher::new("tools");
        for (tool, version) in &spec.tools {
            tools.field("tool", tool.as_bytes());
            tools.field("version", version.as_bytes());
        }

        Self {
            inputs: inputs.finish(),
            command: command.finish(),
            env: env.finish(),
            outputs: outputs.finish(),
            tools: tools.finish(),
        }
    }
}

/// Combine components and direct dependency hashes into a task hash.
///
/// `dependencies` must be sorted by task name. The task's own name is not
/// part of the digest: two tasks with identical declarations are
/// interchangeable.
pub fn task_hash(components: &HashComponents, dependencies: &[(&str, &TaskHash)]) -> TaskHash {
    let mut hasher = FieldHasher::new("task");
    hasher.field("inputs", components.inputs.as_bytes());
    hasher.field("command", components.command.as_bytes());
    hasher.field("env", components.env.as_bytes());
    hasher.field("outputs", components.outputs.as_bytes());
    hasher.field("tools", components.tools.as_bytes());
    for (name, hash) in dependencies {
        hasher.field("dependency", name.as_bytes());
        hasher.field("dependency-hash", hash.as_str().as_bytes());
    }
    TaskHash(hasher.finish())
}

/// Hash of one node with the components it was derived from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHash {
    /// Component digests
    pub components: HashComponents,
    /// Final task hash
    pub hash: TaskHash,
}

/// Every hash of a loaded graph, indexed like the graph arena
#[derive(Debug, Clone)]
pub struct GraphHashes {
    graph: GraphHash,
    nodes: Vec<NodeHash>,
}

impl GraphHashes {
    /// The graph hash
    pub fn graph_hash(&self) -> &GraphHash {
        &self.graph
    }

    /// Hash of one node
    pub fn node(&self, idx: NodeIndex) -> &NodeHash {
        &self.nodes[idx.index()]
    }

    /// Task hash of one node
    pub fn task_hash(&self, idx: NodeIndex) -> &TaskHash {
        &self.nodes[idx.index()].hash
    }
}

/// Graph hash over sorted nodes, sorted edges and every task hash
pub fn graph_hash(graph: &TaskGraph, task_hashes: &[TaskHash]) -> GraphHash {
    let mut hasher = FieldHasher::new("graph");
    for node in graph.nodes() {
        hasher.field("node", node.id.as_str().as_bytes());
    }
    for (from, to) in graph.edges() {
        hasher.field("edge-from", from.as_str().as_bytes());
        hasher.field("edge-to", to.as_str().as_bytes());
    }
    for (node, hash) in graph.nodes().iter().zip(task_hashes) {
        hasher.field("task", node.id.as_str().as_bytes());
        hasher.field("hash", hash.as_str().as_bytes());
    }
    GraphHash(hasher.finish())
}

/// Input resolution settings for one graph
#[derive(Debug, Clone)]
pub struct InputResolver {
    root: PathBuf,
    excluded_patterns: Vec<glob::Pattern>,
    excluded_dirs: Vec<PathBuf>,
}

impl InputResolver {
    /// Resolve against `root`, skipping files under any of `excluded_dirs`
    /// and files matching any task's declared outputs
    pub fn new(root: &Path, graph: &TaskGraph, excluded_dirs: &[PathBuf]) -> Self {
        let excluded_patterns = graph
            .declared_outputs()
            .into_iter()
            .filter_map(|p| glob::Pattern::new(p).ok())
            .collect();
        Self {
            root: root.to_path_buf(),
            excluded_patterns,
            excluded_dirs: excluded_dirs.to_vec(),
        }
    }

    fn is_excluded(&self, path: &Path, relative: &str) -> bool {
        self.excluded_dirs.iter().any(|dir| path.starts_with(dir))
            || self
                .excluded_patterns
                .iter()
                .any(|p| p.matches_with(relative, match_options()))
    }

    /// Read every file matched by the task's input globs
    pub fn read_inputs(&self, spec: &TaskSpec) -> Result<BTreeMap<String, Vec<u8>>, HashError> {
        let mut files = BTreeMap::new();
        for path in expand_globs(&self.root, &spec.inputs)? {
            let relative = relative_path(&self.root, &path);
            if files.contains_key(&relative) || self.is_excluded(&path, &relative) {
                continue;
            }
            let contents = fs::read(&path).map_err(|source| HashError::Io {
                path: path.clone(),
                source,
            })?;
            files.insert(relative, contents);
        }
        Ok(files)
    }
}

/// Glob options shared by input and output matching
pub(crate) fn match_options() -> glob::MatchOptions {
    glob::MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

/// Expand patterns relative to `root` into existing regular files
pub(crate) fn expand_globs(root: &Path, patterns: &[String]) -> Result<Vec<PathBuf>, HashError> {
    let escaped_root = glob::Pattern::escape(&root.to_string_lossy());
    let mut found = Vec::new();
    for pattern in patterns {
        let full = format!("{}/{}", escaped_root.trim_end_matches('/'), pattern);
        let paths = glob::glob_with(&full, match_options()).map_err(|e| HashError::Pattern {
            pattern: pattern.clone(),
            message: e.to_string(),
        })?;
        for entry in paths {
            let path = entry.map_err(|e| HashError::Io {
                path: e.path().to_path_buf(),
                source: e.into_error(),
            })?;
            if path.is_file() {
                found.push(path);
            }
        }
    }
    found.sort();
    found.dedup();
    Ok(found)
}

/// Relative path with `/` separators regardless of platform
pub(crate) fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Compute every task hash and the graph hash.
///
/// Nodes are visited in canonical order so dependency hashes are always
/// available when a dependent is hashed.
#[instrument(skip_all, fields(tasks = graph.len()))]
pub fn hash_graph(graph: &TaskGraph, resolver: &InputResolver) -> Result<GraphHashes, HashError> {
    let mut slots: Vec<Option<NodeHash>> = vec![None; graph.len()];

    for &idx in graph.canonical_order() {
        let node = graph.node(idx);
        let files = resolver.read_inputs(&node.spec)?;
        let components = HashComponents::compute(&node.spec, &files);

        let mut dependencies = Vec::with_capacity(node.dependencies.len());
        for dep in &node.dependencies {
            let dep_hash = slots[dep.index()]
                .as_ref()
                .map(|h| &h.hash)
                .ok_or_else(|| HashError::Unordered(graph.node(*dep).id.to_string()))?;
            dependencies.push((graph.node(*dep).id.as_str(), dep_hash));
        }
        let hash = task_hash(&components, &dependencies);
        debug!(task = %node.id, hash = hash.short(), inputs = files.len(), "task hashed");
        slots[idx.index()] = Some(NodeHash { components, hash });
    }

    let nodes: Vec<NodeHash> = slots.into_iter().flatten().collect();
    let task_hashes: Vec<TaskHash> = nodes.iter().map(|n| n.hash.clone()).collect();
    let graph = graph_hash(graph, &task_hashes);
    debug!(graph_hash = %graph, "graph hashed");
    Ok(GraphHashes { graph, nodes })
}

/// Errors while hashing
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    /// A declared input could not be read
    #[error("Cannot read input '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A pattern could not be expanded
    #[error("Invalid pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },

    /// A dependency was hashed after its dependent
    #[error("Dependency '{0}' was not hashed before its dependents")]
    Unordered(String),
}
