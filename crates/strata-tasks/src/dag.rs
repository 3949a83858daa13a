//! Task graph construction and management
//!
//! The graph is an arena: nodes live in a `Vec` sorted by task name and are
//! addressed by [`NodeIndex`]. Because index order equals name order, sorting
//! indices is the same as sorting by name, which keeps every traversal below
//! deterministic without extra bookkeeping.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use serde::Serialize;
use strata_core::{DefinitionError, TaskDefinitions, TaskSpec};
use tracing::{info, instrument};

use crate::task::TaskId;

/// Position of a node in the graph arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct NodeIndex(usize);

impl NodeIndex {
    /// Raw arena slot
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A node in the task graph
#[derive(Debug, Clone)]
pub struct TaskNode {
    /// Task identifier
    pub id: TaskId,
    /// The declared task
    pub spec: TaskSpec,
    /// Direct dependencies, ascending by name
    pub dependencies: Vec<NodeIndex>,
    /// Direct dependents, ascending by name
    pub dependents: Vec<NodeIndex>,
    /// Topological depth (roots are 0)
    pub depth: usize,
}

/// Immutable directed acyclic graph of tasks
#[derive(Debug, Clone)]
pub struct TaskGraph {
    nodes: Vec<TaskNode>,
    index: BTreeMap<TaskId, NodeIndex>,
    /// Nodes grouped by depth, each level ascending by name
    levels: Vec<Vec<NodeIndex>>,
    /// Canonical (depth, name) order
    order: Vec<NodeIndex>,
    /// Inverse of `order`
    positions: Vec<usize>,
}

impl TaskGraph {
    /// Load and validate a graph from task definitions.
    ///
    /// Fails before anything runs when a field is invalid, a name is
    /// duplicated, an edge points at a missing task, two tasks declare output
    /// patterns that can match the same file, or the edges form a cycle.
    #[instrument(skip_all, fields(tasks = definitions.len()))]
    pub fn load(definitions: &TaskDefinitions) -> Result<Self, DagError> {
        definitions.validate()?;

        let mut sorted: Vec<(&str, &TaskSpec)> = definitions.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(b.0));

        let index: BTreeMap<TaskId, NodeIndex> = sorted
            .iter()
            .enumerate()
            .map(|(i, (name, _))| (TaskId::new(*name), NodeIndex(i)))
            .collect();

        let mut nodes = Vec::with_capacity(sorted.len());
        for (name, spec) in &sorted {
            let mut dependencies = Vec::with_capacity(spec.depends_on.len());
            for dep in &spec.depends_on {
                let dep_idx = index
                    .get(&TaskId::new(dep.as_str()))
                    .copied()
                    .ok_or_else(|| DagError::UnknownDependency {
                        task: name.to_string(),
                        dependency: dep.clone(),
                    })?;
                dependencies.push(dep_idx);
            }
            dependencies.sort();
            dependencies.dedup();

            nodes.push(TaskNode {
                id: TaskId::new(*name),
                spec: (*spec).clone(),
                dependencies,
                dependents: Vec::new(),
                depth: 0,
            });
        }

        // Build reverse dependency lists (dependents)
        for i in 0..nodes.len() {
            let deps = nodes[i].dependencies.clone();
            for dep in deps {
                nodes[dep.0].dependents.push(NodeIndex(i));
            }
        }

        Self::check_output_conflicts(&nodes)?;

        let sorted_order = Self::topological_sort(&nodes)?;
        let levels = Self::compute_levels(&mut nodes, &sorted_order);

        let order: Vec<NodeIndex> = levels.iter().flatten().copied().collect();
        let mut positions = vec![0; nodes.len()];
        for (pos, idx) in order.iter().enumerate() {
            positions[idx.0] = pos;
        }

        info!(
            task_count = nodes.len(),
            depth_count = levels.len(),
            "task graph loaded"
        );

        Ok(Self {
            nodes,
            index,
            levels,
            order,
            positions,
        })
    }

    /// Reject output patterns of different tasks that could match the same
    /// file. Each task clears and collects its own outputs in the shared
    /// working directory, so overlapping patterns would make one task's
    /// artifacts depend on when the other one ran.
    fn check_output_conflicts(nodes: &[TaskNode]) -> Result<(), DagError> {
        for (i, node) in nodes.iter().enumerate() {
            for other in &nodes[i + 1..] {
                for first in &node.spec.outputs {
                    for second in &other.spec.outputs {
                        if patterns_overlap(first, second) {
                            return Err(DagError::ConflictingOutput {
                                first: node.id.to_string(),
                                first_pattern: first.clone(),
                                second: other.id.to_string(),
                                second_pattern: second.clone(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Topological sort using Kahn's algorithm.
    ///
    /// Ready nodes are taken lowest index (name) first.
    #[instrument(skip_all, fields(node_count = nodes.len()))]
    fn topological_sort(nodes: &[TaskNode]) -> Result<Vec<NodeIndex>, DagError> {
        let mut in_degree: Vec<usize> = nodes.iter().map(|n| n.dependencies.len()).collect();
        let mut ready: BTreeSet<NodeIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| NodeIndex(i))
            .collect();
        let mut sorted = Vec::with_capacity(nodes.len());

        while let Some(idx) = ready.pop_first() {
            sorted.push(idx);
            for dependent in &nodes[idx.0].dependents {
                let degree = &mut in_degree[dependent.0];
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    ready.insert(*dependent);
                }
            }
        }

        if sorted.len() != nodes.len() {
            let in_sorted: BTreeSet<_> = sorted.iter().collect();
            let cyclic: Vec<String> = (0..nodes.len())
                .map(NodeIndex)
                .filter(|idx| !in_sorted.contains(idx))
                .map(|idx| nodes[idx.0].id.to_string())
                .collect();
            return Err(DagError::CyclicDependency(cyclic.join(", ")));
        }

        Ok(sorted)
    }

    /// Assign depths and group nodes into levels
    #[instrument(skip_all, fields(node_count = nodes.len()))]
    fn compute_levels(nodes: &mut [TaskNode], sorted: &[NodeIndex]) -> Vec<Vec<NodeIndex>> {
        for idx in sorted {
            let depth = nodes[idx.0]
                .dependencies
                .iter()
                .map(|dep| nodes[dep.0].depth + 1)
                .max()
                .unwrap_or(0);
            nodes[idx.0].depth = depth;
        }

        let max_depth = nodes.iter().map(|n| n.depth).max();
        let mut levels: Vec<Vec<NodeIndex>> = match max_depth {
            Some(max) => vec![Vec::new(); max + 1],
            None => Vec::new(),
        };
        // Index order is name order, so each level comes out sorted.
        for (i, node) in nodes.iter().enumerate() {
            levels[node.depth].push(NodeIndex(i));
        }
        levels
    }

    /// Get a node by index
    pub fn node(&self, idx: NodeIndex) -> &TaskNode {
        &self.nodes[idx.0]
    }

    /// All nodes, ascending by name
    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    /// Every node index, ascending by name
    pub fn indices(&self) -> impl Iterator<Item = NodeIndex> {
        (0..self.nodes.len()).map(NodeIndex)
    }

    /// Look up a task by name
    pub fn get(&self, id: &TaskId) -> Option<NodeIndex> {
        self.index.get(id).copied()
    }

    /// Depth levels; level N holds every node at depth N, ascending by name
    pub fn levels(&self) -> &[Vec<NodeIndex>] {
        &self.levels
    }

    /// Nodes in canonical (depth, name) order
    pub fn canonical_order(&self) -> &[NodeIndex] {
        &self.order
    }

    /// Position of a node in canonical order
    pub fn position(&self, idx: NodeIndex) -> usize {
        self.positions[idx.0]
    }

    /// Get the total number of tasks
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the graph is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every edge as (dependency, dependent), sorted
    pub fn edges(&self) -> Vec<(&TaskId, &TaskId)> {
        let mut edges: Vec<(&TaskId, &TaskId)> = self
            .nodes
            .iter()
            .flat_map(|node| {
                node.dependencies
                    .iter()
                    .map(move |dep| (&self.nodes[dep.0].id, &node.id))
            })
            .collect();
        edges.sort();
        edges
    }

    /// Transitive dependencies of a node
    pub fn ancestors(&self, idx: NodeIndex) -> BTreeSet<NodeIndex> {
        self.walk(idx, |node| &node.dependencies)
    }

    /// Transitive dependents of a node
    pub fn descendants(&self, idx: NodeIndex) -> BTreeSet<NodeIndex> {
        self.walk(idx, |node| &node.dependents)
    }

    fn walk<'a, F>(&'a self, start: NodeIndex, next: F) -> BTreeSet<NodeIndex>
    where
        F: Fn(&'a TaskNode) -> &'a Vec<NodeIndex>,
    {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<NodeIndex> = next(&self.nodes[start.0]).iter().copied().collect();
        while let Some(idx) = queue.pop_front() {
            if seen.insert(idx) {
                queue.extend(next(&self.nodes[idx.0]).iter().copied());
            }
        }
        seen
    }

    /// Output patterns declared by every task, used to keep derived files
    /// out of input resolution
    pub fn declared_outputs(&self) -> Vec<&str> {
        let mut outputs: Vec<&str> = self
            .nodes
            .iter()
            .flat_map(|n| n.spec.outputs.iter().map(String::as_str))
            .collect();
        outputs.sort_unstable();
        outputs.dedup();
        outputs
    }
}

/// Whether two relative output patterns can match a common path.
///
/// Patterns are compared component by component. A literal component is
/// tested against a wildcard one; two wildcard components, or a `**`
/// anywhere past a common prefix, are treated as overlapping.
pub(crate) fn patterns_overlap(a: &str, b: &str) -> bool {
    let left = pattern_components(a);
    let right = pattern_components(b);
    components_overlap(&left, &right)
}

fn pattern_components(pattern: &str) -> Vec<&str> {
    pattern
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect()
}

fn components_overlap(left: &[&str], right: &[&str]) -> bool {
    match (left.split_first(), right.split_first()) {
        (None, None) => true,
        (Some((l, _)), _) if l.contains("**") => true,
        (_, Some((r, _))) if r.contains("**") => true,
        (Some((l, left_rest)), Some((r, right_rest))) => {
            component_overlaps(l, r) && components_overlap(left_rest, right_rest)
        }
        _ => false,
    }
}

fn component_overlaps(l: &str, r: &str) -> bool {
    let is_wild = |c: &str| c.contains(['*', '?', '[']);
    match (is_wild(l), is_wild(r)) {
        (false, false) => l == r,
        (true, false) => wildcard_matches(l, r),
        (false, true) => wildcard_matches(r, l),
        (true, true) => true,
    }
}

fn wildcard_matches(pattern: &str, literal: &str) -> bool {
    glob::Pattern::new(pattern)
        .map(|p| p.matches_with(literal, crate::hash::match_options()))
        .unwrap_or(true)
}

/// Errors during graph loading
#[derive(Debug, thiserror::Error)]
pub enum DagError {
    /// Field-level validation failed
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    /// Cyclic dependency detected
    #[error("Cyclic dependency detected among tasks: {0}")]
    CyclicDependency(String),

    /// Edge endpoint does not exist
    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    /// Two tasks declare outputs that can match the same file
    #[error("Output '{first_pattern}' of '{first}' overlaps output '{second_pattern}' of '{second}'")]
    ConflictingOutput {
        first: String,
        first_pattern: String,
        second: String,
        second_pattern: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> TaskDefinitions {
        TaskDefinitions::new()
            .with_task("package", TaskSpec::new("echo pkg").with_depends_on("test").with_depends_on("lint"))
            .with_task("compile", TaskSpec::new("echo compile"))
            .with_task("test", TaskSpec::new("echo test").with_depends_on("compile"))
            .with_task("lint", TaskSpec::new("echo lint").with_depends_on("compile"))
            .with_task("docs", TaskSpec::new("echo docs"))
    }

    fn names(graph: &TaskGraph, idxs: &[NodeIndex]) -> Vec<String> {
        idxs.iter().map(|i| graph.node(*i).id.to_string()).collect()
    }

    #[test]
    fn test_load_graph() {
        let graph = TaskGraph::load(&diamond()).unwrap();
        assert_eq!(graph.len(), 5);
        assert_eq!(graph.levels().len(), 3);
    }

    #[test]
    fn test_levels_sorted_by_name() {
        let graph = TaskGraph::load(&diamond()).unwrap();
        assert_eq!(names(&graph, &graph.levels()[0]), vec!["compile", "docs"]);
        assert_eq!(names(&graph, &graph.levels()[1]), vec!["lint", "test"]);
        assert_eq!(names(&graph, &graph.levels()[2]), vec!["package"]);
        assert_eq!(
            names(&graph, graph.canonical_order()),
            vec!["compile", "docs", "lint", "test", "package"]
        );
    }

    #[test]
    fn test_positions_follow_canonical_order() {
        let graph = TaskGraph::load(&diamond()).unwrap();
        let package = graph.get(&TaskId::new("package")).unwrap();
        let docs = graph.get(&TaskId::new("docs")).unwrap();
        assert_eq!(graph.position(package), 4);
        assert_eq!(graph.position(docs), 1);
    }

    #[test]
    fn test_definition_order_does_not_matter() {
        let reversed = TaskDefinitions::new()
            .with_task("docs", TaskSpec::new("echo docs"))
            .with_task("lint", TaskSpec::new("echo lint").with_depends_on("compile"))
            .with_task("test", TaskSpec::new("echo test").with_depends_on("compile"))
            .with_task("compile", TaskSpec::new("echo compile"))
            .with_task("package", TaskSpec::new("echo pkg").with_depends_on("lint").with_depends_on("test"));

        let a = TaskGraph::load(&diamond()).unwrap();
        let b = TaskGraph::load(&reversed).unwrap();
        assert_eq!(names(&a, a.canonical_order()), names(&b, b.canonical_order()));
        assert_eq!(a.edges(), b.edges());
    }

    #[test]
    fn test_cycle_detected() {
        let defs = TaskDefinitions::new()
            .with_task("a", TaskSpec::new("true").with_depends_on("c"))
            .with_task("b", TaskSpec::new("true").with_depends_on("a"))
            .with_task("c", TaskSpec::new("true").with_depends_on("b"))
            .with_task("d", TaskSpec::new("true"));

        match TaskGraph::load(&defs) {
            Err(DagError::CyclicDependency(tasks)) => assert_eq!(tasks, "a, b, c"),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_dependency() {
        let defs = TaskDefinitions::new().with_task("a", TaskSpec::new("true").with_depends_on("ghost"));
        assert!(matches!(
            TaskGraph::load(&defs),
            Err(DagError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let defs = TaskDefinitions::new()
            .with_task("a", TaskSpec::new("true"))
            .with_task("a", TaskSpec::new("false"));
        assert!(matches!(
            TaskGraph::load(&defs),
            Err(DagError::Definition(DefinitionError::DuplicateTask(_)))
        ));
    }

    #[test]
    fn test_conflicting_outputs_rejected() {
        let defs = TaskDefinitions::new()
            .with_task("a", TaskSpec::new("true").with_output("out.txt"))
            .with_task("b", TaskSpec::new("true").with_output("out.txt"));
        assert!(matches!(
            TaskGraph::load(&defs),
            Err(DagError::ConflictingOutput { .. })
        ));
    }

    #[test]
    fn test_ancestors_and_descendants() {
        let graph = TaskGraph::load(&diamond()).unwrap();
        let compile = graph.get(&TaskId::new("compile")).unwrap();
        let package = graph.get(&TaskId::new("package")).unwrap();

        let down: Vec<_> = graph.descendants(compile).into_iter().collect();
        assert_eq!(names(&graph, &down), vec!["lint", "package", "test"]);

        let up: Vec<_> = graph.ancestors(package).into_iter().collect();
        assert_eq!(names(&graph, &up), vec!["compile", "lint", "test"]);
    }

    #[test]
    fn test_overlapping_output_globs_rejected() {
        let defs = TaskDefinitions::new()
            .with_task("a_wide", TaskSpec::new("true").with_output("out/*"))
            .with_task("b_narrow", TaskSpec::new("true").with_output("out/n.txt"));
        match TaskGraph::load(&defs) {
            Err(DagError::ConflictingOutput {
                first,
                first_pattern,
                second,
                second_pattern,
            }) => {
                assert_eq!((first.as_str(), first_pattern.as_str()), ("a_wide", "out/*"));
                assert_eq!((second.as_str(), second_pattern.as_str()), ("b_narrow", "out/n.txt"));
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_disjoint_output_globs_accepted() {
        let defs = TaskDefinitions::new()
            .with_task("a", TaskSpec::new("true").with_output("out/a/*"))
            .with_task("b", TaskSpec::new("true").with_output("out/b.txt"))
            .with_task("c", TaskSpec::new("true").with_output("dist/**/*.js"));
        assert!(TaskGraph::load(&defs).is_ok());
    }

    #[test]
    fn test_patterns_overlap() {
        assert!(patterns_overlap("out/*.txt", "out/n.txt"));
        assert!(patterns_overlap("./out/n.txt", "out/n.txt"));
        assert!(patterns_overlap("out/**", "out/deep/n.txt"));
        assert!(patterns_overlap("out/*.txt", "out/n?.txt"));
        assert!(!patterns_overlap("out/*.txt", "out/n.bin"));
        assert!(!patterns_overlap("out/*", "out/deep/n.txt"));
        assert!(!patterns_overlap("build/**", "out/n.txt"));
    }

    #[test]
    fn test_empty_graph() {
        let graph = TaskGraph::load(&TaskDefinitions::new()).unwrap();
        assert!(graph.is_empty());
        assert!(graph.levels().is_empty());
    }
}
