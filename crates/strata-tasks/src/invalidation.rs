//! Invalidation reasons
//!
//! Compares the current graph against the snapshot recorded by a prior run
//! and explains, per task, why its previous result no longer applies. The
//! report is explanatory only: whether a task executes or replays is decided
//! by its hash and the cache.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::dag::{NodeIndex, TaskGraph};
use crate::hash::{GraphHash, GraphHashes, HashComponents, TaskHash};
use crate::task::TaskId;

/// Why a task's prior result no longer applies
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "reason", content = "source", rename_all = "snake_case")]
pub enum InvalidationReason {
    /// The node is new or its dependency set changed
    GraphStructureChanged,
    /// Resolved input files or their contents changed
    InputChanged,
    /// Declared environment changed
    EnvChanged,
    /// Command text, network permission or tool versions changed
    CommandChanged,
    /// Declared outputs changed
    OutputChanged,
    /// An upstream task was invalidated
    DependencyInvalidated(TaskId),
}

impl fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GraphStructureChanged => f.write_str("graph structure changed"),
            Self::InputChanged => f.write_str("inputs changed"),
            Self::EnvChanged => f.write_str("environment changed"),
            Self::CommandChanged => f.write_str("command changed"),
            Self::OutputChanged => f.write_str("outputs changed"),
            Self::DependencyInvalidated(source) => write!(f, "dependency '{}' invalidated", source),
        }
    }
}

/// Recorded state of one task in a prior run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotTask {
    /// Task hash
    pub task_hash: TaskHash,
    /// Component digests
    pub components: HashComponents,
    /// Direct dependencies, sorted
    pub dependencies: Vec<TaskId>,
}

/// Everything a later run needs to explain what changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    /// Graph hash of the run
    pub graph_hash: GraphHash,
    /// Per-task state
    pub tasks: BTreeMap<TaskId, SnapshotTask>,
}

impl GraphSnapshot {
    /// Capture the current graph
    pub fn capture(graph: &TaskGraph, hashes: &GraphHashes) -> Self {
        let tasks = graph
            .indices()
            .map(|idx| {
                let node = graph.node(idx);
                let hash = hashes.node(idx);
                (
                    node.id.clone(),
                    SnapshotTask {
                        task_hash: hash.hash.clone(),
                        components: hash.components.clone(),
                        dependencies: node
                            .dependencies
                            .iter()
                            .map(|d| graph.node(*d).id.clone())
                            .collect(),
                    },
                )
            })
            .collect();
        Self {
            graph_hash: hashes.graph_hash().clone(),
            tasks,
        }
    }
}

/// Per-task invalidation reasons
#[derive(Debug, Clone, Default)]
pub struct InvalidationReport {
    reasons: Vec<Vec<InvalidationReason>>,
    removed: Vec<TaskId>,
    has_prior: bool,
}

impl InvalidationReport {
    /// Reasons for one node, own reasons first, then upstream sources in
    /// (depth, name) order
    pub fn reasons(&self, idx: NodeIndex) -> &[InvalidationReason] {
        self.reasons
            .get(idx.index())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether a node carries any reason
    pub fn is_invalidated(&self, idx: NodeIndex) -> bool {
        !self.reasons(idx).is_empty()
    }

    /// Whether a prior snapshot was available
    pub fn has_prior(&self) -> bool {
        self.has_prior
    }

    /// Tasks present in the prior run but gone now, sorted
    pub fn removed(&self) -> &[TaskId] {
        &self.removed
    }

    /// Number of invalidated nodes
    pub fn invalidated_count(&self) -> usize {
        self.reasons.iter().filter(|r| !r.is_empty()).count()
    }

    /// Invalidated tasks in canonical (depth, name) order
    pub fn entries<'a>(
        &'a self,
        graph: &'a TaskGraph,
    ) -> impl Iterator<Item = (&'a TaskId, &'a [InvalidationReason])> + 'a {
        graph
            .canonical_order()
            .iter()
            .filter(move |idx| self.is_invalidated(**idx))
            .map(move |idx| (&graph.node(*idx).id, self.reasons(*idx)))
    }

    /// Reasons keyed by task name
    pub fn to_map(&self, graph: &TaskGraph) -> BTreeMap<TaskId, Vec<InvalidationReason>> {
        self.entries(graph)
            .map(|(id, reasons)| (id.clone(), reasons.to_vec()))
            .collect()
    }
}

fn own_reasons(current: &HashComponents, prior: &HashComponents) -> Vec<InvalidationReason> {
    let mut reasons = Vec::new();
    if current.inputs != prior.inputs {
        reasons.push(InvalidationReason::InputChanged);
    }
    if current.env != prior.env {
        reasons.push(InvalidationReason::EnvChanged);
    }
    if current.command != prior.command || current.tools != prior.tools {
        reasons.push(InvalidationReason::CommandChanged);
    }
    if current.outputs != prior.outputs {
        reasons.push(InvalidationReason::OutputChanged);
    }
    reasons
}

/// Compare the graph against a prior snapshot.
///
/// Without a prior snapshot there is nothing to compare and the report is
/// empty.
#[instrument(skip_all, fields(tasks = graph.len(), has_prior = prior.is_some()))]
pub fn compute_invalidation(
    graph: &TaskGraph,
    hashes: &GraphHashes,
    prior: Option<&GraphSnapshot>,
) -> InvalidationReport {
    let prior = match prior {
        Some(p) => p,
        None => {
            return InvalidationReport {
                reasons: vec![Vec::new(); graph.len()],
                removed: Vec::new(),
                has_prior: false,
            }
        }
    };

    let mut reasons: Vec<Vec<InvalidationReason>> = vec![Vec::new(); graph.len()];

    for &idx in graph.canonical_order() {
        let node = graph.node(idx);
        let own = match prior.tasks.get(&node.id) {
            None => vec![InvalidationReason::GraphStructureChanged],
            Some(recorded) => {
                let deps: Vec<&TaskId> = node
                    .dependencies
                    .iter()
                    .map(|d| &graph.node(*d).id)
                    .collect();
                let recorded_deps: Vec<&TaskId> = recorded.dependencies.iter().collect();
                let mut own = Vec::new();
                if deps != recorded_deps {
                    own.push(InvalidationReason::GraphStructureChanged);
                }
                own.extend(own_reasons(&hashes.node(idx).components, &recorded.components));
                own
            }
        };
        reasons[idx.index()] = own;
    }

    // Origins are visited in canonical order, so each node's dependency
    // reasons come out sorted by (depth, name) of their source.
    let origins: Vec<NodeIndex> = graph
        .canonical_order()
        .iter()
        .copied()
        .filter(|idx| !reasons[idx.index()].is_empty())
        .collect();
    for origin in origins {
        let source = graph.node(origin).id.clone();
        for descendant in graph.descendants(origin) {
            reasons[descendant.index()].push(InvalidationReason::DependencyInvalidated(source.clone()));
        }
    }

    let removed: Vec<TaskId> = prior
        .tasks
        .keys()
        .filter(|id| graph.get(id).is_none())
        .cloned()
        .collect();

    let report = InvalidationReport {
        reasons,
        removed,
        has_prior: true,
    };
    debug!(
        invalidated = report.invalidated_count(),
        removed = report.removed.len(),
        "invalidation computed"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{hash_graph, InputResolver};
    use std::fs;
    use strata_core::{TaskDefinitions, TaskSpec};
    use tempfile::TempDir;

    struct Fixture {
        temp: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            fs::write(temp.path().join("a.txt"), "a1").unwrap();
            fs::write(temp.path().join("x.txt"), "x1").unwrap();
            Self { temp }
        }

        fn load(&self, defs: &TaskDefinitions) -> (TaskGraph, GraphHashes) {
            let graph = TaskGraph::load(defs).unwrap();
            let resolver = InputResolver::new(self.temp.path(), &graph, &[]);
            let hashes = hash_graph(&graph, &resolver).unwrap();
            (graph, hashes)
        }
    }

    // a -> b -> d, x -> c
    fn defs() -> TaskDefinitions {
        TaskDefinitions::new()
            .with_task("a", TaskSpec::new("cat a.txt").with_input("a.txt"))
            .with_task("b", TaskSpec::new("echo b").with_depends_on("a"))
            .with_task("d", TaskSpec::new("echo d").with_depends_on("b"))
            .with_task("x", TaskSpec::new("cat x.txt").with_input("x.txt"))
            .with_task("c", TaskSpec::new("echo c").with_depends_on("x"))
    }

    fn reasons_of(report: &InvalidationReport, graph: &TaskGraph, name: &str) -> Vec<InvalidationReason> {
        report.reasons(graph.get(&TaskId::new(name)).unwrap()).to_vec()
    }

    #[test]
    fn test_no_prior_means_no_reasons() {
        let fx = Fixture::new();
        let (graph, hashes) = fx.load(&defs());
        let report = compute_invalidation(&graph, &hashes, None);
        assert!(!report.has_prior());
        assert_eq!(report.invalidated_count(), 0);
    }

    #[test]
    fn test_unchanged_graph_has_no_reasons() {
        let fx = Fixture::new();
        let (graph, hashes) = fx.load(&defs());
        let prior = GraphSnapshot::capture(&graph, &hashes);
        let report = compute_invalidation(&graph, &hashes, Some(&prior));
        assert!(report.has_prior());
        assert_eq!(report.invalidated_count(), 0);
    }

    #[test]
    fn test_input_change_propagates_with_source() {
        let fx = Fixture::new();
        let (graph, hashes) = fx.load(&defs());
        let prior = GraphSnapshot::capture(&graph, &hashes);

        fs::write(fx.temp.path().join("a.txt"), "a2").unwrap();
        let (graph, hashes) = fx.load(&defs());
        let report = compute_invalidation(&graph, &hashes, Some(&prior));

        let a = TaskId::new("a");
        assert_eq!(reasons_of(&report, &graph, "a"), vec![InvalidationReason::InputChanged]);
        assert_eq!(
            reasons_of(&report, &graph, "b"),
            vec![InvalidationReason::DependencyInvalidated(a.clone())]
        );
        assert_eq!(
            reasons_of(&report, &graph, "d"),
            vec![InvalidationReason::DependencyInvalidated(a)]
        );
        assert!(reasons_of(&report, &graph, "c").is_empty());
        assert!(reasons_of(&report, &graph, "x").is_empty());
    }

    #[test]
    fn test_multiple_sources_ordered_by_depth_then_name() {
        let fx = Fixture::new();
        let base = TaskDefinitions::new()
            .with_task("root", TaskSpec::new("echo root"))
            .with_task("mid", TaskSpec::new("echo mid").with_depends_on("root"))
            .with_task("leaf", TaskSpec::new("echo leaf").with_depends_on("mid").with_depends_on("root"));
        let (graph, hashes) = fx.load(&base);
        let prior = GraphSnapshot::capture(&graph, &hashes);

        let changed = TaskDefinitions::new()
            .with_task("root", TaskSpec::new("echo root v2"))
            .with_task("mid", TaskSpec::new("echo mid").with_depends_on("root").with_env("MODE", "fast"))
            .with_task("leaf", TaskSpec::new("echo leaf").with_depends_on("mid").with_depends_on("root"));
        let (graph, hashes) = fx.load(&changed);
        let report = compute_invalidation(&graph, &hashes, Some(&prior));

        assert_eq!(
            reasons_of(&report, &graph, "mid"),
            vec![
                InvalidationReason::EnvChanged,
                InvalidationReason::DependencyInvalidated(TaskId::new("root")),
            ]
        );
        assert_eq!(
            reasons_of(&report, &graph, "leaf"),
            vec![
                InvalidationReason::DependencyInvalidated(TaskId::new("root")),
                InvalidationReason::DependencyInvalidated(TaskId::new("mid")),
            ]
        );
    }

    #[test]
    fn test_structure_changes() {
        let fx = Fixture::new();
        let (graph, hashes) = fx.load(&defs());
        let prior = GraphSnapshot::capture(&graph, &hashes);

        // c now also depends on a; e is new; d is removed
        let changed = TaskDefinitions::new()
            .with_task("a", TaskSpec::new("cat a.txt").with_input("a.txt"))
            .with_task("b", TaskSpec::new("echo b").with_depends_on("a"))
            .with_task("x", TaskSpec::new("cat x.txt").with_input("x.txt"))
            .with_task("c", TaskSpec::new("echo c").with_depends_on("x").with_depends_on("a"))
            .with_task("e", TaskSpec::new("echo e"));
        let (graph, hashes) = fx.load(&changed);
        let report = compute_invalidation(&graph, &hashes, Some(&prior));

        assert_eq!(reasons_of(&report, &graph, "c"), vec![InvalidationReason::GraphStructureChanged]);
        assert_eq!(reasons_of(&report, &graph, "e"), vec![InvalidationReason::GraphStructureChanged]);
        assert!(reasons_of(&report, &graph, "b").is_empty());
        assert_eq!(report.removed(), &[TaskId::new("d")]);
    }

    #[test]
    fn test_command_and_output_changes() {
        let fx = Fixture::new();
        let (graph, hashes) = fx.load(&defs());
        let prior = GraphSnapshot::capture(&graph, &hashes);

        let changed = TaskDefinitions::new()
            .with_task("a", TaskSpec::new("cat a.txt").with_input("a.txt").with_output("a.out"))
            .with_task("b", TaskSpec::new("echo b").with_depends_on("a").with_tool("node", "20"))
            .with_task("d", TaskSpec::new("echo d").with_depends_on("b"))
            .with_task("x", TaskSpec::new("cat x.txt").with_input("x.txt"))
            .with_task("c", TaskSpec::new("echo c").with_depends_on("x"));
        let (graph, hashes) = fx.load(&changed);
        let report = compute_invalidation(&graph, &hashes, Some(&prior));

        assert_eq!(reasons_of(&report, &graph, "a"), vec![InvalidationReason::OutputChanged]);
        assert_eq!(
            reasons_of(&report, &graph, "b"),
            vec![
                InvalidationReason::CommandChanged,
                InvalidationReason::DependencyInvalidated(TaskId::new("a")),
            ]
        );
        let entries: Vec<&str> = report.entries(&graph).map(|(id, _)| id.as_str()).collect();
        assert_eq!(entries, vec!["a", "b", "d"]);
    }

    #[test]
    fn test_deterministic_for_identical_pairs() {
        let fx = Fixture::new();
        let (graph, hashes) = fx.load(&defs());
        let prior = GraphSnapshot::capture(&graph, &hashes);
        fs::write(fx.temp.path().join("x.txt"), "x2").unwrap();
        let (graph, hashes) = fx.load(&defs());

        let first = compute_invalidation(&graph, &hashes, Some(&prior)).to_map(&graph);
        let second = compute_invalidation(&graph, &hashes, Some(&prior)).to_map(&graph);
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn test_reason_serialization() {
        let json = serde_json::to_string(&InvalidationReason::DependencyInvalidated(TaskId::new("a"))).unwrap();
        assert_eq!(json, r#"{"reason":"dependency_invalidated","source":"a"}"#);
        let json = serde_json::to_string(&InvalidationReason::InputChanged).unwrap();
        assert_eq!(json, r#"{"reason":"input_changed"}"#);
    }
}
