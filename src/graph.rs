//! Task graph loading and validation.
//!
//! The graph arrives as a JSON array of task objects produced by an
//! external planning step. Validation fails closed: a graph that passes
//! [`TaskGraph::from_specs`] is structurally sound and the engine never
//! re-checks these properties at runtime.
//!
//! Checks run in a fixed order so error output is stable:
//! 1. task id well-formed, level >= 1, duplicate ids
//! 2. dependencies name existing tasks
//! 3. no dependency cycles
//! 4. no dependency on a higher level than the dependent task
//! 5. no two tasks create the same file (anywhere in the graph)
//! 6. no two tasks in the same level modify the same file

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{mlog_debug, Error, Result};

/// Task ids: leading letter, then letters, digits, `_` or `-`, 64 max.
static TASK_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]{0,63}$").unwrap());

/// Files a task declares it will touch. `create` paths must be unique
/// across the whole graph; `modify` paths must be unique within a level;
/// `read` carries no constraint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileSet {
    #[serde(default)]
    pub create: BTreeSet<String>,
    #[serde(default)]
    pub modify: BTreeSet<String>,
    #[serde(default)]
    pub read: BTreeSet<String>,
}

fn default_verification_timeout() -> u64 {
    300
}

/// Per-task acceptance check, run in the worker's worktree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub command: String,
    #[serde(default = "default_verification_timeout")]
    pub timeout_seconds: u64,
}

impl Verification {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_seconds)
    }
}

/// One task as declared in the input document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    pub title: String,
    pub level: u32,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub files: FileSet,
    pub verification: Verification,
}

/// A validated task graph. Construction is the only place validation
/// happens; an instance always satisfies every structural rule.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    /// Sorted by ascending id.
    specs: Vec<TaskSpec>,
    by_id: HashMap<String, usize>,
}

impl TaskGraph {
    /// Validate a set of task specs into a graph.
    ///
    /// # Errors
    /// Returns `Error::GraphValidation` naming the first violated rule in
    /// the documented check order.
    pub fn from_specs(mut specs: Vec<TaskSpec>) -> Result<Self> {
        if specs.is_empty() {
            return Err(Error::GraphValidation(
                "graph contains no tasks".to_string(),
            ));
        }
        specs.sort_by(|a, b| a.id.cmp(&b.id));

        // Pass 1: well-formed ids, sane levels, duplicates.
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for task in &specs {
            if !TASK_ID_RE.is_match(&task.id) {
                return Err(Error::GraphValidation(format!(
                    "invalid task id '{}': must match [A-Za-z][A-Za-z0-9_-]{{0,63}}",
                    task.id
                )));
            }
            if task.level == 0 {
                return Err(Error::GraphValidation(format!(
                    "task '{}' has level 0: levels start at 1",
                    task.id
                )));
            }
            if !seen.insert(&task.id) {
                return Err(Error::GraphValidation(format!(
                    "duplicate task id '{}'",
                    task.id
                )));
            }
        }

        let by_id: HashMap<String, usize> = specs
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();

        // Pass 2: every dependency names a known task.
        for task in &specs {
            for dep in &task.dependencies {
                if !by_id.contains_key(dep) {
                    return Err(Error::GraphValidation(format!(
                        "task '{}' depends on unknown task '{}'",
                        task.id, dep
                    )));
                }
                if dep == &task.id {
                    return Err(Error::GraphValidation(format!(
                        "task '{}' depends on itself",
                        task.id
                    )));
                }
            }
        }

        // Pass 3: cycle check via petgraph, edge dep -> dependent.
        let mut dag: DiGraph<&str, ()> = DiGraph::new();
        let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();
        for task in &specs {
            nodes.insert(&task.id, dag.add_node(&task.id));
        }
        for task in &specs {
            for dep in &task.dependencies {
                dag.add_edge(nodes[dep.as_str()], nodes[task.id.as_str()], ());
            }
        }
        toposort(&dag, None).map_err(|cycle| {
            let at = dag
                .node_weight(cycle.node_id())
                .copied()
                .unwrap_or("unknown");
            Error::GraphValidation(format!("dependency cycle detected at task '{at}'"))
        })?;

        // Pass 4: a dependency may not live above its dependent.
        for task in &specs {
            for dep in &task.dependencies {
                let dep_level = specs[by_id[dep]].level;
                if dep_level > task.level {
                    return Err(Error::GraphValidation(format!(
                        "task '{}' (level {}) depends on '{}' (level {}): \
                         dependencies must be at the same or an earlier level",
                        task.id, task.level, dep, dep_level
                    )));
                }
            }
        }

        // Pass 5: created files are unique across the whole graph.
        let mut creators: BTreeMap<&str, &str> = BTreeMap::new();
        for task in &specs {
            for file in &task.files.create {
                if let Some(first) = creators.insert(file, &task.id) {
                    return Err(Error::GraphValidation(format!(
                        "file '{}' created by both '{}' and '{}'",
                        file, first, task.id
                    )));
                }
            }
        }

        // Pass 6: modified files are unique within a level.
        let mut modifiers: BTreeMap<(u32, &str), &str> = BTreeMap::new();
        for task in &specs {
            for file in &task.files.modify {
                if let Some(first) = modifiers.insert((task.level, file), &task.id) {
                    return Err(Error::GraphValidation(format!(
                        "file '{}' modified by both '{}' and '{}' in level {}",
                        file, first, task.id, task.level
                    )));
                }
            }
        }

        mlog_debug!(
            "TaskGraph validated: {} tasks across {} levels",
            specs.len(),
            specs.iter().map(|t| t.level).collect::<BTreeSet<_>>().len()
        );
        Ok(Self { specs, by_id })
    }

    /// Parse and validate a JSON array of task objects.
    pub fn from_json(raw: &str) -> Result<Self> {
        let specs: Vec<TaskSpec> = serde_json::from_str(raw)?;
        Self::from_specs(specs)
    }

    /// Load and validate a graph file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn get(&self, id: &str) -> Option<&TaskSpec> {
        self.by_id.get(id).map(|&i| &self.specs[i])
    }

    /// All task specs, in ascending id order.
    pub fn specs(&self) -> &[TaskSpec] {
        &self.specs
    }

    /// Distinct levels, ascending.
    pub fn levels(&self) -> Vec<u32> {
        let set: BTreeSet<u32> = self.specs.iter().map(|t| t.level).collect();
        set.into_iter().collect()
    }

    pub fn tasks_at_level(&self, level: u32) -> Vec<&TaskSpec> {
        self.specs.iter().filter(|t| t.level == level).collect()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
