//! Pipeline definitions and node specifications.

use super::DependencyGraph;
use crate::config::{EngineConfig, Environment};
use crate::core::{PipelineId, TaskArgs};
use crate::errors::{
    CycleDetectedError, DefinitionError, DuplicateTaskIdError, InvalidTaskIdError,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Tag carried by every definition built here.
pub const FACTORY_TAG: &str = "pipeline_factory";

/// Normalises a task id: lower case, with `-`, space, `.`, `(` and `)`
/// replaced by `_`.
///
/// Fails for empty ids and ids starting with a digit.
pub fn clean_task_id(raw: &str) -> Result<String, InvalidTaskIdError> {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            '-' | ' ' | '.' | '(' | ')' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect();

    match cleaned.chars().next() {
        None => Err(InvalidTaskIdError::new(raw, "task id is empty")),
        Some(c) if c.is_ascii_digit() => {
            Err(InvalidTaskIdError::new(raw, "task id starts with a digit"))
        }
        Some(_) => Ok(cleaned),
    }
}

/// One node of a pipeline. Immutable once added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Unique id inside the pipeline. Empty until assigned by `add_task`.
    #[serde(default)]
    pub task_id: String,
    /// Registry module of the task.
    pub module: String,
    /// Registry class of the task.
    pub class_name: String,
    /// Arguments baked into the definition.
    #[serde(default)]
    pub static_args: TaskArgs,
    /// Node whose output this one consumes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_task_id: Option<String>,
    /// Skip when an earlier node of the run failed.
    #[serde(default)]
    pub depends_on_past: bool,
}

impl TaskSpec {
    /// Creates a spec for a registered task class.
    #[must_use]
    pub fn new(module: impl Into<String>, class_name: impl Into<String>) -> Self {
        Self {
            task_id: String::new(),
            module: module.into(),
            class_name: class_name.into(),
            static_args: TaskArgs::new(),
            upstream_task_id: None,
            depends_on_past: false,
        }
    }

    /// Sets the task id.
    #[must_use]
    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    /// Sets the upstream node.
    #[must_use]
    pub fn with_upstream(mut self, upstream_task_id: impl Into<String>) -> Self {
        self.upstream_task_id = Some(upstream_task_id.into());
        self
    }

    /// Sets the static arguments.
    #[must_use]
    pub fn with_static_args(mut self, args: TaskArgs) -> Self {
        self.static_args = args;
        self
    }

    /// Adds one static argument.
    #[must_use]
    pub fn with_static_arg(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.static_args.insert(name.into(), value);
        self
    }

    /// Sets `depends_on_past`.
    #[must_use]
    pub fn depends_on_past(mut self, depends: bool) -> Self {
        self.depends_on_past = depends;
        self
    }
}

/// An order-only dependency between two existing nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// Must finish first.
    pub upstream: String,
    /// Waits on `upstream`.
    pub downstream: String,
}

impl DependencyEdge {
    /// Creates an edge.
    #[must_use]
    pub fn new(upstream: impl Into<String>, downstream: impl Into<String>) -> Self {
        Self {
            upstream: upstream.into(),
            downstream: downstream.into(),
        }
    }
}

/// A named DAG of task specs.
///
/// The serialised form (with `id` and `version` left out) is exactly what
/// the compiler hashes and writes as the artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Assigned on first commit.
    #[serde(skip)]
    pub id: Option<PipelineId>,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    max_active_runs: u32,
    concurrency: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    schedule: Option<String>,
    #[serde(default)]
    tags: BTreeSet<String>,
    #[serde(default)]
    nodes: Vec<TaskSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    edges: Vec<DependencyEdge>,
    /// Bumped by the compiler when the content changes.
    #[serde(skip)]
    pub version: u64,
}

impl PipelineDefinition {
    /// Creates an empty definition.
    ///
    /// Fails if the name is blank or could not serve as an artifact file
    /// name (path separators, a leading dot).
    pub fn new(name: impl Into<String>) -> Result<Self, DefinitionError> {
        let name = name.into();
        check_pipeline_name(&name)?;

        Ok(Self {
            id: None,
            name,
            description: None,
            max_active_runs: 1,
            concurrency: 1,
            schedule: None,
            tags: BTreeSet::from([FACTORY_TAG.to_string()]),
            nodes: Vec::new(),
            edges: Vec::new(),
            version: 0,
        })
    }

    /// Creates an empty definition using the configured defaults and the
    /// environment's naming rule.
    pub fn from_config(name: &str, config: &EngineConfig) -> Result<Self, DefinitionError> {
        let mut def = Self::new(config.environment.qualify_pipeline_name(name))?;
        def.max_active_runs = config.pipelines.default_max_active_runs;
        def.concurrency = config.pipelines.default_concurrency;
        def.validate_settings()?;
        Ok(def)
    }

    /// Creates an empty definition named for `environment`.
    pub fn for_environment(name: &str, environment: Environment) -> Result<Self, DefinitionError> {
        Self::new(environment.qualify_pipeline_name(name))
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the schedule expression.
    #[must_use]
    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = Some(schedule.into());
        self
    }

    /// Adds a tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Sets how many runs may be active at once. Must be at least 1.
    pub fn with_max_active_runs(mut self, n: u32) -> Result<Self, DefinitionError> {
        self.max_active_runs = n;
        self.validate_settings()?;
        Ok(self)
    }

    /// Sets how many nodes of one run may execute at once. Must be at
    /// least 1; 1 means strictly sequential.
    pub fn with_concurrency(mut self, n: u32) -> Result<Self, DefinitionError> {
        self.concurrency = n;
        self.validate_settings()?;
        Ok(self)
    }

    /// The pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The description.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// The schedule expression.
    #[must_use]
    pub fn schedule(&self) -> Option<&str> {
        self.schedule.as_deref()
    }

    /// Maximum concurrently active runs.
    #[must_use]
    pub fn max_active_runs(&self) -> u32 {
        self.max_active_runs
    }

    /// Maximum concurrently executing nodes per run.
    #[must_use]
    pub fn concurrency(&self) -> u32 {
        self.concurrency
    }

    /// Tags, sorted.
    #[must_use]
    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Nodes in insertion order.
    #[must_use]
    pub fn nodes(&self) -> &[TaskSpec] {
        &self.nodes
    }

    /// Extra ordering edges.
    #[must_use]
    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    /// Looks up a node.
    #[must_use]
    pub fn node(&self, task_id: &str) -> Option<&TaskSpec> {
        self.nodes.iter().find(|n| n.task_id == task_id)
    }

    /// Returns true if a node with this id exists.
    #[must_use]
    pub fn contains(&self, task_id: &str) -> bool {
        self.node(task_id).is_some()
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true when no node has been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Adds a node and returns its (cleaned or generated) task id.
    ///
    /// An empty `task_id` gets `<class_name>_<n>`. Fails without changing
    /// the definition on a duplicate id, an unknown upstream, or a cycle.
    pub fn add_task(&mut self, mut spec: TaskSpec) -> Result<String, DefinitionError> {
        spec.task_id = if spec.task_id.trim().is_empty() {
            self.generate_task_id(&spec.class_name)?
        } else {
            clean_task_id(&spec.task_id)?
        };
        if let Some(upstream) = spec.upstream_task_id.take() {
            spec.upstream_task_id = Some(clean_task_id(&upstream)?);
        }

        if self.contains(&spec.task_id) {
            return Err(DuplicateTaskIdError::new(&self.name, &spec.task_id).into());
        }
        if spec.upstream_task_id.as_deref() == Some(spec.task_id.as_str()) {
            return Err(
                CycleDetectedError::new(vec![spec.task_id.clone(), spec.task_id.clone()]).into(),
            );
        }

        let task_id = spec.task_id.clone();
        self.nodes.push(spec);
        if let Err(err) = self.check_graph() {
            self.nodes.pop();
            return Err(err);
        }
        Ok(task_id)
    }

    /// Adds an order-only edge between two existing nodes.
    ///
    /// A rejected edge leaves the definition unchanged.
    pub fn add_dependency(&mut self, upstream: &str, downstream: &str) -> Result<(), DefinitionError> {
        let edge = DependencyEdge::new(clean_task_id(upstream)?, clean_task_id(downstream)?);
        if edge.upstream == edge.downstream {
            return Err(
                CycleDetectedError::new(vec![edge.upstream.clone(), edge.downstream]).into(),
            );
        }
        if self.edges.contains(&edge) {
            return Ok(());
        }

        self.edges.push(edge);
        if let Err(err) = self.check_graph() {
            self.edges.pop();
            return Err(err);
        }
        Ok(())
    }

    /// Builds the dependency graph, rejecting dangling references and cycles.
    pub fn graph(&self) -> Result<DependencyGraph, DefinitionError> {
        let graph = DependencyGraph::build(&self.nodes, &self.edges)?;
        graph.topological_order()?;
        Ok(graph)
    }

    /// Task ids in execution order.
    pub fn topological_order(&self) -> Result<Vec<String>, DefinitionError> {
        let graph = DependencyGraph::build(&self.nodes, &self.edges)?;
        Ok(graph.topological_ids()?)
    }

    /// Full validation: settings, unique ids and an acyclic graph.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        self.validate_settings()?;
        let mut seen = BTreeSet::new();
        for node in &self.nodes {
            clean_task_id(&node.task_id)?;
            if !seen.insert(node.task_id.as_str()) {
                return Err(DuplicateTaskIdError::new(&self.name, &node.task_id).into());
            }
        }
        self.check_graph()
    }

    fn check_graph(&self) -> Result<(), DefinitionError> {
        self.graph().map(|_| ())
    }

    fn validate_settings(&self) -> Result<(), DefinitionError> {
        check_pipeline_name(&self.name)?;
        if self.max_active_runs < 1 {
            return Err(DefinitionError::invalid_setting(
                "max_active_runs",
                "must be at least 1",
            ));
        }
        if self.concurrency < 1 {
            return Err(DefinitionError::invalid_setting("concurrency", "must be at least 1"));
        }
        Ok(())
    }

    fn generate_task_id(&self, class_name: &str) -> Result<String, DefinitionError> {
        let base = clean_task_id(class_name)?;
        let n = (1..)
            .find(|n| !self.contains(&format!("{base}_{n}")))
            .unwrap_or(1);
        Ok(format!("{base}_{n}"))
    }
}

/// Pipeline names become artifact file names, so they must stay a single
/// path component.
fn check_pipeline_name(name: &str) -> Result<(), DefinitionError> {
    if name.trim().is_empty() {
        return Err(DefinitionError::invalid_setting(
            "name",
            "pipeline name cannot be empty or whitespace-only",
        ));
    }
    if name.starts_with('.') || name.contains(['/', '\\', '\0']) {
        return Err(DefinitionError::invalid_setting(
            "name",
            format!("pipeline name '{name}' must not start with '.' or contain path separators"),
        ));
    }
    Ok(())
}
