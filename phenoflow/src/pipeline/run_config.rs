//! Per-run argument overrides.

use super::{PipelineDefinition, TaskSpec};
use crate::core::{TaskArgs, TaskRunId};
use crate::errors::PhenoflowError;
use crate::task::{TaskRegistry, RESERVED_ARGS};
use crate::utils::prune_empty;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Caller-supplied overrides keyed by task id.
pub type RunConfig = serde_json::Map<String, Value>;

/// One node's parsed run-config entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOverride {
    /// Record to reuse or rerun.
    pub task_run_id: Option<TaskRunId>,
    /// User notified when the node finishes.
    pub username: Option<String>,
    /// Argument overrides, empty values already dropped.
    pub args: TaskArgs,
}

/// Parses and checks a run config against a definition.
///
/// Fails with `UnknownTaskId` for entries naming no node, and with
/// `InvalidRunConfig` for entries that are not objects or carry an
/// unparsable `task_run_id` or `username`.
pub fn parse_run_config(
    definition: &PipelineDefinition,
    config: &RunConfig,
) -> Result<BTreeMap<String, NodeOverride>, PhenoflowError> {
    let mut parsed = BTreeMap::new();
    for (task_id, entry) in config {
        if !definition.contains(task_id) {
            return Err(PhenoflowError::UnknownTaskId {
                pipeline: definition.name().to_string(),
                task_id: task_id.clone(),
            });
        }
        let mut args = match entry {
            Value::Object(map) => map.clone(),
            Value::Null => TaskArgs::new(),
            other => {
                return Err(PhenoflowError::InvalidRunConfig {
                    task_id: task_id.clone(),
                    reason: format!("expected an object, got {other}"),
                })
            }
        };

        let task_run_id = match args.remove("task_run_id") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(Value::String(s)) => Some(s.parse::<TaskRunId>().map_err(|e| {
                PhenoflowError::InvalidRunConfig {
                    task_id: task_id.clone(),
                    reason: format!("task_run_id '{s}': {e}"),
                }
            })?),
            Some(other) => {
                return Err(PhenoflowError::InvalidRunConfig {
                    task_id: task_id.clone(),
                    reason: format!("task_run_id must be a string, got {other}"),
                })
            }
        };
        let username = match args.remove("username") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => {
                return Err(PhenoflowError::InvalidRunConfig {
                    task_id: task_id.clone(),
                    reason: format!("username must be a string, got {other}"),
                })
            }
        };
        for reserved in &RESERVED_ARGS[1..] {
            if args.remove(*reserved).is_some() {
                debug!(task_id = %task_id, arg = *reserved, "Ignoring engine-assigned argument override");
            }
        }

        parsed.insert(
            task_id.clone(),
            NodeOverride {
                task_run_id,
                username,
                args: prune_empty(args),
            },
        );
    }
    Ok(parsed)
}

/// Merges static args with a node's overrides (overrides win), then
/// applies the registry's parameter filter.
#[must_use]
pub fn merge_args(spec: &TaskSpec, overrides: Option<&NodeOverride>, registry: &TaskRegistry) -> TaskArgs {
    let mut args = spec.static_args.clone();
    if let Some(o) = overrides {
        args.extend(o.args.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    registry.filter_args(&spec.module, &spec.class_name, args)
}
