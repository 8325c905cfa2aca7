//! Registry mapping `module.Class` names to task factories.

use super::Task;
use crate::core::TaskArgs;
use crate::errors::TaskError;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Builds a task from its merged arguments.
pub type TaskFactory = Arc<dyn Fn(&TaskArgs) -> Result<Box<dyn Task>, TaskError> + Send + Sync>;

/// Argument names the engine always passes through.
pub const RESERVED_ARGS: [&str; 3] = ["task_run_id", "pipeline_run_id", "upstream_task_run_id"];

#[derive(Clone)]
struct Registration {
    factory: TaskFactory,
    params: Option<BTreeSet<String>>,
}

/// Registry of task factories.
///
/// Pipeline nodes name their task by module and class; the runner resolves
/// the pair here instead of importing anything dynamically.
#[derive(Default)]
pub struct TaskRegistry {
    entries: RwLock<HashMap<String, Registration>>,
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.list())
            .finish()
    }
}

fn qualified(module: &str, class_name: &str) -> String {
    format!("{module}.{class_name}")
}

impl TaskRegistry {
    /// Creates a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory that accepts any arguments.
    ///
    /// Registering the same name again replaces the factory.
    pub fn register<F>(&self, module: &str, class_name: &str, factory: F)
    where
        F: Fn(&TaskArgs) -> Result<Box<dyn Task>, TaskError> + Send + Sync + 'static,
    {
        self.insert(module, class_name, Arc::new(factory), None);
    }

    /// Registers a factory that only accepts the named parameters.
    ///
    /// Undeclared arguments are dropped before the factory is called.
    pub fn register_with_params<F, I, S>(&self, module: &str, class_name: &str, params: I, factory: F)
    where
        F: Fn(&TaskArgs) -> Result<Box<dyn Task>, TaskError> + Send + Sync + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let params = params.into_iter().map(Into::into).collect();
        self.insert(module, class_name, Arc::new(factory), Some(params));
    }

    fn insert(
        &self,
        module: &str,
        class_name: &str,
        factory: TaskFactory,
        params: Option<BTreeSet<String>>,
    ) {
        self.entries
            .write()
            .insert(qualified(module, class_name), Registration { factory, params });
    }

    /// Checks whether a task is registered.
    #[must_use]
    pub fn contains(&self, module: &str, class_name: &str) -> bool {
        self.entries.read().contains_key(&qualified(module, class_name))
    }

    /// Lists registered names, sorted.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Drops arguments the task does not declare, keeping reserved ones.
    ///
    /// Returns `args` unchanged for tasks registered without parameters.
    #[must_use]
    pub fn filter_args(&self, module: &str, class_name: &str, args: TaskArgs) -> TaskArgs {
        let name = qualified(module, class_name);
        let params = self
            .entries
            .read()
            .get(&name)
            .and_then(|r| r.params.clone());
        let Some(params) = params else {
            return args;
        };

        let (kept, dropped): (TaskArgs, TaskArgs) = args
            .into_iter()
            .partition(|(k, _)| params.contains(k) || RESERVED_ARGS.contains(&k.as_str()));
        if !dropped.is_empty() {
            let dropped: Vec<&String> = dropped.keys().collect();
            info!(task = %name, ?dropped, "Dropped undeclared task arguments");
        }
        kept
    }

    /// Builds a task instance.
    ///
    /// Returns `None` when nothing is registered under the name, and the
    /// factory's own error when it rejects the arguments.
    pub fn instantiate(
        &self,
        module: &str,
        class_name: &str,
        args: &TaskArgs,
    ) -> Option<Result<Box<dyn Task>, TaskError>> {
        let factory = self
            .entries
            .read()
            .get(&qualified(module, class_name))
            .map(|r| r.factory.clone())?;
        Some(factory(args))
    }
}
