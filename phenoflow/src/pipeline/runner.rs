//! Runs pipeline definitions in process, or hands them to a scheduler.

use super::run_config::{merge_args, parse_run_config, NodeOverride, RunConfig};
use super::{
    DependencyGraph, PipelineCompiler, PipelineDefinition, Scheduler, SchedulerInvocation,
    TaskSpec, TriggerConf,
};
use crate::core::{PipelineId, PipelineRunId, TaskRunId, TaskRunRecord, TaskRunStatus};
use crate::errors::{
    DefinitionError, FailureKind, PhenoflowError, SchedulerError, StoreError, TaskError,
    TaskFailure,
};
use crate::observability::pipeline_run_span;
use crate::runtime::RuntimeContext;
use crate::store::{RecordStore, UnitOfWork};
use crate::task::{ExecutionRequest, TaskExecutor, TaskRunReport};
use crate::utils::now_utc;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn, Instrument, Span};

/// Why a node was not executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// An upstream node failed or was itself skipped.
    UpstreamNotSucceeded {
        /// The first upstream node found not to have succeeded.
        upstream: String,
    },
    /// The node depends on past results and an earlier node of the run failed.
    EarlierFailure {
        /// The first node of the run that failed.
        failed: String,
    },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpstreamNotSucceeded { upstream } => {
                write!(f, "upstream '{upstream}' did not succeed")
            }
            Self::EarlierFailure { failed } => write!(f, "earlier task '{failed}' failed"),
        }
    }
}

/// What happened to one node of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    /// The node ran; the report says whether it succeeded.
    Executed(TaskRunReport),
    /// A prior successful record was kept instead of running again.
    Reused(TaskRunRecord),
    /// The node did not run and has no record.
    Skipped {
        /// Why.
        reason: SkipReason,
    },
}

impl NodeOutcome {
    /// The node's record, if it has one.
    #[must_use]
    pub fn record(&self) -> Option<&TaskRunRecord> {
        match self {
            Self::Executed(report) => Some(&report.record),
            Self::Reused(record) => Some(record),
            Self::Skipped { .. } => None,
        }
    }

    /// True for a successful execution or a reused success.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        match self {
            Self::Executed(report) => report.is_success(),
            Self::Reused(_) => true,
            Self::Skipped { .. } => false,
        }
    }

    /// True when the node ran and ended in `ERROR`.
    #[must_use]
    pub fn failed(&self) -> bool {
        matches!(self, Self::Executed(report) if !report.is_success())
    }

    /// True when the node was skipped.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }
}

/// Result of [`PipelineRunner::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRunResult {
    /// Pipeline name.
    pub pipeline: String,
    /// The run.
    pub run_id: PipelineRunId,
    /// Topological order computed at the start of the run.
    pub order: Vec<String>,
    /// Task ids in the order they reached a terminal state.
    pub finished: Vec<String>,
    /// Outcome per task id.
    pub outcomes: BTreeMap<String, NodeOutcome>,
}

impl PipelineRunResult {
    /// One node's outcome.
    #[must_use]
    pub fn outcome(&self, task_id: &str) -> Option<&NodeOutcome> {
        self.outcomes.get(task_id)
    }

    /// One node's record.
    #[must_use]
    pub fn record(&self, task_id: &str) -> Option<&TaskRunRecord> {
        self.outcome(task_id).and_then(NodeOutcome::record)
    }

    /// One node's status; `None` when skipped.
    #[must_use]
    pub fn status(&self, task_id: &str) -> Option<TaskRunStatus> {
        self.record(task_id).map(|r| r.status)
    }

    /// True when every node succeeded or was reused.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcomes.values().all(NodeOutcome::succeeded)
    }

    /// Failed nodes, in topological order.
    #[must_use]
    pub fn failed(&self) -> Vec<&str> {
        self.select(NodeOutcome::failed)
    }

    /// Skipped nodes, in topological order.
    #[must_use]
    pub fn skipped(&self) -> Vec<&str> {
        self.select(NodeOutcome::is_skipped)
    }

    fn select(&self, pred: impl Fn(&NodeOutcome) -> bool) -> Vec<&str> {
        self.order
            .iter()
            .filter(|id| self.outcomes.get(id.as_str()).is_some_and(&pred))
            .map(String::as_str)
            .collect()
    }
}

/// Result of [`PipelineRunner::dispatch`].
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReceipt {
    /// Pipeline name.
    pub pipeline: String,
    /// The committed pipeline.
    pub pipeline_id: PipelineId,
    /// The triggered run.
    pub run_id: PipelineRunId,
    /// The record id assigned to each node, reused ones included.
    pub task_run_ids: BTreeMap<String, TaskRunId>,
    /// Nodes whose explicit record had already succeeded; they are left out
    /// of `conf` and keep their record untouched.
    pub reused: Vec<String>,
    /// What was sent to the scheduler.
    pub conf: TriggerConf,
}

/// Executes definitions node by node.
///
/// Task failures are reported per node in the result; `Err` means the run
/// as a whole could not proceed.
#[derive(Clone)]
pub struct PipelineRunner {
    executor: TaskExecutor,
    compiler: PipelineCompiler,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl fmt::Debug for PipelineRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineRunner")
            .field("compiler", &self.compiler)
            .field("scheduler", &self.scheduler.is_some())
            .finish_non_exhaustive()
    }
}

enum Planned {
    Settled(NodeOutcome),
    Execute(ExecutionRequest),
}

/// Store state a run starts from.
struct PriorState {
    pipeline_id: Option<PipelineId>,
    /// Record ids of an earlier attempt of the same run, by task id.
    record_ids: HashMap<String, TaskRunId>,
    /// Records named by an explicit `task_run_id`, by task id.
    explicit: HashMap<String, TaskRunRecord>,
}

struct RunState<'g> {
    graph: &'g DependencyGraph,
    position: Vec<usize>,
    running: HashMap<usize, TaskRunId>,
    waiting: Vec<usize>,
    ready: BTreeSet<usize>,
    outcomes: Vec<Option<NodeOutcome>>,
    finished: Vec<usize>,
    first_failure: Option<String>,
}

impl<'g> RunState<'g> {
    fn new(graph: &'g DependencyGraph, order: &[usize]) -> Self {
        let mut position = vec![0; graph.len()];
        for (pos, &idx) in order.iter().enumerate() {
            position[idx] = pos;
        }
        let waiting: Vec<usize> = (0..graph.len()).map(|i| graph.upstream(i).len()).collect();
        let ready = (0..graph.len())
            .filter(|&i| waiting[i] == 0)
            .map(|i| position[i])
            .collect();
        Self {
            graph,
            position,
            running: HashMap::new(),
            waiting,
            ready,
            outcomes: vec![None; graph.len()],
            finished: Vec::with_capacity(graph.len()),
            first_failure: None,
        }
    }

    fn skip_reason(&self, idx: usize, spec: &TaskSpec) -> Option<SkipReason> {
        for &up in self.graph.upstream(idx) {
            if !self.outcomes[up].as_ref().is_some_and(NodeOutcome::succeeded) {
                return Some(SkipReason::UpstreamNotSucceeded {
                    upstream: self.graph.id(up).to_string(),
                });
            }
        }
        if spec.depends_on_past {
            if let Some(failed) = &self.first_failure {
                return Some(SkipReason::EarlierFailure {
                    failed: failed.clone(),
                });
            }
        }
        None
    }

    fn record_id(&self, task_id: &str) -> Option<TaskRunId> {
        let idx = self.graph.index_of(task_id)?;
        self.outcomes[idx]
            .as_ref()
            .and_then(NodeOutcome::record)
            .map(|r| r.id)
    }

    fn settle(&mut self, idx: usize, outcome: NodeOutcome) {
        if outcome.failed() && self.first_failure.is_none() {
            self.first_failure = Some(self.graph.id(idx).to_string());
        }
        self.outcomes[idx] = Some(outcome);
        self.finished.push(idx);
        for &next in self.graph.downstream(idx) {
            self.waiting[next] -= 1;
            if self.waiting[next] == 0 {
                self.ready.insert(self.position[next]);
            }
        }
    }
}

impl PipelineRunner {
    /// Creates a runner without a scheduler.
    #[must_use]
    pub fn new(runtime: RuntimeContext) -> Self {
        Self {
            executor: TaskExecutor::new(runtime.clone()),
            compiler: PipelineCompiler::new(runtime),
            scheduler: None,
        }
    }

    /// Uses `scheduler` for dispatch, pause and delete.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.compiler = self.compiler.with_scheduler(Arc::clone(&scheduler));
        self.scheduler = Some(scheduler);
        self
    }

    /// The runtime.
    #[must_use]
    pub fn runtime(&self) -> &RuntimeContext {
        self.executor.runtime()
    }

    /// The executor nodes run through.
    #[must_use]
    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    /// The compiler used by dispatch.
    #[must_use]
    pub fn compiler(&self) -> &PipelineCompiler {
        &self.compiler
    }

    /// Runs every node in process.
    ///
    /// Nodes start in topological order, at most `concurrency` at a time,
    /// and only once all their upstream nodes are terminal. Reusing the
    /// `run_id` of an earlier run reruns each node under the record id it
    /// had in that run.
    pub async fn run(
        &self,
        definition: &PipelineDefinition,
        run_config: &RunConfig,
        run_id: Option<PipelineRunId>,
    ) -> Result<PipelineRunResult, PhenoflowError> {
        definition.validate()?;
        let overrides = parse_run_config(definition, run_config)?;
        let run_id = run_id.unwrap_or_else(PipelineRunId::generate);
        let span = pipeline_run_span(definition.name(), &run_id);
        self.run_nodes(definition, &overrides, run_id).instrument(span).await
    }

    async fn run_nodes(
        &self,
        definition: &PipelineDefinition,
        overrides: &BTreeMap<String, NodeOverride>,
        run_id: PipelineRunId,
    ) -> Result<PipelineRunResult, PhenoflowError> {
        let graph = definition.graph()?;
        let order = graph.topological_order().map_err(DefinitionError::from)?;
        let prior = self.prior_state(definition, overrides, &run_id).await?;
        info!(
            nodes = order.len(),
            retry = !prior.record_ids.is_empty(),
            "Starting pipeline run"
        );

        let concurrency = usize::try_from(definition.concurrency()).unwrap_or(1).max(1);
        let mut state = RunState::new(&graph, &order);
        let mut active = FuturesUnordered::new();
        let mut aborted: Option<(String, PhenoflowError)> = None;

        loop {
            while aborted.is_none() && active.len() < concurrency {
                let Some(pos) = state.ready.pop_first() else {
                    break;
                };
                let idx = order[pos];
                let spec = &definition.nodes()[idx];
                let node_override = overrides.get(&spec.task_id);
                match self.plan_node(&state, idx, spec, node_override, &prior, &run_id) {
                    Planned::Settled(outcome) => state.settle(idx, outcome),
                    Planned::Execute(request) => {
                        if let Some(id) = request.task_run_id {
                            state.running.insert(idx, id);
                        }
                        let executor = self.executor.clone();
                        let handle = tokio::spawn(
                            execute_node(executor, request).instrument(Span::current()),
                        );
                        active.push(join_node(idx, handle));
                    }
                }
            }

            let Some((idx, joined)) = active.next().await else {
                break;
            };
            let task_run_id = state.running.remove(&idx);
            let err = match joined {
                Ok(Ok(report)) => {
                    state.settle(idx, NodeOutcome::Executed(report));
                    continue;
                }
                Ok(Err(err)) => err,
                Err(join_err) => PhenoflowError::NodeAborted {
                    task_id: graph.id(idx).to_string(),
                    reason: join_err.to_string(),
                },
            };
            let task_id = graph.id(idx).to_string();
            error!(
                task_id = %task_id,
                in_flight = active.len(),
                error = %err,
                "Task failed outside its lifecycle, stopping run"
            );
            if let Some(id) = task_run_id {
                self.abandon(id, &task_id, &err).await;
            }
            if aborted.is_none() {
                aborted = Some((task_id, err));
            }
        }

        let finished: Vec<String> = state.finished.iter().map(|&i| graph.id(i).to_string()).collect();
        if let Some((task_id, source)) = aborted {
            return Err(PhenoflowError::RunAborted {
                pipeline: definition.name().to_string(),
                task_id,
                finished,
                source: Box::new(source),
            });
        }
        let outcomes: BTreeMap<String, NodeOutcome> = state
            .outcomes
            .into_iter()
            .enumerate()
            .filter_map(|(i, o)| o.map(|o| (graph.id(i).to_string(), o)))
            .collect();
        let result = PipelineRunResult {
            pipeline: definition.name().to_string(),
            run_id,
            order: order.iter().map(|&i| graph.id(i).to_string()).collect(),
            finished,
            outcomes,
        };
        info!(
            succeeded = result.outcomes.values().filter(|o| o.succeeded()).count(),
            failed = result.failed().len(),
            skipped = result.skipped().len(),
            "Pipeline run finished"
        );
        Ok(result)
    }

    /// Marks a node's `STARTED` record as `ERROR` after the executor gave
    /// up on it. Store failures here are logged, not returned.
    async fn abandon(&self, id: TaskRunId, task_id: &str, cause: &PhenoflowError) {
        match self.mark_abandoned(id, cause).await {
            Ok(true) => debug!(task_id, task_run_id = %id, "Recorded abandoned task run"),
            Ok(false) => {}
            Err(e) => warn!(
                task_id,
                task_run_id = %id,
                error = %e,
                "Could not record abandoned task run"
            ),
        }
    }

    async fn mark_abandoned(&self, id: TaskRunId, cause: &PhenoflowError) -> Result<bool, StoreError> {
        let mut session = self.runtime().database().begin().await?;
        let Some(mut record) = session.load_task_run(id).await? else {
            return Ok(false);
        };
        if record.status != TaskRunStatus::Started {
            return Ok(false);
        }
        record.fail(TaskFailure::new(FailureKind::Unhandled, cause.to_string()), now_utc());
        session.save_task_run(&record).await?;
        session.commit().await?;
        Ok(true)
    }

    async fn prior_state(
        &self,
        definition: &PipelineDefinition,
        overrides: &BTreeMap<String, NodeOverride>,
        run_id: &PipelineRunId,
    ) -> Result<PriorState, PhenoflowError> {
        let session = self.runtime().database().begin().await?;
        let pipeline_id = match definition.id {
            Some(id) => Some(id),
            None => session
                .load_pipeline(definition.name())
                .await?
                .filter(|r| !r.deleted)
                .map(|r| r.id),
        };
        let record_ids = session
            .task_runs_for_run(run_id)
            .await?
            .into_iter()
            .filter(|r| r.pipeline_id == pipeline_id)
            .filter_map(|r| r.task_id.clone().map(|task_id| (task_id, r.id)))
            .collect();
        let explicit = explicit_records(&*session, overrides, pipeline_id).await?;
        Ok(PriorState {
            pipeline_id,
            record_ids,
            explicit,
        })
    }

    fn plan_node(
        &self,
        state: &RunState<'_>,
        idx: usize,
        spec: &TaskSpec,
        node_override: Option<&NodeOverride>,
        prior: &PriorState,
        run_id: &PipelineRunId,
    ) -> Planned {
        if let Some(reason) = state.skip_reason(idx, spec) {
            info!(task_id = %spec.task_id, reason = %reason, "Skipping task");
            return Planned::Settled(NodeOutcome::Skipped { reason });
        }

        if let Some(record) = prior
            .explicit
            .get(&spec.task_id)
            .filter(|r| r.status.is_success())
        {
            info!(task_id = %spec.task_id, task_run_id = %record.id, "Reusing successful task run");
            return Planned::Settled(NodeOutcome::Reused(record.clone()));
        }

        let task_run_id = node_override
            .and_then(|o| o.task_run_id)
            .or_else(|| prior.record_ids.get(&spec.task_id).copied())
            .unwrap_or_default();
        let upstream_task_run_id = spec
            .upstream_task_id
            .as_deref()
            .and_then(|up| state.record_id(up));
        let invocation = SchedulerInvocation {
            task_id: spec.task_id.clone(),
            task_run_id,
            pipeline_run_id: run_id.clone(),
            upstream_task_run_id,
            username: node_override.and_then(|o| o.username.clone()),
            args: merge_args(spec, node_override, self.runtime().registry()),
        };
        Planned::Execute(self.request_for(spec, &invocation, prior.pipeline_id))
    }

    fn request_for(
        &self,
        spec: &TaskSpec,
        invocation: &SchedulerInvocation,
        pipeline_id: Option<PipelineId>,
    ) -> ExecutionRequest {
        let args = self
            .runtime()
            .registry()
            .filter_args(&spec.module, &spec.class_name, invocation.task_args());
        let request = ExecutionRequest::new(&spec.module, &spec.class_name)
            .with_task_run_id(invocation.task_run_id)
            .with_pipeline_id(pipeline_id)
            .with_pipeline_run_id(invocation.pipeline_run_id.clone())
            .with_task_id(&spec.task_id)
            .with_args(args)
            .with_upstream_task_run_id(invocation.upstream_task_run_id);
        match &invocation.username {
            Some(username) => request.with_username(username),
            None => request,
        }
    }

    /// Hands a run to the scheduler.
    ///
    /// Commits the definition (a no-op when unchanged), waits for the
    /// scheduler to report it registered, stages a `SCHEDULED` record per
    /// node and triggers the run. The records are committed only if the
    /// trigger succeeds.
    ///
    /// A node given an explicit `task_run_id` whose record already succeeded
    /// is not scheduled again; any other existing record is rescheduled in
    /// place under its id.
    pub async fn dispatch(
        &self,
        definition: &mut PipelineDefinition,
        run_config: &RunConfig,
        run_id: Option<PipelineRunId>,
    ) -> Result<DispatchReceipt, PhenoflowError> {
        let scheduler = self
            .scheduler
            .as_ref()
            .map(Arc::clone)
            .ok_or(SchedulerError::NotConfigured)?;
        let overrides = parse_run_config(definition, run_config)?;
        let committed = self.compiler.commit(definition).await?;
        self.await_registration(scheduler.as_ref(), definition.name())
            .await?;

        let run_id = run_id.unwrap_or_else(PipelineRunId::generate);
        let now = now_utc();
        let mut assigned: BTreeMap<String, TaskRunId> = BTreeMap::new();
        let mut reused = Vec::new();
        let mut conf = TriggerConf::new();
        let mut session = self.runtime().database().begin().await?;
        let mut explicit =
            explicit_records(&*session, &overrides, Some(committed.pipeline_id)).await?;

        for task_id in definition.topological_order()? {
            let Some(spec) = definition.node(&task_id) else {
                continue;
            };
            let existing = explicit.remove(&task_id);
            if let Some(record) = existing.as_ref().filter(|r| r.status.is_success()) {
                info!(task_id = %task_id, task_run_id = %record.id, "Reusing successful task run");
                assigned.insert(task_id.clone(), record.id);
                reused.push(task_id);
                continue;
            }

            let node_override = overrides.get(&task_id);
            let task_run_id = node_override
                .and_then(|o| o.task_run_id)
                .unwrap_or_default();
            let upstream_task_run_id = spec
                .upstream_task_id
                .as_ref()
                .and_then(|up| assigned.get(up).copied());
            let invocation = SchedulerInvocation {
                task_id: task_id.clone(),
                task_run_id,
                pipeline_run_id: run_id.clone(),
                upstream_task_run_id,
                username: node_override.and_then(|o| o.username.clone()),
                args: merge_args(spec, node_override, self.runtime().registry()),
            };

            let mut record = match existing {
                Some(mut record) => {
                    debug!(task_id = %task_id, task_run_id = %record.id, "Rescheduling existing task run");
                    record.schedule(now);
                    record.module_name = spec.module.clone();
                    record.class_name = spec.class_name.clone();
                    record
                }
                None => TaskRunRecord::new(
                    task_run_id,
                    &spec.module,
                    &spec.class_name,
                    TaskRunStatus::Scheduled,
                    now,
                ),
            };
            record.pipeline_id = Some(committed.pipeline_id);
            record.pipeline_run_id = Some(run_id.clone());
            record.task_id = Some(task_id.clone());
            record.args = invocation.task_args();
            record.upstream_task_run_id = upstream_task_run_id;
            record.username = invocation.username.clone();
            session.save_task_run(&record).await?;

            conf.insert(task_id.clone(), invocation.to_conf()?);
            assigned.insert(task_id, task_run_id);
        }

        if let Err(e) = scheduler.trigger(definition.name(), &run_id, &conf).await {
            warn!(pipeline = %definition.name(), run_id = %run_id, error = %e, "Trigger failed");
            session.rollback().await?;
            return Err(e.into());
        }
        session.commit().await?;
        info!(
            pipeline = %definition.name(),
            run_id = %run_id,
            nodes = conf.len(),
            reused = reused.len(),
            "Dispatched pipeline run"
        );

        Ok(DispatchReceipt {
            pipeline: definition.name().to_string(),
            pipeline_id: committed.pipeline_id,
            run_id,
            task_run_ids: assigned,
            reused,
            conf,
        })
    }

    async fn await_registration(
        &self,
        scheduler: &dyn Scheduler,
        pipeline: &str,
    ) -> Result<(), PhenoflowError> {
        let settings = &self.runtime().config().pipelines;
        let attempts = settings.registration_attempts.max(1);
        for attempt in 1..=attempts {
            if scheduler.is_registered(pipeline).await? {
                debug!(pipeline, attempt, "Pipeline registered with scheduler");
                return Ok(());
            }
            debug!(pipeline, attempt, "Waiting for scheduler registration");
            if attempt < attempts {
                tokio::time::sleep(settings.registration_delay()).await;
            }
        }
        Err(PhenoflowError::NotRegistered {
            pipeline: pipeline.to_string(),
            attempts,
        })
    }

    /// Runs one node when the scheduler fires it.
    ///
    /// The node's `SCHEDULED` record (if any) is rerun in place.
    pub async fn handle_invocation(
        &self,
        definition: &PipelineDefinition,
        invocation: &SchedulerInvocation,
    ) -> Result<TaskRunReport, PhenoflowError> {
        let spec = definition
            .node(&invocation.task_id)
            .ok_or_else(|| PhenoflowError::UnknownTaskId {
                pipeline: definition.name().to_string(),
                task_id: invocation.task_id.clone(),
            })?;
        let request = self.request_for(spec, invocation, definition.id);
        let span = pipeline_run_span(definition.name(), &invocation.pipeline_run_id);
        execute_node(self.executor.clone(), request)
            .instrument(span)
            .await
    }
}

/// Builds the task through the registry and executes it; a task that
/// cannot be built is recorded as failed.
async fn execute_node(
    executor: TaskExecutor,
    request: ExecutionRequest,
) -> Result<TaskRunReport, PhenoflowError> {
    let instance = executor.runtime().registry().instantiate(
        &request.module_name,
        &request.class_name,
        &request.args,
    );
    match instance {
        Some(Ok(task)) => executor.execute(task, request).await,
        Some(Err(err)) => executor.record_rejection(request, &err).await,
        None => {
            let err = TaskError::unhandled(format!(
                "No task registered as '{}.{}'",
                request.module_name, request.class_name
            ));
            executor.record_rejection(request, &err).await
        }
    }
}

/// Loads the records named by explicit `task_run_id` overrides.
///
/// A record owned by a different pipeline than `pipeline_id` is rejected.
async fn explicit_records(
    session: &dyn UnitOfWork,
    overrides: &BTreeMap<String, NodeOverride>,
    pipeline_id: Option<PipelineId>,
) -> Result<HashMap<String, TaskRunRecord>, PhenoflowError> {
    let mut records = HashMap::new();
    for (task_id, node_override) in overrides {
        let Some(id) = node_override.task_run_id else {
            continue;
        };
        let Some(record) = session.load_task_run(id).await? else {
            continue;
        };
        if let (Some(owner), Some(expected)) = (record.pipeline_id, pipeline_id) {
            if owner != expected {
                return Err(PhenoflowError::InvalidRunConfig {
                    task_id: task_id.clone(),
                    reason: format!("task_run_id {id} belongs to another pipeline"),
                });
            }
        }
        records.insert(task_id.clone(), record);
    }
    Ok(records)
}

async fn join_node(
    idx: usize,
    handle: JoinHandle<Result<TaskRunReport, PhenoflowError>>,
) -> (usize, Result<Result<TaskRunReport, PhenoflowError>, JoinError>) {
    (idx, handle.await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(status: TaskRunStatus) -> TaskRunRecord {
        TaskRunRecord::new(TaskRunId::new(), "m", "C", status, now_utc())
    }

    fn executed(status: TaskRunStatus) -> NodeOutcome {
        let mut rec = record(TaskRunStatus::Started);
        if status == TaskRunStatus::Success {
            rec.succeed(now_utc());
        } else {
            rec.fail(TaskFailure::new(FailureKind::Unhandled, "boom"), now_utc());
        }
        NodeOutcome::Executed(TaskRunReport {
            record: rec,
            output: None,
        })
    }

    #[test]
    fn test_outcome_predicates() {
        let ok = executed(TaskRunStatus::Success);
        let bad = executed(TaskRunStatus::Error);
        let reused = NodeOutcome::Reused(record(TaskRunStatus::Success));
        let skipped = NodeOutcome::Skipped {
            reason: SkipReason::EarlierFailure {
                failed: "a".to_string(),
            },
        };

        assert!(ok.succeeded() && !ok.failed());
        assert!(bad.failed() && !bad.succeeded());
        assert!(reused.succeeded() && reused.record().is_some());
        assert!(skipped.is_skipped() && skipped.record().is_none());
    }

    #[test]
    fn test_result_selectors_follow_order() {
        let outcomes = BTreeMap::from([
            ("a".to_string(), executed(TaskRunStatus::Error)),
            (
                "b".to_string(),
                NodeOutcome::Skipped {
                    reason: SkipReason::UpstreamNotSucceeded {
                        upstream: "a".to_string(),
                    },
                },
            ),
            ("c".to_string(), executed(TaskRunStatus::Success)),
        ]);
        let result = PipelineRunResult {
            pipeline: "p".to_string(),
            run_id: PipelineRunId::new("r"),
            order: vec!["c".to_string(), "a".to_string(), "b".to_string()],
            finished: vec!["c".to_string(), "a".to_string(), "b".to_string()],
            outcomes,
        };

        assert!(!result.is_success());
        assert_eq!(result.failed(), vec!["a"]);
        assert_eq!(result.skipped(), vec!["b"]);
        assert_eq!(result.status("c"), Some(TaskRunStatus::Success));
        assert_eq!(result.status("b"), None);
    }

    #[test]
    fn test_skip_reason_display() {
        let reason = SkipReason::UpstreamNotSucceeded {
            upstream: "load".to_string(),
        };
        assert_eq!(reason.to_string(), "upstream 'load' did not succeed");
    }
}
