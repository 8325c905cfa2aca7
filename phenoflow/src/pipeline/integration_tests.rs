//! End-to-end tests of definitions, runs and scheduler dispatch.

#[cfg(test)]
mod tests {
    use crate::cache::OutputCache;
    use crate::core::{PipelineId, PipelineRunId, TaskArgs, TaskRunId, TaskRunRecord, TaskRunStatus};
    use crate::errors::{DefinitionError, FailureKind, PhenoflowError, SchedulerError, TaskError};
    use crate::pipeline::scheduler::MockScheduler;
    use crate::pipeline::{
        NodeOutcome, PipelineDefinition, PipelineRunner, RunConfig, SchedulerInvocation, SkipReason,
        TaskSpec,
    };
    use crate::store::{InMemoryDatabase, RecordStore, UnitOfWork, TASK_RUN_TABLE};
    use crate::task::{Task, TaskContext};
    use crate::testing::{
        test_runtime, test_runtime_in, FailingTask, Journal, RecordingScheduler, RecordingTask,
        TestRuntime, ValidationFailingTask,
    };
    use crate::utils::now_utc;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn register<T, F>(rt: &TestRuntime, class: &str, make: F)
    where
        T: Task + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        rt.registry
            .register("etl", class, move |_| Ok(Box::new(make()) as Box<dyn Task>));
    }

    fn node(task_id: &str, class: &str) -> TaskSpec {
        TaskSpec::new("etl", class).with_task_id(task_id)
    }

    fn run_config(value: Value) -> RunConfig {
        value.as_object().cloned().unwrap_or_default()
    }

    /// Outputs whatever its upstream task cached.
    #[derive(Debug, Default)]
    struct EchoUpstream {
        seen: Option<Value>,
    }

    #[async_trait]
    impl Task for EchoUpstream {
        async fn process(&mut self, ctx: &mut TaskContext) -> Result<(), TaskError> {
            self.seen = ctx.upstream_output().await?;
            Ok(())
        }

        fn output(&self) -> Value {
            json!({ "upstream": self.seen.clone().unwrap_or(Value::Null) })
        }
    }

    /// Fails while its switch is on.
    #[derive(Debug)]
    struct Flaky {
        failing: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Task for Flaky {
        async fn process(&mut self, _ctx: &mut TaskContext) -> Result<(), TaskError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(TaskError::unhandled("source not ready"));
            }
            Ok(())
        }
    }

    /// Leaves the store refusing its next `outage` commits.
    #[derive(Debug)]
    struct StoreOutage {
        database: InMemoryDatabase,
        outage: usize,
    }

    #[async_trait]
    impl Task for StoreOutage {
        async fn process(&mut self, _ctx: &mut TaskContext) -> Result<(), TaskError> {
            self.database.fail_next_commits(self.outage);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_validation_failure_skips_downstream() {
        let rt = test_runtime();
        register(&rt, "Check", || ValidationFailingTask::new("row count mismatch"));
        register(&rt, "Load", || RecordingTask::new("b"));

        let mut p = PipelineDefinition::new("p").unwrap();
        p.add_task(node("a", "Check")).unwrap();
        p.add_task(node("b", "Load").with_upstream("a")).unwrap();

        let runner = PipelineRunner::new(rt.runtime.clone());
        let result = runner.run(&p, &RunConfig::new(), None).await.unwrap();

        let a = result.record("a").unwrap();
        assert_eq!(a.status, TaskRunStatus::Error);
        assert_eq!(a.error.as_ref().unwrap().kind, FailureKind::Validation);
        assert!(rt.cache.get(&a.output_key()).await.unwrap().is_none());

        assert_eq!(
            result.outcome("b"),
            Some(&NodeOutcome::Skipped {
                reason: SkipReason::UpstreamNotSucceeded {
                    upstream: "a".to_string()
                }
            })
        );
        assert_eq!(rt.database.committed_rows(TASK_RUN_TABLE).len(), 1);
        assert_eq!(result.failed(), vec!["a"]);
        assert_eq!(result.skipped(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_downstream_receives_upstream_record_id() {
        let rt = test_runtime();
        register(&rt, "Load", || RecordingTask::new("a"));
        register(&rt, "Echo", EchoUpstream::default);

        let mut p2 = PipelineDefinition::new("p2").unwrap();
        p2.add_task(node("a", "Load")).unwrap();
        p2.add_task(node("b", "Echo").with_upstream("a").depends_on_past(false))
            .unwrap();

        let runner = PipelineRunner::new(rt.runtime.clone());
        let result = runner.run(&p2, &RunConfig::new(), None).await.unwrap();
        assert!(result.is_success());

        let a_id = result.record("a").unwrap().id;
        let b = result.record("b").unwrap();
        assert_eq!(b.upstream_task_run_id, Some(a_id));
        assert_eq!(b.args["upstream_task_run_id"], json!(a_id.to_string()));
        assert_eq!(b.args["pipeline_run_id"], json!(result.run_id.to_string()));

        let NodeOutcome::Executed(report) = result.outcome("b").unwrap() else {
            panic!("b should have executed");
        };
        assert_eq!(report.output, Some(json!({"upstream": {"task": "a"}})));
    }

    #[tokio::test]
    async fn test_nodes_wait_for_all_upstreams() {
        let rt = test_runtime();
        let journal = Journal::new();
        for (class, name, delay) in [("A", "a", 20), ("B", "b", 30), ("C", "c", 5), ("D", "d", 0)] {
            let journal = journal.clone();
            register(&rt, class, move || {
                RecordingTask::new(name)
                    .with_journal(journal.clone())
                    .with_delay(Duration::from_millis(delay))
            });
        }

        let mut p = PipelineDefinition::new("diamond")
            .unwrap()
            .with_concurrency(3)
            .unwrap();
        p.add_task(node("a", "A")).unwrap();
        p.add_task(node("b", "B").with_upstream("a")).unwrap();
        p.add_task(node("c", "C").with_upstream("a")).unwrap();
        p.add_task(node("d", "D").with_upstream("b")).unwrap();
        p.add_dependency("c", "d").unwrap();

        let runner = PipelineRunner::new(rt.runtime.clone());
        let result = runner.run(&p, &RunConfig::new(), None).await.unwrap();
        assert!(result.is_success());

        let at = |event: &str| journal.position(event).unwrap();
        assert!(at("start:b") > at("end:a"));
        assert!(at("start:c") > at("end:a"));
        assert!(at("start:d") > at("end:b"));
        assert!(at("start:d") > at("end:c"));
        assert_eq!(result.order, vec!["a", "b", "c", "d"]);
        assert_eq!(result.finished.last().map(String::as_str), Some("d"));
    }

    #[tokio::test]
    async fn test_sequential_run_follows_topological_order() {
        let rt = test_runtime();
        register(&rt, "Load", || RecordingTask::new("x"));

        let mut p = PipelineDefinition::new("seq").unwrap();
        p.add_task(node("report", "Load")).unwrap();
        p.add_task(node("extract", "Load")).unwrap();
        p.add_task(node("transform", "Load").with_upstream("extract"))
            .unwrap();
        p.add_dependency("transform", "report").unwrap();

        let runner = PipelineRunner::new(rt.runtime.clone());
        let result = runner.run(&p, &RunConfig::new(), None).await.unwrap();

        assert_eq!(result.order, vec!["extract", "transform", "report"]);
        assert_eq!(result.finished, result.order);
    }

    #[tokio::test]
    async fn test_depends_on_past_skips_after_earlier_failure() {
        let rt = test_runtime();
        register(&rt, "Broken", || FailingTask::new("boom"));
        register(&rt, "Load", || RecordingTask::new("ok"));

        let mut p = PipelineDefinition::new("past").unwrap();
        p.add_task(node("first", "Broken")).unwrap();
        p.add_task(node("careful", "Load").depends_on_past(true))
            .unwrap();
        p.add_task(node("independent", "Load")).unwrap();

        let runner = PipelineRunner::new(rt.runtime.clone());
        let result = runner.run(&p, &RunConfig::new(), None).await.unwrap();

        assert_eq!(result.status("first"), Some(TaskRunStatus::Error));
        assert_eq!(
            result.outcome("careful"),
            Some(&NodeOutcome::Skipped {
                reason: SkipReason::EarlierFailure {
                    failed: "first".to_string()
                }
            })
        );
        assert_eq!(result.status("independent"), Some(TaskRunStatus::Success));
    }

    #[tokio::test]
    async fn test_failed_node_leaves_no_writes() {
        let rt = test_runtime();
        register(&rt, "Load", || RecordingTask::new("a").with_write("samples", "s1", json!(1)));
        register(&rt, "Broken", || {
            FailingTask::new("disk full")
                .with_write("samples", "s2", json!(2))
                .with_write("samples", "s3", json!(3))
        });

        let mut p = PipelineDefinition::new("atomic").unwrap();
        p.add_task(node("a", "Load")).unwrap();
        p.add_task(node("b", "Broken")).unwrap();

        let runner = PipelineRunner::new(rt.runtime.clone());
        let result = runner.run(&p, &RunConfig::new(), None).await.unwrap();

        assert_eq!(result.failed(), vec!["b"]);
        let rows: Vec<String> = rt
            .database
            .committed_rows("samples")
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(rows, vec!["s1"]);
    }

    #[tokio::test]
    async fn test_unknown_task_in_run_config_aborts_run() {
        let rt = test_runtime();
        let mut p = PipelineDefinition::new("p").unwrap();
        p.add_task(node("a", "Load")).unwrap();

        let runner = PipelineRunner::new(rt.runtime.clone());
        let err = runner
            .run(&p, &run_config(json!({"ghost": {"year": 2020}})), None)
            .await
            .unwrap_err();

        assert!(matches!(err, PhenoflowError::UnknownTaskId { ref task_id, .. } if task_id == "ghost"));
        assert!(rt.database.committed_rows(TASK_RUN_TABLE).is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_task_is_recorded_as_error() {
        let rt = test_runtime();
        register(&rt, "Load", || RecordingTask::new("b"));

        let mut p = PipelineDefinition::new("p").unwrap();
        p.add_task(node("a", "Missing")).unwrap();
        p.add_task(node("b", "Load").with_upstream("a")).unwrap();

        let runner = PipelineRunner::new(rt.runtime.clone());
        let result = runner.run(&p, &RunConfig::new(), None).await.unwrap();

        let a = result.record("a").unwrap();
        assert_eq!(a.status, TaskRunStatus::Error);
        assert!(a.error.as_ref().unwrap().message.contains("etl.Missing"));
        assert!(result.outcome("b").unwrap().is_skipped());
    }

    #[tokio::test]
    async fn test_overrides_merge_and_factory_rejection() {
        let rt = test_runtime();
        rt.registry.register_with_params("etl", "Import", ["year", "source"], |args: &TaskArgs| {
            if args.get("year").and_then(Value::as_i64).is_none() {
                return Err(TaskError::validation("year is required"));
            }
            Ok(Box::new(RecordingTask::new("import")) as Box<dyn Task>)
        });

        let mut p = PipelineDefinition::new("imports").unwrap();
        p.add_task(
            node("with_year", "Import")
                .with_static_arg("year", json!(2019))
                .with_static_arg("source", json!("lims")),
        )
        .unwrap();
        p.add_task(node("without_year", "Import")).unwrap();

        let config = run_config(json!({
            "with_year": {"year": 2021, "source": "", "verbose": true},
            "without_year": {"year": null},
        }));
        let runner = PipelineRunner::new(rt.runtime.clone());
        let result = runner.run(&p, &config, None).await.unwrap();

        let ok = result.record("with_year").unwrap();
        assert_eq!(ok.status, TaskRunStatus::Success);
        assert_eq!(ok.args["year"], json!(2021));
        assert_eq!(ok.args["source"], json!("lims"));
        assert!(!ok.args.contains_key("verbose"));
        assert!(ok.args.contains_key("task_run_id"));

        let rejected = result.record("without_year").unwrap();
        assert_eq!(rejected.status, TaskRunStatus::Error);
        assert_eq!(rejected.error.as_ref().unwrap().kind, FailureKind::Validation);
        assert_eq!(rt.notifier.failures(), vec![rejected.id]);
    }

    #[tokio::test]
    async fn test_retry_run_reruns_under_same_record_ids() {
        let rt = test_runtime();
        let failing = Arc::new(AtomicBool::new(true));
        let switch = failing.clone();
        register(&rt, "Flaky", move || Flaky {
            failing: switch.clone(),
        });
        register(&rt, "Load", || RecordingTask::new("b"));

        let mut p = PipelineDefinition::new("retry").unwrap();
        p.add_task(node("a", "Flaky")).unwrap();
        p.add_task(node("b", "Load").with_upstream("a")).unwrap();
        let runner = PipelineRunner::new(rt.runtime.clone());
        let run_id = PipelineRunId::new("manual__2024-05-01");

        let first = runner
            .run(&p, &RunConfig::new(), Some(run_id.clone()))
            .await
            .unwrap();
        assert_eq!(first.failed(), vec!["a"]);
        assert_eq!(first.skipped(), vec!["b"]);

        failing.store(false, Ordering::SeqCst);
        let second = runner
            .run(&p, &RunConfig::new(), Some(run_id))
            .await
            .unwrap();

        assert!(second.is_success());
        assert_eq!(second.record("a").unwrap().id, first.record("a").unwrap().id);
        assert!(second.record("a").unwrap().error.is_none());
        assert_eq!(rt.database.committed_rows(TASK_RUN_TABLE).len(), 2);
    }

    #[tokio::test]
    async fn test_explicit_successful_record_is_reused() {
        let rt = test_runtime();
        let journal = Journal::new();
        for name in ["a", "b"] {
            let journal = journal.clone();
            register(&rt, &name.to_uppercase(), move || {
                RecordingTask::new(name).with_journal(journal.clone())
            });
        }

        let mut p = PipelineDefinition::new("reuse").unwrap();
        p.add_task(node("a", "A")).unwrap();
        p.add_task(node("b", "B").with_upstream("a")).unwrap();
        let runner = PipelineRunner::new(rt.runtime.clone());

        let first = runner.run(&p, &RunConfig::new(), None).await.unwrap();
        let a_id = first.record("a").unwrap().id;

        let config = run_config(json!({"a": {"task_run_id": a_id.to_string()}}));
        let second = runner.run(&p, &config, None).await.unwrap();

        assert!(matches!(second.outcome("a"), Some(NodeOutcome::Reused(r)) if r.id == a_id));
        assert_eq!(second.record("b").unwrap().upstream_task_run_id, Some(a_id));
        let starts_of_a = journal.events().iter().filter(|e| *e == "start:a").count();
        assert_eq!(starts_of_a, 1);
    }

    #[tokio::test]
    async fn test_rejected_cycle_leaves_definition_runnable() {
        let rt = test_runtime();
        let mut p = PipelineDefinition::new("cyclic").unwrap();
        p.add_task(node("a", "Load")).unwrap();
        p.add_task(node("b", "Load").with_upstream("a")).unwrap();
        p.add_task(node("c", "Load").with_upstream("b")).unwrap();

        let err = p.add_dependency("c", "a").unwrap_err();
        let DefinitionError::CycleDetected(cycle) = err else {
            panic!("expected a cycle");
        };
        assert_eq!(cycle.cycle_path.first(), cycle.cycle_path.last());
        assert!(cycle.cycle_path.iter().any(|id| id == "c"));
        assert_eq!(p.edges().len(), 0);

        let runner = PipelineRunner::new(rt.runtime.clone());
        let result = runner.run(&p, &RunConfig::new(), None).await.unwrap();
        assert_eq!(result.order, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_dispatch_then_scheduler_callbacks() {
        let dir = tempfile::tempdir().unwrap();
        let rt = test_runtime_in(dir.path());
        register(&rt, "Load", || RecordingTask::new("a"));
        register(&rt, "Echo", EchoUpstream::default);
        let scheduler = Arc::new(RecordingScheduler::registered_after(1));
        let runner = PipelineRunner::new(rt.runtime.clone()).with_scheduler(scheduler.clone());

        let mut p = PipelineDefinition::new("nightly").unwrap();
        p.add_task(node("a", "Load")).unwrap();
        p.add_task(node("b", "Echo").with_upstream("a")).unwrap();

        let receipt = runner
            .dispatch(&mut p, &run_config(json!({"a": {"year": 2020}})), None)
            .await
            .unwrap();

        assert!(dir.path().join("nightly.json").exists());
        assert_eq!(p.id, Some(receipt.pipeline_id));
        assert_eq!(scheduler.polls(), 2);
        let triggers = scheduler.triggers();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].run_id, receipt.run_id);

        let a_id = receipt.task_run_ids["a"];
        let b_id = receipt.task_run_ids["b"];
        assert_eq!(receipt.conf["a"]["year"], json!(2020));
        assert_eq!(receipt.conf["b"]["upstream_task_run_id"], json!(a_id.to_string()));
        let stored = rt
            .database
            .committed_row(TASK_RUN_TABLE, &a_id.to_string())
            .unwrap();
        assert_eq!(stored["status"], json!("SCHEDULED"));

        for task_id in ["a", "b"] {
            let invocation = SchedulerInvocation::from_conf(task_id, &receipt.conf[task_id]).unwrap();
            let report = runner.handle_invocation(&p, &invocation).await.unwrap();
            assert!(report.is_success());
        }

        let stored = rt
            .database
            .committed_row(TASK_RUN_TABLE, &b_id.to_string())
            .unwrap();
        assert_eq!(stored["status"], json!("SUCCESS"));
        assert_eq!(
            rt.cache.get(&crate::core::task_output_key(b_id)).await.unwrap(),
            Some(json!({"upstream": {"task": "a"}}))
        );
        assert_eq!(rt.database.committed_rows(TASK_RUN_TABLE).len(), 2);
    }

    #[tokio::test]
    async fn test_dispatch_gives_up_when_never_registered() {
        let dir = tempfile::tempdir().unwrap();
        let rt = test_runtime_in(dir.path());
        let scheduler = Arc::new(RecordingScheduler::registered_after(usize::MAX));
        let runner = PipelineRunner::new(rt.runtime.clone()).with_scheduler(scheduler.clone());
        let mut p = PipelineDefinition::new("never").unwrap();
        p.add_task(node("a", "Load")).unwrap();

        let err = runner
            .dispatch(&mut p, &RunConfig::new(), None)
            .await
            .unwrap_err();

        let attempts = rt.runtime.config().pipelines.registration_attempts;
        assert!(matches!(err, PhenoflowError::NotRegistered { attempts: n, .. } if n == attempts));
        assert_eq!(scheduler.polls(), attempts as usize);
        assert!(rt.database.committed_rows(TASK_RUN_TABLE).is_empty());
    }

    #[tokio::test]
    async fn test_rejected_trigger_rolls_back_scheduled_records() {
        let dir = tempfile::tempdir().unwrap();
        let rt = test_runtime_in(dir.path());
        let scheduler = Arc::new(RecordingScheduler::new());
        scheduler.reject_triggers();
        let runner = PipelineRunner::new(rt.runtime.clone()).with_scheduler(scheduler);
        let mut p = PipelineDefinition::new("rejected").unwrap();
        p.add_task(node("a", "Load")).unwrap();

        let err = runner
            .dispatch(&mut p, &RunConfig::new(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, PhenoflowError::Scheduler(SchedulerError::Rejected { .. })));
        assert!(rt.database.committed_rows(TASK_RUN_TABLE).is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_triggers_mock_scheduler_once() {
        let dir = tempfile::tempdir().unwrap();
        let rt = test_runtime_in(dir.path());
        let mut scheduler = MockScheduler::new();
        scheduler.expect_is_registered().returning(|_| Ok(true));
        scheduler
            .expect_trigger()
            .withf(|pipeline, run_id, conf| {
                pipeline == "mocked" && run_id.as_str() == "run-7" && conf.len() == 2
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let runner = PipelineRunner::new(rt.runtime.clone()).with_scheduler(Arc::new(scheduler));

        let mut p = PipelineDefinition::new("mocked").unwrap();
        p.add_task(node("a", "Load")).unwrap();
        p.add_task(node("b", "Load")).unwrap();

        let receipt = runner
            .dispatch(&mut p, &RunConfig::new(), Some(PipelineRunId::new("run-7")))
            .await
            .unwrap();
        assert_eq!(receipt.task_run_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_dispatch_requires_scheduler() {
        let rt = test_runtime();
        let runner = PipelineRunner::new(rt.runtime.clone());
        let mut p = PipelineDefinition::new("p").unwrap();

        let err = runner
            .dispatch(&mut p, &RunConfig::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PhenoflowError::Scheduler(SchedulerError::NotConfigured)));
    }

    #[tokio::test]
    async fn test_store_failure_drains_in_flight_nodes() {
        let rt = test_runtime();
        let database = (*rt.database).clone();
        register(&rt, "Slow", || RecordingTask::new("slow").with_delay(Duration::from_millis(50)));
        register(&rt, "Outage", move || StoreOutage {
            database: database.clone(),
            outage: 2,
        });
        register(&rt, "Late", || RecordingTask::new("late"));

        let mut p = PipelineDefinition::new("outage").unwrap().with_concurrency(2).unwrap();
        p.add_task(node("slow", "Slow")).unwrap();
        p.add_task(node("sab", "Outage")).unwrap();
        p.add_task(node("late", "Late")).unwrap();
        let runner = PipelineRunner::new(rt.runtime.clone());

        let err = runner.run(&p, &RunConfig::new(), None).await.unwrap_err();
        let PhenoflowError::RunAborted {
            task_id,
            finished,
            source,
            ..
        } = err
        else {
            panic!("expected the run to abort");
        };
        assert_eq!(task_id, "sab");
        assert_eq!(finished, vec!["slow"]);
        assert!(matches!(*source, PhenoflowError::Store(_)));

        let rows = rt.database.committed_rows(TASK_RUN_TABLE);
        assert_eq!(rows.len(), 2);
        let status_of = |task_id: &str| {
            rows.iter()
                .find(|(_, row)| row["task_id"] == json!(task_id))
                .map(|(_, row)| row["status"].clone())
        };
        assert_eq!(status_of("slow"), Some(json!("SUCCESS")));
        assert_eq!(status_of("sab"), Some(json!("ERROR")));
        assert_eq!(status_of("late"), None);
    }

    #[tokio::test]
    async fn test_username_reaches_records() {
        let dir = tempfile::tempdir().unwrap();
        let rt = test_runtime_in(dir.path());
        register(&rt, "Load", || RecordingTask::new("a"));
        let runner =
            PipelineRunner::new(rt.runtime.clone()).with_scheduler(Arc::new(RecordingScheduler::new()));
        let mut p = PipelineDefinition::new("owned").unwrap();
        p.add_task(node("a", "Load")).unwrap();
        let config = run_config(json!({"a": {"username": "alice"}}));

        let result = runner.run(&p, &config, None).await.unwrap();
        let record = result.record("a").unwrap();
        assert_eq!(record.username.as_deref(), Some("alice"));
        assert!(!record.args.contains_key("username"));

        let receipt = runner.dispatch(&mut p, &config, None).await.unwrap();
        assert_eq!(receipt.conf["a"]["username"], json!("alice"));
        let a_id = receipt.task_run_ids["a"];
        let scheduled = rt
            .database
            .committed_row(TASK_RUN_TABLE, &a_id.to_string())
            .unwrap();
        assert_eq!(scheduled["username"], json!("alice"));

        let invocation = SchedulerInvocation::from_conf("a", &receipt.conf["a"]).unwrap();
        let report = runner.handle_invocation(&p, &invocation).await.unwrap();
        assert_eq!(report.record.username.as_deref(), Some("alice"));
        assert!(!report.record.args.contains_key("username"));
    }

    #[tokio::test]
    async fn test_dispatch_keeps_successful_explicit_record() {
        let dir = tempfile::tempdir().unwrap();
        let rt = test_runtime_in(dir.path());
        register(&rt, "Load", || RecordingTask::new("a"));
        register(&rt, "Echo", EchoUpstream::default);
        let scheduler = Arc::new(RecordingScheduler::new());
        let runner = PipelineRunner::new(rt.runtime.clone()).with_scheduler(scheduler.clone());
        let mut p = PipelineDefinition::new("resume").unwrap();
        p.add_task(node("a", "Load")).unwrap();
        p.add_task(node("b", "Echo").with_upstream("a")).unwrap();

        let first = runner.dispatch(&mut p, &RunConfig::new(), None).await.unwrap();
        let a_id = first.task_run_ids["a"];
        let invocation = SchedulerInvocation::from_conf("a", &first.conf["a"]).unwrap();
        assert!(runner.handle_invocation(&p, &invocation).await.unwrap().is_success());

        let config = run_config(json!({"a": {"task_run_id": a_id.to_string()}}));
        let second = runner.dispatch(&mut p, &config, None).await.unwrap();

        assert_eq!(second.reused, vec!["a"]);
        assert_eq!(second.task_run_ids["a"], a_id);
        assert!(!second.conf.contains_key("a"));
        assert_eq!(second.conf["b"]["upstream_task_run_id"], json!(a_id.to_string()));
        assert_eq!(scheduler.triggers().len(), 2);

        let stored = rt
            .database
            .committed_row(TASK_RUN_TABLE, &a_id.to_string())
            .unwrap();
        assert_eq!(stored["status"], json!("SUCCESS"));
        assert_eq!(stored["pipeline_run_id"], json!(first.run_id.to_string()));
        assert!(!stored["output_cache_key"].is_null());
        assert_eq!(
            rt.cache.get(&crate::core::task_output_key(a_id)).await.unwrap(),
            Some(json!({"task": "a"}))
        );
    }

    #[tokio::test]
    async fn test_dispatch_reschedules_failed_explicit_record_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let rt = test_runtime_in(dir.path());
        register(&rt, "Broken", || FailingTask::new("source offline"));
        let runner =
            PipelineRunner::new(rt.runtime.clone()).with_scheduler(Arc::new(RecordingScheduler::new()));
        let mut p = PipelineDefinition::new("again").unwrap();
        p.add_task(node("a", "Broken")).unwrap();

        let first = runner.dispatch(&mut p, &RunConfig::new(), None).await.unwrap();
        let a_id = first.task_run_ids["a"];
        let invocation = SchedulerInvocation::from_conf("a", &first.conf["a"]).unwrap();
        assert!(!runner.handle_invocation(&p, &invocation).await.unwrap().is_success());

        let config = run_config(json!({"a": {"task_run_id": a_id.to_string()}}));
        let second = runner.dispatch(&mut p, &config, None).await.unwrap();

        assert!(second.reused.is_empty());
        assert_eq!(second.task_run_ids["a"], a_id);
        assert!(second.conf.contains_key("a"));
        let stored = rt
            .database
            .committed_row(TASK_RUN_TABLE, &a_id.to_string())
            .unwrap();
        assert_eq!(stored["status"], json!("SCHEDULED"));
        assert!(stored["error"].is_null());
        assert_eq!(stored["pipeline_run_id"], json!(second.run_id.to_string()));
        assert_eq!(rt.database.committed_rows(TASK_RUN_TABLE).len(), 1);
    }

    #[tokio::test]
    async fn test_explicit_record_of_another_pipeline_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let rt = test_runtime_in(dir.path());
        register(&rt, "Load", || RecordingTask::new("a"));
        let scheduler = Arc::new(RecordingScheduler::new());
        let runner = PipelineRunner::new(rt.runtime.clone()).with_scheduler(scheduler.clone());

        let mut foreign = TaskRunRecord::new(TaskRunId::new(), "etl", "Load", TaskRunStatus::Success, now_utc());
        foreign.pipeline_id = Some(PipelineId::new());
        let mut session = rt.runtime.database().begin().await.unwrap();
        session.save_task_run(&foreign).await.unwrap();
        session.commit().await.unwrap();

        let mut p = PipelineDefinition::new("mine").unwrap();
        p.add_task(node("a", "Load")).unwrap();
        let config = run_config(json!({"a": {"task_run_id": foreign.id.to_string()}}));

        let err = runner.dispatch(&mut p, &config, None).await.unwrap_err();
        assert!(matches!(err, PhenoflowError::InvalidRunConfig { ref task_id, .. } if task_id == "a"));
        assert!(scheduler.triggers().is_empty());

        let err = runner.run(&p, &config, None).await.unwrap_err();
        assert!(matches!(err, PhenoflowError::InvalidRunConfig { .. }));
        assert_eq!(rt.database.committed_rows(TASK_RUN_TABLE).len(), 1);
    }

    #[tokio::test]
    async fn test_invocation_for_unknown_node() {
        let rt = test_runtime();
        let runner = PipelineRunner::new(rt.runtime.clone());
        let p = PipelineDefinition::new("p").unwrap();
        let invocation = SchedulerInvocation {
            task_id: "ghost".to_string(),
            task_run_id: TaskRunId::new(),
            pipeline_run_id: PipelineRunId::new("r"),
            upstream_task_run_id: None,
            username: None,
            args: TaskArgs::new(),
        };

        let err = runner.handle_invocation(&p, &invocation).await.unwrap_err();
        assert!(matches!(err, PhenoflowError::UnknownTaskId { .. }));
    }
}
