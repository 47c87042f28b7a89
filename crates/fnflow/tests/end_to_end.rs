//! End-to-end scenarios driving the engine through its public API, each
//! exercising one of the engine's externally observable properties.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fnflow::bootstrap::bootstrap_with;
use fnflow::config::EngineConfig;
use fnflow::eventlog::{EventLog, InMemoryEventLog};
use fnflow::model::spec::{DependencyParams, TaskSpec, WorkflowSpec};
use fnflow::model::status::{TaskInvocationStatus, WorkflowInvocationStatus};
use fnflow::model::value::TypedValue;
use fnflow::runtime::{FailRuntime, NoopRuntime, RuntimeRegistry, SleepRuntime, StaticResolver};
use uuid::Uuid;

async fn engine_with_runtimes(runtimes: Vec<Arc<dyn fnflow::runtime::Runtime>>) -> fnflow::bootstrap::Engine {
    let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new());
    let resolver = Arc::new(StaticResolver::new("noop"));
    let registry = Arc::new(RuntimeRegistry::new());
    for runtime in runtimes {
        registry.register(runtime);
    }
    bootstrap_with(EngineConfig::default(), log, resolver, registry).await.unwrap()
}

async fn wait_finished(engine: &fnflow::bootstrap::Engine, invocation_id: Uuid, within: Duration) -> fnflow::model::aggregate::WorkflowInvocationAggregate {
    tokio::time::timeout(within, async {
        loop {
            if let Ok(inv) = engine.invocation_api.get(invocation_id).await {
                if inv.status.is_finished() {
                    return inv;
                }
            }
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
    })
    .await
    .expect("invocation did not finish in time")
}

#[tokio::test]
async fn single_task_invocation_succeeds() {
    let engine = engine_with_runtimes(vec![Arc::new(NoopRuntime)]).await;
    let spec = WorkflowSpec::new("t1").with_task("t1", TaskSpec::new("noop").with_input("default", TypedValue::string("ok")));

    let id = engine.invocation_api.invoke(Uuid::nil(), spec, BTreeMap::new(), None).await.unwrap();
    let invocation = wait_finished(&engine, id, Duration::from_secs(2)).await;

    assert_eq!(invocation.status, WorkflowInvocationStatus::Succeeded);
    assert_eq!(invocation.output, Some(TypedValue::string("ok")));
    engine.shutdown().await;
}

#[tokio::test]
async fn linear_dependency_runs_in_order() {
    let engine = engine_with_runtimes(vec![Arc::new(NoopRuntime)]).await;
    let spec = WorkflowSpec::new("t2")
        .with_task("t1", TaskSpec::new("noop").with_input("default", TypedValue::string("first")))
        .with_task("t2", TaskSpec::new("noop").requires("t1", DependencyParams::default()));

    let id = engine.invocation_api.invoke(Uuid::nil(), spec, BTreeMap::new(), None).await.unwrap();
    let invocation = wait_finished(&engine, id, Duration::from_secs(2)).await;

    assert_eq!(invocation.status, WorkflowInvocationStatus::Succeeded);
    assert_eq!(invocation.tasks["t1"].status, TaskInvocationStatus::Succeeded);
    assert_eq!(invocation.tasks["t2"].status, TaskInvocationStatus::Succeeded);
    engine.shutdown().await;
}

#[tokio::test]
async fn diamond_dependencies_all_complete() {
    let engine = engine_with_runtimes(vec![Arc::new(NoopRuntime)]).await;
    let spec = WorkflowSpec::new("d")
        .with_task("a", TaskSpec::new("noop"))
        .with_task("b", TaskSpec::new("noop").requires("a", DependencyParams::default()))
        .with_task("c", TaskSpec::new("noop").requires("a", DependencyParams::default()))
        .with_task(
            "d",
            TaskSpec::new("noop")
                .requires("b", DependencyParams::default())
                .requires("c", DependencyParams::default()),
        );

    let id = engine.invocation_api.invoke(Uuid::nil(), spec, BTreeMap::new(), None).await.unwrap();
    let invocation = wait_finished(&engine, id, Duration::from_secs(2)).await;

    assert_eq!(invocation.status, WorkflowInvocationStatus::Succeeded);
    for task in ["a", "b", "c", "d"] {
        assert_eq!(invocation.tasks[task].status, TaskInvocationStatus::Succeeded);
    }
    engine.shutdown().await;
}

#[tokio::test]
async fn expression_timeout_surfaces_as_eval_error() {
    let resolver = fnflow::expr::ExpressionResolver::new(Duration::from_millis(20));
    let scope = fnflow::expr::ScopeData::default();
    let err = resolver.resolve_expression("while (true) {}", &scope, "t1").unwrap_err();
    assert!(matches!(err, fnflow::expr::ExprError::Timeout { .. }));
}

#[tokio::test]
async fn cancel_mid_flight_aborts_remaining_tasks() {
    let engine = engine_with_runtimes(vec![Arc::new(SleepRuntime { delay: Duration::from_secs(5) })]).await;
    let spec = WorkflowSpec::new("t1").with_task("t1", TaskSpec::new("sleep"));

    let id = engine.invocation_api.invoke(Uuid::nil(), spec, BTreeMap::new(), None).await.unwrap();

    // Give the controller a moment to start the task, then cancel well
    // before the 5s sleep would otherwise finish it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    engine.invocation_api.cancel(id).await.unwrap();

    let invocation = wait_finished(&engine, id, Duration::from_secs(2)).await;
    assert_eq!(invocation.status, WorkflowInvocationStatus::Aborted);
    assert_eq!(invocation.tasks["t1"].status, TaskInvocationStatus::Aborted);

    // Wait past the point where the uncancelled sleep would have completed
    // and confirm the abort stuck: no `TaskSucceeded` ever lands for a task
    // whose invocation already finished.
    tokio::time::sleep(Duration::from_secs(5)).await;
    let invocation = engine.invocation_api.get(id).await.unwrap();
    assert_eq!(invocation.status, WorkflowInvocationStatus::Aborted);
    assert_eq!(invocation.tasks["t1"].status, TaskInvocationStatus::Aborted);
    engine.shutdown().await;
}

#[tokio::test]
async fn failing_task_aborts_the_workflow() {
    let engine = engine_with_runtimes(vec![Arc::new(FailRuntime)]).await;
    let spec = WorkflowSpec::new("t1").with_task("t1", TaskSpec::new("fail").with_await(0));
    // Use no retries so the scenario resolves quickly.
    let id = engine.invocation_api.invoke(Uuid::nil(), spec, BTreeMap::new(), None).await.unwrap();

    let invocation = wait_finished(&engine, id, Duration::from_secs(10)).await;
    assert_eq!(invocation.status, WorkflowInvocationStatus::Failed);
    assert_eq!(invocation.tasks["t1"].status, TaskInvocationStatus::Failed);
    engine.shutdown().await;
}

#[tokio::test]
async fn duplicate_invoke_with_same_client_request_id_is_idempotent() {
    let engine = engine_with_runtimes(vec![Arc::new(NoopRuntime)]).await;
    let spec = WorkflowSpec::new("t1").with_task("t1", TaskSpec::new("noop"));

    let id1 = engine
        .invocation_api
        .invoke(Uuid::nil(), spec.clone(), BTreeMap::new(), Some("dup-req".to_string()))
        .await
        .unwrap();
    let id2 = engine
        .invocation_api
        .invoke(Uuid::nil(), spec, BTreeMap::new(), Some("dup-req".to_string()))
        .await
        .unwrap();

    assert_eq!(id1, id2);
    wait_finished(&engine, id1, Duration::from_secs(2)).await;
    engine.shutdown().await;
}
