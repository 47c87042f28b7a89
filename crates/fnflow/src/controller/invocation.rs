//! Drives `WorkflowInvocation` aggregates forward: on each tick, re-derives
//! the schedule from cached state and turns its proposals into task
//! invocations and status transitions.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::bus::{BusMessage, EventBus, Selector};
use crate::cache::SubscribedCache;
use crate::eventlog::EventLog;
use crate::expr::{ExpressionResolver, ScopeData};
use crate::model::event::{AggregateRef, AggregateType, EventPayload, InvocationEventPayload};
use crate::model::spec::TaskId;
use crate::model::status::WorkflowInvocationStatus;
use crate::model::value::TypedValue;
use crate::reliability::RetryPolicy;
use crate::runtime::{Resolver, ResolvedRef, RuntimeContext, RuntimeRegistry};
use crate::scheduler::{schedule, ScheduleAction};

/// Minimum fallback tick period, matching the spec's stated 1 s floor —
/// the bus carries the fast path, this is only a safety net against a
/// missed notification.
pub const MIN_TICK: Duration = Duration::from_secs(1);

pub struct InvocationControllerConfig {
    pub tick: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for InvocationControllerConfig {
    fn default() -> Self {
        Self {
            tick: MIN_TICK,
            retry_policy: RetryPolicy::standard(),
        }
    }
}

pub struct InvocationController {
    log: Arc<dyn EventLog>,
    cache: Arc<SubscribedCache>,
    bus: EventBus,
    resolver: Arc<dyn Resolver>,
    runtimes: Arc<RuntimeRegistry>,
    expr: Arc<ExpressionResolver>,
    config: InvocationControllerConfig,
    /// Guards against proposing the same task invocation twice while the
    /// first attempt is still in flight, the way the teacher's worker pool
    /// tracks tasks it has already claimed.
    in_flight: Arc<DashMap<(Uuid, TaskId), ()>>,
    /// One cancellation token per in-flight task invocation, cancelled as
    /// soon as the owning invocation reaches a finished status so a
    /// long-running `Runtime::invoke` call is actually interrupted rather
    /// than left to run to completion after `cancel()`.
    cancellations: Arc<DashMap<(Uuid, TaskId), CancellationToken>>,
}

impl InvocationController {
    pub fn new(
        log: Arc<dyn EventLog>,
        cache: Arc<SubscribedCache>,
        bus: EventBus,
        resolver: Arc<dyn Resolver>,
        runtimes: Arc<RuntimeRegistry>,
        expr: Arc<ExpressionResolver>,
        config: InvocationControllerConfig,
    ) -> Self {
        Self {
            log,
            cache,
            bus,
            resolver,
            runtimes,
            expr,
            config,
            in_flight: Arc::new(DashMap::new()),
            cancellations: Arc::new(DashMap::new()),
        }
    }

    /// Runs the tick loop until `shutdown` resolves. Intended to be spawned
    /// by a [`crate::meta_controller::MetaController`].
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut subscription = self.bus.subscribe(Selector::AggregateType(AggregateType::WorkflowInvocation));
        let mut interval = tokio::time::interval(self.config.tick);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
                msg = subscription.recv() => {
                    match msg {
                        Some(BusMessage::Event(_)) => self.tick().await,
                        Some(BusMessage::Lagged { skipped }) => {
                            warn!(skipped, "invocation controller bus subscription lagged");
                            self.tick().await;
                        }
                        None => break,
                    }
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn tick(&self) {
        for aggregate in self.cache.list(AggregateType::WorkflowInvocation) {
            let Some(invocation) = aggregate.as_invocation() else { continue };
            if invocation.status.is_finished() {
                self.cancel_in_flight(invocation.id);
                continue;
            }
            let Some(spec) = invocation.spec.clone() else { continue };

            let result = schedule(&spec, invocation.status, &invocation.task_statuses());
            for action in result.actions {
                self.apply_action(invocation.id, &spec, action).await;
            }
        }
    }

    /// Cancels every still-registered task token for `invocation_id` — the
    /// in-flight `Runtime::invoke` call (if any) races this and returns
    /// early instead of running to completion after the invocation is
    /// already `Aborted`/`Failed`/`Succeeded`.
    fn cancel_in_flight(&self, invocation_id: Uuid) {
        for entry in self.cancellations.iter() {
            if entry.key().0 == invocation_id {
                entry.value().cancel();
            }
        }
    }

    async fn apply_action(&self, invocation_id: Uuid, spec: &crate::model::spec::WorkflowSpec, action: ScheduleAction) {
        match action {
            ScheduleAction::InvokeTask(task_id) => self.invoke_task(invocation_id, spec, task_id).await,
            ScheduleAction::SkipTask { task_id, reason } => {
                self.append(
                    invocation_id,
                    EventPayload::WorkflowInvocation(InvocationEventPayload::TaskSkipped { task_id, reason }),
                )
                .await;
            }
            ScheduleAction::Complete => {
                self.append(
                    invocation_id,
                    EventPayload::WorkflowInvocation(InvocationEventPayload::StatusChanged {
                        status: WorkflowInvocationStatus::Succeeded,
                    }),
                )
                .await;
            }
            ScheduleAction::AbortWorkflow { reason } => {
                debug!(invocation_id = %invocation_id, reason, "aborting workflow invocation");
                self.append(
                    invocation_id,
                    EventPayload::WorkflowInvocation(InvocationEventPayload::StatusChanged {
                        status: WorkflowInvocationStatus::Failed,
                    }),
                )
                .await;
            }
        }
    }

    async fn invoke_task(&self, invocation_id: Uuid, spec: &crate::model::spec::WorkflowSpec, task_id: TaskId) {
        let key = (invocation_id, task_id.clone());
        if self.in_flight.contains_key(&key) {
            return;
        }
        self.in_flight.insert(key.clone(), ());
        let token = CancellationToken::new();
        self.cancellations.insert(key.clone(), token.clone());

        let log = self.log.clone();
        let cache = self.cache.clone();
        let resolver = self.resolver.clone();
        let runtimes = self.runtimes.clone();
        let expr = self.expr.clone();
        let retry_policy = self.config.retry_policy.clone();
        let in_flight = self.in_flight.clone();
        let cancellations = self.cancellations.clone();
        let spec = spec.clone();

        tokio::spawn(async move {
            let aggregate_ref = AggregateRef::invocation(invocation_id);

            let resolved = match resolve_task(&cache, &aggregate_ref, &spec, &task_id, &*resolver, &expr).await {
                Ok(resolved) => resolved,
                Err(err) => {
                    append_event(
                        &*log,
                        &cache,
                        &aggregate_ref,
                        EventPayload::WorkflowInvocation(InvocationEventPayload::TaskFailed { task_id: task_id.clone(), error: err }),
                    )
                    .await;
                    in_flight.remove(&key);
                    cancellations.remove(&key);
                    return;
                }
            };
            let ResolvedTask { resolved_ref, inputs } = resolved;

            append_event(
                &*log,
                &cache,
                &aggregate_ref,
                EventPayload::WorkflowInvocation(InvocationEventPayload::Scheduled {
                    task_id: task_id.clone(),
                    inputs: inputs.clone(),
                }),
            )
            .await;
            append_event(
                &*log,
                &cache,
                &aggregate_ref,
                EventPayload::WorkflowInvocation(InvocationEventPayload::TaskStarted {
                    task_id: task_id.clone(),
                    resolved_ref: format!("{}:{}", resolved_ref.runtime_name, resolved_ref.resolved_ref),
                    inputs: inputs.clone(),
                }),
            )
            .await;

            let ctx = RuntimeContext::new(token.clone());
            let mut attempt: u32 = 1;
            loop {
                if token.is_cancelled() {
                    break;
                }
                match runtimes.invoke(&ctx, &resolved_ref, inputs.clone()).await {
                    Ok(output) => {
                        append_event(
                            &*log,
                            &cache,
                            &aggregate_ref,
                            EventPayload::WorkflowInvocation(InvocationEventPayload::TaskSucceeded {
                                task_id: task_id.clone(),
                                output,
                            }),
                        )
                        .await;
                        break;
                    }
                    Err(err) => {
                        if token.is_cancelled() {
                            break;
                        }
                        let err = err.to_string();
                        if retry_policy.has_attempts_remaining(attempt) {
                            let delay = retry_policy.delay_for_attempt(attempt);
                            warn!(task_id = %task_id, attempt, ?delay, %err, "task invocation failed, retrying");
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = token.cancelled() => break,
                            }
                            attempt += 1;
                            continue;
                        }
                        append_event(
                            &*log,
                            &cache,
                            &aggregate_ref,
                            EventPayload::WorkflowInvocation(InvocationEventPayload::TaskFailed {
                                task_id: task_id.clone(),
                                error: err,
                            }),
                        )
                        .await;
                        break;
                    }
                }
            }

            in_flight.remove(&key);
            cancellations.remove(&key);
        });
    }

    async fn append(&self, invocation_id: Uuid, payload: EventPayload) {
        append_event(&*self.log, &self.cache, &AggregateRef::invocation(invocation_id), payload).await;
    }
}

/// Appends `payload` unless the cache already shows the invocation as
/// finished — a best-effort guard (the cache can lag the log by one tail
/// cycle) that stops the common case of a task-terminal event landing
/// after `Aborted`/`Succeeded`/`Failed`.
async fn append_event(log: &dyn EventLog, cache: &SubscribedCache, aggregate_ref: &AggregateRef, payload: EventPayload) {
    if let Some(aggregate) = cache.get(aggregate_ref) {
        if let Some(invocation) = aggregate.as_invocation() {
            if invocation.status.is_finished() {
                debug!(aggregate = ?aggregate_ref, "invocation already finished, dropping event");
                return;
            }
        }
    }

    let events = match log.replay(aggregate_ref).await {
        Ok(events) => events,
        Err(err) => {
            warn!(%err, "failed to load events before append");
            return;
        }
    };
    let expected = events.len() as u64;
    if let Err(err) = log.append(aggregate_ref.clone(), expected, vec![payload], None).await {
        warn!(%err, "failed to append controller event");
    }
}

struct ResolvedTask {
    resolved_ref: ResolvedRef,
    inputs: BTreeMap<String, TypedValue>,
}

/// Resolves a task's inputs and function reference once, up front, so the
/// result can be persisted on `Scheduled`/`TaskStarted` before the runtime
/// is invoked (and reused unchanged across retries, rather than
/// re-evaluating expressions on every attempt).
async fn resolve_task(
    cache: &SubscribedCache,
    aggregate_ref: &AggregateRef,
    spec: &crate::model::spec::WorkflowSpec,
    task_id: &TaskId,
    resolver: &dyn Resolver,
    expr: &ExpressionResolver,
) -> Result<ResolvedTask, String> {
    let Some(task_spec) = spec.tasks.get(task_id) else {
        return Err(format!("task {task_id:?} not found in spec"));
    };

    let scope_data = build_scope_data(cache, aggregate_ref);
    let mut inputs = BTreeMap::new();
    for (name, value) in &task_spec.inputs {
        let resolved = expr.resolve(value, &scope_data, task_id).map_err(|e| e.to_string())?;
        inputs.insert(name.clone(), resolved);
    }

    let resolved_ref = resolver.resolve(&task_spec.function_ref).await.map_err(|e| e.to_string())?;
    Ok(ResolvedTask { resolved_ref, inputs })
}

fn build_scope_data(cache: &SubscribedCache, aggregate_ref: &AggregateRef) -> ScopeData {
    let mut scope = ScopeData::default();
    if let Some(aggregate) = cache.get(aggregate_ref) {
        if let Some(invocation) = aggregate.as_invocation() {
            for (name, value) in &invocation.inputs {
                scope.invocation_inputs.insert(name.clone(), value.value.clone());
            }
            for (task_id, task) in &invocation.tasks {
                if let Some(output) = &task.output {
                    scope.task_outputs.insert(task_id.clone(), output.value.clone());
                }
            }
        }
    }
    scope
}
