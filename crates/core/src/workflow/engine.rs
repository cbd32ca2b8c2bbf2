//! Per-workflow coordinator.
//!
//! An [`Engine`] owns one workflow's dependency graph. Once started it
//! listens to the workflow's triggers and, for every event, records a new
//! execution and walks the graph step by step, persisting each result
//! through the execution store before moving on.

use super::dag::{DependencyGraph, Vertex};
use super::interpolate::interpolate;
use super::strategy::{ExecutionStrategy, Immediate, Scheduled};
use super::transmission::KEY_LEN;
use crate::capability::{
    trigger_id, CapabilityRegistry, CapabilityRequest, ExecutableCapability, Node, RequestMetadata, TriggerCapability,
    TriggerEvent, TriggerRegistrationRequest, TriggerResponse, WorkflowRegistration,
};
use crate::config::EngineConfig;
use crate::error::{CapabilityError, EngineError, GraphError, StoreError, StrategyError};
use crate::metrics::{self, labels, MetricsCollector};
use crate::queue::{self, QueueReceiver, QueueSender};
use crate::retry::retryable;
use crate::storage::ExecutionStore;
use crate::types::{
    execution_id_for, CapabilityType, ExecutionStatus, Value, ValueMap, WorkflowExecution, WorkflowExecutionStep,
    WorkflowSpec, TRIGGER_REF,
};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const FINISHED_CHANNEL_CAPACITY: usize = 256;

/// Notification sent once a run reaches a terminal status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionFinished {
    pub execution_id: String,
    pub status: ExecutionStatus,
}

/// Everything needed to construct an [`Engine`]
pub struct EngineParams {
    pub workflow_id: String,
    pub workflow_owner: String,
    pub workflow_name: String,
    pub spec: WorkflowSpec,
    pub registry: Arc<dyn CapabilityRegistry>,
    pub store: Arc<dyn ExecutionStore>,
    pub metrics: Arc<MetricsCollector>,
    pub config: EngineConfig,
}

/// Immutable state shared by the engine handle and its tasks
struct Shared {
    workflow_id: String,
    workflow_owner: String,
    workflow_name: String,
    spec: WorkflowSpec,
    graph: DependencyGraph,
    registry: Arc<dyn CapabilityRegistry>,
    store: Arc<dyn ExecutionStore>,
    metrics: Arc<MetricsCollector>,
    config: EngineConfig,
    secret: [u8; KEY_LEN],
    cancel: CancellationToken,
    tracker: TaskTracker,
    finished: broadcast::Sender<ExecutionFinished>,
}

struct StepRuntime {
    capability_id: String,
    capability: Arc<dyn ExecutableCapability>,
    strategy: Arc<dyn ExecutionStrategy>,
}

struct TriggerRuntime {
    capability: Arc<dyn TriggerCapability>,
    request: TriggerRegistrationRequest,
}

/// Resolved capabilities, available once initialization succeeded
struct Runner {
    shared: Arc<Shared>,
    node: Node,
    steps: HashMap<String, StepRuntime>,
    triggers: Vec<TriggerRuntime>,
    permits: Arc<Semaphore>,
}

enum Lifecycle {
    Idle,
    Starting,
    Running(Arc<Runner>),
    Closed,
}

/// Runs one workflow
pub struct Engine {
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
}

impl Engine {
    /// Validate the workflow and prepare an engine for it. Nothing runs until [`Engine::start`].
    pub fn new(params: EngineParams) -> Result<Self, EngineError> {
        let graph = DependencyGraph::build(&params.spec).map_err(|source| EngineError::Graph {
            workflow_id: params.workflow_id.clone(),
            source,
        })?;
        let secret = params.config.secret()?;
        let (finished, _) = broadcast::channel(FINISHED_CHANNEL_CAPACITY);

        Ok(Self {
            shared: Arc::new(Shared {
                workflow_id: params.workflow_id,
                workflow_owner: params.workflow_owner,
                workflow_name: params.workflow_name,
                spec: params.spec,
                graph,
                registry: params.registry,
                store: params.store,
                metrics: params.metrics,
                config: params.config,
                secret,
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
                finished,
            }),
            lifecycle: Mutex::new(Lifecycle::Idle),
        })
    }

    pub fn workflow_id(&self) -> &str {
        &self.shared.workflow_id
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.shared.graph
    }

    /// Receive a notification for every run that finishes from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionFinished> {
        self.shared.finished.subscribe()
    }

    /// Resolve capabilities, resume unfinished runs and subscribe to triggers.
    ///
    /// A failed start is permanent: the engine ends up closed.
    pub async fn start(&self) -> Result<(), EngineError> {
        {
            let mut lifecycle = self.lifecycle.lock().await;
            match *lifecycle {
                Lifecycle::Idle => *lifecycle = Lifecycle::Starting,
                Lifecycle::Starting | Lifecycle::Running(_) => return Err(EngineError::AlreadyStarted),
                Lifecycle::Closed => return Err(EngineError::Closed),
            }
        }

        tracing::info!(workflow_id = %self.shared.workflow_id, "starting workflow engine");

        let started = self.try_start().await;
        let mut lifecycle = self.lifecycle.lock().await;
        let still_starting = matches!(*lifecycle, Lifecycle::Starting);
        match started {
            Ok(runner) if still_starting => {
                *lifecycle = Lifecycle::Running(runner);
                tracing::info!(workflow_id = %self.shared.workflow_id, "workflow engine started");
                Ok(())
            }
            // closed while starting
            Ok(runner) => {
                drop(lifecycle);
                runner.unregister_triggers(runner.triggers.len()).await;
                self.shutdown_tasks().await;
                runner.unregister_from_workflow().await;
                Err(EngineError::Closed)
            }
            Err(err) => {
                *lifecycle = Lifecycle::Closed;
                drop(lifecycle);
                self.shutdown_tasks().await;
                if self.shared.cancel.is_cancelled() && matches!(err, EngineError::Initialization { .. }) {
                    return Err(EngineError::Closed);
                }
                tracing::error!(workflow_id = %self.shared.workflow_id, error = %err, "failed to start workflow engine");
                Err(err)
            }
        }
    }

    async fn try_start(&self) -> Result<Arc<Runner>, EngineError> {
        let runner = Arc::new(self.initialize().await?);

        if let Err(err) = runner.resume_unfinished().await {
            self.shutdown_tasks().await;
            runner.unregister_from_workflow().await;
            return Err(err);
        }

        let (events_tx, events_rx) = queue::channel(self.shared.cancel.child_token());
        if let Err(err) = runner.register_triggers(events_tx).await {
            self.shutdown_tasks().await;
            runner.unregister_from_workflow().await;
            return Err(err);
        }

        let loop_runner = runner.clone();
        self.shared.tracker.spawn(loop_runner.event_loop(events_rx));
        Ok(runner)
    }

    /// Resolve the local node and every capability, retrying until the registry has them
    async fn initialize(&self) -> Result<Runner, EngineError> {
        let shared = &self.shared;
        let interval = shared.config.init_retry_interval();
        let max_retries = shared.config.init_max_retries;
        let init_error = |source| EngineError::Initialization {
            workflow_id: shared.workflow_id.clone(),
            source,
        };

        let registry = &shared.registry;
        let node = retryable(&shared.cancel, interval, max_retries, move || registry.local_node())
            .await
            .map_err(init_error)?;

        let mut steps = HashMap::new();
        for vertex in shared.graph.steps() {
            let id = vertex.step.id.as_str();
            let registration = &WorkflowRegistration {
                workflow_id: shared.workflow_id.clone(),
                config: vertex.step.config.clone(),
            };

            let resolved = retryable(&shared.cancel, interval, max_retries, move || async move {
                let capability = registry.get_executable(id).await?;
                capability.register_to_workflow(registration.clone()).await?;
                Ok::<_, CapabilityError>(capability)
            })
            .await;
            let capability = match resolved {
                Ok(capability) => capability,
                Err(source) => {
                    shared.unregister_steps(&steps).await;
                    return Err(init_error(source));
                }
            };

            let info = capability.info();
            let strategy: Arc<dyn ExecutionStrategy> = if info.capability_type == CapabilityType::Target
                && info.is_local
                && node.workflow_don.members.len() > 1
            {
                Arc::new(Scheduled::new(shared.secret, node.clone()))
            } else {
                Arc::new(Immediate)
            };

            steps.insert(
                vertex.reference().to_string(),
                StepRuntime {
                    capability_id: info.id,
                    capability,
                    strategy,
                },
            );
        }

        let mut triggers = Vec::with_capacity(shared.spec.triggers.len());
        for (index, step) in shared.spec.triggers.iter().enumerate() {
            let id = step.id.as_str();
            let resolved = retryable(&shared.cancel, interval, max_retries, move || registry.get_trigger(id)).await;
            let capability = match resolved {
                Ok(capability) => capability,
                Err(source) => {
                    shared.unregister_steps(&steps).await;
                    return Err(init_error(source));
                }
            };

            triggers.push(TriggerRuntime {
                capability,
                request: TriggerRegistrationRequest {
                    trigger_id: trigger_id(&shared.workflow_id, index),
                    metadata: shared.metadata(&node, "", TRIGGER_REF),
                    config: step.config.clone(),
                },
            });
        }

        Ok(Runner {
            shared: shared.clone(),
            node,
            steps,
            triggers,
            permits: Arc::new(Semaphore::new(shared.config.max_concurrent_executions.max(1))),
        })
    }

    async fn shutdown_tasks(&self) {
        self.shared.cancel.cancel();
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
    }

    /// Unregister triggers, stop every run and release capabilities. Idempotent.
    pub async fn close(&self) -> Result<(), EngineError> {
        let previous = {
            let mut lifecycle = self.lifecycle.lock().await;
            std::mem::replace(&mut *lifecycle, Lifecycle::Closed)
        };

        match previous {
            Lifecycle::Closed => return Ok(()),
            // start() finishes the teardown once it notices
            Lifecycle::Starting => self.shared.cancel.cancel(),
            Lifecycle::Idle => self.shutdown_tasks().await,
            Lifecycle::Running(runner) => {
                runner.unregister_triggers(runner.triggers.len()).await;
                self.shutdown_tasks().await;
                runner.unregister_from_workflow().await;
            }
        }

        tracing::info!(workflow_id = %self.shared.workflow_id, "workflow engine closed");
        Ok(())
    }
}

impl Shared {
    fn metadata(&self, node: &Node, execution_id: &str, reference: &str) -> RequestMetadata {
        RequestMetadata {
            workflow_id: self.workflow_id.clone(),
            workflow_execution_id: execution_id.to_string(),
            workflow_owner: self.workflow_owner.clone(),
            workflow_name: self.workflow_name.clone(),
            workflow_don_id: node.workflow_don.id,
            workflow_don_config_version: node.workflow_don.config_version,
            reference_id: reference.to_string(),
        }
    }

    /// Release every capability in `steps` from this workflow
    async fn unregister_steps(&self, steps: &HashMap<String, StepRuntime>) {
        for (reference, step) in steps {
            let registration = WorkflowRegistration {
                workflow_id: self.workflow_id.clone(),
                config: self
                    .graph
                    .vertex(reference)
                    .map(|v| v.step.config.clone())
                    .unwrap_or_default(),
            };
            if let Err(err) = step.capability.unregister_from_workflow(registration).await {
                tracing::warn!(
                    workflow_id = %self.workflow_id,
                    capability_id = %step.capability_id,
                    error = %err,
                    "failed to unregister capability from workflow"
                );
            }
        }
    }

    fn graph_error(&self, source: GraphError) -> EngineError {
        EngineError::Graph {
            workflow_id: self.workflow_id.clone(),
            source,
        }
    }
}

/// How a single step ended
enum StepOutcome {
    Completed,
    EarlyExit,
    Failed,
    TimedOut,
}

impl Runner {
    async fn register_triggers(&self, events: QueueSender<TriggerResponse>) -> Result<(), EngineError> {
        for (registered, trigger) in self.triggers.iter().enumerate() {
            let result = trigger
                .capability
                .register_trigger(trigger.request.clone(), events.clone())
                .await;

            if let Err(source) = result {
                self.shared.metrics.increment_counter(
                    metrics::TRIGGER_REGISTRATION_FAILURES,
                    labels(&[("workflow_id", self.shared.workflow_id.as_str())]),
                );
                self.unregister_triggers(registered).await;
                return Err(EngineError::TriggerRegistration {
                    workflow_id: self.shared.workflow_id.clone(),
                    trigger_id: trigger.request.trigger_id.clone(),
                    source,
                });
            }

            tracing::debug!(
                workflow_id = %self.shared.workflow_id,
                trigger_id = %trigger.request.trigger_id,
                "registered trigger"
            );
        }
        Ok(())
    }

    /// Unregister the first `count` triggers
    async fn unregister_triggers(&self, count: usize) {
        for trigger in self.triggers.iter().take(count) {
            if let Err(err) = trigger.capability.unregister_trigger(trigger.request.clone()).await {
                tracing::warn!(
                    workflow_id = %self.shared.workflow_id,
                    trigger_id = %trigger.request.trigger_id,
                    error = %err,
                    "failed to unregister trigger"
                );
            }
        }
    }

    async fn unregister_from_workflow(&self) {
        self.shared.unregister_steps(&self.steps).await;
    }

    /// Pick up this workflow's executions left `started` by a previous process
    async fn resume_unfinished(self: &Arc<Self>) -> Result<(), EngineError> {
        let page_size = self.shared.config.unfinished_page_size.max(1);
        let mut unfinished = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.shared.store.get_unfinished(offset, page_size).await?;
            let fetched = page.len();
            unfinished.extend(
                page.into_iter()
                    .filter(|execution| execution.workflow_id == self.shared.workflow_id),
            );
            if fetched < page_size {
                break;
            }
            offset += fetched;
        }

        if !unfinished.is_empty() {
            tracing::info!(
                workflow_id = %self.shared.workflow_id,
                count = unfinished.len(),
                "resuming unfinished executions"
            );
        }

        for execution in unfinished {
            let runner = self.clone();
            self.shared.tracker.spawn(async move {
                let permit = tokio::select! {
                    _ = runner.shared.cancel.cancelled() => return,
                    permit = runner.permits.clone().acquire_owned() => permit,
                };
                if let Ok(_permit) = permit {
                    runner.execute(execution).await;
                }
            });
        }
        Ok(())
    }

    async fn event_loop(self: Arc<Self>, mut events: QueueReceiver<TriggerResponse>) {
        let cancel = self.shared.cancel.clone();
        loop {
            let response = tokio::select! {
                _ = cancel.cancelled() => return,
                response = events.recv() => match response {
                    Some(response) => response,
                    None => return,
                },
            };

            let event = match response {
                Ok(event) => event,
                Err(err) => {
                    tracing::error!(workflow_id = %self.shared.workflow_id, error = %err, "trigger event error");
                    continue;
                }
            };
            if event.id.is_empty() {
                tracing::error!(
                    workflow_id = %self.shared.workflow_id,
                    trigger_type = %event.trigger_type,
                    "trigger event has no id, skipping"
                );
                continue;
            }

            let permit = tokio::select! {
                _ = cancel.cancelled() => return,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            let runner = self.clone();
            self.shared.tracker.spawn(async move {
                runner.start_execution(event).await;
                drop(permit);
            });
        }
    }

    async fn start_execution(&self, event: TriggerEvent) {
        let execution_id = execution_id_for(&self.shared.workflow_id, &event.id);

        let mut execution = WorkflowExecution::new(&execution_id, &self.shared.workflow_id);
        let mut trigger = WorkflowExecutionStep::new(&execution_id, TRIGGER_REF, ExecutionStatus::Completed);
        trigger.outputs.value = Some(event.outputs);
        execution.steps.insert(TRIGGER_REF.to_string(), trigger);

        let execution = match self.shared.store.add(execution).await {
            Ok(execution) => execution,
            Err(StoreError::DuplicateExecution(_)) => {
                tracing::info!(
                    workflow_id = %self.shared.workflow_id,
                    execution_id = %execution_id,
                    event_id = %event.id,
                    "execution already exists for trigger event, skipping"
                );
                return;
            }
            Err(err) => {
                tracing::error!(
                    workflow_id = %self.shared.workflow_id,
                    execution_id = %execution_id,
                    error = %err,
                    "failed to record new execution"
                );
                return;
            }
        };

        tracing::info!(
            workflow_id = %self.shared.workflow_id,
            execution_id = %execution_id,
            event_id = %event.id,
            "execution started"
        );
        self.execute(execution).await;
    }

    /// Walk an execution to a terminal status and record it
    async fn execute(&self, execution: WorkflowExecution) {
        let shared = &self.shared;
        let execution_id = execution.execution_id.clone();
        let workflow_labels = labels(&[("workflow_id", shared.workflow_id.as_str())]);
        let started = tokio::time::Instant::now();

        shared
            .metrics
            .add_gauge(metrics::EXECUTIONS_IN_FLIGHT, 1.0, workflow_labels.clone());
        let result = self.walk(execution).await;
        shared
            .metrics
            .add_gauge(metrics::EXECUTIONS_IN_FLIGHT, -1.0, workflow_labels.clone());

        let status = match result {
            Ok(status) => status,
            Err(EngineError::Closed) => {
                tracing::info!(
                    workflow_id = %shared.workflow_id,
                    execution_id = %execution_id,
                    "execution interrupted by shutdown"
                );
                return;
            }
            Err(err) => {
                tracing::error!(
                    workflow_id = %shared.workflow_id,
                    execution_id = %execution_id,
                    error = %err,
                    "execution failed"
                );
                ExecutionStatus::Errored
            }
        };

        if let Err(err) = shared.store.update_status(&execution_id, status).await {
            tracing::error!(
                workflow_id = %shared.workflow_id,
                execution_id = %execution_id,
                error = %err,
                "failed to record execution status"
            );
            return;
        }

        shared.metrics.increment_counter(
            metrics::EXECUTIONS_FINISHED,
            labels(&[("workflow_id", shared.workflow_id.as_str()), ("status", status.as_str())]),
        );
        shared.metrics.observe_histogram(
            metrics::EXECUTION_DURATION,
            started.elapsed().as_secs_f64(),
            workflow_labels,
        );

        tracing::info!(
            workflow_id = %shared.workflow_id,
            execution_id = %execution_id,
            status = %status,
            "execution finished"
        );
        let _ = shared.finished.send(ExecutionFinished { execution_id, status });
    }

    async fn walk(&self, mut execution: WorkflowExecution) -> Result<ExecutionStatus, EngineError> {
        let shared = &self.shared;
        let order = shared
            .graph
            .execution_order(TRIGGER_REF)
            .map_err(|e| shared.graph_error(e))?;

        let mut skipped: HashSet<String> = HashSet::new();
        let mut early_exit = false;

        for vertex in order {
            let reference = vertex.reference();
            if vertex.is_trigger() || skipped.contains(reference) {
                continue;
            }

            // already done before a restart
            match execution.step(reference).map(|s| s.status) {
                Some(ExecutionStatus::Completed) => continue,
                Some(ExecutionStatus::CompletedEarlyExit) => {
                    early_exit = true;
                    self.skip_descendants(reference, &mut skipped)?;
                    continue;
                }
                // failed before a restart; never invoked again
                Some(ExecutionStatus::Errored) => return Ok(ExecutionStatus::Errored),
                Some(ExecutionStatus::Timeout) => return Ok(ExecutionStatus::Timeout),
                _ => {}
            }

            if shared.cancel.is_cancelled() {
                return Err(EngineError::Closed);
            }

            let (outcome, snapshot) = self.run_step(&execution, vertex).await?;
            execution = snapshot;
            match outcome {
                StepOutcome::Completed => {}
                StepOutcome::EarlyExit => {
                    early_exit = true;
                    self.skip_descendants(reference, &mut skipped)?;
                }
                StepOutcome::Failed => return Ok(ExecutionStatus::Errored),
                StepOutcome::TimedOut => return Ok(ExecutionStatus::Timeout),
            }
        }

        Ok(if early_exit {
            ExecutionStatus::CompletedEarlyExit
        } else {
            ExecutionStatus::Completed
        })
    }

    fn skip_descendants(&self, reference: &str, skipped: &mut HashSet<String>) -> Result<(), EngineError> {
        let descendants = self
            .shared
            .graph
            .descendants(reference)
            .map_err(|e| self.shared.graph_error(e))?;
        skipped.extend(descendants.into_iter().map(|v| v.reference().to_string()));
        Ok(())
    }

    fn timed_out(&self, execution: &WorkflowExecution) -> bool {
        let created = execution.created_at.unwrap_or_else(Utc::now);
        let age = (Utc::now() - created).to_std().unwrap_or_default();
        age >= self.shared.config.max_execution_duration()
    }

    /// Execute one step and record its outcome. Returns the refreshed execution.
    async fn run_step(
        &self,
        execution: &WorkflowExecution,
        vertex: &Vertex,
    ) -> Result<(StepOutcome, WorkflowExecution), EngineError> {
        let shared = &self.shared;
        let execution_id = &execution.execution_id;
        let reference = vertex.reference();
        let mut step = WorkflowExecutionStep::new(execution_id, reference, ExecutionStatus::Started);

        if self.timed_out(execution) {
            tracing::warn!(
                workflow_id = %shared.workflow_id,
                execution_id = %execution_id,
                step_ref = %reference,
                "execution exceeded its maximum duration"
            );
            step.status = ExecutionStatus::Timeout;
            let snapshot = shared.store.upsert_step(step).await?;
            return Ok((StepOutcome::TimedOut, snapshot));
        }

        let inputs = match interpolate(&vertex.step.inputs, execution) {
            Ok(inputs) => inputs,
            Err(source) => {
                let err = EngineError::Interpolation {
                    step_ref: reference.to_string(),
                    source,
                };
                return self.record_failure(step, err).await;
            }
        };
        step.inputs = Some(inputs.clone());
        shared.store.upsert_step(step.clone()).await?;

        match self.invoke(execution, vertex, inputs).await {
            Ok(value) => {
                step.status = ExecutionStatus::Completed;
                step.outputs.value = value;
                let snapshot = shared.store.upsert_step(step).await?;
                tracing::debug!(
                    workflow_id = %shared.workflow_id,
                    execution_id = %execution_id,
                    step_ref = %reference,
                    "step completed"
                );
                Ok((StepOutcome::Completed, snapshot))
            }
            Err(EngineError::Capability {
                source: CapabilityError::StopExecution,
                ..
            }) => {
                tracing::info!(
                    workflow_id = %shared.workflow_id,
                    execution_id = %execution_id,
                    step_ref = %reference,
                    "step requested early exit, skipping its dependents"
                );
                step.status = ExecutionStatus::CompletedEarlyExit;
                let snapshot = shared.store.upsert_step(step).await?;
                Ok((StepOutcome::EarlyExit, snapshot))
            }
            Err(EngineError::Closed) => Err(EngineError::Closed),
            Err(err) => self.record_failure(step, err).await,
        }
    }

    async fn record_failure(
        &self,
        mut step: WorkflowExecutionStep,
        err: EngineError,
    ) -> Result<(StepOutcome, WorkflowExecution), EngineError> {
        let shared = &self.shared;
        tracing::error!(
            workflow_id = %shared.workflow_id,
            execution_id = %step.execution_id,
            step_ref = %step.reference,
            error = %err,
            "step failed"
        );
        shared.metrics.increment_counter(
            metrics::STEP_ERRORS,
            labels(&[("workflow_id", shared.workflow_id.as_str()), ("step_ref", step.reference.as_str())]),
        );

        step.status = ExecutionStatus::Errored;
        step.outputs.err = Some(err.to_string());
        let snapshot = shared.store.upsert_step(step).await?;
        Ok((StepOutcome::Failed, snapshot))
    }

    /// Call the step's capability through its strategy
    async fn invoke(
        &self,
        execution: &WorkflowExecution,
        vertex: &Vertex,
        inputs: ValueMap,
    ) -> Result<Option<Value>, EngineError> {
        let shared = &self.shared;
        let reference = vertex.reference();
        let runtime = self.steps.get(reference).ok_or_else(|| EngineError::Capability {
            step_ref: reference.to_string(),
            capability_id: vertex.step.id.clone(),
            source: CapabilityError::NotFound(vertex.step.id.clone()),
        })?;

        let mut config = vertex.step.config.clone();
        if let Some(defaults) = shared.registry.config_for_capability(&runtime.capability_id).await {
            config.extend(defaults);
        }

        let request = CapabilityRequest {
            metadata: shared.metadata(&self.node, &execution.execution_id, reference),
            inputs,
            config,
        };

        shared.metrics.increment_counter(
            metrics::CAPABILITY_INVOCATIONS,
            labels(&[
                ("workflow_id", shared.workflow_id.as_str()),
                ("capability_id", runtime.capability_id.as_str()),
            ]),
        );
        tracing::debug!(
            workflow_id = %shared.workflow_id,
            execution_id = %execution.execution_id,
            step_ref = %reference,
            capability_id = %runtime.capability_id,
            "invoking capability"
        );

        runtime
            .strategy
            .apply(&shared.cancel, runtime.capability.as_ref(), request)
            .await
            .map_err(|err| match err {
                StrategyError::Cancelled => EngineError::Closed,
                StrategyError::Capability(source) => EngineError::Capability {
                    step_ref: reference.to_string(),
                    capability_id: runtime.capability_id.clone(),
                    source,
                },
                source => EngineError::Step {
                    step_ref: reference.to_string(),
                    capability_id: runtime.capability_id.clone(),
                    source,
                },
            })
    }
}
