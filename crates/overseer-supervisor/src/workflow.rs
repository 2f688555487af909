use crate::dispatcher::TaskDispatcher;
use crate::history::WorkflowHistory;
use crate::types::{
    SelectionRequirements, StepRecord, Task, TaskResult, WorkflowState, WorkflowStatus,
};
use chrono::Utc;
use overseer_core::{EventBus, StatusEvent, SupervisorError, SupervisorResult};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Synthetic step name used for workflow-level events and errors.
const WORKFLOW_STEP: &str = "workflow";

/// What a fan-out workflow does when a branch fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abort remaining branches on the first failure.
    AbortOnFirst,
    /// Let every branch finish, then fail if any branch failed.
    CollectAll,
}

/// One task within a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    /// Step name, unique within the workflow.
    pub name: String,
    /// Capability the step dispatches to.
    pub capability: String,
    /// Preferred specialization tag for agent selection.
    #[serde(default)]
    pub specialization: Option<String>,
    /// Per-step latency budget in milliseconds.
    #[serde(default)]
    pub max_latency_ms: Option<u64>,
}

impl StepDef {
    /// Create a step dispatching to the given capability.
    pub fn new(name: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capability: capability.into(),
            specialization: None,
            max_latency_ms: None,
        }
    }

    /// Prefer agents with this specialization tag.
    pub fn with_specialization(mut self, tag: impl Into<String>) -> Self {
        self.specialization = Some(tag.into());
        self
    }

    /// Set a latency budget in milliseconds.
    pub fn with_max_latency_ms(mut self, ms: u64) -> Self {
        self.max_latency_ms = Some(ms);
        self
    }
}

/// Routes a sequential workflow based on a field in a step's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    /// The output field to inspect (e.g. a severity or risk level).
    pub field: String,
    /// field value → next step name.
    pub routes: Vec<(String, String)>,
    /// Step to run when no route matches; `None` ends the workflow.
    #[serde(default)]
    pub default: Option<String>,
}

impl RouteRule {
    /// Pick the next step name for the given step output.
    fn next_step(&self, output: &Value) -> Option<&str> {
        let actual = output.get(&self.field).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
        if let Some(actual) = actual {
            for (value, next) in &self.routes {
                if *value == actual {
                    return Some(next);
                }
            }
        }
        self.default.as_deref()
    }
}

/// A sequential step with optional conditional routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeqStep {
    /// The step itself.
    pub step: StepDef,
    /// Routing rule evaluated on this step's output; when absent the next
    /// step in declaration order runs.
    #[serde(default)]
    pub route: Option<RouteRule>,
}

impl SeqStep {
    /// A sequential step without routing.
    pub fn new(step: StepDef) -> Self {
        Self { step, route: None }
    }

    /// Attach a routing rule.
    pub fn with_route(mut self, route: RouteRule) -> Self {
        self.route = Some(route);
        self
    }
}

/// A named, multi-step execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum WorkflowDefinition {
    /// N independent tasks dispatched concurrently, joined at a barrier.
    FanOut {
        /// The parallel branches.
        steps: Vec<StepDef>,
        /// Partial-failure policy.
        on_failure: FailurePolicy,
    },
    /// Steps execute one after another, optionally routed by step output.
    ///
    /// The first step receives the workflow input; each later step receives
    /// the previous step's output.
    Sequence {
        /// The steps, in declaration order.
        steps: Vec<SeqStep>,
    },
}

/// One live workflow instance: its state plus a cancellation flag.
struct WorkflowHandle {
    state: Mutex<WorkflowState>,
    cancel_tx: watch::Sender<bool>,
}

impl WorkflowHandle {
    fn snapshot(&self) -> WorkflowState {
        self.state.lock().clone()
    }
}

/// Executes named workflow definitions over the task dispatcher,
/// maintaining per-workflow state.
///
/// Each [`WorkflowState`] is owned by its run; callers only ever observe
/// read-only snapshots via [`WorkflowEngine::get_workflow`].
pub struct WorkflowEngine {
    dispatcher: Arc<TaskDispatcher>,
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    workflows: RwLock<HashMap<Uuid, Arc<WorkflowHandle>>>,
    running: Mutex<Vec<JoinHandle<()>>>,
    events: EventBus,
    history: Option<Arc<WorkflowHistory>>,
    default_timeout_ms: Option<u64>,
}

impl WorkflowEngine {
    /// Create an engine over the given dispatcher.
    pub fn new(
        dispatcher: Arc<TaskDispatcher>,
        events: EventBus,
        history: Option<Arc<WorkflowHistory>>,
        default_timeout_ms: Option<u64>,
    ) -> Self {
        Self {
            dispatcher,
            definitions: RwLock::new(HashMap::new()),
            workflows: RwLock::new(HashMap::new()),
            running: Mutex::new(Vec::new()),
            events,
            history,
            default_timeout_ms,
        }
    }

    /// Register a workflow definition under a kind name.
    ///
    /// Re-registering a kind replaces the previous definition; running
    /// instances keep the definition they started with.
    pub fn register_workflow(&self, kind: impl Into<String>, definition: WorkflowDefinition) {
        let kind = kind.into();
        info!(kind = %kind, "Workflow registered");
        self.definitions.write().insert(kind, Arc::new(definition));
    }

    /// Start a workflow asynchronously and return its id.
    ///
    /// Fails synchronously only for an unknown kind; downstream agent
    /// failures are recorded in the workflow state instead.
    pub fn run_workflow(self: &Arc<Self>, kind: &str, input: Value) -> SupervisorResult<Uuid> {
        self.run_workflow_with_timeout(kind, input, self.default_timeout_ms)
    }

    /// Like [`run_workflow`](Self::run_workflow), overriding the configured
    /// per-workflow timeout for this run.
    pub fn run_workflow_with_timeout(
        self: &Arc<Self>,
        kind: &str,
        input: Value,
        timeout_ms: Option<u64>,
    ) -> SupervisorResult<Uuid> {
        let definition = self
            .definitions
            .read()
            .get(kind)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownWorkflow(kind.to_string()))?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let state = WorkflowState::new(kind);
        let id = state.id;
        let handle = Arc::new(WorkflowHandle {
            state: Mutex::new(state),
            cancel_tx,
        });
        self.workflows.write().insert(id, handle.clone());

        info!(workflow_id = %id, kind = %kind, "Workflow starting");
        let engine = self.clone();
        let join = tokio::spawn(async move {
            engine
                .drive(handle, definition, input, cancel_rx, timeout_ms)
                .await;
        });
        // Reap handles from runs that already finished so the list stays
        // bounded between drains.
        let mut running = self.running.lock();
        running.retain(|handle| !handle.is_finished());
        running.push(join);

        Ok(id)
    }

    /// Read-only snapshot of a workflow, including while running.
    pub fn get_workflow(&self, id: Uuid) -> SupervisorResult<WorkflowState> {
        self.workflows
            .read()
            .get(&id)
            .map(|handle| handle.snapshot())
            .ok_or_else(|| SupervisorError::UnknownWorkflow(id.to_string()))
    }

    /// Cancel a workflow by id.
    ///
    /// Best-effort: already-dispatched agent calls may still complete, but
    /// their results are discarded and no further steps are appended.
    /// Cancelling a finished workflow is a no-op.
    pub fn cancel_workflow(&self, id: Uuid) -> SupervisorResult<()> {
        let handle = self
            .workflows
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownWorkflow(id.to_string()))?;

        {
            let mut state = handle.state.lock();
            if state.status.is_terminal() {
                return Ok(());
            }
            state.status = WorkflowStatus::Failed {
                reason: SupervisorError::Cancelled.to_string(),
            };
            state.record_error(WORKFLOW_STEP, SupervisorError::Cancelled.to_string());
            state.finished_at = Some(Utc::now());
        }
        let _ = handle.cancel_tx.send(true);

        warn!(workflow_id = %id, "Workflow cancelled");
        self.events.publish(StatusEvent::WorkflowStep {
            workflow_id: id,
            step: WORKFLOW_STEP.to_string(),
            status: "cancelled".to_string(),
        });
        self.record_history(&handle);
        Ok(())
    }

    /// Await every spawned workflow task (graceful shutdown drain).
    pub async fn drain(&self) {
        let joins: Vec<JoinHandle<()>> = std::mem::take(&mut *self.running.lock());
        for join in joins {
            let _ = join.await;
        }
    }

    /// Top-level driver for one workflow run: applies the per-workflow
    /// timeout and finalizes the state.
    async fn drive(
        self: Arc<Self>,
        handle: Arc<WorkflowHandle>,
        definition: Arc<WorkflowDefinition>,
        input: Value,
        cancel_rx: watch::Receiver<bool>,
        timeout_ms: Option<u64>,
    ) {
        {
            let mut state = handle.state.lock();
            if state.status.is_terminal() {
                return; // cancelled before it started
            }
            state.status = WorkflowStatus::Running;
        }

        let body = self.execute(&handle, &definition, input, cancel_rx);
        let outcome = match timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), body).await {
                Ok(outcome) => outcome,
                Err(_) => RunOutcome::Failed(format!("workflow timed out after {ms}ms")),
            },
            None => body.await,
        };

        self.finalize(&handle, outcome);
    }

    async fn execute(
        &self,
        handle: &Arc<WorkflowHandle>,
        definition: &WorkflowDefinition,
        input: Value,
        cancel_rx: watch::Receiver<bool>,
    ) -> RunOutcome {
        match definition {
            WorkflowDefinition::FanOut { steps, on_failure } => {
                self.execute_fan_out(handle, steps, *on_failure, input, cancel_rx)
                    .await
            }
            WorkflowDefinition::Sequence { steps } => {
                self.execute_sequence(handle, steps, input, cancel_rx).await
            }
        }
    }

    /// Fan-out/fan-in: spawn every branch, then hold at the join barrier
    /// until all branches have a recorded outcome (or the policy aborts).
    async fn execute_fan_out(
        &self,
        handle: &Arc<WorkflowHandle>,
        steps: &[StepDef],
        on_failure: FailurePolicy,
        input: Value,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> RunOutcome {
        let total = steps.len();
        let mut branches: JoinSet<(String, SupervisorResult<TaskResult>)> = JoinSet::new();

        for step in steps {
            let dispatcher = self.dispatcher.clone();
            let step = step.clone();
            let input = input.clone();
            branches.spawn(async move {
                let result = dispatch_step(&dispatcher, &step, input).await;
                (step.name, result)
            });
        }

        let mut failures = 0usize;
        loop {
            tokio::select! {
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        branches.abort_all();
                        return RunOutcome::Cancelled;
                    }
                }
                joined = branches.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok((step, Ok(result))) => {
                            self.append_step(handle, &step, result);
                        }
                        Ok((step, Err(e))) => {
                            failures += 1;
                            self.append_error(handle, &step, &e.to_string());
                            if on_failure == FailurePolicy::AbortOnFirst {
                                branches.abort_all();
                                return RunOutcome::Failed(format!(
                                    "step '{step}' failed: {e}"
                                ));
                            }
                        }
                        Err(join_err) => {
                            failures += 1;
                            self.append_error(handle, WORKFLOW_STEP, &join_err.to_string());
                        }
                    }
                }
            }
        }

        if failures > 0 {
            RunOutcome::Failed(format!("{failures} of {total} steps failed"))
        } else {
            RunOutcome::Completed
        }
    }

    /// Sequential steps with conditional routing. A step never starts
    /// before its predecessor's result is recorded.
    async fn execute_sequence(
        &self,
        handle: &Arc<WorkflowHandle>,
        steps: &[SeqStep],
        input: Value,
        cancel_rx: watch::Receiver<bool>,
    ) -> RunOutcome {
        if steps.is_empty() {
            return RunOutcome::Completed;
        }

        let mut index = 0usize;
        let mut step_input = input;

        loop {
            if *cancel_rx.borrow() {
                return RunOutcome::Cancelled;
            }

            let seq_step = &steps[index];
            let step_name = seq_step.step.name.clone();

            let result = dispatch_step(&self.dispatcher, &seq_step.step, step_input.clone()).await;
            if *cancel_rx.borrow() {
                // Cancelled mid-dispatch: discard the result.
                return RunOutcome::Cancelled;
            }

            let output = match result {
                Ok(result) => {
                    let output = result.output.clone();
                    self.append_step(handle, &step_name, result);
                    output
                }
                Err(e) => {
                    self.append_error(handle, &step_name, &e.to_string());
                    return RunOutcome::Failed(format!("step '{step_name}' failed: {e}"));
                }
            };

            let next = match &seq_step.route {
                Some(rule) => match rule.next_step(&output) {
                    Some(next_name) => {
                        match steps.iter().position(|s| s.step.name == next_name) {
                            Some(pos) => Some(pos),
                            None => {
                                let message =
                                    format!("route target '{next_name}' is not a step");
                                self.append_error(handle, &step_name, &message);
                                return RunOutcome::Failed(message);
                            }
                        }
                    }
                    None => None,
                },
                None => {
                    if index + 1 < steps.len() {
                        Some(index + 1)
                    } else {
                        None
                    }
                }
            };

            match next {
                Some(pos) => {
                    index = pos;
                    step_input = output;
                }
                None => return RunOutcome::Completed,
            }
        }
    }

    /// Record a step result unless the workflow already reached a terminal
    /// state (e.g. was cancelled while the dispatch was in flight).
    fn append_step(&self, handle: &Arc<WorkflowHandle>, step: &str, result: TaskResult) {
        let workflow_id = {
            let mut state = handle.state.lock();
            if state.status.is_terminal() {
                return;
            }
            state.steps.push(StepRecord {
                step: step.to_string(),
                result,
            });
            state.id
        };
        self.events.publish(StatusEvent::WorkflowStep {
            workflow_id,
            step: step.to_string(),
            status: "completed".to_string(),
        });
    }

    fn append_error(&self, handle: &Arc<WorkflowHandle>, step: &str, message: &str) {
        let workflow_id = {
            let mut state = handle.state.lock();
            if state.status.is_terminal() {
                return;
            }
            state.record_error(step, message);
            state.id
        };
        self.events.publish(StatusEvent::WorkflowStep {
            workflow_id,
            step: step.to_string(),
            status: "failed".to_string(),
        });
    }

    fn finalize(&self, handle: &Arc<WorkflowHandle>, outcome: RunOutcome) {
        let (id, status) = {
            let mut state = handle.state.lock();
            if state.status.is_terminal() {
                // Cancellation already finalized the state.
                return;
            }
            state.status = match outcome {
                RunOutcome::Completed => WorkflowStatus::Completed,
                RunOutcome::Failed(reason) => {
                    state.record_error(WORKFLOW_STEP, reason.clone());
                    WorkflowStatus::Failed { reason }
                }
                RunOutcome::Cancelled => WorkflowStatus::Failed {
                    reason: SupervisorError::Cancelled.to_string(),
                },
            };
            state.finished_at = Some(Utc::now());
            (state.id, state.status.clone())
        };

        match &status {
            WorkflowStatus::Completed => info!(workflow_id = %id, "Workflow completed"),
            WorkflowStatus::Failed { reason } => {
                error!(workflow_id = %id, reason = %reason, "Workflow failed");
            }
            _ => {}
        }
        self.events.publish(StatusEvent::WorkflowStep {
            workflow_id: id,
            step: WORKFLOW_STEP.to_string(),
            status: match status {
                WorkflowStatus::Completed => "completed".to_string(),
                _ => "failed".to_string(),
            },
        });
        self.record_history(handle);
    }

    fn record_history(&self, handle: &Arc<WorkflowHandle>) {
        if let Some(history) = &self.history {
            history.append(handle.snapshot());
        }
    }
}

/// Select an agent for the step's capability and dispatch the task.
async fn dispatch_step(
    dispatcher: &TaskDispatcher,
    step: &StepDef,
    input: Value,
) -> SupervisorResult<TaskResult> {
    let requirements = SelectionRequirements {
        specialization: step.specialization.clone(),
    };
    let agent = dispatcher.selector().select(&step.capability, &requirements)?;

    let mut task = Task::new(&step.capability, input);
    if let Some(tag) = &step.specialization {
        task = task.with_specialization(tag.clone());
    }
    if let Some(ms) = step.max_latency_ms {
        task = task.with_max_latency_ms(ms);
    }
    dispatcher.dispatch(&agent, &task).await
}

enum RunOutcome {
    Completed,
    Failed(String),
    Cancelled,
}
