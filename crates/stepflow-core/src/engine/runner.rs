//! Workflow runner: the state machine behind every instance.
//!
//! The runner owns all transitions of `WorkflowInstance`,
//! `WorkflowStepInstance`, and `WorkflowExecution`. Lifecycle commands
//! (start, pause, resume, stop, restart) and worker callbacks both funnel
//! into it, serialized per instance through an in-process lock so that
//! concurrent callbacks for one instance apply one at a time. Every
//! transition is persisted through the [`ExecutionStore`] before the next
//! one is considered.
//!
//! Sub-workflows run as ordinary child instances. A finalizing child never
//! reaches into its parent while holding its own lock: finalization hands
//! back a [`ParentWake`] that the calling context applies after the child's
//! lock is released (or inline when the parent's lock is already held,
//! which is the case for a child that completes during its own launch).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use stepflow_types::callback::CallbackMessage;
use stepflow_types::config::EngineConfig;
use stepflow_types::error::EngineError;
use stepflow_types::execution::{
    InstanceStatus, StepRunStatus, WorkflowExecution, WorkflowInstance, WorkflowStepInstance,
};
use stepflow_types::workflow::{DecisionCase, StepDefinition, StepType, WorkflowDefinition};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::dispatcher::{DispatchSink, InvocationRequest};
use crate::engine::expression::ExpressionScope;
use crate::repository::execution::ExecutionStore;
use crate::repository::lookup::DefinitionService;

/// Key under which a SWITCH step's selected case label is recorded in the
/// step's input data. Retries read it back to re-dispatch the same case.
const SELECTED_CASE_KEY: &str = "selectedCase";

// ---------------------------------------------------------------------------
// Parent wake-up
// ---------------------------------------------------------------------------

/// Outcome a finalized child instance reports to its parent step.
#[derive(Debug)]
enum ChildOutcome {
    Succeeded {
        output: HashMap<String, serde_json::Value>,
        with_errors: bool,
    },
    Failed {
        reason: String,
    },
}

/// A pending notification for the parent of a finalized sub-workflow.
///
/// Carried up the call stack instead of being applied in place, so the
/// child's lock is never held while the parent's is taken.
#[derive(Debug)]
struct ParentWake {
    instance_id: Uuid,
    step_instance_id: Uuid,
    outcome: ChildOutcome,
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Drives workflow instances through their steps.
///
/// Generic over the execution store, the definition lookup, and the
/// dispatch sink; the API layer wires concrete implementations, tests
/// substitute in-memory fakes.
pub struct WorkflowRunner<S, D, P>
where
    S: ExecutionStore,
    D: DefinitionService,
    P: DispatchSink,
{
    store: Arc<S>,
    definitions: Arc<D>,
    dispatch: Arc<P>,
    config: EngineConfig,
    /// One lock per live instance. Entries are removed at finalization; a
    /// waiter holding a removed lock re-checks terminal state after
    /// acquiring, so the race with a fresh entry is benign.
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl<S, D, P> WorkflowRunner<S, D, P>
where
    S: ExecutionStore,
    D: DefinitionService,
    P: DispatchSink,
{
    pub fn new(store: Arc<S>, definitions: Arc<D>, dispatch: Arc<P>, config: EngineConfig) -> Self {
        Self {
            store,
            definitions,
            dispatch,
            config,
            locks: DashMap::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle operations
    // -----------------------------------------------------------------------

    /// Start a new instance of `workflow_id` with the given input.
    ///
    /// Validates the input against the definition's `inputKeys`, creates
    /// the instance with one step instance per defined step, and advances
    /// from START. Returns the new execution record.
    pub async fn start(
        &self,
        workflow_id: &Uuid,
        input: HashMap<String, serde_json::Value>,
    ) -> Result<WorkflowExecution, EngineError> {
        let definition = self.require_definition(workflow_id).await?;

        let missing: Vec<&str> = definition
            .input_keys
            .iter()
            .filter(|key| !input.contains_key(key.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(EngineError::PayloadNotValid(format!(
                "missing input keys: {}",
                missing.join(", ")
            )));
        }

        let (instance_id, execution) = self.create_instance_tree(&definition, input, None).await?;
        let wake = self.launch(&definition, instance_id).await?;
        self.drain_wakes(wake).await?;
        self.require_execution(&execution.id).await
    }

    /// Pause a running execution. In-flight callbacks still land; the next
    /// dispatch is deferred until resume.
    pub async fn pause(&self, execution_id: &Uuid) -> Result<WorkflowExecution, EngineError> {
        let mut execution = self.require_execution(execution_id).await?;
        let lock = self.lock_for(execution.workflow_instance_id);
        let _guard = lock.lock().await;

        let mut instance = self.require_instance(&execution.workflow_instance_id).await?;
        if instance.status.is_terminal() {
            return Err(EngineError::PayloadNotValid(format!(
                "execution {execution_id} is already {}",
                instance.status
            )));
        }
        if instance.status == InstanceStatus::Paused {
            return Ok(execution);
        }

        instance.status = InstanceStatus::Paused;
        self.touch_instance(&mut instance).await?;
        execution.status = InstanceStatus::Paused;
        self.store.update_execution(&execution).await?;
        info!(%execution_id, instance_id = %instance.id, "execution paused");
        Ok(execution)
    }

    /// Resume a paused execution, dispatching the deferred step if one was
    /// resolved while paused. Resuming anything that is not PAUSED is a
    /// not-found per the lifecycle contract.
    pub async fn resume(&self, execution_id: &Uuid) -> Result<WorkflowExecution, EngineError> {
        let mut execution = self.require_execution(execution_id).await?;
        let wake = {
            let lock = self.lock_for(execution.workflow_instance_id);
            let _guard = lock.lock().await;

            let mut instance = self.require_instance(&execution.workflow_instance_id).await?;
            if instance.status != InstanceStatus::Paused {
                return Err(EngineError::ResourceNotFound(format!(
                    "no paused execution {execution_id}"
                )));
            }

            instance.status = InstanceStatus::Running;
            let deferred = instance.deferred_step_id.take();
            self.touch_instance(&mut instance).await?;
            execution.status = InstanceStatus::Running;
            self.store.update_execution(&execution).await?;
            info!(
                %execution_id,
                instance_id = %instance.id,
                deferred_step = deferred.as_deref().unwrap_or("none"),
                "execution resumed"
            );

            match deferred {
                Some(step_id) => {
                    let definition = self.require_definition(&instance.workflow_id).await?;
                    self.advance_to(&definition, instance.id, &step_id).await?
                }
                None => None,
            }
        };
        self.drain_wakes(wake).await?;
        self.require_execution(execution_id).await
    }

    /// Stop an execution for good. Non-terminal steps are marked STOPPED
    /// and late callbacks become no-ops.
    pub async fn stop(&self, execution_id: &Uuid) -> Result<WorkflowExecution, EngineError> {
        let execution = self.require_execution(execution_id).await?;
        let wake = {
            let lock = self.lock_for(execution.workflow_instance_id);
            let _guard = lock.lock().await;

            let instance = self.require_instance(&execution.workflow_instance_id).await?;
            if instance.status.is_terminal() {
                return Err(EngineError::PayloadNotValid(format!(
                    "execution {execution_id} is already {}",
                    instance.status
                )));
            }
            info!(%execution_id, instance_id = %instance.id, "stop requested");
            self.finalize(instance.id, InstanceStatus::Stopped, None).await?
        };
        self.drain_wakes(wake).await?;
        self.require_execution(execution_id).await
    }

    /// Current state of an execution.
    pub async fn execution_state(
        &self,
        execution_id: &Uuid,
    ) -> Result<WorkflowExecution, EngineError> {
        self.require_execution(execution_id).await
    }

    /// Start a fresh instance of a terminal execution's workflow with the
    /// original input. Requires the definition to be restartable.
    pub async fn restart(&self, execution_id: &Uuid) -> Result<WorkflowExecution, EngineError> {
        let execution = self.require_execution(execution_id).await?;
        let instance = self.require_instance(&execution.workflow_instance_id).await?;
        if !instance.status.is_terminal() {
            return Err(EngineError::PayloadNotValid(format!(
                "execution {execution_id} is still {}",
                instance.status
            )));
        }
        let definition = self.require_definition(&execution.workflow_id).await?;
        if !definition.restartable {
            return Err(EngineError::PayloadNotValid(format!(
                "workflow '{}' is not restartable",
                definition.name
            )));
        }
        info!(%execution_id, workflow_id = %definition.id, "restarting as a new instance");
        self.start(&definition.id, instance.input_parameters.clone())
            .await
    }

    /// Executions recorded for a workflow definition, newest first.
    pub async fn list_executions(
        &self,
        workflow_id: &Uuid,
        limit: u32,
    ) -> Result<Vec<WorkflowExecution>, EngineError> {
        Ok(self.store.list_executions(workflow_id, limit).await?)
    }

    // -----------------------------------------------------------------------
    // Callback intake
    // -----------------------------------------------------------------------

    /// Apply one worker callback.
    ///
    /// Safe to call more than once for the same message: callbacks for
    /// terminal steps and terminal instances are discarded.
    pub async fn handle_callback(&self, message: &CallbackMessage) -> Result<(), EngineError> {
        let status = message
            .validate()
            .map_err(|err| EngineError::PayloadNotValid(err.to_string()))?;
        debug!(
            instance_id = %message.workflow_instance_id,
            step_instance_id = %message.step_instance_id,
            status = %status,
            "callback received"
        );
        let wake = {
            let lock = self.lock_for(message.workflow_instance_id);
            let _guard = lock.lock().await;
            self.apply_callback(message, status).await?
        };
        self.drain_wakes(wake).await
    }

    /// Callback application under the instance lock.
    async fn apply_callback(
        &self,
        message: &CallbackMessage,
        status: StepRunStatus,
    ) -> Result<Option<ParentWake>, EngineError> {
        let instance = self
            .store
            .get_instance(&message.workflow_instance_id)
            .await?
            .ok_or_else(|| {
                EngineError::ResourceNotFound(format!(
                    "workflow instance {}",
                    message.workflow_instance_id
                ))
            })?;
        if instance.status.is_terminal() {
            debug!(
                instance_id = %instance.id,
                status = %instance.status,
                "callback for terminal instance discarded"
            );
            return Ok(None);
        }

        let mut step = self
            .store
            .get_step_instance(&message.step_instance_id)
            .await?
            .ok_or_else(|| {
                EngineError::ResourceNotFound(format!(
                    "step instance {}",
                    message.step_instance_id
                ))
            })?;
        if step.workflow_instance_id != instance.id {
            return Err(EngineError::PayloadNotValid(format!(
                "step instance {} does not belong to workflow instance {}",
                step.id, instance.id
            )));
        }
        if step.run_status.is_terminal() {
            debug!(
                step_instance_id = %step.id,
                status = %step.run_status,
                "callback for terminal step discarded"
            );
            return Ok(None);
        }

        let definition = self.require_definition(&instance.workflow_id).await?;
        let Some(step_def) = definition.step(&step.step_id) else {
            return self
                .fail_instance_config(
                    instance.id,
                    format!(
                        "step `{}` missing from workflow definition {}",
                        step.step_id, definition.id
                    ),
                )
                .await;
        };

        match status {
            StepRunStatus::Running => {
                step.run_status = StepRunStatus::Running;
                step.started_at.get_or_insert_with(Utc::now);
                self.touch_step(&mut step).await?;
                debug!(step_instance_id = %step.id, step_id = %step.step_id, "step running");
                Ok(None)
            }
            reported if reported.is_success() => {
                self.complete_step(&definition, step, step_def, message, reported)
                    .await
            }
            reported => {
                let reason = message
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "step failed".to_string());
                if !message.output_data.is_empty() {
                    step.output_data = message.output_data.clone();
                }
                if reported == StepRunStatus::FailedWithTerminalError {
                    self.fail_step_terminal(step, reason, reported).await
                } else {
                    let terminal_status = match reported {
                        StepRunStatus::TimedOut | StepRunStatus::Canceled => reported,
                        _ => StepRunStatus::FailedWithTerminalError,
                    };
                    self.fail_step(&definition, step, reason, terminal_status).await
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Timeout sweep
    // -----------------------------------------------------------------------

    /// Scan active instances and finalize those past their deadline.
    /// Returns how many instances this sweep timed out.
    pub async fn sweep_overdue(&self) -> Result<u32, EngineError> {
        let now = Utc::now();
        let mut expired = 0;
        for instance in self.store.list_active_instances().await? {
            let deadline =
                instance.started_at + chrono::Duration::seconds(instance.timeout_seconds as i64);
            if now >= deadline && self.expire(&instance.id).await? {
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Finalize one overdue instance as TIMED_OUT. Re-checks the deadline
    /// under the lock; returns whether this call performed the transition.
    pub async fn expire(&self, instance_id: &Uuid) -> Result<bool, EngineError> {
        let wake = {
            let lock = self.lock_for(*instance_id);
            let _guard = lock.lock().await;

            let instance = self.require_instance(instance_id).await?;
            if instance.status.is_terminal() {
                return Ok(false);
            }
            let deadline =
                instance.started_at + chrono::Duration::seconds(instance.timeout_seconds as i64);
            if Utc::now() < deadline {
                return Ok(false);
            }
            warn!(
                %instance_id,
                timeout_seconds = instance.timeout_seconds,
                "workflow instance timed out"
            );
            self.finalize(
                *instance_id,
                InstanceStatus::TimedOut,
                Some(format!(
                    "instance exceeded its timeout of {}s",
                    instance.timeout_seconds
                )),
            )
            .await?
        };
        self.drain_wakes(wake).await?;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Instance creation and launch
    // -----------------------------------------------------------------------

    /// Persist a new instance, its step instances, and its execution
    /// record. The START step completes immediately with the workflow
    /// input as its output. No step is dispatched yet.
    async fn create_instance_tree(
        &self,
        definition: &WorkflowDefinition,
        input: HashMap<String, serde_json::Value>,
        parent: Option<(Uuid, Uuid)>,
    ) -> Result<(Uuid, WorkflowExecution), EngineError> {
        let now = Utc::now();
        let instance_id = Uuid::now_v7();
        let timeout = definition
            .timeout_seconds
            .unwrap_or(self.config.default_timeout_seconds);

        let mut steps = Vec::with_capacity(definition.steps.len());
        let mut step_ids = Vec::with_capacity(definition.steps.len());
        for step_def in &definition.steps {
            let mut step = WorkflowStepInstance::new(
                instance_id,
                &step_def.id,
                step_def.step_type,
                step_def.retry_count,
            );
            if step_def.step_type == StepType::Start {
                step.run_status = StepRunStatus::Completed;
                step.output_data = input.clone();
                step.started_at = Some(now);
                step.ended_at = Some(now);
            }
            step_ids.push(step.id);
            steps.push(step);
        }

        let mut instance = WorkflowInstance {
            id: instance_id,
            workflow_id: definition.id,
            input_parameters: input,
            status: InstanceStatus::NotRun,
            timeout_seconds: timeout,
            step_instance_ids: step_ids.clone(),
            deferred_step_id: None,
            parent_instance_id: parent.map(|(instance, _)| instance),
            parent_step_instance_id: parent.map(|(_, step)| step),
            started_at: now,
            updated_at: now,
        };
        self.store.create_instance(&instance).await?;
        self.store.create_step_instances(&steps).await?;

        let execution = WorkflowExecution {
            id: Uuid::now_v7(),
            workflow_instance_id: instance_id,
            workflow_id: definition.id,
            status: InstanceStatus::Running,
            start_time: now,
            end_time: None,
            errors: Vec::new(),
            output: HashMap::new(),
            step_instance_ids: step_ids,
        };
        self.store.create_execution(&execution).await?;

        instance.status = InstanceStatus::Running;
        self.touch_instance(&mut instance).await?;
        info!(
            workflow_id = %definition.id,
            %instance_id,
            execution_id = %execution.id,
            "workflow instance created"
        );
        Ok((instance_id, execution))
    }

    /// Take the instance's lock and advance out of START.
    async fn launch(
        &self,
        definition: &WorkflowDefinition,
        instance_id: Uuid,
    ) -> Result<Option<ParentWake>, EngineError> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.lock().await;

        let start = definition.start_step().ok_or_else(|| {
            EngineError::InternalService(format!(
                "workflow definition {} has no START step",
                definition.id
            ))
        })?;
        match &start.next_step_id {
            Some(next) => self.advance_to(definition, instance_id, next).await,
            None => {
                self.finalize(instance_id, InstanceStatus::Completed, None)
                    .await
            }
        }
    }

    // -----------------------------------------------------------------------
    // Advancement
    // -----------------------------------------------------------------------

    /// Move the instance forward into `step_id`. Caller holds the lock.
    ///
    /// While the instance is PAUSED the step id is parked in
    /// `deferredStepId` instead of being dispatched.
    async fn advance_to(
        &self,
        definition: &WorkflowDefinition,
        instance_id: Uuid,
        step_id: &str,
    ) -> Result<Option<ParentWake>, EngineError> {
        let mut instance = self.require_instance(&instance_id).await?;
        if instance.status.is_terminal() {
            debug!(%instance_id, step_id, "instance terminal, not advancing");
            return Ok(None);
        }
        if instance.status == InstanceStatus::Paused {
            instance.deferred_step_id = Some(step_id.to_string());
            self.touch_instance(&mut instance).await?;
            debug!(%instance_id, step_id, "instance paused, step deferred");
            return Ok(None);
        }

        let Some(step_def) = definition.step(step_id) else {
            return self
                .fail_instance_config(
                    instance_id,
                    format!(
                        "unknown step `{step_id}` in workflow definition {}",
                        definition.id
                    ),
                )
                .await;
        };

        match step_def.step_type {
            StepType::Start => {
                self.fail_instance_config(
                    instance_id,
                    format!("step `{step_id}` cannot be a successor (START)"),
                )
                .await
            }
            StepType::Terminate => {
                let mut step = self.require_step_by_def(&instance_id, step_id).await?;
                if !step.run_status.is_terminal() {
                    let now = Utc::now();
                    step.run_status = StepRunStatus::Completed;
                    step.started_at.get_or_insert(now);
                    step.ended_at = Some(now);
                    self.touch_step(&mut step).await?;
                }
                self.finalize(instance_id, InstanceStatus::Completed, None)
                    .await
            }
            StepType::Simple | StepType::DoWhile => {
                self.schedule_function_step(definition, instance_id, step_def, None)
                    .await
            }
            StepType::Switch => {
                self.schedule_switch_step(definition, instance_id, step_def)
                    .await
            }
            StepType::SubWorkflow => {
                self.schedule_sub_workflow(definition, instance_id, step_def, None)
                    .await
            }
            StepType::Wait | StepType::Event | StepType::Human => {
                let mut step = self.require_step_by_def(&instance_id, step_id).await?;
                step.run_status = StepRunStatus::Scheduled;
                step.scheduled_at = Some(Utc::now());
                self.touch_step(&mut step).await?;
                info!(
                    %instance_id,
                    step_id,
                    step_type = %step_def.step_type,
                    "step awaiting external signal"
                );
                Ok(None)
            }
        }
    }

    /// After `step_def` completed: follow its successor, or finalize when
    /// the chain ends without a TERMINATE.
    async fn advance_from(
        &self,
        definition: &WorkflowDefinition,
        instance_id: Uuid,
        step_def: &StepDefinition,
    ) -> Result<Option<ParentWake>, EngineError> {
        match &step_def.next_step_id {
            Some(next) => self.advance_to(definition, instance_id, next).await,
            None => {
                debug!(%instance_id, step_id = %step_def.id, "no successor, finalizing");
                self.finalize(instance_id, InstanceStatus::Completed, None)
                    .await
            }
        }
    }

    /// Resolve input, mark the step SCHEDULED, and enqueue the dispatch.
    /// `case` carries the SWITCH override for function, input, and retries.
    async fn schedule_function_step(
        &self,
        definition: &WorkflowDefinition,
        instance_id: Uuid,
        step_def: &StepDefinition,
        case: Option<&DecisionCase>,
    ) -> Result<Option<ParentWake>, EngineError> {
        let mut step = self.require_step_by_def(&instance_id, &step_def.id).await?;

        let steps = self.store.list_step_instances(&instance_id).await?;
        let scope = ExpressionScope::from_steps(&steps);
        let template = match case {
            Some(case) if !case.input_data.is_empty() => &case.input_data,
            _ => &step_def.input_template,
        };
        let mut input = match scope.resolve_template(template) {
            Ok(input) => input,
            Err(err) => {
                return self
                    .fail_step(
                        definition,
                        step,
                        format!("input resolution failed: {err}"),
                        StepRunStatus::FailedWithTerminalError,
                    )
                    .await;
            }
        };

        let function_id = case
            .and_then(|case| case.function_id.clone())
            .or_else(|| step_def.function_id.clone());
        let Some(function_id) = function_id else {
            return self
                .fail_step(
                    definition,
                    step,
                    format!("step `{}` has no functionId to dispatch", step_def.id),
                    StepRunStatus::FailedWithTerminalError,
                )
                .await;
        };

        if let Some(case) = case {
            // Case retry budget applies on first scheduling only; a retry
            // must not refill it.
            if step.run_status == StepRunStatus::New && case.retry_count > 0 {
                step.retry_count = case.retry_count;
            }
            input.insert(SELECTED_CASE_KEY.to_string(), json!(case.name));
        }

        step.run_status = StepRunStatus::Scheduled;
        step.scheduled_at = Some(Utc::now());
        step.input_data = input.clone();
        self.touch_step(&mut step).await?;

        self.dispatch
            .enqueue(InvocationRequest {
                workflow_instance_id: instance_id,
                step_instance_id: step.id,
                function_id,
                input_data: input,
            })
            .await?;
        debug!(%instance_id, step_id = %step_def.id, "step scheduled for dispatch");
        Ok(None)
    }

    /// Evaluate the switch condition and dispatch the matching case on the
    /// switch step's own instance.
    async fn schedule_switch_step(
        &self,
        definition: &WorkflowDefinition,
        instance_id: Uuid,
        step_def: &StepDefinition,
    ) -> Result<Option<ParentWake>, EngineError> {
        let step = self.require_step_by_def(&instance_id, &step_def.id).await?;
        let steps = self.store.list_step_instances(&instance_id).await?;
        let scope = ExpressionScope::from_steps(&steps);

        let Some(condition) = step_def.switch_condition.as_deref() else {
            return self
                .fail_step(
                    definition,
                    step,
                    format!("SWITCH step `{}` has no switchCondition", step_def.id),
                    StepRunStatus::FailedWithTerminalError,
                )
                .await;
        };
        let label = match scope.evaluate_label(condition) {
            Ok(label) => label,
            Err(err) => {
                return self
                    .fail_step(
                        definition,
                        step,
                        format!("switch condition failed: {err}"),
                        StepRunStatus::FailedWithTerminalError,
                    )
                    .await;
            }
        };
        let Some(case) = step_def.decision_cases.iter().find(|c| c.name == label) else {
            return self
                .fail_step(
                    definition,
                    step,
                    format!(
                        "no decision case matches `{label}` on SWITCH step `{}`",
                        step_def.id
                    ),
                    StepRunStatus::FailedWithTerminalError,
                )
                .await;
        };
        info!(%instance_id, step_id = %step_def.id, case = %label, "switch case selected");

        if case.sub_workflow_id.is_some() {
            self.schedule_sub_workflow(definition, instance_id, step_def, Some(case))
                .await
        } else {
            self.schedule_function_step(definition, instance_id, step_def, Some(case))
                .await
        }
    }

    /// Start a child instance for a SUB_WORKFLOW step (or a case that
    /// targets one). The child's completion wakes this step up again.
    async fn schedule_sub_workflow(
        &self,
        definition: &WorkflowDefinition,
        instance_id: Uuid,
        step_def: &StepDefinition,
        case: Option<&DecisionCase>,
    ) -> Result<Option<ParentWake>, EngineError> {
        let mut step = self.require_step_by_def(&instance_id, &step_def.id).await?;

        let child_workflow_id = case
            .and_then(|case| case.sub_workflow_id)
            .or(step_def.sub_workflow_id);
        let Some(child_workflow_id) = child_workflow_id else {
            return self
                .fail_step(
                    definition,
                    step,
                    format!("step `{}` has no subWorkflowId", step_def.id),
                    StepRunStatus::FailedWithTerminalError,
                )
                .await;
        };
        let Some(child_definition) = self.definitions.get_workflow(&child_workflow_id).await?
        else {
            return self
                .fail_step(
                    definition,
                    step,
                    format!("sub-workflow definition {child_workflow_id} not found"),
                    StepRunStatus::FailedWithTerminalError,
                )
                .await;
        };

        let steps = self.store.list_step_instances(&instance_id).await?;
        let scope = ExpressionScope::from_steps(&steps);
        let template = match case {
            Some(case) if !case.input_data.is_empty() => &case.input_data,
            _ => &step_def.input_template,
        };
        let child_input = match scope.resolve_template(template) {
            Ok(input) => input,
            Err(err) => {
                return self
                    .fail_step(
                        definition,
                        step,
                        format!("sub-workflow input resolution failed: {err}"),
                        StepRunStatus::FailedWithTerminalError,
                    )
                    .await;
            }
        };

        let (child_instance_id, child_execution) = self
            .create_instance_tree(&child_definition, child_input.clone(), Some((instance_id, step.id)))
            .await?;

        let first_schedule = step.run_status == StepRunStatus::New;
        let now = Utc::now();
        step.run_status = StepRunStatus::Running;
        step.scheduled_at = Some(now);
        step.started_at = Some(now);
        step.input_data = child_input;
        if let Some(case) = case {
            if first_schedule && case.retry_count > 0 {
                step.retry_count = case.retry_count;
            }
            step.input_data
                .insert(SELECTED_CASE_KEY.to_string(), json!(case.name));
        }
        step.sub_execution_id = Some(child_execution.id);
        self.touch_step(&mut step).await?;
        info!(
            %instance_id,
            step_id = %step_def.id,
            child_instance_id = %child_instance_id,
            "sub-workflow started"
        );

        // A trivial child finalizes during its own launch; its wake targets
        // this instance, whose lock we already hold, so apply it in place.
        let launched = Box::pin(self.launch(&child_definition, child_instance_id)).await?;
        match launched {
            Some(wake) if wake.instance_id == instance_id => {
                Box::pin(self.apply_child_outcome(definition, instance_id, wake)).await
            }
            other => Ok(other),
        }
    }

    // -----------------------------------------------------------------------
    // Step completion and failure
    // -----------------------------------------------------------------------

    /// Apply a success callback: store output, re-arm DO_WHILE while its
    /// stop condition is false, otherwise complete and advance.
    async fn complete_step(
        &self,
        definition: &WorkflowDefinition,
        mut step: WorkflowStepInstance,
        step_def: &StepDefinition,
        message: &CallbackMessage,
        status: StepRunStatus,
    ) -> Result<Option<ParentWake>, EngineError> {
        let now = Utc::now();
        step.output_data = message.output_data.clone();
        step.started_at.get_or_insert(now);

        if step_def.step_type == StepType::DoWhile {
            // Persist the iteration's output first so the stop condition can
            // reference it through the normal scope.
            self.touch_step(&mut step).await?;
            let steps = self.store.list_step_instances(&step.workflow_instance_id).await?;
            let scope = ExpressionScope::from_steps(&steps);

            let Some(condition) = step_def.stop_condition.as_deref() else {
                return self
                    .fail_step(
                        definition,
                        step,
                        format!("DO_WHILE step `{}` has no stopCondition", step_def.id),
                        StepRunStatus::FailedWithTerminalError,
                    )
                    .await;
            };
            match scope.evaluate_bool(condition) {
                Err(err) => {
                    return self
                        .fail_step(
                            definition,
                            step,
                            format!("stop condition failed: {err}"),
                            StepRunStatus::FailedWithTerminalError,
                        )
                        .await;
                }
                Ok(false) => return self.rearm_loop(definition, step, step_def, &scope).await,
                Ok(true) => {
                    debug!(
                        step_id = %step.step_id,
                        loop_count = step.loop_count,
                        "stop condition satisfied"
                    );
                }
            }
        }

        step.run_status = status;
        step.ended_at = Some(now);
        self.touch_step(&mut step).await?;
        info!(
            instance_id = %step.workflow_instance_id,
            step_id = %step.step_id,
            status = %status,
            "step completed"
        );
        self.advance_from(definition, step.workflow_instance_id, step_def)
            .await
    }

    /// One more DO_WHILE iteration: bump the loop counter, enforce the
    /// bound, and dispatch the arm again with freshly resolved input.
    async fn rearm_loop(
        &self,
        definition: &WorkflowDefinition,
        mut step: WorkflowStepInstance,
        step_def: &StepDefinition,
        scope: &ExpressionScope,
    ) -> Result<Option<ParentWake>, EngineError> {
        step.loop_count += 1;
        if step.loop_count >= self.config.max_loop_iterations {
            return self
                .fail_step_terminal(
                    step,
                    format!(
                        "loop bound of {} iterations reached",
                        self.config.max_loop_iterations
                    ),
                    StepRunStatus::FailedWithTerminalError,
                )
                .await;
        }

        let mut instance = self.require_instance(&step.workflow_instance_id).await?;
        if instance.status == InstanceStatus::Paused {
            self.touch_step(&mut step).await?;
            instance.deferred_step_id = Some(step.step_id.clone());
            self.touch_instance(&mut instance).await?;
            debug!(step_id = %step.step_id, "loop re-arm deferred while paused");
            return Ok(None);
        }

        let input = match scope.resolve_template(&step_def.input_template) {
            Ok(input) => input,
            Err(err) => {
                return self
                    .fail_step(
                        definition,
                        step,
                        format!("input resolution failed: {err}"),
                        StepRunStatus::FailedWithTerminalError,
                    )
                    .await;
            }
        };
        let Some(function_id) = step_def.function_id.clone() else {
            return self
                .fail_step(
                    definition,
                    step,
                    format!("DO_WHILE step `{}` has no functionId", step_def.id),
                    StepRunStatus::FailedWithTerminalError,
                )
                .await;
        };

        step.run_status = StepRunStatus::Scheduled;
        step.scheduled_at = Some(Utc::now());
        step.input_data = input.clone();
        self.touch_step(&mut step).await?;
        self.dispatch
            .enqueue(InvocationRequest {
                workflow_instance_id: step.workflow_instance_id,
                step_instance_id: step.id,
                function_id,
                input_data: input,
            })
            .await?;
        debug!(
            instance_id = %step.workflow_instance_id,
            step_id = %step.step_id,
            loop_count = step.loop_count,
            "loop re-armed"
        );
        Ok(None)
    }

    /// Apply the retry policy to a failing step: decrement and re-dispatch
    /// while budget remains, otherwise fail terminally.
    async fn fail_step(
        &self,
        definition: &WorkflowDefinition,
        mut step: WorkflowStepInstance,
        reason: String,
        terminal_status: StepRunStatus,
    ) -> Result<Option<ParentWake>, EngineError> {
        step.error_message = Some(reason.clone());
        if step.retry_count == 0 {
            return self.fail_step_terminal(step, reason, terminal_status).await;
        }

        step.retry_count -= 1;
        self.touch_step(&mut step).await?;
        info!(
            instance_id = %step.workflow_instance_id,
            step_id = %step.step_id,
            retries_left = step.retry_count,
            reason,
            "step failed, retrying"
        );

        let mut instance = self.require_instance(&step.workflow_instance_id).await?;
        let Some(step_def) = definition.step(&step.step_id) else {
            return self
                .fail_instance_config(
                    instance.id,
                    format!("step `{}` missing from definition", step.step_id),
                )
                .await;
        };
        Box::pin(self.redispatch_step(definition, &mut instance, step_def)).await
    }

    /// Mark a step with its terminal failure status and fail the instance.
    async fn fail_step_terminal(
        &self,
        mut step: WorkflowStepInstance,
        reason: String,
        terminal_status: StepRunStatus,
    ) -> Result<Option<ParentWake>, EngineError> {
        // Only terminal failure markers may land here.
        let status = match terminal_status {
            StepRunStatus::TimedOut | StepRunStatus::Canceled => terminal_status,
            _ => StepRunStatus::FailedWithTerminalError,
        };
        step.run_status = status;
        step.error_message = Some(reason.clone());
        step.ended_at = Some(Utc::now());
        self.touch_step(&mut step).await?;
        warn!(
            instance_id = %step.workflow_instance_id,
            step_id = %step.step_id,
            status = %status,
            reason,
            "step failed terminally"
        );
        self.finalize(step.workflow_instance_id, InstanceStatus::Failed, None)
            .await
    }

    /// Dispatch a step again after a retry decrement. SWITCH steps re-use
    /// the recorded case; SUB_WORKFLOW steps start a fresh child.
    async fn redispatch_step(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        step_def: &StepDefinition,
    ) -> Result<Option<ParentWake>, EngineError> {
        if instance.status == InstanceStatus::Paused {
            instance.deferred_step_id = Some(step_def.id.clone());
            self.touch_instance(instance).await?;
            debug!(
                instance_id = %instance.id,
                step_id = %step_def.id,
                "retry deferred while paused"
            );
            return Ok(None);
        }

        match step_def.step_type {
            StepType::Switch => {
                let step = self.require_step_by_def(&instance.id, &step_def.id).await?;
                let label = step
                    .input_data
                    .get(SELECTED_CASE_KEY)
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string);
                let Some(label) = label else {
                    return self
                        .fail_step_terminal(
                            step,
                            format!("no recorded case to retry on SWITCH step `{}`", step_def.id),
                            StepRunStatus::FailedWithTerminalError,
                        )
                        .await;
                };
                let Some(case) = step_def.decision_cases.iter().find(|c| c.name == label) else {
                    return self
                        .fail_step_terminal(
                            step,
                            format!("recorded case `{label}` missing on SWITCH step `{}`", step_def.id),
                            StepRunStatus::FailedWithTerminalError,
                        )
                        .await;
                };
                if case.sub_workflow_id.is_some() {
                    self.schedule_sub_workflow(definition, instance.id, step_def, Some(case))
                        .await
                } else {
                    self.schedule_function_step(definition, instance.id, step_def, Some(case))
                        .await
                }
            }
            StepType::SubWorkflow => {
                self.schedule_sub_workflow(definition, instance.id, step_def, None)
                    .await
            }
            _ => {
                self.schedule_function_step(definition, instance.id, step_def, None)
                    .await
            }
        }
    }

    /// A configuration fault that cannot be pinned on a dispatchable step.
    async fn fail_instance_config(
        &self,
        instance_id: Uuid,
        reason: String,
    ) -> Result<Option<ParentWake>, EngineError> {
        warn!(%instance_id, reason, "configuration fault, failing instance");
        self.finalize(instance_id, InstanceStatus::Failed, Some(reason))
            .await
    }

    // -----------------------------------------------------------------------
    // Finalization and parent wake-up
    // -----------------------------------------------------------------------

    /// Settle the instance into a terminal status: leftover steps are
    /// marked, the execution record is closed, and the parent (if any) is
    /// handed back as a wake to apply.
    async fn finalize(
        &self,
        instance_id: Uuid,
        requested: InstanceStatus,
        extra_error: Option<String>,
    ) -> Result<Option<ParentWake>, EngineError> {
        let mut instance = self.require_instance(&instance_id).await?;
        if instance.status.is_terminal() {
            return Ok(None);
        }

        let now = Utc::now();
        let mut steps = self.store.list_step_instances(&instance_id).await?;
        for step in &mut steps {
            if step.run_status.is_terminal() {
                continue;
            }
            step.run_status = match requested {
                InstanceStatus::Stopped => StepRunStatus::Stopped,
                InstanceStatus::TimedOut if step.is_active() => StepRunStatus::TimedOut,
                InstanceStatus::Failed if step.is_active() => StepRunStatus::Canceled,
                _ => StepRunStatus::Skipped,
            };
            step.ended_at = Some(now);
            self.touch_step(step).await?;
        }

        let status = if requested == InstanceStatus::Completed
            && steps
                .iter()
                .any(|s| s.run_status == StepRunStatus::CompletedWithErrors)
        {
            InstanceStatus::CompletedWithErrors
        } else {
            requested
        };

        instance.status = status;
        instance.deferred_step_id = None;
        self.touch_instance(&mut instance).await?;

        let mut execution = self.require_execution_by_instance(&instance_id).await?;
        execution.status = status;
        execution.end_time = Some(now);
        execution.errors = steps
            .iter()
            .filter_map(|s| {
                s.error_message
                    .as_ref()
                    .map(|err| format!("{}: {err}", s.step_id))
            })
            .collect();
        if let Some(extra) = extra_error {
            execution.errors.push(extra);
        }
        execution.output = steps
            .iter()
            .filter(|s| s.run_status.is_success() && !s.output_data.is_empty())
            .max_by_key(|s| s.ended_at)
            .map(|s| s.output_data.clone())
            .unwrap_or_default();
        self.store.update_execution(&execution).await?;

        info!(
            %instance_id,
            execution_id = %execution.id,
            status = %status,
            "workflow instance finalized"
        );
        self.locks.remove(&instance_id);

        Ok(match (instance.parent_instance_id, instance.parent_step_instance_id) {
            (Some(parent_instance), Some(parent_step)) => Some(ParentWake {
                instance_id: parent_instance,
                step_instance_id: parent_step,
                outcome: match status {
                    InstanceStatus::Completed => ChildOutcome::Succeeded {
                        output: execution.output.clone(),
                        with_errors: false,
                    },
                    InstanceStatus::CompletedWithErrors => ChildOutcome::Succeeded {
                        output: execution.output.clone(),
                        with_errors: true,
                    },
                    other => ChildOutcome::Failed {
                        reason: format!("sub-workflow finished as {other}"),
                    },
                },
            }),
            _ => None,
        })
    }

    /// Apply parent wakes one at a time, each under its own lock only.
    async fn drain_wakes(&self, mut wake: Option<ParentWake>) -> Result<(), EngineError> {
        while let Some(next) = wake {
            wake = self.wake_parent(next).await?;
        }
        Ok(())
    }

    /// Take the parent's lock and apply a child outcome to its step.
    async fn wake_parent(&self, wake: ParentWake) -> Result<Option<ParentWake>, EngineError> {
        let lock = self.lock_for(wake.instance_id);
        let _guard = lock.lock().await;

        let Some(instance) = self.store.get_instance(&wake.instance_id).await? else {
            warn!(instance_id = %wake.instance_id, "parent instance missing, dropping wake");
            return Ok(None);
        };
        if instance.status.is_terminal() {
            debug!(
                instance_id = %instance.id,
                status = %instance.status,
                "parent already terminal, dropping wake"
            );
            return Ok(None);
        }
        let definition = self.require_definition(&instance.workflow_id).await?;
        self.apply_child_outcome(&definition, instance.id, wake).await
    }

    /// Complete or fail the parent's SUB_WORKFLOW step from the child's
    /// terminal status. Caller holds the parent's lock.
    async fn apply_child_outcome(
        &self,
        definition: &WorkflowDefinition,
        instance_id: Uuid,
        wake: ParentWake,
    ) -> Result<Option<ParentWake>, EngineError> {
        let Some(mut step) = self.store.get_step_instance(&wake.step_instance_id).await? else {
            warn!(
                step_instance_id = %wake.step_instance_id,
                "parent step missing, dropping wake"
            );
            return Ok(None);
        };
        if step.run_status.is_terminal() {
            debug!(step_instance_id = %step.id, "parent step already terminal, dropping wake");
            return Ok(None);
        }
        let Some(step_def) = definition.step(&step.step_id) else {
            return self
                .fail_instance_config(
                    instance_id,
                    format!("step `{}` missing from definition", step.step_id),
                )
                .await;
        };

        match wake.outcome {
            ChildOutcome::Succeeded { output, with_errors } => {
                let now = Utc::now();
                step.run_status = if with_errors {
                    StepRunStatus::CompletedWithErrors
                } else {
                    StepRunStatus::Completed
                };
                step.output_data = output;
                step.started_at.get_or_insert(now);
                step.ended_at = Some(now);
                self.touch_step(&mut step).await?;
                info!(
                    %instance_id,
                    step_id = %step.step_id,
                    "sub-workflow step completed"
                );
                self.advance_from(definition, instance_id, step_def).await
            }
            ChildOutcome::Failed { reason } => {
                self.fail_step(definition, step, reason, StepRunStatus::FailedWithTerminalError)
                    .await
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn lock_for(&self, instance_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(instance_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn touch_instance(&self, instance: &mut WorkflowInstance) -> Result<(), EngineError> {
        instance.updated_at = Utc::now();
        self.store.update_instance(instance).await?;
        Ok(())
    }

    async fn touch_step(&self, step: &mut WorkflowStepInstance) -> Result<(), EngineError> {
        step.updated_at = Utc::now();
        self.store.update_step_instance(step).await?;
        Ok(())
    }

    async fn require_definition(&self, id: &Uuid) -> Result<WorkflowDefinition, EngineError> {
        self.definitions
            .get_workflow(id)
            .await?
            .ok_or_else(|| EngineError::ResourceNotFound(format!("workflow definition {id}")))
    }

    async fn require_instance(&self, id: &Uuid) -> Result<WorkflowInstance, EngineError> {
        self.store
            .get_instance(id)
            .await?
            .ok_or_else(|| EngineError::ResourceNotFound(format!("workflow instance {id}")))
    }

    async fn require_execution(&self, id: &Uuid) -> Result<WorkflowExecution, EngineError> {
        self.store
            .get_execution(id)
            .await?
            .ok_or_else(|| EngineError::ResourceNotFound(format!("execution {id}")))
    }

    async fn require_execution_by_instance(
        &self,
        instance_id: &Uuid,
    ) -> Result<WorkflowExecution, EngineError> {
        self.store
            .get_execution_by_instance(instance_id)
            .await?
            .ok_or_else(|| {
                EngineError::InternalService(format!(
                    "no execution record for workflow instance {instance_id}"
                ))
            })
    }

    async fn require_step_by_def(
        &self,
        instance_id: &Uuid,
        step_id: &str,
    ) -> Result<WorkflowStepInstance, EngineError> {
        self.store
            .get_step_instance_by_step(instance_id, step_id)
            .await?
            .ok_or_else(|| {
                EngineError::InternalService(format!(
                    "no step instance for step `{step_id}` of workflow instance {instance_id}"
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
