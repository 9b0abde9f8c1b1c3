//! Execution store trait definition.
//!
//! Defines the storage interface for workflow instances, step instances,
//! and execution audit records. The infrastructure layer (stepflow-infra)
//! implements this trait with SQLite persistence.

use stepflow_types::error::StoreError;
use stepflow_types::execution::{WorkflowExecution, WorkflowInstance, WorkflowStepInstance};
use uuid::Uuid;

/// Store trait for execution persistence.
///
/// Covers three entity families:
/// - **Instances:** the live runtime state of one workflow run.
/// - **Step instances:** per-step runtime state, one row per step definition.
/// - **Executions:** the immutable-once-finalized audit record.
///
/// Every state transition performed by the runner is persisted through this
/// trait before the next transition is considered, so a restarted process
/// can pick up from the stored state.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ExecutionStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Workflow instances
    // -----------------------------------------------------------------------

    /// Insert a new workflow instance.
    fn create_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Get a workflow instance by its UUID.
    fn get_instance(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, StoreError>> + Send;

    /// Persist the current state of a workflow instance.
    fn update_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// List instances whose status is non-terminal (RUNNING or PAUSED).
    ///
    /// Used by the timeout watchdog; also how overdue instances are found
    /// again after a process restart.
    fn list_active_instances(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, StoreError>> + Send;

    // -----------------------------------------------------------------------
    // Step instances
    // -----------------------------------------------------------------------

    /// Insert the full set of step instances for a new workflow instance.
    fn create_step_instances(
        &self,
        steps: &[WorkflowStepInstance],
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Get a step instance by its UUID.
    fn get_step_instance(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowStepInstance>, StoreError>> + Send;

    /// Get the step instance for a given step definition id within an instance.
    ///
    /// Exactly one step instance exists per (instance, step id) pair.
    fn get_step_instance_by_step(
        &self,
        workflow_instance_id: &Uuid,
        step_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowStepInstance>, StoreError>> + Send;

    /// List all step instances for a workflow instance, ordered by creation
    /// (UUIDv7 ids are time-sortable).
    fn list_step_instances(
        &self,
        workflow_instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowStepInstance>, StoreError>> + Send;

    /// Persist the current state of a step instance.
    fn update_step_instance(
        &self,
        step: &WorkflowStepInstance,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Insert a new execution record.
    fn create_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Get an execution record by its UUID.
    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowExecution>, StoreError>> + Send;

    /// Get the execution record for a workflow instance.
    fn get_execution_by_instance(
        &self,
        workflow_instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowExecution>, StoreError>> + Send;

    /// Persist the current state of an execution record.
    ///
    /// Returns [`StoreError::Conflict`] if the stored record is already
    /// finalized (has an end time); finalized executions are immutable.
    fn update_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// List executions for a workflow definition, newest first.
    fn list_executions(
        &self,
        workflow_id: &Uuid,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowExecution>, StoreError>> + Send;
}
