//! Execution-side records for Stepflow.
//!
//! One `WorkflowInstance` is created per execution attempt of a definition,
//! together with one `WorkflowStepInstance` per defined step and a single
//! `WorkflowExecution` audit record. All three are mutated only by the runner
//! and retained after the instance reaches a terminal status.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::StepType;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Overall status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    NotRun,
    Running,
    Paused,
    Completed,
    CompletedWithErrors,
    Failed,
    TimedOut,
    Stopped,
}

impl InstanceStatus {
    /// Terminal statuses admit no further transition.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed
                | InstanceStatus::CompletedWithErrors
                | InstanceStatus::Failed
                | InstanceStatus::TimedOut
                | InstanceStatus::Stopped
        )
    }

    /// The wire name of this status.
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::NotRun => "NOT_RUN",
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::Paused => "PAUSED",
            InstanceStatus::Completed => "COMPLETED",
            InstanceStatus::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            InstanceStatus::Failed => "FAILED",
            InstanceStatus::TimedOut => "TIMED_OUT",
            InstanceStatus::Stopped => "STOPPED",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single step instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepRunStatus {
    New,
    Scheduled,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
    FailedWithTerminalError,
    TimedOut,
    Canceled,
    Paused,
    Stopped,
    Skipped,
}

impl StepRunStatus {
    /// Terminal step statuses. A callback for a terminal step is a no-op;
    /// DO_WHILE re-arming is the single exception, handled by the runner.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepRunStatus::Completed
                | StepRunStatus::CompletedWithErrors
                | StepRunStatus::FailedWithTerminalError
                | StepRunStatus::TimedOut
                | StepRunStatus::Canceled
                | StepRunStatus::Stopped
                | StepRunStatus::Skipped
        )
    }

    /// Statuses reporting successful completion of the step's work.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            StepRunStatus::Completed | StepRunStatus::CompletedWithErrors
        )
    }

    /// Statuses reporting failed completion of the step's work.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            StepRunStatus::Failed
                | StepRunStatus::FailedWithTerminalError
                | StepRunStatus::TimedOut
                | StepRunStatus::Canceled
        )
    }

    /// The wire name of this status.
    pub fn as_str(self) -> &'static str {
        match self {
            StepRunStatus::New => "NEW",
            StepRunStatus::Scheduled => "SCHEDULED",
            StepRunStatus::Running => "RUNNING",
            StepRunStatus::Completed => "COMPLETED",
            StepRunStatus::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            StepRunStatus::Failed => "FAILED",
            StepRunStatus::FailedWithTerminalError => "FAILED_WITH_TERMINAL_ERROR",
            StepRunStatus::TimedOut => "TIMED_OUT",
            StepRunStatus::Canceled => "CANCELED",
            StepRunStatus::Paused => "PAUSED",
            StepRunStatus::Stopped => "STOPPED",
            StepRunStatus::Skipped => "SKIPPED",
        }
    }
}

impl std::fmt::Display for StepRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Workflow Instance
// ---------------------------------------------------------------------------

/// One execution attempt of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// UUIDv7 instance ID.
    pub id: Uuid,
    /// Definition being executed.
    pub workflow_id: Uuid,
    /// Snapshot of the start input.
    pub input_parameters: HashMap<String, serde_json::Value>,
    /// Current status. Only the runner mutates it.
    pub status: InstanceStatus,
    /// Effective timeout for this instance in seconds.
    pub timeout_seconds: u64,
    /// Step instances created for this run, in definition order.
    pub step_instance_ids: Vec<Uuid>,
    /// Next step resolved while PAUSED, dispatched on resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deferred_step_id: Option<String>,
    /// Parent instance when this run is a SUB_WORKFLOW child.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_instance_id: Option<Uuid>,
    /// Parent step instance awaiting this child's terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_step_instance_id: Option<Uuid>,
    /// When the instance was created.
    pub started_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// Workflow Step Instance
// ---------------------------------------------------------------------------

/// Per-run execution record of one definition step.
///
/// Created in bulk at instance start with status NEW. Immutable after
/// reaching a terminal status, except DO_WHILE steps which are re-armed
/// (reset to SCHEDULED, `loop_count` incremented) while their stop condition
/// is false.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStepInstance {
    /// UUIDv7 step instance ID.
    pub id: Uuid,
    /// Owning workflow instance.
    pub workflow_instance_id: Uuid,
    /// Definition step id this record tracks.
    pub step_id: String,
    /// Copy of the definition step's control structure.
    pub control_structure: StepType,
    /// Current run status.
    pub run_status: StepRunStatus,
    /// Remaining retry attempts. Decremented on failure, never negative.
    pub retry_count: u32,
    /// Completed DO_WHILE iterations.
    pub loop_count: u32,
    /// Resolved input sent with the dispatch.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub input_data: HashMap<String, serde_json::Value>,
    /// Output reported by the worker's completion callback.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub output_data: HashMap<String, serde_json::Value>,
    /// Failure reason from the most recent failed callback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Child execution for SUB_WORKFLOW steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_execution_id: Option<Uuid>,
    /// When the step was last marked SCHEDULED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// When the worker reported RUNNING.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl WorkflowStepInstance {
    /// Fresh NEW record for one definition step.
    pub fn new(workflow_instance_id: Uuid, step_id: &str, step_type: StepType, retry_count: u32) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_instance_id,
            step_id: step_id.to_string(),
            control_structure: step_type,
            run_status: StepRunStatus::New,
            retry_count,
            loop_count: 0,
            input_data: HashMap::new(),
            output_data: HashMap::new(),
            error_message: None,
            sub_execution_id: None,
            scheduled_at: None,
            started_at: None,
            ended_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Active means dispatched or awaiting dispatch.
    pub fn is_active(&self) -> bool {
        matches!(
            self.run_status,
            StepRunStatus::Scheduled | StepRunStatus::Running
        )
    }
}

// ---------------------------------------------------------------------------
// Workflow Execution (audit record)
// ---------------------------------------------------------------------------

/// Append-only summary of one instance's run.
///
/// Created when the instance starts and finalized when it reaches a terminal
/// status. The store rejects writes once `end_time` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// UUIDv7 execution ID. This is the id lifecycle calls address.
    pub id: Uuid,
    /// Instance this record summarizes.
    pub workflow_instance_id: Uuid,
    /// Definition that was executed.
    pub workflow_id: Uuid,
    /// Mirror of the instance status.
    pub status: InstanceStatus,
    /// When the run started.
    pub start_time: DateTime<Utc>,
    /// When the run reached a terminal status. Set exactly once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Aggregated step error messages.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Output of the last completed step at finalization.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub output: HashMap<String, serde_json::Value>,
    /// Step instances in definition order.
    pub step_instance_ids: Vec<Uuid>,
}

impl WorkflowExecution {
    pub fn is_finalized(&self) -> bool {
        self.end_time.is_some()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
