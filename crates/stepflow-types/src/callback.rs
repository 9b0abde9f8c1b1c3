//! Completion callback payloads posted by external workers.
//!
//! Workers report step outcomes onto the result queue (or the callback URL
//! attached at dispatch time, which feeds the same queue). The payload uses
//! camelCase field names on the wire; `validate()` applies the intake rules
//! before a message may reach the runner.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::StepRunStatus;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Why a callback payload was rejected at intake.
#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    /// `runStatus` was absent from the payload.
    #[error("callback is missing runStatus")]
    MissingRunStatus,

    /// A success callback arrived with a null or empty `outputData`.
    #[error("success callback has empty outputData")]
    EmptyOutputData,

    /// A failure callback arrived without a `failureReason`.
    #[error("failure callback has no failureReason")]
    MissingFailureReason,

    /// The reported status is not one a worker may report.
    #[error("runStatus '{0}' is not reportable by a worker")]
    NotReportable(String),
}

// ---------------------------------------------------------------------------
// Callback Message
// ---------------------------------------------------------------------------

/// A completion (or progress) message for one step instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackMessage {
    /// Owning workflow instance.
    pub workflow_instance_id: Uuid,
    /// Step instance this message reports on.
    pub step_instance_id: Uuid,
    /// Reported status. Optional on the wire so absence is a validation
    /// fault, not a parse failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_status: Option<StepRunStatus>,
    /// Input echo from the worker, if any.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub input_data: HashMap<String, serde_json::Value>,
    /// Step output. Required non-empty on success.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub output_data: HashMap<String, serde_json::Value>,
    /// Failure description. Required on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Callback URL the dispatch carried, echoed back by some executors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_back_url: Option<String>,
}

impl CallbackMessage {
    /// Apply the intake validation rules and return the reported status.
    ///
    /// Workers may report RUNNING (progress), a success status, or a failure
    /// status. Anything else, a missing status, an empty `outputData` on
    /// success, or a missing `failureReason` on failure rejects the message.
    pub fn validate(&self) -> Result<StepRunStatus, CallbackError> {
        let status = self.run_status.ok_or(CallbackError::MissingRunStatus)?;

        if status == StepRunStatus::Running {
            return Ok(status);
        }
        if status.is_success() {
            if self.output_data.is_empty() {
                return Err(CallbackError::EmptyOutputData);
            }
            return Ok(status);
        }
        if status.is_failure() {
            if self.failure_reason.as_deref().unwrap_or("").is_empty() {
                return Err(CallbackError::MissingFailureReason);
            }
            return Ok(status);
        }

        Err(CallbackError::NotReportable(format!("{status:?}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
