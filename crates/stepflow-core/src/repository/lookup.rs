//! Lookup service traits for workflow definitions and function metadata.
//!
//! The engine never stores definitions or function records itself; it asks
//! these services at dispatch time. Implementations live in stepflow-infra:
//! an HTTP client against the definition/function services, and a local
//! directory loader for development.

use serde::{Deserialize, Serialize};
use stepflow_types::workflow::WorkflowDefinition;
use thiserror::Error;
use uuid::Uuid;

/// Errors from definition and function lookups.
#[derive(Debug, Error)]
pub enum LookupError {
    /// The backing service could not be reached or answered with a
    /// server-side error.
    #[error("lookup service unavailable: {0}")]
    Unavailable(String),

    /// The service answered, but the payload did not parse.
    #[error("malformed lookup response: {0}")]
    Malformed(String),
}

impl From<LookupError> for stepflow_types::error::EngineError {
    fn from(err: LookupError) -> Self {
        stepflow_types::error::EngineError::InternalService(err.to_string())
    }
}

/// Metadata for a remotely executable function.
///
/// The dispatcher needs only enough to address the invocation: the gateway
/// resolves the rest from the function id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionRecord {
    /// Stable function identifier referenced by step definitions.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Invocation endpoint on the function execution tier.
    pub endpoint: String,
}

/// Read access to workflow definitions.
pub trait DefinitionService: Send + Sync {
    /// Fetch a workflow definition by its UUID. `Ok(None)` means the
    /// definition does not exist; `Err` means the lookup itself failed.
    fn get_workflow(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, LookupError>> + Send;
}

/// Read access to function metadata.
pub trait FunctionService: Send + Sync {
    /// Fetch a function record by its id.
    fn get_function(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<FunctionRecord>, LookupError>> + Send;
}
