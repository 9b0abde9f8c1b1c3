use thiserror::Error;

/// Engine-boundary error taxonomy.
///
/// Every fault leaving the runner maps onto one of three categories, which
/// the HTTP layer translates to 400, 404, and 500 respectively.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed start input or lifecycle call in an illegal state.
    #[error("payload not valid: {0}")]
    PayloadNotValid(String),

    /// Unknown workflow, execution, instance, or step id.
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    /// Downstream unavailable, exhausted dispatch retries, unresolvable
    /// expression, or a configuration fault such as a missing decision case.
    #[error("internal service error: {0}")]
    InternalService(String),
}

/// Errors from execution-store operations (used by trait definitions in
/// stepflow-core).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => EngineError::ResourceNotFound("entity not found".to_string()),
            other => EngineError::InternalService(other.to_string()),
        }
    }
}
