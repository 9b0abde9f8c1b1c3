//! SQLite execution store implementation.
//!
//! Implements `ExecutionStore` from `stepflow-core` using sqlx with split
//! read/write pools. Every runner transition is persisted here before the
//! next one is considered, so a restarted process resumes from the stored
//! state. JSON payloads (inputs, outputs, errors, id lists) are stored as
//! TEXT columns; status enums are stored under their wire names.

use chrono::{DateTime, Utc};
use sqlx::Row;
use stepflow_core::repository::execution::ExecutionStore;
use stepflow_types::error::StoreError;
use stepflow_types::execution::{WorkflowExecution, WorkflowInstance, WorkflowStepInstance};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `ExecutionStore`.
pub struct SqliteExecutionStore {
    pool: DatabasePool,
}

impl SqliteExecutionStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct InstanceRow {
    id: String,
    workflow_id: String,
    input_parameters: String,
    status: String,
    timeout_seconds: i64,
    step_instance_ids: String,
    deferred_step_id: Option<String>,
    parent_instance_id: Option<String>,
    parent_step_instance_id: Option<String>,
    started_at: String,
    updated_at: String,
}

impl InstanceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            input_parameters: row.try_get("input_parameters")?,
            status: row.try_get("status")?,
            timeout_seconds: row.try_get("timeout_seconds")?,
            step_instance_ids: row.try_get("step_instance_ids")?,
            deferred_step_id: row.try_get("deferred_step_id")?,
            parent_instance_id: row.try_get("parent_instance_id")?,
            parent_step_instance_id: row.try_get("parent_step_instance_id")?,
            started_at: row.try_get("started_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_instance(self) -> Result<WorkflowInstance, StoreError> {
        Ok(WorkflowInstance {
            id: parse_uuid(&self.id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            input_parameters: parse_json(&self.input_parameters, "input_parameters")?,
            status: parse_status(&self.status, "instance status")?,
            timeout_seconds: self.timeout_seconds as u64,
            step_instance_ids: parse_json(&self.step_instance_ids, "step_instance_ids")?,
            deferred_step_id: self.deferred_step_id,
            parent_instance_id: self
                .parent_instance_id
                .as_deref()
                .map(parse_uuid)
                .transpose()?,
            parent_step_instance_id: self
                .parent_step_instance_id
                .as_deref()
                .map(parse_uuid)
                .transpose()?,
            started_at: parse_datetime(&self.started_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct StepRow {
    id: String,
    workflow_instance_id: String,
    step_id: String,
    control_structure: String,
    run_status: String,
    retry_count: i64,
    loop_count: i64,
    input_data: String,
    output_data: String,
    error_message: Option<String>,
    sub_execution_id: Option<String>,
    scheduled_at: Option<String>,
    started_at: Option<String>,
    ended_at: Option<String>,
    updated_at: String,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_instance_id: row.try_get("workflow_instance_id")?,
            step_id: row.try_get("step_id")?,
            control_structure: row.try_get("control_structure")?,
            run_status: row.try_get("run_status")?,
            retry_count: row.try_get("retry_count")?,
            loop_count: row.try_get("loop_count")?,
            input_data: row.try_get("input_data")?,
            output_data: row.try_get("output_data")?,
            error_message: row.try_get("error_message")?,
            sub_execution_id: row.try_get("sub_execution_id")?,
            scheduled_at: row.try_get("scheduled_at")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_step(self) -> Result<WorkflowStepInstance, StoreError> {
        Ok(WorkflowStepInstance {
            id: parse_uuid(&self.id)?,
            workflow_instance_id: parse_uuid(&self.workflow_instance_id)?,
            step_id: self.step_id,
            control_structure: parse_status(&self.control_structure, "step type")?,
            run_status: parse_status(&self.run_status, "step status")?,
            retry_count: self.retry_count as u32,
            loop_count: self.loop_count as u32,
            input_data: parse_json(&self.input_data, "input_data")?,
            output_data: parse_json(&self.output_data, "output_data")?,
            error_message: self.error_message,
            sub_execution_id: self
                .sub_execution_id
                .as_deref()
                .map(parse_uuid)
                .transpose()?,
            scheduled_at: self.scheduled_at.as_deref().map(parse_datetime).transpose()?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            ended_at: self.ended_at.as_deref().map(parse_datetime).transpose()?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct ExecutionRow {
    id: String,
    workflow_instance_id: String,
    workflow_id: String,
    status: String,
    start_time: String,
    end_time: Option<String>,
    errors: String,
    output: String,
    step_instance_ids: String,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_instance_id: row.try_get("workflow_instance_id")?,
            workflow_id: row.try_get("workflow_id")?,
            status: row.try_get("status")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            errors: row.try_get("errors")?,
            output: row.try_get("output")?,
            step_instance_ids: row.try_get("step_instance_ids")?,
        })
    }

    fn into_execution(self) -> Result<WorkflowExecution, StoreError> {
        Ok(WorkflowExecution {
            id: parse_uuid(&self.id)?,
            workflow_instance_id: parse_uuid(&self.workflow_instance_id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            status: parse_status(&self.status, "execution status")?,
            start_time: parse_datetime(&self.start_time)?,
            end_time: self.end_time.as_deref().map(parse_datetime).transpose()?,
            errors: parse_json(&self.errors, "errors")?,
            output: parse_json(&self.output, "output")?,
            step_instance_ids: parse_json(&self.step_instance_ids, "step_instance_ids")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn store_err(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_) => StoreError::Connection,
        other => StoreError::Query(other.to_string()),
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    s.parse::<Uuid>()
        .map_err(|e| StoreError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_json<T: serde::de::DeserializeOwned>(s: &str, what: &str) -> Result<T, StoreError> {
    serde_json::from_str(s).map_err(|e| StoreError::Query(format!("invalid {what} JSON: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Query(format!("serialize {what}: {e}")))
}

/// Parse a wire-name status column back into its enum.
fn parse_status<T: serde::de::DeserializeOwned>(s: &str, what: &str) -> Result<T, StoreError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| StoreError::Query(format!("invalid {what}: {s}")))
}

// ---------------------------------------------------------------------------
// ExecutionStore impl
// ---------------------------------------------------------------------------

impl ExecutionStore for SqliteExecutionStore {
    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO workflow_instances
               (id, workflow_id, input_parameters, status, timeout_seconds, step_instance_ids,
                deferred_step_id, parent_instance_id, parent_step_instance_id,
                started_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(instance.id.to_string())
        .bind(instance.workflow_id.to_string())
        .bind(to_json(&instance.input_parameters, "input_parameters")?)
        .bind(instance.status.as_str())
        .bind(instance.timeout_seconds as i64)
        .bind(to_json(&instance.step_instance_ids, "step_instance_ids")?)
        .bind(&instance.deferred_step_id)
        .bind(instance.parent_instance_id.map(|id| id.to_string()))
        .bind(instance.parent_step_instance_id.map(|id| id.to_string()))
        .bind(format_datetime(&instance.started_at))
        .bind(format_datetime(&instance.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(store_err)?;

        match row {
            Some(row) => {
                let r = InstanceRow::from_row(&row).map_err(store_err)?;
                Ok(Some(r.into_instance()?))
            }
            None => Ok(None),
        }
    }

    async fn update_instance(&self, instance: &WorkflowInstance) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"UPDATE workflow_instances
               SET status = ?, timeout_seconds = ?, step_instance_ids = ?,
                   deferred_step_id = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(instance.status.as_str())
        .bind(instance.timeout_seconds as i64)
        .bind(to_json(&instance.step_instance_ids, "step_instance_ids")?)
        .bind(&instance.deferred_step_id)
        .bind(format_datetime(&instance.updated_at))
        .bind(instance.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(store_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }

        Ok(())
    }

    async fn list_active_instances(&self) -> Result<Vec<WorkflowInstance>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_instances WHERE status IN ('RUNNING', 'PAUSED') ORDER BY started_at ASC",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(store_err)?;

        let mut instances = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = InstanceRow::from_row(row).map_err(store_err)?;
            instances.push(r.into_instance()?);
        }
        Ok(instances)
    }

    async fn create_step_instances(
        &self,
        steps: &[WorkflowStepInstance],
    ) -> Result<(), StoreError> {
        // One transaction per tree: readers never see a partially created set.
        let mut tx = self.pool.writer.begin().await.map_err(store_err)?;

        for step in steps {
            sqlx::query(
                r#"INSERT INTO workflow_step_instances
                   (id, workflow_instance_id, step_id, control_structure, run_status,
                    retry_count, loop_count, input_data, output_data, error_message,
                    sub_execution_id, scheduled_at, started_at, ended_at, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(step.id.to_string())
            .bind(step.workflow_instance_id.to_string())
            .bind(&step.step_id)
            .bind(step.control_structure.as_str())
            .bind(step.run_status.as_str())
            .bind(step.retry_count as i64)
            .bind(step.loop_count as i64)
            .bind(to_json(&step.input_data, "input_data")?)
            .bind(to_json(&step.output_data, "output_data")?)
            .bind(&step.error_message)
            .bind(step.sub_execution_id.map(|id| id.to_string()))
            .bind(step.scheduled_at.as_ref().map(format_datetime))
            .bind(step.started_at.as_ref().map(format_datetime))
            .bind(step.ended_at.as_ref().map(format_datetime))
            .bind(format_datetime(&step.updated_at))
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }

        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn get_step_instance(
        &self,
        id: &Uuid,
    ) -> Result<Option<WorkflowStepInstance>, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_step_instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(store_err)?;

        match row {
            Some(row) => {
                let r = StepRow::from_row(&row).map_err(store_err)?;
                Ok(Some(r.into_step()?))
            }
            None => Ok(None),
        }
    }

    async fn get_step_instance_by_step(
        &self,
        workflow_instance_id: &Uuid,
        step_id: &str,
    ) -> Result<Option<WorkflowStepInstance>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM workflow_step_instances WHERE workflow_instance_id = ? AND step_id = ?",
        )
        .bind(workflow_instance_id.to_string())
        .bind(step_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(store_err)?;

        match row {
            Some(row) => {
                let r = StepRow::from_row(&row).map_err(store_err)?;
                Ok(Some(r.into_step()?))
            }
            None => Ok(None),
        }
    }

    async fn list_step_instances(
        &self,
        workflow_instance_id: &Uuid,
    ) -> Result<Vec<WorkflowStepInstance>, StoreError> {
        // UUIDv7 ids sort by creation time.
        let rows = sqlx::query(
            "SELECT * FROM workflow_step_instances WHERE workflow_instance_id = ? ORDER BY id ASC",
        )
        .bind(workflow_instance_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(store_err)?;

        let mut steps = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = StepRow::from_row(row).map_err(store_err)?;
            steps.push(r.into_step()?);
        }
        Ok(steps)
    }

    async fn update_step_instance(&self, step: &WorkflowStepInstance) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"UPDATE workflow_step_instances
               SET run_status = ?, retry_count = ?, loop_count = ?, input_data = ?,
                   output_data = ?, error_message = ?, sub_execution_id = ?,
                   scheduled_at = ?, started_at = ?, ended_at = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(step.run_status.as_str())
        .bind(step.retry_count as i64)
        .bind(step.loop_count as i64)
        .bind(to_json(&step.input_data, "input_data")?)
        .bind(to_json(&step.output_data, "output_data")?)
        .bind(&step.error_message)
        .bind(step.sub_execution_id.map(|id| id.to_string()))
        .bind(step.scheduled_at.as_ref().map(format_datetime))
        .bind(step.started_at.as_ref().map(format_datetime))
        .bind(step.ended_at.as_ref().map(format_datetime))
        .bind(format_datetime(&step.updated_at))
        .bind(step.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(store_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }

        Ok(())
    }

    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO workflow_executions
               (id, workflow_instance_id, workflow_id, status, start_time, end_time,
                errors, output, step_instance_ids)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(execution.id.to_string())
        .bind(execution.workflow_instance_id.to_string())
        .bind(execution.workflow_id.to_string())
        .bind(execution.status.as_str())
        .bind(format_datetime(&execution.start_time))
        .bind(execution.end_time.as_ref().map(format_datetime))
        .bind(to_json(&execution.errors, "errors")?)
        .bind(to_json(&execution.output, "output")?)
        .bind(to_json(&execution.step_instance_ids, "step_instance_ids")?)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e {
                if db_err.message().contains("UNIQUE") {
                    return StoreError::Conflict(format!(
                        "execution already exists for instance {}",
                        execution.workflow_instance_id
                    ));
                }
            }
            store_err(e)
        })?;

        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<WorkflowExecution>, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(store_err)?;

        match row {
            Some(row) => {
                let r = ExecutionRow::from_row(&row).map_err(store_err)?;
                Ok(Some(r.into_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn get_execution_by_instance(
        &self,
        workflow_instance_id: &Uuid,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_executions WHERE workflow_instance_id = ?")
            .bind(workflow_instance_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(store_err)?;

        match row {
            Some(row) => {
                let r = ExecutionRow::from_row(&row).map_err(store_err)?;
                Ok(Some(r.into_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn update_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        // `end_time IS NULL` guards the append-only contract: a finalized
        // record never changes again.
        let result = sqlx::query(
            r#"UPDATE workflow_executions
               SET status = ?, end_time = ?, errors = ?, output = ?, step_instance_ids = ?
               WHERE id = ? AND end_time IS NULL"#,
        )
        .bind(execution.status.as_str())
        .bind(execution.end_time.as_ref().map(format_datetime))
        .bind(to_json(&execution.errors, "errors")?)
        .bind(to_json(&execution.output, "output")?)
        .bind(to_json(&execution.step_instance_ids, "step_instance_ids")?)
        .bind(execution.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(store_err)?;

        if result.rows_affected() == 0 {
            // Distinguish a finalized record from a missing one.
            let row = sqlx::query("SELECT end_time FROM workflow_executions WHERE id = ?")
                .bind(execution.id.to_string())
                .fetch_optional(&self.pool.reader)
                .await
                .map_err(store_err)?;
            return match row {
                Some(_) => Err(StoreError::Conflict(format!(
                    "execution {} is already finalized",
                    execution.id
                ))),
                None => Err(StoreError::NotFound),
            };
        }

        Ok(())
    }

    async fn list_executions(
        &self,
        workflow_id: &Uuid,
        limit: u32,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_executions WHERE workflow_id = ? ORDER BY start_time DESC, id DESC LIMIT ?",
        )
        .bind(workflow_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(store_err)?;

        let mut executions = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ExecutionRow::from_row(row).map_err(store_err)?;
            executions.push(r.into_execution()?);
        }
        Ok(executions)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::pool::DatabasePool;
    use serde_json::json;
    use std::collections::HashMap;
    use stepflow_types::execution::{InstanceStatus, StepRunStatus};
    use stepflow_types::workflow::StepType;

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    fn sample_instance() -> WorkflowInstance {
        WorkflowInstance {
            id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            input_parameters: HashMap::from([("orderId".to_string(), json!("ord-42"))]),
            status: InstanceStatus::Running,
            timeout_seconds: 600,
            step_instance_ids: vec![],
            deferred_step_id: None,
            parent_instance_id: None,
            parent_step_instance_id: None,
            started_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn sample_step(instance_id: Uuid, step_id: &str) -> WorkflowStepInstance {
        WorkflowStepInstance::new(instance_id, step_id, StepType::Simple, 3)
    }

    fn sample_execution(instance: &WorkflowInstance) -> WorkflowExecution {
        WorkflowExecution {
            id: Uuid::now_v7(),
            workflow_instance_id: instance.id,
            workflow_id: instance.workflow_id,
            status: InstanceStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            errors: vec![],
            output: HashMap::new(),
            step_instance_ids: vec![],
        }
    }

    // -- Instances --

    #[tokio::test]
    async fn test_create_and_get_instance() {
        let store = SqliteExecutionStore::new(test_pool().await);
        let instance = sample_instance();

        store.create_instance(&instance).await.unwrap();

        let loaded = store.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(loaded.workflow_id, instance.workflow_id);
        assert_eq!(loaded.status, InstanceStatus::Running);
        assert_eq!(loaded.timeout_seconds, 600);
        assert_eq!(loaded.input_parameters["orderId"], json!("ord-42"));
        assert!(loaded.parent_instance_id.is_none());
    }

    #[tokio::test]
    async fn test_get_instance_missing_returns_none() {
        let store = SqliteExecutionStore::new(test_pool().await);
        let found = store.get_instance(&Uuid::now_v7()).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_update_instance_state() {
        let store = SqliteExecutionStore::new(test_pool().await);
        let mut instance = sample_instance();
        store.create_instance(&instance).await.unwrap();

        instance.status = InstanceStatus::Paused;
        instance.deferred_step_id = Some("summarize".to_string());
        instance.updated_at = Utc::now();
        store.update_instance(&instance).await.unwrap();

        let loaded = store.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, InstanceStatus::Paused);
        assert_eq!(loaded.deferred_step_id.as_deref(), Some("summarize"));
    }

    #[tokio::test]
    async fn test_update_instance_missing_is_not_found() {
        let store = SqliteExecutionStore::new(test_pool().await);
        let instance = sample_instance();
        let err = store.update_instance(&instance).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn test_list_active_instances() {
        let store = SqliteExecutionStore::new(test_pool().await);

        let running = sample_instance();
        let mut paused = sample_instance();
        paused.status = InstanceStatus::Paused;
        let mut completed = sample_instance();
        completed.status = InstanceStatus::Completed;

        store.create_instance(&running).await.unwrap();
        store.create_instance(&paused).await.unwrap();
        store.create_instance(&completed).await.unwrap();

        let active = store.list_active_instances().await.unwrap();
        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|i| !i.is_terminal()));
    }

    #[tokio::test]
    async fn test_instance_parent_linkage_roundtrip() {
        let store = SqliteExecutionStore::new(test_pool().await);
        let parent = sample_instance();
        store.create_instance(&parent).await.unwrap();

        let mut child = sample_instance();
        child.parent_instance_id = Some(parent.id);
        child.parent_step_instance_id = Some(Uuid::now_v7());
        store.create_instance(&child).await.unwrap();

        let loaded = store.get_instance(&child.id).await.unwrap().unwrap();
        assert_eq!(loaded.parent_instance_id, Some(parent.id));
        assert_eq!(
            loaded.parent_step_instance_id,
            child.parent_step_instance_id
        );
    }

    // -- Step instances --

    #[tokio::test]
    async fn test_step_instances_roundtrip() {
        let store = SqliteExecutionStore::new(test_pool().await);
        let instance = sample_instance();
        store.create_instance(&instance).await.unwrap();

        let steps = vec![
            sample_step(instance.id, "fetch"),
            sample_step(instance.id, "summarize"),
        ];
        store.create_step_instances(&steps).await.unwrap();

        let listed = store.list_step_instances(&instance.id).await.unwrap();
        assert_eq!(listed.len(), 2);
        // UUIDv7 creation order preserved.
        assert_eq!(listed[0].step_id, "fetch");
        assert_eq!(listed[1].step_id, "summarize");
        assert_eq!(listed[0].run_status, StepRunStatus::New);
        assert_eq!(listed[0].retry_count, 3);
        assert_eq!(listed[0].control_structure, StepType::Simple);
    }

    #[tokio::test]
    async fn test_get_step_instance_by_step() {
        let store = SqliteExecutionStore::new(test_pool().await);
        let instance = sample_instance();
        store.create_instance(&instance).await.unwrap();

        let steps = vec![sample_step(instance.id, "fetch")];
        store.create_step_instances(&steps).await.unwrap();

        let found = store
            .get_step_instance_by_step(&instance.id, "fetch")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, steps[0].id);

        let missing = store
            .get_step_instance_by_step(&instance.id, "no-such-step")
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_update_step_instance() {
        let store = SqliteExecutionStore::new(test_pool().await);
        let instance = sample_instance();
        store.create_instance(&instance).await.unwrap();

        let mut step = sample_step(instance.id, "fetch");
        store
            .create_step_instances(std::slice::from_ref(&step))
            .await
            .unwrap();

        step.run_status = StepRunStatus::Completed;
        step.retry_count = 2;
        step.loop_count = 1;
        step.output_data = HashMap::from([("rows".to_string(), json!(17))]);
        step.error_message = Some("transient glitch".to_string());
        step.sub_execution_id = Some(Uuid::now_v7());
        step.scheduled_at = Some(Utc::now());
        step.started_at = Some(Utc::now());
        step.ended_at = Some(Utc::now());
        step.updated_at = Utc::now();
        store.update_step_instance(&step).await.unwrap();

        let loaded = store.get_step_instance(&step.id).await.unwrap().unwrap();
        assert_eq!(loaded.run_status, StepRunStatus::Completed);
        assert_eq!(loaded.retry_count, 2);
        assert_eq!(loaded.loop_count, 1);
        assert_eq!(loaded.output_data["rows"], json!(17));
        assert_eq!(loaded.error_message.as_deref(), Some("transient glitch"));
        assert_eq!(loaded.sub_execution_id, step.sub_execution_id);
        assert!(loaded.scheduled_at.is_some());
        assert!(loaded.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_update_step_missing_is_not_found() {
        let store = SqliteExecutionStore::new(test_pool().await);
        let step = sample_step(Uuid::now_v7(), "fetch");
        let err = store.update_step_instance(&step).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn test_step_batch_rolls_back_on_duplicate() {
        let store = SqliteExecutionStore::new(test_pool().await);
        let instance = sample_instance();
        store.create_instance(&instance).await.unwrap();

        // Two rows for the same (instance, step id) violate the unique
        // constraint; the first insert must roll back with them.
        let steps = vec![
            sample_step(instance.id, "fetch"),
            sample_step(instance.id, "fetch"),
        ];
        store.create_step_instances(&steps).await.unwrap_err();

        let listed = store.list_step_instances(&instance.id).await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn test_step_requires_instance_row() {
        let store = SqliteExecutionStore::new(test_pool().await);
        // No workflow_instances row: the foreign key rejects the insert.
        let steps = vec![sample_step(Uuid::now_v7(), "fetch")];
        let err = store.create_step_instances(&steps).await.unwrap_err();
        assert!(matches!(err, StoreError::Query(_)));
    }

    // -- Executions --

    #[tokio::test]
    async fn test_create_and_get_execution() {
        let store = SqliteExecutionStore::new(test_pool().await);
        let instance = sample_instance();
        store.create_instance(&instance).await.unwrap();

        let execution = sample_execution(&instance);
        store.create_execution(&execution).await.unwrap();

        let by_id = store.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(by_id.workflow_instance_id, instance.id);
        assert_eq!(by_id.status, InstanceStatus::Running);
        assert!(by_id.end_time.is_none());

        let by_instance = store
            .get_execution_by_instance(&instance.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_instance.id, execution.id);
    }

    #[tokio::test]
    async fn test_duplicate_execution_for_instance_conflicts() {
        let store = SqliteExecutionStore::new(test_pool().await);
        let instance = sample_instance();
        store.create_instance(&instance).await.unwrap();

        store
            .create_execution(&sample_execution(&instance))
            .await
            .unwrap();
        let err = store
            .create_execution(&sample_execution(&instance))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_finalized_execution_rejects_updates() {
        let store = SqliteExecutionStore::new(test_pool().await);
        let instance = sample_instance();
        store.create_instance(&instance).await.unwrap();

        let mut execution = sample_execution(&instance);
        store.create_execution(&execution).await.unwrap();

        execution.status = InstanceStatus::Completed;
        execution.end_time = Some(Utc::now());
        execution.output = HashMap::from([("summary".to_string(), json!("done"))]);
        store.update_execution(&execution).await.unwrap();

        let loaded = store.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, InstanceStatus::Completed);
        assert!(loaded.is_finalized());
        assert_eq!(loaded.output["summary"], json!("done"));

        // A second write against the finalized record must be rejected.
        execution.status = InstanceStatus::Failed;
        let err = store.update_execution(&execution).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert!(err.to_string().contains("finalized"));
    }

    #[tokio::test]
    async fn test_update_execution_missing_is_not_found() {
        let store = SqliteExecutionStore::new(test_pool().await);
        let instance = sample_instance();
        let execution = sample_execution(&instance);
        let err = store.update_execution(&execution).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn test_execution_error_list_roundtrip() {
        let store = SqliteExecutionStore::new(test_pool().await);
        let instance = sample_instance();
        store.create_instance(&instance).await.unwrap();

        let mut execution = sample_execution(&instance);
        store.create_execution(&execution).await.unwrap();

        execution.status = InstanceStatus::Failed;
        execution.end_time = Some(Utc::now());
        execution.errors = vec![
            "fetch: connection refused".to_string(),
            "instance exceeded its timeout of 600s".to_string(),
        ];
        store.update_execution(&execution).await.unwrap();

        let loaded = store.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(loaded.errors.len(), 2);
        assert_eq!(loaded.errors[0], "fetch: connection refused");
    }

    #[tokio::test]
    async fn test_list_executions_newest_first() {
        let store = SqliteExecutionStore::new(test_pool().await);
        let workflow_id = Uuid::now_v7();

        let mut ids = Vec::new();
        for age_secs in [30i64, 20, 10] {
            let mut instance = sample_instance();
            instance.workflow_id = workflow_id;
            store.create_instance(&instance).await.unwrap();

            let mut execution = sample_execution(&instance);
            execution.start_time = Utc::now() - chrono::Duration::seconds(age_secs);
            store.create_execution(&execution).await.unwrap();
            ids.push(execution.id);
        }

        let recent = store.list_executions(&workflow_id, 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        // Newest (age 10s) first.
        assert_eq!(recent[0].id, ids[2]);
        assert_eq!(recent[1].id, ids[1]);

        let all = store.list_executions(&workflow_id, 10).await.unwrap();
        assert_eq!(all.len(), 3);
    }
}
