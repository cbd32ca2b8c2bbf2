use super::ExecutionStore;
use crate::error::StoreError;
use crate::types::{ExecutionStatus, StepOutput, Value, ValueMap, WorkflowExecution, WorkflowExecutionStep};
use ::redb::{Database, ReadableTable, Table, TableDefinition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// execution_id -> ExecutionRow
const EXECUTIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("workflow_executions");
/// (execution_id, ref) -> StepRow
const STEPS_TABLE: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("workflow_steps");

#[derive(Debug, Serialize, Deserialize)]
struct ExecutionRow {
    workflow_id: String,
    status: ExecutionStatus,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StepRow {
    status: ExecutionStatus,
    inputs: Option<ValueMap>,
    output_err: Option<String>,
    output_value: Option<Value>,
    updated_at: Option<DateTime<Utc>>,
}

impl From<&WorkflowExecutionStep> for StepRow {
    fn from(step: &WorkflowExecutionStep) -> Self {
        Self {
            status: step.status,
            inputs: step.inputs.clone(),
            output_err: step.outputs.err.clone(),
            output_value: step.outputs.value.clone(),
            updated_at: step.updated_at,
        }
    }
}

impl StepRow {
    fn into_step(self, execution_id: &str, reference: &str) -> WorkflowExecutionStep {
        WorkflowExecutionStep {
            execution_id: execution_id.to_string(),
            reference: reference.to_string(),
            status: self.status,
            inputs: self.inputs,
            outputs: StepOutput {
                value: self.output_value,
                err: self.output_err,
            },
            updated_at: self.updated_at,
        }
    }
}

/// Durable execution store on an embedded redb database
#[derive(Clone)]
pub struct RedbExecutionStore {
    db: Arc<Database>,
}

impl RedbExecutionStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _executions = write_txn.open_table(EXECUTIONS_TABLE)?;
            let _steps = write_txn.open_table(STEPS_TABLE)?;
        }
        write_txn.commit()?;

        tracing::debug!(path = %path.display(), "opened execution store");
        Ok(Self { db: Arc::new(db) })
    }

    fn read_row<T>(table: &T, execution_id: &str) -> Result<Option<ExecutionRow>, StoreError>
    where
        T: ReadableTable<&'static str, &'static [u8]>,
    {
        match table.get(execution_id)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    fn read_steps<T>(
        table: &T,
        execution_id: &str,
    ) -> Result<BTreeMap<String, WorkflowExecutionStep>, StoreError>
    where
        T: ReadableTable<(&'static str, &'static str), &'static [u8]>,
    {
        let mut steps = BTreeMap::new();
        for item in table.range((execution_id, "")..)? {
            let (key, value) = item?;
            let (id, reference) = key.value();
            if id != execution_id {
                break;
            }
            let row: StepRow = serde_json::from_slice(value.value())?;
            steps.insert(reference.to_string(), row.into_step(id, reference));
        }
        Ok(steps)
    }

    fn assemble(
        execution_id: &str,
        row: ExecutionRow,
        steps: BTreeMap<String, WorkflowExecutionStep>,
    ) -> WorkflowExecution {
        WorkflowExecution {
            execution_id: execution_id.to_string(),
            workflow_id: row.workflow_id,
            status: row.status,
            created_at: row.created_at,
            updated_at: row.updated_at,
            finished_at: row.finished_at,
            steps,
        }
    }

    fn write_step(
        table: &mut Table<'_, (&'static str, &'static str), &'static [u8]>,
        step: &WorkflowExecutionStep,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_vec(&StepRow::from(step))?;
        table.insert((step.execution_id.as_str(), step.reference.as_str()), value.as_slice())?;
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for RedbExecutionStore {
    async fn add(&self, mut execution: WorkflowExecution) -> Result<WorkflowExecution, StoreError> {
        let now = Utc::now();
        execution.created_at.get_or_insert(now);
        execution.updated_at.get_or_insert(now);
        for step in execution.steps.values_mut() {
            step.updated_at.get_or_insert(now);
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut executions = write_txn.open_table(EXECUTIONS_TABLE)?;
            if executions.get(execution.execution_id.as_str())?.is_some() {
                return Err(StoreError::DuplicateExecution(execution.execution_id));
            }

            let row = ExecutionRow {
                workflow_id: execution.workflow_id.clone(),
                status: execution.status,
                created_at: execution.created_at,
                updated_at: execution.updated_at,
                finished_at: execution.finished_at,
            };
            let value = serde_json::to_vec(&row)?;
            executions.insert(execution.execution_id.as_str(), value.as_slice())?;

            let mut steps = write_txn.open_table(STEPS_TABLE)?;
            for step in execution.steps.values() {
                Self::write_step(&mut steps, step)?;
            }
        }
        write_txn.commit()?;

        Ok(execution)
    }

    async fn upsert_step(&self, mut step: WorkflowExecutionStep) -> Result<WorkflowExecution, StoreError> {
        step.updated_at = Some(Utc::now());

        let write_txn = self.db.begin_write()?;
        let execution = {
            let executions = write_txn.open_table(EXECUTIONS_TABLE)?;
            let row = Self::read_row(&executions, &step.execution_id)?
                .ok_or_else(|| StoreError::ExecutionNotFound(step.execution_id.clone()))?;

            let mut steps = write_txn.open_table(STEPS_TABLE)?;
            Self::write_step(&mut steps, &step)?;

            let all = Self::read_steps(&steps, &step.execution_id)?;
            Self::assemble(&step.execution_id, row, all)
        };
        write_txn.commit()?;

        Ok(execution)
    }

    async fn update_status(&self, execution_id: &str, status: ExecutionStatus) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut executions = write_txn.open_table(EXECUTIONS_TABLE)?;
            let mut row = Self::read_row(&executions, execution_id)?
                .ok_or_else(|| StoreError::ExecutionNotFound(execution_id.to_string()))?;

            let now = Utc::now();
            row.status = status;
            row.updated_at = Some(now);
            if status != ExecutionStatus::Started {
                row.finished_at = Some(now);
            }

            let value = serde_json::to_vec(&row)?;
            executions.insert(execution_id, value.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    async fn get(&self, execution_id: &str) -> Result<WorkflowExecution, StoreError> {
        let read_txn = self.db.begin_read()?;
        let executions = read_txn.open_table(EXECUTIONS_TABLE)?;
        let row = Self::read_row(&executions, execution_id)?
            .ok_or_else(|| StoreError::ExecutionNotFound(execution_id.to_string()))?;

        let steps = read_txn.open_table(STEPS_TABLE)?;
        Ok(Self::assemble(execution_id, row, Self::read_steps(&steps, execution_id)?))
    }

    async fn get_unfinished(&self, offset: usize, limit: usize) -> Result<Vec<WorkflowExecution>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let executions = read_txn.open_table(EXECUTIONS_TABLE)?;
        let steps = read_txn.open_table(STEPS_TABLE)?;

        let mut unfinished = Vec::new();
        let mut skipped = 0;
        for item in executions.iter()? {
            if unfinished.len() == limit {
                break;
            }
            let (key, value) = item?;
            let row: ExecutionRow = serde_json::from_slice(value.value())?;
            if row.status != ExecutionStatus::Started {
                continue;
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            let id = key.value();
            unfinished.push(Self::assemble(id, row, Self::read_steps(&steps, id)?));
        }
        Ok(unfinished)
    }
}
