use super::ExecutionStore;
use crate::error::StoreError;
use crate::types::{ExecutionStatus, WorkflowExecution, WorkflowExecutionStep};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Execution store kept in process memory, behind a single lock
#[derive(Default)]
pub struct InMemoryExecutionStore {
    executions: RwLock<BTreeMap<String, WorkflowExecution>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn add(&self, mut execution: WorkflowExecution) -> Result<WorkflowExecution, StoreError> {
        let mut executions = self.executions.write().await;
        if executions.contains_key(&execution.execution_id) {
            return Err(StoreError::DuplicateExecution(execution.execution_id));
        }

        let now = Utc::now();
        execution.created_at.get_or_insert(now);
        execution.updated_at.get_or_insert(now);
        for step in execution.steps.values_mut() {
            step.updated_at.get_or_insert(now);
        }

        executions.insert(execution.execution_id.clone(), execution.clone());
        Ok(execution)
    }

    async fn upsert_step(&self, mut step: WorkflowExecutionStep) -> Result<WorkflowExecution, StoreError> {
        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(&step.execution_id)
            .ok_or_else(|| StoreError::ExecutionNotFound(step.execution_id.clone()))?;

        step.updated_at = Some(Utc::now());
        execution.steps.insert(step.reference.clone(), step);
        Ok(execution.clone())
    }

    async fn update_status(&self, execution_id: &str, status: ExecutionStatus) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(execution_id)
            .ok_or_else(|| StoreError::ExecutionNotFound(execution_id.to_string()))?;

        let now = Utc::now();
        execution.status = status;
        execution.updated_at = Some(now);
        if status != ExecutionStatus::Started {
            execution.finished_at = Some(now);
        }
        Ok(())
    }

    async fn get(&self, execution_id: &str) -> Result<WorkflowExecution, StoreError> {
        self.executions
            .read()
            .await
            .get(execution_id)
            .cloned()
            .ok_or_else(|| StoreError::ExecutionNotFound(execution_id.to_string()))
    }

    async fn get_unfinished(&self, offset: usize, limit: usize) -> Result<Vec<WorkflowExecution>, StoreError> {
        Ok(self
            .executions
            .read()
            .await
            .values()
            .filter(|execution| execution.status == ExecutionStatus::Started)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::conformance;

    #[tokio::test]
    async fn test_add_rejects_duplicates() {
        conformance::add_rejects_duplicates(&InMemoryExecutionStore::new()).await;
    }

    #[tokio::test]
    async fn test_upsert_overwrites_in_place() {
        conformance::upsert_overwrites_in_place(&InMemoryExecutionStore::new()).await;
    }

    #[tokio::test]
    async fn test_missing_execution_is_reported() {
        conformance::missing_execution_is_reported(&InMemoryExecutionStore::new()).await;
    }

    #[tokio::test]
    async fn test_status_transitions_stamp_finish() {
        conformance::status_transitions_stamp_finish(&InMemoryExecutionStore::new()).await;
    }

    #[tokio::test]
    async fn test_unfinished_pages_by_id() {
        conformance::unfinished_pages_by_id(&InMemoryExecutionStore::new()).await;
    }

    #[tokio::test]
    async fn test_concurrent_upserts_on_distinct_refs() {
        let store = std::sync::Arc::new(InMemoryExecutionStore::new());
        store.add(WorkflowExecution::new("exec-1", "wf-1")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let step = WorkflowExecutionStep::new("exec-1", format!("step-{}", i), ExecutionStatus::Completed);
                store.upsert_step(step).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.get("exec-1").await.unwrap().steps.len(), 16);
    }
}
