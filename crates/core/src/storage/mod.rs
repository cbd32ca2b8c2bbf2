//! Persistence of executions and their steps.

pub mod memory;
pub mod redb;

pub use self::memory::InMemoryExecutionStore;
pub use self::redb::RedbExecutionStore;

use crate::error::StoreError;
use crate::types::{ExecutionStatus, WorkflowExecution, WorkflowExecutionStep};
use async_trait::async_trait;

/// Execution persistence shared by every run of every engine on a node.
///
/// Implementations must be safe under concurrent use by in-flight runs. Two
/// writers on the same `(execution_id, ref)` are not supported.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert a new execution with its initial steps in one atomic unit.
    ///
    /// Fails with [`StoreError::DuplicateExecution`] without touching state
    /// when the id already exists. Returns the stored copy.
    async fn add(&self, execution: WorkflowExecution) -> Result<WorkflowExecution, StoreError>;

    /// Insert or overwrite a step and return the refreshed execution
    async fn upsert_step(&self, step: WorkflowExecutionStep) -> Result<WorkflowExecution, StoreError>;

    /// Set the execution status; any status other than `started` also stamps `finished_at`
    async fn update_status(&self, execution_id: &str, status: ExecutionStatus) -> Result<(), StoreError>;

    async fn get(&self, execution_id: &str) -> Result<WorkflowExecution, StoreError>;

    /// Executions still `started`, ordered by execution id
    async fn get_unfinished(&self, offset: usize, limit: usize) -> Result<Vec<WorkflowExecution>, StoreError>;
}

/// Behaviour every store must share, run against each implementation
#[cfg(test)]
pub(crate) mod conformance {
    use super::*;
    use serde_json::json;

    fn execution(id: &str) -> WorkflowExecution {
        let mut execution = WorkflowExecution::new(id, "wf-1");
        let mut trigger = WorkflowExecutionStep::new(id, "trigger", ExecutionStatus::Completed);
        trigger.outputs.value = Some(json!({"n": 1}));
        execution.steps.insert("trigger".into(), trigger);
        execution
    }

    pub async fn add_rejects_duplicates(store: &dyn ExecutionStore) {
        let stored = store.add(execution("exec-1")).await.unwrap();
        assert!(stored.created_at.is_some());
        assert_eq!(stored.steps.len(), 1);

        let mut changed = execution("exec-1");
        changed.workflow_id = "other".into();
        let err = store.add(changed).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateExecution(id) if id == "exec-1"));

        let fetched = store.get("exec-1").await.unwrap();
        assert_eq!(fetched.workflow_id, "wf-1");
        assert_eq!(
            fetched.step("trigger").unwrap().outputs.value,
            Some(json!({"n": 1}))
        );
    }

    pub async fn upsert_overwrites_in_place(store: &dyn ExecutionStore) {
        store.add(execution("exec-1")).await.unwrap();

        let mut step = WorkflowExecutionStep::new("exec-1", "fetch", ExecutionStatus::Started);
        step.inputs = json!({"url": "x"}).as_object().cloned();
        let snapshot = store.upsert_step(step.clone()).await.unwrap();
        assert_eq!(snapshot.steps.len(), 2);
        assert_eq!(snapshot.step("fetch").unwrap().status, ExecutionStatus::Started);

        step.status = ExecutionStatus::Completed;
        step.outputs.value = Some(json!([1, 2]));
        let snapshot = store.upsert_step(step).await.unwrap();
        assert_eq!(snapshot.steps.len(), 2);

        let fetch = snapshot.step("fetch").unwrap();
        assert_eq!(fetch.status, ExecutionStatus::Completed);
        assert_eq!(fetch.outputs.value, Some(json!([1, 2])));
        assert_eq!(fetch.inputs, json!({"url": "x"}).as_object().cloned());
        assert!(fetch.updated_at.is_some());
        assert_eq!(snapshot, store.get("exec-1").await.unwrap());
    }

    pub async fn missing_execution_is_reported(store: &dyn ExecutionStore) {
        let step = WorkflowExecutionStep::new("ghost", "fetch", ExecutionStatus::Started);
        assert!(matches!(
            store.upsert_step(step).await.unwrap_err(),
            StoreError::ExecutionNotFound(_)
        ));
        assert!(matches!(
            store.update_status("ghost", ExecutionStatus::Completed).await.unwrap_err(),
            StoreError::ExecutionNotFound(_)
        ));
        assert!(matches!(
            store.get("ghost").await.unwrap_err(),
            StoreError::ExecutionNotFound(_)
        ));
    }

    pub async fn status_transitions_stamp_finish(store: &dyn ExecutionStore) {
        store.add(execution("exec-1")).await.unwrap();

        store.update_status("exec-1", ExecutionStatus::Started).await.unwrap();
        let fetched = store.get("exec-1").await.unwrap();
        assert!(fetched.finished_at.is_none());
        assert!(fetched.updated_at.is_some());

        store.update_status("exec-1", ExecutionStatus::Errored).await.unwrap();
        let fetched = store.get("exec-1").await.unwrap();
        assert_eq!(fetched.status, ExecutionStatus::Errored);
        assert!(fetched.finished_at.is_some());
    }

    pub async fn unfinished_pages_by_id(store: &dyn ExecutionStore) {
        for id in ["exec-c", "exec-a", "exec-d", "exec-b"] {
            store.add(execution(id)).await.unwrap();
        }
        store.update_status("exec-b", ExecutionStatus::Completed).await.unwrap();

        let first = store.get_unfinished(0, 2).await.unwrap();
        let ids: Vec<_> = first.iter().map(|e| e.execution_id.as_str()).collect();
        assert_eq!(ids, vec!["exec-a", "exec-c"]);
        assert_eq!(first[0].steps.len(), 1);

        let rest = store.get_unfinished(2, 10).await.unwrap();
        let ids: Vec<_> = rest.iter().map(|e| e.execution_id.as_str()).collect();
        assert_eq!(ids, vec!["exec-d"]);

        assert!(store.get_unfinished(3, 10).await.unwrap().is_empty());
    }
}
