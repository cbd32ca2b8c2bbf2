use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Structured values exchanged between steps and capabilities
pub type Value = serde_json::Value;

/// Map of named values (step inputs, step config, capability config)
pub type ValueMap = serde_json::Map<String, Value>;

/// Reserved reference of the synthetic vertex standing in for whichever trigger fired
pub const TRIGGER_REF: &str = "trigger";

/// Kind of capability a step invokes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityType {
    Trigger,
    Action,
    Consensus,
    Target,
}

impl std::fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CapabilityType::Trigger => "trigger",
            CapabilityType::Action => "action",
            CapabilityType::Consensus => "consensus",
            CapabilityType::Target => "target",
        };
        f.write_str(s)
    }
}

/// One declared unit of work in a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Capability identifier, including its version (e.g. `write-chain@1.0.0`)
    pub id: String,
    /// Unique name within the workflow; defaults to `id` when empty
    #[serde(rename = "ref", default)]
    pub reference: String,
    #[serde(default)]
    pub inputs: ValueMap,
    #[serde(default)]
    pub config: ValueMap,
    #[serde(default = "default_capability_type")]
    pub capability_type: CapabilityType,
}

fn default_capability_type() -> CapabilityType {
    CapabilityType::Action
}

impl StepDefinition {
    pub fn new(id: impl Into<String>, capability_type: CapabilityType) -> Self {
        Self {
            id: id.into(),
            reference: String::new(),
            inputs: ValueMap::new(),
            config: ValueMap::new(),
            capability_type,
        }
    }

    pub fn with_ref(mut self, reference: impl Into<String>) -> Self {
        self.reference = reference.into();
        self
    }

    pub fn with_inputs(mut self, inputs: Value) -> Self {
        if let Value::Object(map) = inputs {
            self.inputs = map;
        }
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        if let Value::Object(map) = config {
            self.config = map;
        }
        self
    }

    /// The effective reference: `ref` when set, `id` otherwise
    pub fn effective_ref(&self) -> &str {
        if self.reference.is_empty() {
            &self.id
        } else {
            &self.reference
        }
    }
}

/// A parsed workflow specification
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub triggers: Vec<StepDefinition>,
    #[serde(default)]
    pub actions: Vec<StepDefinition>,
    #[serde(default)]
    pub consensus: Vec<StepDefinition>,
    #[serde(default)]
    pub targets: Vec<StepDefinition>,
}

impl WorkflowSpec {
    /// All non-trigger steps in declaration order: actions, consensus, targets
    pub fn steps(&self) -> impl Iterator<Item = &StepDefinition> {
        self.actions
            .iter()
            .chain(self.consensus.iter())
            .chain(self.targets.iter())
    }
}

/// Status shared by executions and their steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Started,
    Errored,
    Timeout,
    Completed,
    CompletedEarlyExit,
}

impl ExecutionStatus {
    /// Terminal statuses are final; nothing transitions out of them
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Started)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Started => "started",
            ExecutionStatus::Errored => "errored",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::CompletedEarlyExit => "completed_early_exit",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recorded outcome of a step. Either side may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

/// Per-step record of an execution, unique by (execution_id, reference)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionStep {
    pub execution_id: String,
    #[serde(rename = "ref")]
    pub reference: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<ValueMap>,
    #[serde(default)]
    pub outputs: StepOutput,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl WorkflowExecutionStep {
    pub fn new(
        execution_id: impl Into<String>,
        reference: impl Into<String>,
        status: ExecutionStatus,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            reference: reference.into(),
            status,
            inputs: None,
            outputs: StepOutput::default(),
            updated_at: None,
        }
    }
}

/// One run of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub steps: BTreeMap<String, WorkflowExecutionStep>,
}

impl WorkflowExecution {
    pub fn new(execution_id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            workflow_id: workflow_id.into(),
            status: ExecutionStatus::Started,
            created_at: None,
            updated_at: None,
            finished_at: None,
            steps: BTreeMap::new(),
        }
    }

    pub fn step(&self, reference: &str) -> Option<&WorkflowExecutionStep> {
        self.steps.get(reference)
    }
}

/// Derive the execution id of a run from its workflow and the trigger event that started it.
///
/// Every replica receiving the same event computes the same id.
pub fn execution_id_for(workflow_id: &str, event_id: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(workflow_id.as_bytes());
    hasher.update(event_id.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_effective_ref_defaults_to_id() {
        let step = StepDefinition::new("write-chain@1.0.0", CapabilityType::Target);
        assert_eq!(step.effective_ref(), "write-chain@1.0.0");

        let step = step.with_ref("write");
        assert_eq!(step.effective_ref(), "write");
    }

    #[test]
    fn test_spec_deserializes_with_ref_key() {
        let spec: WorkflowSpec = serde_json::from_value(json!({
            "triggers": [{"id": "cron@1.0.0", "capability_type": "trigger"}],
            "actions": [{
                "id": "fetch@1.0.0",
                "ref": "fetch",
                "inputs": {"url": "$(trigger.outputs.url)"}
            }]
        }))
        .unwrap();

        assert_eq!(spec.triggers.len(), 1);
        assert_eq!(spec.actions[0].effective_ref(), "fetch");
        assert_eq!(spec.actions[0].capability_type, CapabilityType::Action);
        assert_eq!(spec.steps().count(), 1);
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_value(ExecutionStatus::CompletedEarlyExit).unwrap(),
            json!("completed_early_exit")
        );
        assert!(!ExecutionStatus::Started.is_terminal());
        assert!(ExecutionStatus::Timeout.is_terminal());
    }

    #[test]
    fn test_execution_id_is_deterministic() {
        let a = execution_id_for("wf-1", "event-7");
        let b = execution_id_for("wf-1", "event-7");
        let c = execution_id_for("wf-1", "event-8");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
