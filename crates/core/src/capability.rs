//! The contract between the engine and pluggable capabilities.

use crate::error::CapabilityError;
use crate::queue::QueueSender;
use crate::types::{CapabilityType, Value, ValueMap};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Static description of a capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityInfo {
    pub id: String,
    pub capability_type: CapabilityType,
    pub description: String,
    /// Runs on this node rather than on a remote DON
    pub is_local: bool,
}

/// Identity of a peer in a DON
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A replicated set of nodes running the same workflows
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Don {
    pub id: u32,
    pub config_version: u32,
    pub members: Vec<PeerId>,
}

/// The node this engine runs on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub peer_id: PeerId,
    pub workflow_don: Don,
}

impl Node {
    /// Index of this node in its DON's member list
    pub fn position(&self) -> Option<usize> {
        self.workflow_don
            .members
            .iter()
            .position(|member| member == &self.peer_id)
    }
}

/// Metadata attached to every capability request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub workflow_id: String,
    pub workflow_execution_id: String,
    pub workflow_owner: String,
    pub workflow_name: String,
    pub workflow_don_id: u32,
    pub workflow_don_config_version: u32,
    pub reference_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRequest {
    pub metadata: RequestMetadata,
    pub inputs: ValueMap,
    pub config: ValueMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityResponse {
    pub value: Value,
}

/// Binds or unbinds an executable capability to a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRegistration {
    pub workflow_id: String,
    pub config: ValueMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRegistrationRequest {
    /// Workflow-scoped id of this trigger, see [`trigger_id`]
    pub trigger_id: String,
    pub metadata: RequestMetadata,
    pub config: ValueMap,
}

/// An event emitted by a trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub trigger_type: String,
    /// Unique per event; identical on every replica observing the event
    pub id: String,
    pub outputs: Value,
}

/// What a trigger pushes into the engine's queue
pub type TriggerResponse = Result<TriggerEvent, CapabilityError>;

/// Workflow-scoped id of the `index`-th trigger of a workflow
pub fn trigger_id(workflow_id: &str, index: usize) -> String {
    format!("wf_{}_trigger_{}", workflow_id, index)
}

pub trait Capability: Send + Sync {
    fn info(&self) -> CapabilityInfo;
}

/// Actions, consensus and targets all execute through this entry point
#[async_trait]
pub trait ExecutableCapability: Capability {
    async fn execute(&self, request: CapabilityRequest) -> Result<CapabilityResponse, CapabilityError>;

    async fn register_to_workflow(&self, _request: WorkflowRegistration) -> Result<(), CapabilityError> {
        Ok(())
    }

    async fn unregister_from_workflow(
        &self,
        _request: WorkflowRegistration,
    ) -> Result<(), CapabilityError> {
        Ok(())
    }
}

#[async_trait]
pub trait TriggerCapability: Capability {
    /// Start emitting events for `request` into `events`
    async fn register_trigger(
        &self,
        request: TriggerRegistrationRequest,
        events: QueueSender<TriggerResponse>,
    ) -> Result<(), CapabilityError>;

    async fn unregister_trigger(&self, request: TriggerRegistrationRequest) -> Result<(), CapabilityError>;
}

/// A registered capability, one variant per kind
#[derive(Clone)]
pub enum CapabilityHandle {
    Trigger(Arc<dyn TriggerCapability>),
    Action(Arc<dyn ExecutableCapability>),
    Consensus(Arc<dyn ExecutableCapability>),
    Target(Arc<dyn ExecutableCapability>),
}

impl CapabilityHandle {
    pub fn capability_type(&self) -> CapabilityType {
        match self {
            CapabilityHandle::Trigger(_) => CapabilityType::Trigger,
            CapabilityHandle::Action(_) => CapabilityType::Action,
            CapabilityHandle::Consensus(_) => CapabilityType::Consensus,
            CapabilityHandle::Target(_) => CapabilityType::Target,
        }
    }

    pub fn info(&self) -> CapabilityInfo {
        match self {
            CapabilityHandle::Trigger(c) => c.info(),
            CapabilityHandle::Action(c) | CapabilityHandle::Consensus(c) | CapabilityHandle::Target(c) => {
                c.info()
            }
        }
    }

    /// The uniform execute entry point of non-trigger capabilities
    pub fn executable(&self) -> Option<Arc<dyn ExecutableCapability>> {
        match self {
            CapabilityHandle::Trigger(_) => None,
            CapabilityHandle::Action(c) | CapabilityHandle::Consensus(c) | CapabilityHandle::Target(c) => {
                Some(c.clone())
            }
        }
    }
}

/// Lookup of capabilities by id
#[async_trait]
pub trait CapabilityRegistry: Send + Sync {
    async fn get(&self, id: &str) -> Result<CapabilityHandle, CapabilityError>;

    async fn local_node(&self) -> Result<Node, CapabilityError>;

    /// Registry-side default config for a capability, overriding step config
    async fn config_for_capability(&self, _id: &str) -> Option<ValueMap> {
        None
    }

    async fn get_executable(&self, id: &str) -> Result<Arc<dyn ExecutableCapability>, CapabilityError> {
        let handle = self.get(id).await?;
        handle.executable().ok_or_else(|| CapabilityError::WrongType {
            id: id.to_string(),
            expected: "executable capability".to_string(),
            actual: handle.capability_type().to_string(),
        })
    }

    async fn get_trigger(&self, id: &str) -> Result<Arc<dyn TriggerCapability>, CapabilityError> {
        match self.get(id).await? {
            CapabilityHandle::Trigger(trigger) => Ok(trigger),
            other => Err(CapabilityError::WrongType {
                id: id.to_string(),
                expected: CapabilityType::Trigger.to_string(),
                actual: other.capability_type().to_string(),
            }),
        }
    }
}

/// In-process registry
pub struct LocalRegistry {
    node: Node,
    capabilities: RwLock<HashMap<String, CapabilityHandle>>,
    default_configs: RwLock<HashMap<String, ValueMap>>,
}

impl LocalRegistry {
    pub fn new(node: Node) -> Self {
        Self {
            node,
            capabilities: RwLock::new(HashMap::new()),
            default_configs: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add(&self, handle: CapabilityHandle) {
        let id = handle.info().id;
        tracing::debug!(capability_id = %id, "registering capability");
        self.capabilities.write().await.insert(id, handle);
    }

    pub async fn set_default_config(&self, id: impl Into<String>, config: ValueMap) {
        self.default_configs.write().await.insert(id.into(), config);
    }
}

#[async_trait]
impl CapabilityRegistry for LocalRegistry {
    async fn get(&self, id: &str) -> Result<CapabilityHandle, CapabilityError> {
        self.capabilities
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CapabilityError::NotFound(id.to_string()))
    }

    async fn local_node(&self) -> Result<Node, CapabilityError> {
        Ok(self.node.clone())
    }

    async fn config_for_capability(&self, id: &str) -> Option<ValueMap> {
        self.default_configs.read().await.get(id).cloned()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn test_registry_typed_lookup() {
        let registry = LocalRegistry::new(single_node());
        registry
            .add(CapabilityHandle::Trigger(FakeTrigger::new("cron@1.0.0")))
            .await;
        registry
            .add(CapabilityHandle::Action(FakeCapability::echo(
                "echo@1.0.0",
                CapabilityType::Action,
            )))
            .await;

        assert!(registry.get_trigger("cron@1.0.0").await.is_ok());
        assert!(registry.get_executable("echo@1.0.0").await.is_ok());

        let err = registry.get_executable("cron@1.0.0").await.err().unwrap();
        assert!(matches!(err, CapabilityError::WrongType { .. }));

        let err = registry.get_trigger("echo@1.0.0").await.err().unwrap();
        assert!(matches!(err, CapabilityError::WrongType { .. }));

        let err = registry.get("missing@1.0.0").await.err().unwrap();
        assert_eq!(err, CapabilityError::NotFound("missing@1.0.0".into()));
    }

    #[test]
    fn test_node_position() {
        let mut node = single_node();
        node.workflow_don.members.insert(0, PeerId("peer-x".into()));
        assert_eq!(node.position(), Some(1));

        node.peer_id = PeerId("stranger".into());
        assert_eq!(node.position(), None);
    }

    #[test]
    fn test_trigger_id_format() {
        assert_eq!(trigger_id("abc", 2), "wf_abc_trigger_2");
    }
}
