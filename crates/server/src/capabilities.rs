//! Capabilities built into the node.

use async_trait::async_trait;
use capflow_core::capability::{
    Capability, CapabilityInfo, CapabilityRequest, CapabilityResponse, ExecutableCapability, TriggerCapability,
    TriggerEvent, TriggerRegistrationRequest, TriggerResponse,
};
use capflow_core::error::CapabilityError;
use capflow_core::queue::QueueSender;
use capflow_core::{CapabilityType, Value};
use std::collections::HashMap;
use tokio::sync::RwLock;

pub const WEBHOOK_TRIGGER_ID: &str = "webhook-trigger@1.0.0";
pub const LOG_TARGET_ID: &str = "log-target@1.0.0";

/// Trigger fed by `POST /api/workflows/{workflow_id}/trigger`
#[derive(Default)]
pub struct WebhookTrigger {
    /// workflow id -> (trigger id, sink)
    subscribers: RwLock<HashMap<String, Vec<(String, QueueSender<TriggerResponse>)>>>,
}

impl WebhookTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an event to every trigger registered by `workflow_id`.
    ///
    /// Returns how many triggers received it.
    pub async fn deliver(&self, workflow_id: &str, event_id: &str, payload: Value) -> usize {
        let subscribers = self.subscribers.read().await;
        let Some(sinks) = subscribers.get(workflow_id) else {
            return 0;
        };

        let mut delivered = 0;
        for (trigger_id, sink) in sinks {
            let event = TriggerEvent {
                trigger_type: WEBHOOK_TRIGGER_ID.to_string(),
                id: event_id.to_string(),
                outputs: payload.clone(),
            };
            match sink.push(Ok(event)) {
                Ok(()) => delivered += 1,
                Err(_) => tracing::warn!("Trigger {} is no longer receiving events", trigger_id),
            }
        }
        delivered
    }
}

impl Capability for WebhookTrigger {
    fn info(&self) -> CapabilityInfo {
        CapabilityInfo {
            id: WEBHOOK_TRIGGER_ID.to_string(),
            capability_type: CapabilityType::Trigger,
            description: "Fires when a payload is posted to the node's webhook endpoint".to_string(),
            is_local: true,
        }
    }
}

#[async_trait]
impl TriggerCapability for WebhookTrigger {
    async fn register_trigger(
        &self,
        request: TriggerRegistrationRequest,
        events: QueueSender<TriggerResponse>,
    ) -> Result<(), CapabilityError> {
        tracing::debug!(
            "Registering webhook trigger {} for workflow {}",
            request.trigger_id,
            request.metadata.workflow_id
        );
        self.subscribers
            .write()
            .await
            .entry(request.metadata.workflow_id)
            .or_default()
            .push((request.trigger_id, events));
        Ok(())
    }

    async fn unregister_trigger(&self, request: TriggerRegistrationRequest) -> Result<(), CapabilityError> {
        let mut subscribers = self.subscribers.write().await;
        if let Some(sinks) = subscribers.get_mut(&request.metadata.workflow_id) {
            sinks.retain(|(id, _)| id != &request.trigger_id);
            if sinks.is_empty() {
                subscribers.remove(&request.metadata.workflow_id);
            }
        }
        Ok(())
    }
}

/// Local target that writes its inputs to the node log
pub struct LogTarget;

impl Capability for LogTarget {
    fn info(&self) -> CapabilityInfo {
        CapabilityInfo {
            id: LOG_TARGET_ID.to_string(),
            capability_type: CapabilityType::Target,
            description: "Logs its inputs".to_string(),
            is_local: true,
        }
    }
}

#[async_trait]
impl ExecutableCapability for LogTarget {
    async fn execute(&self, request: CapabilityRequest) -> Result<CapabilityResponse, CapabilityError> {
        let inputs = Value::Object(request.inputs);
        tracing::info!(
            workflow_id = %request.metadata.workflow_id,
            execution_id = %request.metadata.workflow_execution_id,
            step_ref = %request.metadata.reference_id,
            inputs = %inputs,
            "log target"
        );
        Ok(CapabilityResponse { value: inputs })
    }
}
