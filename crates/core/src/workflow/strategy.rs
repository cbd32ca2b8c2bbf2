use super::transmission::{self, TransmissionConfig, KEY_LEN};
use crate::capability::{CapabilityRequest, ExecutableCapability, Node};
use crate::error::StrategyError;
use crate::types::Value;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Decides how and when a capability invocation actually fires.
///
/// `Ok(None)` means this replica was not scheduled to transmit and the
/// invocation was skipped.
#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    async fn apply(
        &self,
        cancel: &CancellationToken,
        capability: &dyn ExecutableCapability,
        request: CapabilityRequest,
    ) -> Result<Option<Value>, StrategyError>;
}

/// Invoke right away and wait for the single response
#[derive(Debug, Clone, Copy, Default)]
pub struct Immediate;

#[async_trait]
impl ExecutionStrategy for Immediate {
    async fn apply(
        &self,
        _cancel: &CancellationToken,
        capability: &dyn ExecutableCapability,
        request: CapabilityRequest,
    ) -> Result<Option<Value>, StrategyError> {
        let response = capability.execute(request).await?;
        let value = match response.value {
            Value::Array(mut items) if items.len() == 1 => items.swap_remove(0),
            other => other,
        };
        Ok(Some(value))
    }
}

/// Wait for this replica's slot in the run's transmission schedule, then
/// fall through to [`Immediate`].
#[derive(Debug, Clone)]
pub struct Scheduled {
    secret: [u8; KEY_LEN],
    node: Node,
}

impl Scheduled {
    pub fn new(secret: [u8; KEY_LEN], node: Node) -> Self {
        Self { secret, node }
    }

    /// Delay this replica waits before transmitting for `request`
    pub fn delay(&self, request: &CapabilityRequest) -> Result<Option<std::time::Duration>, StrategyError> {
        let config = TransmissionConfig::from_config(&request.config)?;
        let position = self.node.position().ok_or(StrategyError::NotAMember)?;
        let n = self.node.workflow_don.members.len();

        let key = transmission::schedule_key(
            &self.secret,
            &request.metadata.workflow_id,
            &request.metadata.workflow_execution_id,
        );
        let delays = transmission::delays(n, key, &config)?;
        Ok(delays.get(position).copied().flatten())
    }
}

#[async_trait]
impl ExecutionStrategy for Scheduled {
    async fn apply(
        &self,
        cancel: &CancellationToken,
        capability: &dyn ExecutableCapability,
        request: CapabilityRequest,
    ) -> Result<Option<Value>, StrategyError> {
        let Some(delay) = self.delay(&request)? else {
            tracing::debug!(
                execution_id = %request.metadata.workflow_execution_id,
                step_ref = %request.metadata.reference_id,
                peer_id = %self.node.peer_id,
                "replica not part of transmission schedule, skipping"
            );
            return Ok(None);
        };

        tracing::debug!(
            execution_id = %request.metadata.workflow_execution_id,
            step_ref = %request.metadata.reference_id,
            delay_ms = delay.as_millis() as u64,
            "waiting for transmission slot"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(StrategyError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }

        Immediate.apply(cancel, capability, request).await
    }
}
