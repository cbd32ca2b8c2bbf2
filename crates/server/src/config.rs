use crate::capabilities::{LogTarget, WebhookTrigger};
use anyhow::{Context, Result};
use capflow_core::capability::{CapabilityHandle, Don, LocalRegistry, Node, PeerId};
use capflow_core::config::EngineConfig;
use capflow_core::metrics::MetricsCollector;
use capflow_core::storage::{ExecutionStore, RedbExecutionStore};
use capflow_core::workflow::{Engine, EngineParams};
use capflow_core::WorkflowSpec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub node: NodeSettings,

    #[serde(default)]
    pub workflows: Vec<WorkflowEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_index_file")]
    pub index_file: String,
}

fn default_index_file() -> String {
    "executions.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            index_file: default_index_file(),
        }
    }
}

/// Identity of this node within its DON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    #[serde(default = "default_peer_id")]
    pub peer_id: String,

    #[serde(default = "default_don_id")]
    pub don_id: u32,

    #[serde(default = "default_don_id")]
    pub don_config_version: u32,

    /// Every member of the DON, this node included. Empty means a DON of one.
    #[serde(default)]
    pub don_members: Vec<String>,
}

fn default_peer_id() -> String {
    "peer-0".to_string()
}

fn default_don_id() -> u32 {
    1
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            peer_id: default_peer_id(),
            don_id: default_don_id(),
            don_config_version: default_don_id(),
            don_members: Vec::new(),
        }
    }
}

impl NodeSettings {
    pub fn to_node(&self) -> Node {
        let members = if self.don_members.is_empty() {
            vec![PeerId(self.peer_id.clone())]
        } else {
            self.don_members.iter().cloned().map(PeerId).collect()
        };

        Node {
            peer_id: PeerId(self.peer_id.clone()),
            workflow_don: Don {
                id: self.don_id,
                config_version: self.don_config_version,
                members,
            },
        }
    }
}

/// A workflow hosted by this node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEntry {
    pub id: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub name: String,
    /// Path to the JSON workflow spec
    pub spec: PathBuf,
}

impl WorkflowEntry {
    pub fn load_spec(&self) -> Result<WorkflowSpec> {
        let content = std::fs::read_to_string(&self.spec)
            .with_context(|| format!("Failed to read workflow spec {}", self.spec.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse workflow spec {}", self.spec.display()))
    }
}

impl NodeConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self {
                data_dir: data_dir.clone(),
                storage: Default::default(),
                engine: Default::default(),
                node: Default::default(),
                workflows: Vec::new(),
            }
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    /// Path of the execution store
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.index_file)
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ExecutionStore>,
    pub metrics: Arc<MetricsCollector>,
    pub webhooks: Arc<WebhookTrigger>,
    pub engines: Arc<HashMap<String, Arc<Engine>>>,
}

impl AppState {
    /// Open storage, load every configured workflow and start its engine
    pub async fn new(config: &NodeConfig) -> Result<Self> {
        let store = Arc::new(
            RedbExecutionStore::open(config.index_path())
                .context("Failed to open execution store")?,
        );

        let mut workflows = Vec::with_capacity(config.workflows.len());
        for entry in &config.workflows {
            workflows.push((entry.clone(), entry.load_spec()?));
        }

        Self::build(config.node.to_node(), store, &config.engine, workflows).await
    }

    pub async fn build(
        node: Node,
        store: Arc<dyn ExecutionStore>,
        engine_config: &EngineConfig,
        workflows: Vec<(WorkflowEntry, WorkflowSpec)>,
    ) -> Result<Self> {
        let metrics = Arc::new(MetricsCollector::new());
        let webhooks = Arc::new(WebhookTrigger::new());

        let registry = Arc::new(LocalRegistry::new(node));
        registry.add(CapabilityHandle::Trigger(webhooks.clone())).await;
        registry
            .add(CapabilityHandle::Target(Arc::new(LogTarget)))
            .await;

        let mut engines = HashMap::new();
        for (entry, spec) in workflows {
            let engine = Engine::new(EngineParams {
                workflow_id: entry.id.clone(),
                workflow_owner: entry.owner.clone(),
                workflow_name: entry.name.clone(),
                spec,
                registry: registry.clone(),
                store: store.clone(),
                metrics: metrics.clone(),
                config: engine_config.clone(),
            })
            .with_context(|| format!("Invalid workflow {}", entry.id))?;

            engine
                .start()
                .await
                .with_context(|| format!("Failed to start workflow {}", entry.id))?;
            tracing::info!("Workflow {} started", entry.id);

            engines.insert(entry.id, Arc::new(engine));
        }

        Ok(Self {
            store,
            metrics,
            webhooks,
            engines: Arc::new(engines),
        })
    }

    /// Close every engine
    pub async fn shutdown(&self) {
        for (id, engine) in self.engines.iter() {
            if let Err(err) = engine.close().await {
                tracing::warn!("Failed to close workflow {}: {}", id, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_node_config() {
        let config: NodeConfig = toml::from_str(
            r#"
            [engine]
            max_concurrent_executions = 4
            transmission_secret = "000102030405060708090a0b0c0d0e0f"

            [node]
            peer_id = "peer-b"
            don_members = ["peer-a", "peer-b", "peer-c"]

            [[workflows]]
            id = "price-feed"
            owner = "0xabc"
            spec = "workflows/price-feed.json"
            "#,
        )
        .unwrap();

        assert_eq!(config.storage.index_file, "executions.redb");
        assert_eq!(config.engine.max_concurrent_executions, 4);
        assert_eq!(config.engine.max_execution_duration_secs, 600);
        assert_eq!(config.workflows[0].id, "price-feed");

        let node = config.node.to_node();
        assert_eq!(node.position(), Some(1));
        assert_eq!(node.workflow_don.members.len(), 3);
    }

    #[test]
    fn test_single_member_don_by_default() {
        let node = NodeSettings::default().to_node();
        assert_eq!(node.workflow_don.members, vec![PeerId("peer-0".into())]);
        assert_eq!(node.position(), Some(0));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = NodeConfig::load(&dir.path().join("missing.toml"), dir.path().join("data")).unwrap();
        assert!(config.workflows.is_empty());
        assert_eq!(config.index_path(), dir.path().join("data").join("executions.redb"));
    }
}
