use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};
use vmcloud_common::{CloudError, HypervisorClient, Result};

use crate::config::NodeConfig;

/// Factory for hypervisor connections; implemented by the binding.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, node: &NodeConfig) -> Result<Arc<dyn HypervisorClient>>;
}

/// Lazily-populated per-node connection cache. Connections are reused and never
/// closed here.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    nodes: Vec<NodeConfig>,
    connections: DashMap<String, Arc<dyn HypervisorClient>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, nodes: Vec<NodeConfig>) -> Self {
        Self {
            connector,
            nodes,
            connections: DashMap::new(),
        }
    }

    pub async fn get(&self, node: &str) -> Result<Arc<dyn HypervisorClient>> {
        if let Some(conn) = self.connections.get(node) {
            return Ok(conn.clone());
        }

        let config = self
            .nodes
            .iter()
            .find(|n| n.name == node)
            .ok_or_else(|| CloudError::NotFound(format!("node {node}")))?;

        // Connect without holding any map shard.
        debug!(node, uri = %config.uri, "Opening hypervisor connection");
        let conn = self.connector.connect(config).await?;

        let entry = self
            .connections
            .entry(node.to_string())
            .or_insert_with(|| {
                info!(node, remote = config.is_remote(), "Hypervisor connection cached");
                conn
            });
        Ok(entry.value().clone())
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.name.clone()).collect()
    }

    pub fn cached(&self) -> usize {
        self.connections.len()
    }
}
