use std::sync::Arc;
use tracing::info;
use vmcloud_common::{DiskToolClient, GuestCustomizeClient, Result, Store};

use crate::config::CloudConfig;
use crate::connection::{ConnectionManager, Connector};
use crate::customize::VirtCustomize;
use crate::disk_tool::{DiskTools, QemuImg};
use crate::download::{DownloadManager, Fetcher, HttpFetcher, TaskRunner, TokioRunner};
use crate::image::ImageService;
use crate::instance::InstanceManager;
use crate::keypair::KeyPairService;
use crate::password::PasswordResetCoordinator;
use crate::persistence::{MemoryStore, Repository};
use crate::provisioning::ProvisioningEngine;
use crate::snapshot::SnapshotService;
use crate::template::TemplateService;

/// External collaborators the control plane is built on.
pub struct Collaborators {
    pub connector: Arc<dyn Connector>,
    pub disk_tool: Arc<dyn DiskToolClient>,
    pub customize: Arc<dyn GuestCustomizeClient>,
    pub store: Arc<dyn Store>,
    pub fetcher: Arc<dyn Fetcher>,
    pub runner: Arc<dyn TaskRunner>,
}

impl Collaborators {
    /// Command-line tools from the config, an in-memory store, HTTP downloads on tokio.
    pub fn with_defaults(connector: Arc<dyn Connector>, config: &CloudConfig) -> Self {
        Self {
            connector,
            disk_tool: Arc::new(QemuImg::new(config.qemu_img_bin.clone())),
            customize: Arc::new(VirtCustomize::new(config.virt_customize_bin.clone())),
            store: Arc::new(MemoryStore::new()),
            fetcher: Arc::new(HttpFetcher::new()),
            runner: Arc::new(TokioRunner),
        }
    }
}

/// Every service of the control plane, wired over one set of collaborators.
#[derive(Clone)]
pub struct CloudContext {
    pub config: Arc<CloudConfig>,
    pub connections: Arc<ConnectionManager>,
    pub provisioning: Arc<ProvisioningEngine>,
    pub instances: Arc<InstanceManager>,
    pub downloads: DownloadManager,
    pub passwords: Arc<PasswordResetCoordinator>,
    pub images: Arc<ImageService>,
    pub snapshots: Arc<SnapshotService>,
    pub templates: Arc<TemplateService>,
    pub key_pairs: Arc<KeyPairService>,
}

impl CloudContext {
    pub fn new(config: CloudConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let store = collaborators.store;

        let connections = Arc::new(ConnectionManager::new(
            collaborators.connector,
            config.nodes.clone(),
        ));
        let disk_tools = DiskTools::new(collaborators.disk_tool, config.qemu_img_bin.clone());

        let provisioning = Arc::new(ProvisioningEngine::new(
            config.clone(),
            connections.clone(),
            disk_tools.clone(),
            Repository::new(store.clone()),
            Repository::new(store.clone()),
            Repository::new(store.clone()),
        ));
        let instances = Arc::new(InstanceManager::new(
            config.clone(),
            connections.clone(),
            provisioning.clone(),
            Repository::new(store.clone()),
            Repository::new(store.clone()),
        ));
        let downloads = DownloadManager::new(collaborators.runner, collaborators.fetcher);
        let passwords = Arc::new(PasswordResetCoordinator::new(
            connections.clone(),
            instances.clone(),
            collaborators.customize,
            config.virt_customize_bin.clone(),
        ));
        let images = Arc::new(ImageService::new(
            config.clone(),
            connections.clone(),
            disk_tools.clone(),
            Repository::new(store.clone()),
            Repository::new(store.clone()),
        ));
        let snapshots = Arc::new(SnapshotService::new(
            config.clone(),
            connections.clone(),
            disk_tools,
            Repository::new(store.clone()),
            Repository::new(store.clone()),
        ));
        let templates = Arc::new(TemplateService::new(
            config.clone(),
            connections.clone(),
            downloads.clone(),
            Repository::new(store.clone()),
        ));
        let key_pairs = Arc::new(KeyPairService::new(Repository::new(store)));

        info!(
            nodes = config.nodes.len(),
            default_node = %config.default_node,
            "Control plane context ready"
        );
        Ok(Self {
            config,
            connections,
            provisioning,
            instances,
            downloads,
            passwords,
            images,
            snapshots,
            templates,
            key_pairs,
        })
    }

    /// Background cleanup of finished download tasks, using the configured TTL.
    pub fn spawn_download_janitor(&self) -> tokio::task::JoinHandle<()> {
        let ttl = self.config.download_task_ttl();
        let interval = (ttl / 4).max(std::time::Duration::from_secs(60));
        self.downloads.spawn_janitor(interval, ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeConnector;
    use vmcloud_common::CloudError;

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = CloudConfig {
            default_node: "ghost".to_string(),
            ..CloudConfig::default()
        };
        let collaborators = Collaborators::with_defaults(Arc::new(FakeConnector::new()), &config);
        assert!(matches!(
            CloudContext::new(config, collaborators).err(),
            Some(CloudError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_default_context_starts_empty() {
        let config = CloudConfig::default();
        let collaborators = Collaborators::with_defaults(Arc::new(FakeConnector::new()), &config);
        let context = CloudContext::new(config, collaborators).unwrap();

        assert_eq!(context.connections.cached(), 0);
        assert!(context.instances.describe_instances(&[], false).await.unwrap().is_empty());
        assert!(context.downloads.list_tasks().await.is_empty());
    }
}
