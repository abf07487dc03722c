//! OS templates backed by pool volumes, optionally downloaded first.

use chrono::Utc;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use vmcloud_common::{
    id_prefix, new_id, CloudError, DestinationKey, DownloadTask, Filter, HypervisorClient,
    Result, Template, TemplateStatus,
};

use crate::config::CloudConfig;
use crate::connection::ConnectionManager;
use crate::download::{CompletionCallback, DownloadManager};
use crate::persistence::Repository;
use crate::provisioning::require_pool;

#[derive(Debug, Clone, Default)]
pub struct RegisterTemplateRequest {
    pub name: String,
    pub description: Option<String>,
    pub node: Option<String>,
    pub pool: Option<String>,
    pub volume_name: String,
    /// Fetched into the pool when the volume does not exist yet.
    pub source_url: Option<String>,
    pub os_type: String,
    pub os_version: Option<String>,
    pub arch: Option<String>,
    pub features: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Default)]
pub struct TemplateUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub os_type: Option<String>,
    pub os_version: Option<String>,
    pub arch: Option<String>,
    pub features: Option<BTreeMap<String, bool>>,
}

pub struct TemplateService {
    config: Arc<CloudConfig>,
    connections: Arc<ConnectionManager>,
    downloads: DownloadManager,
    templates: Repository<Template>,
    // Serializes read-modify-write of template records against download callbacks.
    writes: Arc<Mutex<()>>,
}

impl TemplateService {
    pub fn new(
        config: Arc<CloudConfig>,
        connections: Arc<ConnectionManager>,
        downloads: DownloadManager,
        templates: Repository<Template>,
    ) -> Self {
        Self {
            config,
            connections,
            downloads,
            templates,
            writes: Arc::new(Mutex::new(())),
        }
    }

    /// Synchronous when the volume is already in the pool; otherwise the template
    /// stays pending until the download finishes.
    #[instrument(skip(self, request), fields(name = %request.name, volume = %request.volume_name))]
    pub async fn register_template(&self, request: RegisterTemplateRequest) -> Result<Template> {
        if request.name.trim().is_empty() || request.volume_name.trim().is_empty() {
            return Err(CloudError::InvalidArgument(
                "template name and volume name are required".to_string(),
            ));
        }
        let node = request
            .node
            .clone()
            .unwrap_or_else(|| self.config.default_node.clone());
        let pool = request
            .pool
            .clone()
            .unwrap_or_else(|| self.config.default_pool.clone());
        let hypervisor = self.connections.get(&node).await?;
        require_pool(hypervisor.as_ref(), &pool).await?;

        let now = Utc::now();
        let mut template = Template {
            id: new_id(id_prefix::TEMPLATE),
            name: request.name,
            description: request.description,
            node: node.clone(),
            pool: pool.clone(),
            volume_name: request.volume_name.clone(),
            os_type: request.os_type,
            os_version: request.os_version,
            arch: request.arch.unwrap_or_else(|| "x86_64".to_string()),
            features: request.features,
            size_gb: 0,
            status: TemplateStatus::Pending,
            source_url: request.source_url.clone(),
            download_task_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        };

        match hypervisor.get_volume(&pool, &request.volume_name).await {
            Ok(info) => {
                template.size_gb = info.capacity_gb();
                template.status = TemplateStatus::Available;
                self.templates.save(&template).await?;
                info!(template_id = %template.id, "Registered template");
                return Ok(template);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let url = request.source_url.ok_or_else(|| {
            CloudError::NotFound(format!(
                "volume {} in pool {pool} and no source URL given",
                request.volume_name
            ))
        })?;
        self.templates.save(&template).await?;

        let destination = DestinationKey::new(&node, &pool, &request.volume_name);
        let callback = self.completion(template.id.clone(), hypervisor.clone());
        let started = self
            .downloads
            .start_download(hypervisor, destination, &url, Some(callback))
            .await;
        let (task, is_new) = match started {
            Ok(started) => started,
            Err(e) => {
                warn!(template_id = %template.id, error = %e, "Could not start template download");
                template.status = TemplateStatus::Failed;
                template.error = Some(e.to_string());
                if let Err(save_err) = self.templates.save(&template).await {
                    warn!(template_id = %template.id, error = %save_err, "Failed to persist template status");
                }
                return Err(e);
            }
        };
        debug!(template_id = %template.id, task_id = %task.id, is_new, "Template download scheduled");

        let _guard = self.writes.lock().await;
        let mut current = self.templates.get(&template.id).await?;
        if current.download_task_id.is_none() {
            current.download_task_id = Some(task.id);
            current.updated_at = Utc::now();
            self.templates.save(&current).await?;
        }
        Ok(current)
    }

    fn completion(&self, template_id: String, hypervisor: Arc<dyn HypervisorClient>) -> CompletionCallback {
        let templates = self.templates.clone();
        let writes = self.writes.clone();
        Box::new(move |task: DownloadTask, failure: Option<Arc<CloudError>>| {
            async move {
                let _guard = writes.lock().await;
                let mut template = match templates.find(&template_id).await {
                    Ok(Some(t)) => t,
                    Ok(None) => {
                        debug!(%template_id, "Template removed before download finished");
                        return;
                    }
                    Err(e) => {
                        warn!(%template_id, error = %e, "Failed to load template after download");
                        return;
                    }
                };

                template.download_task_id = Some(task.id.clone());
                template.updated_at = Utc::now();
                let size = match failure {
                    None => hypervisor
                        .get_volume(&template.pool, &template.volume_name)
                        .await
                        .map(|info| info.capacity_gb()),
                    Some(e) => Err(CloudError::ToolFailure(e.to_string())),
                };
                match size {
                    Ok(size_gb) => {
                        template.size_gb = size_gb;
                        template.status = TemplateStatus::Available;
                        template.error = None;
                        info!(%template_id, size_gb, "Template available");
                    }
                    Err(e) => {
                        template.status = TemplateStatus::Failed;
                        template.error = Some(e.to_string());
                        warn!(%template_id, error = %e, "Template download failed");
                    }
                }
                if let Err(e) = templates.save(&template).await {
                    warn!(%template_id, error = %e, "Failed to persist template status");
                }
            }
            .boxed()
        })
    }

    #[instrument(skip(self, update))]
    pub async fn update_template(&self, template_id: &str, update: TemplateUpdate) -> Result<Template> {
        let _guard = self.writes.lock().await;
        let mut template = self.templates.get(template_id).await?;
        if let Some(name) = update.name {
            if name.trim().is_empty() {
                return Err(CloudError::InvalidArgument("template name is required".to_string()));
            }
            template.name = name;
        }
        if let Some(description) = update.description {
            template.description = Some(description);
        }
        if let Some(os_type) = update.os_type {
            template.os_type = os_type;
        }
        if let Some(os_version) = update.os_version {
            template.os_version = Some(os_version);
        }
        if let Some(arch) = update.arch {
            template.arch = arch;
        }
        if let Some(features) = update.features {
            template.features = features;
        }
        template.updated_at = Utc::now();
        self.templates.save(&template).await?;
        Ok(template)
    }

    /// Remove the template, and its backing volume when `delete_volume` is set.
    #[instrument(skip(self))]
    pub async fn delete_template(&self, template_id: &str, delete_volume: bool) -> Result<()> {
        let template = self.templates.get(template_id).await?;
        if delete_volume {
            let hypervisor = self.connections.get(&template.node).await?;
            match hypervisor
                .delete_volume(&template.pool, &template.volume_name)
                .await
            {
                Err(e) if !e.is_not_found() => return Err(e),
                _ => {}
            }
        }
        self.templates.soft_delete(template_id).await?;
        info!(%template_id, delete_volume, "Deleted template");
        Ok(())
    }

    pub async fn get_template(&self, template_id: &str) -> Result<Template> {
        self.templates.get(template_id).await
    }

    pub async fn describe_templates(&self, filters: &[Filter]) -> Result<Vec<Template>> {
        self.templates.list(filters).await
    }
}
