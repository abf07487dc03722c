use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use vmcloud_common::{
    id_prefix, new_id, CloudError, Filter, Image, Result, Volume, VolumeFormat, VolumeSpec,
};

use crate::config::CloudConfig;
use crate::connection::ConnectionManager;
use crate::disk_tool::DiskTools;
use crate::persistence::Repository;
use crate::provisioning::{require_pool, Rollback};

#[derive(Debug, Clone, Default)]
pub struct RegisterImageRequest {
    pub name: String,
    pub node: Option<String>,
    pub pool: Option<String>,
    /// Existing volume in the pool that holds the image bits.
    pub volume_name: String,
    pub description: Option<String>,
}

/// Immutable boot images.
pub struct ImageService {
    config: Arc<CloudConfig>,
    connections: Arc<ConnectionManager>,
    disk_tools: DiskTools,
    images: Repository<Image>,
    volumes: Repository<Volume>,
}

impl ImageService {
    pub fn new(
        config: Arc<CloudConfig>,
        connections: Arc<ConnectionManager>,
        disk_tools: DiskTools,
        images: Repository<Image>,
        volumes: Repository<Volume>,
    ) -> Self {
        Self {
            config,
            connections,
            disk_tools,
            images,
            volumes,
        }
    }

    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn register_image(&self, request: RegisterImageRequest) -> Result<Image> {
        if request.name.trim().is_empty() {
            return Err(CloudError::InvalidArgument("image name is required".to_string()));
        }
        let node = request.node.unwrap_or_else(|| self.config.default_node.clone());
        let pool = request.pool.unwrap_or_else(|| self.config.default_pool.clone());
        let hypervisor = self.connections.get(&node).await?;
        let info = hypervisor.get_volume(&pool, &request.volume_name).await?;

        let image = Image {
            id: new_id(id_prefix::IMAGE),
            name: request.name,
            node,
            pool,
            path: info.path.clone(),
            size_gb: info.capacity_gb(),
            format: info.format,
            description: request.description,
            created_at: Utc::now(),
        };
        self.images.save(&image).await?;
        info!(image_id = %image.id, size_gb = image.size_gb, "Registered image");
        Ok(image)
    }

    /// Full copy of a volume into a new image volume.
    #[instrument(skip(self, description))]
    pub async fn create_image_from_volume(
        &self,
        volume_id: &str,
        name: &str,
        description: Option<String>,
    ) -> Result<Image> {
        let volume = self.volumes.get(volume_id).await?;
        let hypervisor = self.connections.get(&volume.node).await?;
        let pool = require_pool(hypervisor.as_ref(), &self.config.default_pool).await?;

        let id = new_id(id_prefix::IMAGE);
        let format = VolumeFormat::Qcow2;
        let file = format.file_name(&id);
        let registered = hypervisor
            .create_volume(
                &pool.name,
                &VolumeSpec {
                    name: file.clone(),
                    capacity_gb: volume.size_gb,
                    format,
                },
            )
            .await?;
        let mut rollback = Rollback::new(hypervisor.clone());
        rollback.track(&pool.name, &file);

        let tool = self.disk_tools.for_node(&hypervisor);
        let converted = match tool
            .convert(volume.format, format, &volume.path, &registered.path)
            .await
        {
            Ok(()) => hypervisor.get_volume(&pool.name, &file).await,
            Err(e) => Err(e),
        };
        let info = match converted {
            Ok(info) => info,
            Err(e) => {
                rollback.run().await;
                return Err(e);
            }
        };

        let size_gb = info.capacity_gb().max(volume.size_gb);
        let image = Image {
            id,
            name: name.to_string(),
            node: volume.node.clone(),
            pool: pool.name,
            path: info.path,
            size_gb,
            format,
            description,
            created_at: Utc::now(),
        };
        if let Err(e) = self.images.save(&image).await {
            warn!(image_id = %image.id, error = %e, "Failed to persist image record");
        }
        info!(image_id = %image.id, %volume_id, "Created image from volume");
        Ok(image)
    }

    /// Forget the image. The file is only removed on request and only when no
    /// volume still uses it as a backing file.
    #[instrument(skip(self))]
    pub async fn deregister_image(&self, image_id: &str, delete_file: bool) -> Result<()> {
        let image = self.images.get(image_id).await?;
        if delete_file {
            let dependents = self
                .volumes
                .list(&[Filter::new("source_image_id", image_id)])
                .await?;
            if let Some(volume) = dependents.iter().find(|v| v.backing_file.is_some()) {
                return Err(CloudError::InvalidState(format!(
                    "image {image_id} backs volume {}",
                    volume.id
                )));
            }
            let hypervisor = self.connections.get(&image.node).await?;
            match hypervisor.delete_volume(&image.pool, &image.volume_name()).await {
                Err(e) if !e.is_not_found() => return Err(e),
                _ => {}
            }
        }
        self.images.soft_delete(image_id).await?;
        info!(%image_id, delete_file, "Deregistered image");
        Ok(())
    }

    pub async fn get_image(&self, image_id: &str) -> Result<Image> {
        self.images.get(image_id).await
    }

    pub async fn describe_images(&self, filters: &[Filter]) -> Result<Vec<Image>> {
        self.images.list(filters).await
    }
}
