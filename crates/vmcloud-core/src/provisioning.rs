//! Volume materialization: images and snapshots into ready block devices.

use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use vmcloud_common::{
    id_prefix, new_id, CloudError, DomainDisk, Filter, HypervisorClient, Image, Result, Snapshot,
    SnapshotState, StoragePoolInfo, Volume, VolumeFormat, VolumeInfo, VolumeSpec, VolumeState,
    GIB,
};

use crate::config::CloudConfig;
use crate::connection::ConnectionManager;
use crate::disk_tool::DiskTools;
use crate::persistence::Repository;

/// How a destination volume is produced from its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializeStrategy {
    /// Copy-on-write overlay on the source, grown afterwards when `resize_to` is set.
    Clone { resize_to: Option<u64> },
    /// Full block-level conversion; a backing-file overlay cannot be smaller than its source.
    Convert,
}

pub fn choose_strategy(source_gb: u64, target_gb: u64) -> MaterializeStrategy {
    if source_gb <= target_gb {
        MaterializeStrategy::Clone {
            resize_to: (target_gb > source_gb).then_some(target_gb),
        }
    } else {
        MaterializeStrategy::Convert
    }
}

/// First free virtio target after the boot disk.
pub fn allocate_device(used: &[String]) -> Result<String> {
    (b'b'..=b'z')
        .map(|c| format!("vd{}", c as char))
        .find(|candidate| !used.iter().any(|u| u == candidate))
        .ok_or_else(|| CloudError::InvalidState("no free device slots left".to_string()))
}

/// Compensating deletes for volumes registered during a multi-step operation.
pub(crate) struct Rollback {
    hypervisor: Arc<dyn HypervisorClient>,
    volumes: Vec<(String, String)>,
}

impl Rollback {
    pub(crate) fn new(hypervisor: Arc<dyn HypervisorClient>) -> Self {
        Self {
            hypervisor,
            volumes: Vec::new(),
        }
    }

    pub(crate) fn track(&mut self, pool: &str, name: &str) {
        self.volumes.push((pool.to_string(), name.to_string()));
    }

    /// Delete everything tracked, newest first. Already-missing volumes count as cleaned.
    pub(crate) async fn run(self) {
        for (pool, name) in self.volumes.into_iter().rev() {
            match self.hypervisor.delete_volume(&pool, &name).await {
                Ok(()) => debug!(%pool, %name, "Rolled back volume"),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(%pool, %name, error = %e, "Failed to roll back volume"),
            }
        }
    }
}

/// Source artifact of a materialization.
struct Source {
    node: String,
    path: PathBuf,
    format: VolumeFormat,
    size_gb: u64,
    image_id: Option<String>,
    snapshot_id: Option<String>,
}

impl From<&Image> for Source {
    fn from(image: &Image) -> Self {
        Self {
            node: image.node.clone(),
            path: image.path.clone(),
            format: image.format,
            size_gb: image.size_gb,
            image_id: Some(image.id.clone()),
            snapshot_id: None,
        }
    }
}

impl From<&Snapshot> for Source {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            node: snapshot.node.clone(),
            path: snapshot.path.clone(),
            format: snapshot.format,
            size_gb: snapshot.size_gb,
            image_id: None,
            snapshot_id: Some(snapshot.id.clone()),
        }
    }
}

pub struct ProvisioningEngine {
    config: Arc<CloudConfig>,
    connections: Arc<ConnectionManager>,
    disk_tools: DiskTools,
    volumes: Repository<Volume>,
    images: Repository<Image>,
    snapshots: Repository<Snapshot>,
}

impl ProvisioningEngine {
    pub fn new(
        config: Arc<CloudConfig>,
        connections: Arc<ConnectionManager>,
        disk_tools: DiskTools,
        volumes: Repository<Volume>,
        images: Repository<Image>,
        snapshots: Repository<Snapshot>,
    ) -> Self {
        Self {
            config,
            connections,
            disk_tools,
            volumes,
            images,
            snapshots,
        }
    }

    #[instrument(skip(self), fields(image_id = %image_id, size_gb))]
    pub async fn create_volume_from_image(&self, image_id: &str, size_gb: u64) -> Result<Volume> {
        let image = self
            .images
            .find(image_id)
            .await?
            .ok_or_else(|| CloudError::NotFound(format!("source image {image_id}")))?;
        self.materialize(Source::from(&image), size_gb).await
    }

    /// Size defaults to the snapshot's own size.
    #[instrument(skip(self), fields(snapshot_id = %snapshot_id))]
    pub async fn create_volume_from_snapshot(
        &self,
        snapshot_id: &str,
        size_gb: Option<u64>,
    ) -> Result<Volume> {
        let snapshot = self
            .snapshots
            .find(snapshot_id)
            .await?
            .ok_or_else(|| CloudError::NotFound(format!("source snapshot {snapshot_id}")))?;
        if snapshot.state != SnapshotState::Completed {
            return Err(CloudError::InvalidState(format!(
                "snapshot {snapshot_id} is not completed"
            )));
        }
        let target = size_gb.unwrap_or(snapshot.size_gb);
        self.materialize(Source::from(&snapshot), target).await
    }

    /// Blank volume, no source.
    #[instrument(skip(self))]
    pub async fn create_volume(&self, size_gb: u64, node: Option<&str>) -> Result<Volume> {
        if size_gb == 0 {
            return Err(CloudError::InvalidArgument(
                "volume size must be greater than zero".to_string(),
            ));
        }
        let node = node.unwrap_or(&self.config.default_node);
        let hypervisor = self.connections.get(node).await?;
        let pool = self.require_pool(&hypervisor, &self.config.default_pool).await?;

        let id = new_id(id_prefix::VOLUME);
        let format = VolumeFormat::Qcow2;
        let info = hypervisor
            .create_volume(
                &pool.name,
                &VolumeSpec {
                    name: format.file_name(&id),
                    capacity_gb: size_gb,
                    format,
                },
            )
            .await?;

        let volume = self.new_record(id, node, size_gb, &info, None, None);
        self.persist(&volume).await;
        info!(volume_id = %volume.id, size_gb, "Created blank volume");
        Ok(volume)
    }

    async fn materialize(&self, source: Source, target_gb: u64) -> Result<Volume> {
        if target_gb == 0 {
            return Err(CloudError::InvalidArgument(
                "target size must be greater than zero".to_string(),
            ));
        }
        let hypervisor = self.connections.get(&source.node).await?;
        let pool = self.require_pool(&hypervisor, &self.config.default_pool).await?;

        let id = new_id(id_prefix::VOLUME);
        let format = VolumeFormat::Qcow2;
        let name = format.file_name(&id);
        let strategy = choose_strategy(source.size_gb, target_gb);
        let capacity_gb = match strategy {
            MaterializeStrategy::Clone { .. } => target_gb,
            MaterializeStrategy::Convert => source.size_gb,
        };
        debug!(volume_id = %id, ?strategy, source_gb = source.size_gb, target_gb, "Materializing volume");

        let registered = hypervisor
            .create_volume(
                &pool.name,
                &VolumeSpec {
                    name: name.clone(),
                    capacity_gb,
                    format,
                },
            )
            .await?;
        let mut rollback = Rollback::new(hypervisor.clone());
        rollback.track(&pool.name, &name);

        let tool = self.disk_tools.for_node(&hypervisor);
        let written: Result<VolumeInfo> = async {
            match strategy {
                MaterializeStrategy::Clone { resize_to } => {
                    tool.clone_from_backing(source.format, format, &source.path, &registered.path)
                        .await?;
                    if let Some(size) = resize_to {
                        tool.resize(&registered.path, size).await?;
                    }
                }
                MaterializeStrategy::Convert => {
                    tool.convert(source.format, format, &source.path, &registered.path)
                        .await?;
                }
            }
            hypervisor.get_volume(&pool.name, &name).await
        }
        .await;

        let info = match written {
            Ok(info) => info,
            Err(e) => {
                warn!(volume_id = %id, error = %e, "Volume materialization failed, rolling back");
                rollback.run().await;
                return Err(e);
            }
        };

        let mut volume = self.new_record(
            id,
            &source.node,
            target_gb,
            &info,
            source.image_id,
            source.snapshot_id,
        );
        if matches!(strategy, MaterializeStrategy::Clone { .. }) {
            volume.backing_file = Some(source.path);
        }
        self.persist(&volume).await;
        info!(volume_id = %volume.id, ?strategy, "Volume ready");
        Ok(volume)
    }

    #[instrument(skip(self))]
    pub async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let volume = self.volumes.get(volume_id).await?;
        let hypervisor = self.connections.get(&volume.node).await?;

        if let Some((domain, target)) = find_attachment(hypervisor.as_ref(), &volume.path).await? {
            return Err(CloudError::InvalidState(format!(
                "volume {volume_id} is attached to {domain} as {target}"
            )));
        }

        self.remove_from_pool(hypervisor.as_ref(), &volume).await?;
        if let Err(e) = self.volumes.soft_delete(volume_id).await {
            warn!(%volume_id, error = %e, "Volume deleted but record update failed");
        }
        info!(%volume_id, "Deleted volume");
        Ok(())
    }

    /// Remove a volume that was never handed to a domain, skipping the attachment scan.
    pub(crate) async fn discard_volume(&self, volume: &Volume) {
        let hypervisor = match self.connections.get(&volume.node).await {
            Ok(hv) => hv,
            Err(e) => {
                warn!(volume_id = %volume.id, error = %e, "Cannot reach node to discard volume");
                return;
            }
        };
        if let Err(e) = self.remove_from_pool(hypervisor.as_ref(), volume).await {
            warn!(volume_id = %volume.id, error = %e, "Failed to discard volume");
            return;
        }
        if let Err(e) = self.volumes.soft_delete(&volume.id).await {
            warn!(volume_id = %volume.id, error = %e, "Failed to mark discarded volume deleted");
        }
    }

    async fn remove_from_pool(&self, hypervisor: &dyn HypervisorClient, volume: &Volume) -> Result<()> {
        match hypervisor.delete_volume(&volume.pool, &volume.file_name()).await {
            Err(e) if e.is_not_found() => {
                debug!(volume_id = %volume.id, "Volume already absent from pool");
                Ok(())
            }
            other => other,
        }
    }

    #[instrument(skip(self))]
    pub async fn resize_volume(&self, volume_id: &str, new_size_gb: u64) -> Result<Volume> {
        let mut volume = self.volumes.get(volume_id).await?;
        // A converted volume keeps its source's capacity, which can exceed the declared size.
        let current_gb = volume.size_gb.max(volume.capacity_bytes.div_ceil(GIB));
        if new_size_gb < current_gb {
            return Err(CloudError::InvalidArgument(format!(
                "cannot shrink volume {volume_id} from {current_gb}GB to {new_size_gb}GB"
            )));
        }
        if new_size_gb == current_gb {
            return Ok(volume);
        }

        let hypervisor = self.connections.get(&volume.node).await?;
        let name = volume.file_name();
        hypervisor
            .resize_volume(&volume.pool, &name, new_size_gb)
            .await?;
        let info = hypervisor.get_volume(&volume.pool, &name).await?;

        volume.size_gb = new_size_gb;
        volume.capacity_bytes = info.capacity_bytes;
        self.persist(&volume).await;
        info!(%volume_id, new_size_gb, "Resized volume");
        Ok(volume)
    }

    /// Attach a volume to a domain on the same node. `device` defaults to the next free slot.
    #[instrument(skip(self))]
    pub async fn attach_volume(
        &self,
        volume_id: &str,
        domain: &str,
        device: Option<&str>,
    ) -> Result<Volume> {
        let mut volume = self.volumes.get(volume_id).await?;
        let hypervisor = self.connections.get(&volume.node).await?;

        if let Some((owner, target)) = find_attachment(hypervisor.as_ref(), &volume.path).await? {
            return Err(CloudError::InvalidState(format!(
                "volume {volume_id} is already attached to {owner} as {target}"
            )));
        }

        let info = hypervisor.get_domain(domain).await?;
        let used: Vec<String> = hypervisor
            .domain_disks(domain)
            .await?
            .into_iter()
            .map(|d| d.target)
            .collect();
        let target = match device {
            Some(dev) if used.iter().any(|u| u == dev) => {
                return Err(CloudError::InvalidArgument(format!(
                    "device {dev} is already in use on {domain}"
                )))
            }
            Some(dev) => dev.to_string(),
            None => allocate_device(&used)?,
        };

        let live = info.state == vmcloud_common::DomainState::Running;
        hypervisor
            .attach_disk(
                domain,
                &DomainDisk::virtio(target.clone(), volume.path.clone(), volume.format),
                live,
            )
            .await?;

        volume.state = VolumeState::InUse;
        volume.attached_to = Some(domain.to_string());
        volume.device = Some(target.clone());
        self.persist(&volume).await;
        info!(%volume_id, %domain, device = %target, live, "Attached volume");
        Ok(volume)
    }

    #[instrument(skip(self))]
    pub async fn detach_volume(&self, volume_id: &str) -> Result<Volume> {
        let mut volume = self.volumes.get(volume_id).await?;
        let hypervisor = self.connections.get(&volume.node).await?;

        let (domain, target) = find_attachment(hypervisor.as_ref(), &volume.path)
            .await?
            .ok_or_else(|| {
                CloudError::InvalidState(format!("volume {volume_id} is not attached"))
            })?;
        if target == "vda" {
            return Err(CloudError::InvalidState(format!(
                "volume {volume_id} is the boot disk of {domain}"
            )));
        }

        let live = hypervisor.get_domain(&domain).await?.state
            == vmcloud_common::DomainState::Running;
        hypervisor.detach_disk(&domain, &target, live).await?;

        volume.state = VolumeState::Available;
        volume.attached_to = None;
        volume.device = None;
        self.persist(&volume).await;
        info!(%volume_id, %domain, "Detached volume");
        Ok(volume)
    }

    /// Live attachment of a volume as (domain, target), found by scanning all domains' disks.
    pub async fn volume_attachment(&self, volume_id: &str) -> Result<Option<(String, String)>> {
        let volume = self.volumes.get(volume_id).await?;
        let hypervisor = self.connections.get(&volume.node).await?;
        find_attachment(hypervisor.as_ref(), &volume.path).await
    }

    /// Persisted volumes with their attachment state derived from the live disk lists.
    pub async fn describe_volumes(&self, filters: &[Filter]) -> Result<Vec<Volume>> {
        let mut volumes = self.volumes.list(filters).await?;
        // `None` marks a node whose scan failed; its volumes keep their cached state.
        let mut attachments: HashMap<String, Option<HashMap<PathBuf, (String, String)>>> =
            HashMap::new();

        for volume in &mut volumes {
            if !attachments.contains_key(&volume.node) {
                let scanned = match self.connections.get(&volume.node).await {
                    Ok(hv) => match disk_index(hv.as_ref()).await {
                        Ok(index) => Some(index),
                        Err(e) => {
                            warn!(node = %volume.node, error = %e, "Disk scan failed, using cached state");
                            None
                        }
                    },
                    Err(e) => {
                        warn!(node = %volume.node, error = %e, "Node unreachable, using cached state");
                        None
                    }
                };
                attachments.insert(volume.node.clone(), scanned);
            }
            let Some(Some(index)) = attachments.get(&volume.node) else {
                continue;
            };
            match index.get(&volume.path) {
                Some((domain, target)) => {
                    volume.state = VolumeState::InUse;
                    volume.attached_to = Some(domain.clone());
                    volume.device = Some(target.clone());
                }
                None => {
                    volume.state = VolumeState::Available;
                    volume.attached_to = None;
                    volume.device = None;
                }
            }
        }
        Ok(volumes)
    }

    /// Update the cached attachment of a volume record.
    pub(crate) async fn mark_volume(
        &self,
        volume_id: &str,
        state: VolumeState,
        attached_to: Option<&str>,
        device: Option<&str>,
    ) {
        match self.volumes.find(volume_id).await {
            Ok(Some(mut volume)) => {
                volume.state = state;
                volume.attached_to = attached_to.map(str::to_string);
                volume.device = device.map(str::to_string);
                self.persist(&volume).await;
            }
            Ok(None) => debug!(%volume_id, "No volume record to update"),
            Err(e) => warn!(%volume_id, error = %e, "Failed to load volume record"),
        }
    }

    pub(crate) async fn volumes_attached_to(&self, domain: &str) -> Vec<Volume> {
        self.volumes
            .list(&[Filter::new("attached_to", domain)])
            .await
            .unwrap_or_else(|e| {
                warn!(%domain, error = %e, "Failed to list attached volumes");
                Vec::new()
            })
    }

    pub(crate) async fn require_pool(
        &self,
        hypervisor: &Arc<dyn HypervisorClient>,
        pool: &str,
    ) -> Result<StoragePoolInfo> {
        require_pool(hypervisor.as_ref(), pool).await
    }

    fn new_record(
        &self,
        id: String,
        node: &str,
        size_gb: u64,
        info: &VolumeInfo,
        source_image_id: Option<String>,
        source_snapshot_id: Option<String>,
    ) -> Volume {
        Volume {
            id,
            node: node.to_string(),
            pool: info.pool.clone(),
            path: info.path.clone(),
            size_gb,
            capacity_bytes: info.capacity_bytes,
            format: info.format,
            state: VolumeState::Available,
            attached_to: None,
            device: None,
            source_image_id,
            source_snapshot_id,
            backing_file: None,
            created_at: Utc::now(),
        }
    }

    async fn persist(&self, volume: &Volume) {
        if let Err(e) = self.volumes.save(volume).await {
            warn!(volume_id = %volume.id, error = %e, "Failed to persist volume record");
        }
    }
}

/// Active pool or `PoolUnavailable`.
pub(crate) async fn require_pool(
    hypervisor: &dyn HypervisorClient,
    pool: &str,
) -> Result<StoragePoolInfo> {
    match hypervisor.get_pool(pool).await {
        Ok(info) if info.active => Ok(info),
        Ok(_) => Err(CloudError::PoolUnavailable(format!("pool {pool} is not active"))),
        Err(e) if e.is_not_found() => Err(CloudError::PoolUnavailable(format!(
            "pool {pool} does not exist on {}",
            hypervisor.node()
        ))),
        Err(e) => Err(e),
    }
}

async fn disk_index(
    hypervisor: &dyn HypervisorClient,
) -> Result<HashMap<PathBuf, (String, String)>> {
    let mut index = HashMap::new();
    for domain in hypervisor.list_domains().await? {
        let disks = match hypervisor.domain_disks(&domain.name).await {
            Ok(disks) => disks,
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e),
        };
        for disk in disks {
            index.insert(disk.source, (domain.name.clone(), disk.target));
        }
    }
    Ok(index)
}

pub(crate) async fn find_attachment(
    hypervisor: &dyn HypervisorClient,
    path: &std::path::Path,
) -> Result<Option<(String, String)>> {
    for domain in hypervisor.list_domains().await? {
        let disks = match hypervisor.domain_disks(&domain.name).await {
            Ok(disks) => disks,
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e),
        };
        if let Some(disk) = disks.into_iter().find(|d| d.source == path) {
            return Ok(Some((domain.name, disk.target)));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_choose_strategy() {
        assert_eq!(
            choose_strategy(10, 10),
            MaterializeStrategy::Clone { resize_to: None }
        );
        assert_eq!(
            choose_strategy(10, 20),
            MaterializeStrategy::Clone {
                resize_to: Some(20)
            }
        );
        assert_eq!(choose_strategy(30, 20), MaterializeStrategy::Convert);
    }

    #[test]
    fn test_clone_never_shrinks_for_any_pair() {
        for source in 1..40u64 {
            for target in 1..40u64 {
                match choose_strategy(source, target) {
                    MaterializeStrategy::Clone { resize_to } => {
                        assert!(source <= target);
                        assert_eq!(resize_to.is_some(), target > source);
                    }
                    MaterializeStrategy::Convert => assert!(source > target),
                }
            }
        }
    }

    #[test]
    fn test_allocate_device() {
        assert_eq!(allocate_device(&["vda".to_string()]).unwrap(), "vdb");
        assert_eq!(
            allocate_device(&["vda".into(), "vdb".into(), "vdd".into()]).unwrap(),
            "vdc"
        );
        let full: Vec<String> = (b'a'..=b'z').map(|c| format!("vd{}", c as char)).collect();
        assert!(matches!(
            allocate_device(&full),
            Err(CloudError::InvalidState(_))
        ));
    }
}
