//! Volume snapshots, exported as standalone files into the snapshot pool.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use vmcloud_common::{
    id_prefix, new_id, CloudError, DiskToolClient, Filter, HypervisorClient, Result, Snapshot,
    SnapshotState, Volume, VolumeFormat, VolumeInfo, VolumeSpec,
};

use crate::config::CloudConfig;
use crate::connection::ConnectionManager;
use crate::disk_tool::DiskTools;
use crate::persistence::Repository;
use crate::provisioning::{require_pool, Rollback};

pub struct SnapshotService {
    config: Arc<CloudConfig>,
    connections: Arc<ConnectionManager>,
    disk_tools: DiskTools,
    snapshots: Repository<Snapshot>,
    volumes: Repository<Volume>,
}

impl SnapshotService {
    pub fn new(
        config: Arc<CloudConfig>,
        connections: Arc<ConnectionManager>,
        disk_tools: DiskTools,
        snapshots: Repository<Snapshot>,
        volumes: Repository<Volume>,
    ) -> Self {
        Self {
            config,
            connections,
            disk_tools,
            snapshots,
            volumes,
        }
    }

    #[instrument(skip(self, description))]
    pub async fn create_snapshot(
        &self,
        volume_id: &str,
        description: Option<String>,
    ) -> Result<Snapshot> {
        let volume = self.volumes.get(volume_id).await?;
        let hypervisor = self.connections.get(&volume.node).await?;
        let pool = require_pool(hypervisor.as_ref(), &self.config.snapshot_pool).await?;

        let id = new_id(id_prefix::SNAPSHOT);
        let format = VolumeFormat::Qcow2;
        let mut snapshot = Snapshot {
            id: id.clone(),
            volume_id: volume.id.clone(),
            node: volume.node.clone(),
            pool: pool.name.clone(),
            path: pool.path.join(format.file_name(&id)),
            format,
            state: SnapshotState::Pending,
            size_gb: volume.size_gb,
            description,
            copied_from: None,
            error: None,
            created_at: Utc::now(),
        };
        self.snapshots.save(&snapshot).await?;

        let tool = self.disk_tools.for_node(&hypervisor);
        let exported = self
            .export(&hypervisor, tool.as_ref(), &volume, &snapshot)
            .await;
        self.finish(&mut snapshot, exported).await?;
        info!(snapshot_id = %snapshot.id, %volume_id, "Snapshot completed");
        Ok(snapshot)
    }

    /// Internal snapshot on the volume, converted out to its own file, then dropped.
    async fn export(
        &self,
        hypervisor: &Arc<dyn HypervisorClient>,
        tool: &dyn DiskToolClient,
        volume: &Volume,
        snapshot: &Snapshot,
    ) -> Result<VolumeInfo> {
        let file = snapshot.format.file_name(&snapshot.id);
        let registered = hypervisor
            .create_volume(
                &snapshot.pool,
                &VolumeSpec {
                    name: file.clone(),
                    capacity_gb: volume.size_gb,
                    format: snapshot.format,
                },
            )
            .await?;
        let mut rollback = Rollback::new(hypervisor.clone());
        rollback.track(&snapshot.pool, &file);

        if let Err(e) = tool.snapshot_create(&volume.path, &snapshot.id).await {
            rollback.run().await;
            return Err(e);
        }
        let converted = tool
            .convert_snapshot(
                volume.format,
                snapshot.format,
                &volume.path,
                &snapshot.id,
                &registered.path,
            )
            .await;
        if let Err(e) = tool.snapshot_delete(&volume.path, &snapshot.id).await {
            warn!(snapshot_id = %snapshot.id, error = %e, "Failed to drop internal snapshot");
        }

        match converted {
            Ok(()) => Ok(registered),
            Err(e) => {
                rollback.run().await;
                Err(e)
            }
        }
    }

    /// Copy of a completed snapshot within the snapshot pool.
    #[instrument(skip(self, description))]
    pub async fn copy_snapshot(
        &self,
        snapshot_id: &str,
        description: Option<String>,
    ) -> Result<Snapshot> {
        let source = self.snapshots.get(snapshot_id).await?;
        if source.state != SnapshotState::Completed {
            return Err(CloudError::InvalidState(format!(
                "snapshot {snapshot_id} is not completed"
            )));
        }
        let hypervisor = self.connections.get(&source.node).await?;
        let pool = require_pool(hypervisor.as_ref(), &self.config.snapshot_pool).await?;

        let id = new_id(id_prefix::SNAPSHOT);
        let mut copy = Snapshot {
            id: id.clone(),
            pool: pool.name.clone(),
            path: pool.path.join(source.format.file_name(&id)),
            state: SnapshotState::Pending,
            description: description.or_else(|| source.description.clone()),
            copied_from: Some(source.id.clone()),
            error: None,
            created_at: Utc::now(),
            ..source.clone()
        };
        self.snapshots.save(&copy).await?;

        let file = copy.format.file_name(&id);
        let copied: Result<VolumeInfo> = async {
            let registered = hypervisor
                .create_volume(
                    &copy.pool,
                    &VolumeSpec {
                        name: file.clone(),
                        capacity_gb: source.size_gb,
                        format: copy.format,
                    },
                )
                .await?;
            let mut rollback = Rollback::new(hypervisor.clone());
            rollback.track(&copy.pool, &file);
            let tool = self.disk_tools.for_node(&hypervisor);
            match tool
                .convert(source.format, copy.format, &source.path, &registered.path)
                .await
            {
                Ok(()) => Ok(registered),
                Err(e) => {
                    rollback.run().await;
                    Err(e)
                }
            }
        }
        .await;

        self.finish(&mut copy, copied).await?;
        info!(snapshot_id = %copy.id, source = %snapshot_id, "Snapshot copied");
        Ok(copy)
    }

    async fn finish(&self, snapshot: &mut Snapshot, result: Result<VolumeInfo>) -> Result<()> {
        match result {
            Ok(info) => {
                snapshot.state = SnapshotState::Completed;
                snapshot.path = info.path;
                self.persist(snapshot).await;
                Ok(())
            }
            Err(e) => {
                snapshot.state = SnapshotState::Failed;
                snapshot.error = Some(e.to_string());
                self.persist(snapshot).await;
                Err(e)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let snapshot = self.snapshots.get(snapshot_id).await?;
        if snapshot.state == SnapshotState::Completed {
            let hypervisor = self.connections.get(&snapshot.node).await?;
            let file = snapshot.format.file_name(&snapshot.id);
            match hypervisor.delete_volume(&snapshot.pool, &file).await {
                Err(e) if e.is_not_found() => debug!(%snapshot_id, "Snapshot file already gone"),
                other => other?,
            }
        }
        self.snapshots.soft_delete(snapshot_id).await?;
        info!(%snapshot_id, "Deleted snapshot");
        Ok(())
    }

    pub async fn get_snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
        self.snapshots.get(snapshot_id).await
    }

    pub async fn describe_snapshots(&self, filters: &[Filter]) -> Result<Vec<Snapshot>> {
        self.snapshots.list(filters).await
    }

    async fn persist(&self, snapshot: &Snapshot) {
        if let Err(e) = self.snapshots.save(snapshot).await {
            warn!(snapshot_id = %snapshot.id, error = %e, "Failed to persist snapshot record");
        }
    }
}
