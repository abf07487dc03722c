//! Instance lifecycle: RunInstance and the batch state transitions.

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};
use vmcloud_common::{
    id_prefix, new_id, CloudError, DomainDisk, DomainInfo, DomainSpec, DomainState, Filter,
    HypervisorClient, Instance, InstanceState, KeyPair, NetworkAttachment, Result, VolumeState,
};

use crate::cloud_init::{build_seed, generate_mac};
use crate::config::CloudConfig;
use crate::connection::ConnectionManager;
use crate::persistence::Repository;
use crate::provisioning::ProvisioningEngine;

const BOOT_DEVICE: &str = "vda";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunInstanceRequest {
    pub image_id: Option<String>,
    pub name: Option<String>,
    pub size_gb: Option<u64>,
    pub memory_mb: Option<u64>,
    pub vcpus: Option<u32>,
    pub key_name: Option<String>,
    pub user_data: Option<String>,
}

/// Per-identity result of a batch lifecycle operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStateChange {
    pub instance_id: String,
    pub previous_state: InstanceState,
    pub current_state: InstanceState,
    pub error: Option<String>,
}

impl InstanceStateChange {
    fn new(instance_id: &str, previous: InstanceState, current: InstanceState) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            previous_state: previous,
            current_state: current,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub changes: Vec<InstanceStateChange>,
}

impl BatchOutcome {
    pub fn failed(&self) -> usize {
        self.changes.iter().filter(|c| !c.is_success()).count()
    }

    pub fn get(&self, instance_id: &str) -> Option<&InstanceStateChange> {
        self.changes.iter().find(|c| c.instance_id == instance_id)
    }

    /// All changes, or `PartialBatchFailure` when any identity failed.
    pub fn into_result(self) -> Result<Vec<InstanceStateChange>> {
        match self.failed() {
            0 => Ok(self.changes),
            failed => Err(CloudError::PartialBatchFailure {
                failed,
                total: self.changes.len(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceAttribute {
    Vcpus,
    Memory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModifyInstanceAttributes {
    pub vcpus: Option<u32>,
    pub memory_mb: Option<u64>,
    /// Apply to the running guest as well as the persistent definition.
    pub live: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeChange {
    pub attribute: InstanceAttribute,
    pub value: u64,
    pub error: Option<String>,
}

/// Outcome of ModifyAttribute; attributes are applied independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifyReport {
    pub instance_id: String,
    pub changes: Vec<AttributeChange>,
}

impl ModifyReport {
    pub fn is_complete(&self) -> bool {
        self.changes.iter().all(|c| c.error.is_none())
    }
}

pub struct InstanceManager {
    config: Arc<CloudConfig>,
    connections: Arc<ConnectionManager>,
    provisioning: Arc<ProvisioningEngine>,
    instances: Repository<Instance>,
    key_pairs: Repository<KeyPair>,
}

impl InstanceManager {
    pub fn new(
        config: Arc<CloudConfig>,
        connections: Arc<ConnectionManager>,
        provisioning: Arc<ProvisioningEngine>,
        instances: Repository<Instance>,
        key_pairs: Repository<KeyPair>,
    ) -> Self {
        Self {
            config,
            connections,
            provisioning,
            instances,
            key_pairs,
        }
    }

    #[instrument(skip(self, request), fields(image_id = ?request.image_id))]
    pub async fn run_instance(&self, request: RunInstanceRequest) -> Result<Instance> {
        let image_id = request
            .image_id
            .clone()
            .or_else(|| self.config.default_image_id.clone())
            .ok_or_else(|| {
                CloudError::InvalidArgument(
                    "no image specified and no default image configured".to_string(),
                )
            })?;
        let size_gb = request.size_gb.unwrap_or(self.config.default_volume_size_gb);
        let memory_mb = request.memory_mb.unwrap_or(self.config.default_memory_mb);
        let vcpus = request.vcpus.unwrap_or(self.config.default_vcpus);
        if memory_mb == 0 || vcpus == 0 {
            return Err(CloudError::InvalidArgument(
                "memory and vcpu count must be greater than zero".to_string(),
            ));
        }
        let key_pair = match &request.key_name {
            Some(name) => Some(self.key_pairs.get(name).await?),
            None => None,
        };

        let id = new_id(id_prefix::INSTANCE);
        let name = request.name.clone().unwrap_or_else(|| id.clone());
        let volume = self
            .provisioning
            .create_volume_from_image(&image_id, size_gb)
            .await?;

        let spec = DomainSpec {
            name: id.clone(),
            memory_mb,
            vcpus,
            disks: vec![DomainDisk::virtio(
                BOOT_DEVICE,
                volume.path.clone(),
                volume.format,
            )],
            networks: vec![NetworkAttachment {
                kind: self.config.network.kind,
                source: self.config.network.source.clone(),
                mac: generate_mac(),
                model: self.config.network.model.clone(),
            }],
            cloud_init: build_seed(
                &id,
                &name,
                key_pair.as_ref().map(|k| k.public_key.as_str()),
                request.user_data.as_deref(),
            ),
        };

        let started = match self.connections.get(&volume.node).await {
            Ok(hypervisor) => hypervisor.define_and_start_domain(&spec).await,
            Err(e) => Err(e),
        };
        let domain = match started {
            Ok(domain) => domain,
            Err(e) => {
                warn!(instance_id = %id, error = %e, "Domain creation failed, rolling back volume");
                self.provisioning.discard_volume(&volume).await;
                return Err(e);
            }
        };

        self.provisioning
            .mark_volume(&volume.id, VolumeState::InUse, Some(&id), Some(BOOT_DEVICE))
            .await;

        let now = Utc::now();
        let instance = Instance {
            id: id.clone(),
            name,
            node: volume.node.clone(),
            state: match InstanceState::from_domain_state(domain.state) {
                InstanceState::Pending => InstanceState::Running,
                state => state,
            },
            image_id: Some(image_id),
            volume_id: Some(volume.id.clone()),
            memory_mb,
            vcpus,
            key_name: request.key_name,
            domain_uuid: Some(domain.uuid),
            created_at: now,
            updated_at: now,
        };
        self.persist(&instance).await;
        info!(instance_id = %instance.id, volume_id = %volume.id, "Instance running");
        Ok(instance)
    }

    /// Persisted record first, otherwise a transient record built from the live domain.
    pub async fn get_instance(&self, instance_id: &str) -> Result<Instance> {
        match self.instances.find(instance_id).await {
            Ok(Some(instance)) => return Ok(instance),
            Ok(None) => {}
            Err(e) => warn!(%instance_id, error = %e, "Instance lookup failed, asking hypervisors"),
        }

        for node in self.connections.node_names() {
            let hypervisor = match self.connections.get(&node).await {
                Ok(hv) => hv,
                Err(e) => {
                    warn!(%node, error = %e, "Skipping unreachable node");
                    continue;
                }
            };
            match hypervisor.get_domain(instance_id).await {
                Ok(domain) => return Ok(transient_record(hypervisor.as_ref(), domain).await),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(CloudError::NotFound(format!("instance {instance_id}")))
    }

    /// Persisted instances; with `include_unmanaged`, domains without a record are
    /// appended as transient records.
    pub async fn describe_instances(
        &self,
        filters: &[Filter],
        include_unmanaged: bool,
    ) -> Result<Vec<Instance>> {
        let mut instances = self.instances.list(filters).await?;
        if !include_unmanaged {
            return Ok(instances);
        }

        let known: HashSet<String> = self
            .instances
            .list(&[])
            .await?
            .into_iter()
            .map(|i| i.id)
            .collect();
        for node in self.connections.node_names() {
            let hypervisor = match self.connections.get(&node).await {
                Ok(hv) => hv,
                Err(e) => {
                    warn!(%node, error = %e, "Skipping unreachable node");
                    continue;
                }
            };
            for domain in hypervisor.list_domains().await? {
                if !known.contains(&domain.name) {
                    instances.push(transient_record(hypervisor.as_ref(), domain).await);
                }
            }
        }
        Ok(instances)
    }

    #[instrument(skip(self))]
    pub async fn start_instances(&self, instance_ids: &[String]) -> BatchOutcome {
        self.batch(instance_ids, |id| self.start_one(id)).await
    }

    #[instrument(skip(self))]
    pub async fn stop_instances(&self, instance_ids: &[String], force: bool) -> BatchOutcome {
        self.batch(instance_ids, |id| self.stop_one(id, force)).await
    }

    #[instrument(skip(self))]
    pub async fn reboot_instances(&self, instance_ids: &[String]) -> BatchOutcome {
        self.batch(instance_ids, |id| self.reboot_one(id)).await
    }

    #[instrument(skip(self))]
    pub async fn terminate_instances(&self, instance_ids: &[String]) -> BatchOutcome {
        self.batch(instance_ids, |id| self.terminate_one(id)).await
    }

    async fn batch<'a, F, Fut>(&'a self, instance_ids: &'a [String], op: F) -> BatchOutcome
    where
        F: Fn(&'a str) -> Fut,
        Fut: Future<Output = Result<InstanceStateChange>> + 'a,
    {
        let mut seen = HashSet::new();
        let unique: Vec<&str> = instance_ids
            .iter()
            .map(String::as_str)
            .filter(|id| seen.insert(*id))
            .collect();

        let results = join_all(unique.iter().map(|id| op(*id))).await;

        let mut changes = Vec::with_capacity(results.len());
        for (id, result) in unique.into_iter().zip(results) {
            match result {
                Ok(change) => changes.push(change),
                Err(e) => {
                    warn!(instance_id = %id, error = %e, "Lifecycle operation failed");
                    let known = self.known_state(id).await;
                    changes.push(InstanceStateChange {
                        error: Some(e.to_string()),
                        ..InstanceStateChange::new(id, known, known)
                    });
                }
            }
        }
        BatchOutcome { changes }
    }

    async fn known_state(&self, instance_id: &str) -> InstanceState {
        match self.get_instance(instance_id).await {
            Ok(instance) => instance.state,
            Err(_) => InstanceState::Pending,
        }
    }

    async fn start_one(&self, instance_id: &str) -> Result<InstanceStateChange> {
        let (mut instance, hypervisor) = self.resolve(instance_id).await?;
        let previous = observe(hypervisor.as_ref(), &instance).await?;

        match previous {
            InstanceState::Running => {
                return Ok(InstanceStateChange::new(instance_id, previous, previous))
            }
            InstanceState::Stopped | InstanceState::Failed => {}
            other => {
                return Err(CloudError::InvalidState(format!(
                    "instance {instance_id} cannot be started while {other}"
                )))
            }
        }

        hypervisor.start_domain(instance_id).await?;
        self.transition(&mut instance, InstanceState::Running).await;
        info!(%instance_id, %previous, "Instance started");
        Ok(InstanceStateChange::new(instance_id, previous, InstanceState::Running))
    }

    async fn stop_one(&self, instance_id: &str, force: bool) -> Result<InstanceStateChange> {
        let (mut instance, hypervisor) = self.resolve(instance_id).await?;
        let previous = observe(hypervisor.as_ref(), &instance).await?;

        match previous {
            InstanceState::Stopped => {
                debug!(%instance_id, "Already stopped");
                return Ok(InstanceStateChange::new(instance_id, previous, previous));
            }
            InstanceState::Terminated => {
                return Err(CloudError::InvalidState(format!(
                    "instance {instance_id} is terminated"
                )))
            }
            _ => {}
        }

        let graceful = !force && previous == InstanceState::Running;
        let current = if graceful {
            hypervisor.shutdown_domain(instance_id).await?;
            self.wait_for_shutdown(hypervisor.as_ref(), instance_id)
                .await?
        } else {
            hypervisor.destroy_domain(instance_id).await?;
            InstanceState::Stopped
        };

        self.transition(&mut instance, current).await;
        info!(%instance_id, %previous, %current, force, "Instance stop requested");
        Ok(InstanceStateChange::new(instance_id, previous, current))
    }

    /// Poll until the domain is shut off; on timeout the instance is left `stopping`.
    async fn wait_for_shutdown(
        &self,
        hypervisor: &dyn HypervisorClient,
        instance_id: &str,
    ) -> Result<InstanceState> {
        let deadline = Instant::now() + self.config.stop_timeout();
        loop {
            let domain = hypervisor.get_domain(instance_id).await?;
            if domain.state == DomainState::ShutOff {
                return Ok(InstanceState::Stopped);
            }
            if Instant::now() >= deadline {
                warn!(%instance_id, state = ?domain.state, "Graceful stop timed out");
                return Ok(InstanceState::Stopping);
            }
            sleep(self.config.stop_poll_interval()).await;
        }
    }

    async fn reboot_one(&self, instance_id: &str) -> Result<InstanceStateChange> {
        let (mut instance, hypervisor) = self.resolve(instance_id).await?;
        let previous = observe(hypervisor.as_ref(), &instance).await?;
        if previous != InstanceState::Running {
            return Err(CloudError::InvalidState(format!(
                "instance {instance_id} is {previous}, reboot needs running"
            )));
        }

        hypervisor.reboot_domain(instance_id).await?;
        self.transition(&mut instance, InstanceState::Running).await;
        info!(%instance_id, "Instance rebooted");
        Ok(InstanceStateChange::new(instance_id, previous, InstanceState::Running))
    }

    async fn terminate_one(&self, instance_id: &str) -> Result<InstanceStateChange> {
        let (mut instance, hypervisor) = self.resolve(instance_id).await?;
        if instance.state == InstanceState::Terminated {
            return Ok(InstanceStateChange::new(
                instance_id,
                InstanceState::Terminated,
                InstanceState::Terminated,
            ));
        }

        let previous = match hypervisor.get_domain(instance_id).await {
            Ok(domain) => {
                if domain.state != DomainState::ShutOff {
                    hypervisor.destroy_domain(instance_id).await?;
                }
                hypervisor.undefine_domain(instance_id).await?;
                InstanceState::from_domain_state(domain.state)
            }
            Err(e) if e.is_not_found() => {
                debug!(%instance_id, "Domain already gone");
                instance.state
            }
            Err(e) => return Err(e),
        };

        // Data volumes outlive the instance; only the boot volume goes with it.
        for volume in self.provisioning.volumes_attached_to(instance_id).await {
            if Some(&volume.id) != instance.volume_id.as_ref() {
                self.provisioning
                    .mark_volume(&volume.id, VolumeState::Available, None, None)
                    .await;
            }
        }
        if let Some(volume_id) = &instance.volume_id {
            if let Err(e) = self.provisioning.delete_volume(volume_id).await {
                warn!(%instance_id, %volume_id, error = %e, "Failed to delete boot volume");
            }
        }

        self.transition(&mut instance, InstanceState::Terminated).await;
        if let Err(e) = self.instances.soft_delete(instance_id).await {
            warn!(%instance_id, error = %e, "Failed to soft-delete instance record");
        }
        info!(%instance_id, %previous, "Instance terminated");
        Ok(InstanceStateChange::new(
            instance_id,
            previous,
            InstanceState::Terminated,
        ))
    }

    /// Apply vCPU then memory; an applied change is kept when a later one fails.
    #[instrument(skip(self, attributes))]
    pub async fn modify_instance_attribute(
        &self,
        instance_id: &str,
        attributes: ModifyInstanceAttributes,
    ) -> Result<ModifyReport> {
        if attributes.vcpus.is_none() && attributes.memory_mb.is_none() {
            return Err(CloudError::InvalidArgument(
                "no attribute to modify".to_string(),
            ));
        }
        if attributes.vcpus == Some(0) || attributes.memory_mb == Some(0) {
            return Err(CloudError::InvalidArgument(
                "memory and vcpu count must be greater than zero".to_string(),
            ));
        }

        let (mut instance, hypervisor) = self.resolve(instance_id).await?;
        let mut changes = Vec::new();

        if let Some(vcpus) = attributes.vcpus {
            let result = hypervisor
                .set_vcpus(instance_id, vcpus, attributes.live)
                .await;
            if result.is_ok() {
                instance.vcpus = vcpus;
            }
            changes.push(attribute_change(
                InstanceAttribute::Vcpus,
                u64::from(vcpus),
                result,
            ));
        }
        if let Some(memory_mb) = attributes.memory_mb {
            let result = hypervisor
                .set_memory(instance_id, memory_mb, attributes.live)
                .await;
            if result.is_ok() {
                instance.memory_mb = memory_mb;
            }
            changes.push(attribute_change(InstanceAttribute::Memory, memory_mb, result));
        }

        if changes.iter().any(|c| c.error.is_none()) {
            instance.updated_at = Utc::now();
            self.persist(&instance).await;
        }
        Ok(ModifyReport {
            instance_id: instance_id.to_string(),
            changes,
        })
    }

    async fn resolve(&self, instance_id: &str) -> Result<(Instance, Arc<dyn HypervisorClient>)> {
        let instance = self.get_instance(instance_id).await?;
        let hypervisor = self.connections.get(&instance.node).await?;
        Ok((instance, hypervisor))
    }

    async fn transition(&self, instance: &mut Instance, state: InstanceState) {
        instance.state = state;
        instance.updated_at = Utc::now();
        self.persist(instance).await;
    }

    async fn persist(&self, instance: &Instance) {
        if let Err(e) = self.instances.save(instance).await {
            warn!(instance_id = %instance.id, error = %e, "Failed to persist instance record");
        }
    }
}

/// Live state of the backing domain; a terminated record is never revived.
async fn observe(hypervisor: &dyn HypervisorClient, instance: &Instance) -> Result<InstanceState> {
    if instance.state == InstanceState::Terminated {
        return Ok(InstanceState::Terminated);
    }
    let domain = hypervisor.get_domain(&instance.id).await?;
    Ok(InstanceState::from_domain_state(domain.state))
}

fn attribute_change(
    attribute: InstanceAttribute,
    value: u64,
    result: Result<()>,
) -> AttributeChange {
    AttributeChange {
        attribute,
        value,
        error: result.err().map(|e| {
            warn!(?attribute, value, error = %e, "Attribute change failed");
            e.to_string()
        }),
    }
}

async fn transient_record(hypervisor: &dyn HypervisorClient, domain: DomainInfo) -> Instance {
    let disks = hypervisor
        .domain_disks(&domain.name)
        .await
        .unwrap_or_else(|e| {
            warn!(domain = %domain.name, error = %e, "Failed to read domain disks");
            Vec::new()
        });
    let volume_id = boot_disk(&disks).and_then(|d| volume_id_from_path(&d.source));
    let now = Utc::now();
    Instance {
        id: domain.name.clone(),
        name: domain.name,
        node: hypervisor.node().to_string(),
        state: InstanceState::from_domain_state(domain.state),
        image_id: None,
        volume_id,
        memory_mb: domain.memory_mb,
        vcpus: domain.vcpus,
        key_name: None,
        domain_uuid: Some(domain.uuid),
        created_at: now,
        updated_at: now,
    }
}

/// The `vda` disk when present, otherwise the first disk device.
pub(crate) fn boot_disk(disks: &[DomainDisk]) -> Option<&DomainDisk> {
    disks
        .iter()
        .find(|d| d.is_disk() && d.target == BOOT_DEVICE)
        .or_else(|| disks.iter().find(|d| d.is_disk()))
}

fn volume_id_from_path(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmcloud_common::VolumeFormat;

    #[test]
    fn test_boot_disk_prefers_vda() {
        let disks = vec![
            DomainDisk {
                device: "cdrom".into(),
                ..DomainDisk::virtio("sda", "/pool/seed.iso", VolumeFormat::Raw)
            },
            DomainDisk::virtio("vdb", "/pool/vol-data.qcow2", VolumeFormat::Qcow2),
            DomainDisk::virtio("vda", "/pool/vol-boot.qcow2", VolumeFormat::Qcow2),
        ];
        let boot = boot_disk(&disks).unwrap();
        assert_eq!(boot.target, "vda");
        assert_eq!(
            volume_id_from_path(&boot.source).as_deref(),
            Some("vol-boot")
        );
    }

    #[test]
    fn test_batch_outcome_into_result() {
        let ok = BatchOutcome {
            changes: vec![InstanceStateChange::new(
                "i-1",
                InstanceState::Running,
                InstanceState::Stopped,
            )],
        };
        assert_eq!(ok.clone().into_result().unwrap().len(), 1);

        let mut partial = ok;
        partial.changes.push(InstanceStateChange {
            error: Some("boom".into()),
            ..InstanceStateChange::new("i-2", InstanceState::Pending, InstanceState::Pending)
        });
        assert_eq!(partial.failed(), 1);
        assert!(matches!(
            partial.into_result(),
            Err(CloudError::PartialBatchFailure { failed: 1, total: 2 })
        ));
    }
}
