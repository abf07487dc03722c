//! In-memory collaborators that record calls and accept failure injection.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use vmcloud_common::{
    CloudError, CommandOutput, DiskToolClient, DomainDisk, DomainInfo, DomainSpec, DomainState,
    GuestCustomizeClient, HypervisorClient, Image, Result, StoragePoolInfo, VolumeFormat,
    VolumeInfo, VolumeSpec, GIB,
};

use crate::config::{CloudConfig, NodeConfig};
use crate::connection::Connector;
use crate::context::{CloudContext, Collaborators};
use crate::download::{Fetcher, TaskRunner};
use crate::persistence::{MemoryStore, Repository};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn injected(op: &str) -> CloudError {
    CloudError::ToolFailure(format!("injected failure in {op}"))
}

fn format_for(name: &str) -> VolumeFormat {
    if name.ends_with(".raw") || name.ends_with(".img") {
        VolumeFormat::Raw
    } else {
        VolumeFormat::Qcow2
    }
}

struct FakeDomain {
    info: DomainInfo,
    disks: Vec<DomainDisk>,
    agent: bool,
    spec: Option<DomainSpec>,
}

#[derive(Default)]
struct HypervisorState {
    pools: BTreeMap<String, StoragePoolInfo>,
    volumes: BTreeMap<(String, String), VolumeInfo>,
    domains: BTreeMap<String, FakeDomain>,
    files: BTreeMap<String, Vec<u8>>,
    calls: Vec<String>,
    remote_commands: Vec<String>,
    agent_commands: Vec<(String, Value)>,
    failures: HashSet<String>,
    failing_agent_users: HashSet<String>,
    remote_exit_code: i32,
    shutdown_hangs: bool,
}

/// A single node's hypervisor, held entirely in memory.
pub struct FakeHypervisor {
    node: String,
    remote: bool,
    state: Mutex<HypervisorState>,
}

impl FakeHypervisor {
    pub const POOL_ROOT: &'static str = "/var/lib/vmcloud";

    /// A local node with an active `default` pool.
    pub fn new(node: impl Into<String>) -> Self {
        let hv = Self {
            node: node.into(),
            remote: false,
            state: Mutex::new(HypervisorState::default()),
        };
        hv.add_pool("default", true);
        hv
    }

    pub fn remote(mut self) -> Self {
        self.remote = true;
        self
    }

    pub fn with_pool(self, name: &str, active: bool) -> Self {
        self.add_pool(name, active);
        self
    }

    fn add_pool(&self, name: &str, active: bool) {
        lock(&self.state).pools.insert(
            name.to_string(),
            StoragePoolInfo {
                name: name.to_string(),
                path: Path::new(Self::POOL_ROOT).join(name),
                active,
                capacity_bytes: 1024 * GIB,
                available_bytes: 512 * GIB,
            },
        );
    }

    pub fn pool_path(&self, pool: &str) -> PathBuf {
        Path::new(Self::POOL_ROOT).join(pool)
    }

    pub fn add_volume(&self, pool: &str, name: &str, size_gb: u64) -> VolumeInfo {
        let info = VolumeInfo {
            name: name.to_string(),
            pool: pool.to_string(),
            path: self.pool_path(pool).join(name),
            capacity_bytes: size_gb * GIB,
            allocation_bytes: 0,
            format: format_for(name),
        };
        lock(&self.state)
            .volumes
            .insert((pool.to_string(), name.to_string()), info.clone());
        info
    }

    /// A domain created behind the control plane's back.
    pub fn add_domain(&self, name: &str, state: DomainState, disks: Vec<DomainDisk>) {
        lock(&self.state).domains.insert(
            name.to_string(),
            FakeDomain {
                info: DomainInfo {
                    name: name.to_string(),
                    uuid: vmcloud_common::uuid::Uuid::new_v4().to_string(),
                    state,
                    memory_mb: 1024,
                    vcpus: 1,
                },
                disks,
                agent: false,
                spec: None,
            },
        );
    }

    pub fn set_agent(&self, domain: &str, available: bool) {
        if let Some(d) = lock(&self.state).domains.get_mut(domain) {
            d.agent = available;
        }
    }

    pub fn set_domain_state(&self, domain: &str, state: DomainState) {
        if let Some(d) = lock(&self.state).domains.get_mut(domain) {
            d.info.state = state;
        }
    }

    /// Make every call of `op` fail until cleared.
    pub fn fail_on(&self, op: &str) {
        lock(&self.state).failures.insert(op.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = lock(&self.state);
        state.failures.clear();
        state.failing_agent_users.clear();
        state.remote_exit_code = 0;
    }

    pub fn fail_agent_for_user(&self, user: &str) {
        lock(&self.state).failing_agent_users.insert(user.to_string());
    }

    pub fn set_remote_exit_code(&self, code: i32) {
        lock(&self.state).remote_exit_code = code;
    }

    /// Graceful shutdown requests leave the domain shutting down forever.
    pub fn hang_on_shutdown(&self) {
        lock(&self.state).shutdown_hangs = true;
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    /// Number of calls of the named operation.
    pub fn count(&self, op: &str) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|c| c.split(' ').next() == Some(op))
            .count()
    }

    pub fn remote_commands(&self) -> Vec<String> {
        lock(&self.state).remote_commands.clone()
    }

    pub fn agent_commands(&self) -> Vec<(String, Value)> {
        lock(&self.state).agent_commands.clone()
    }

    pub fn volume_names(&self, pool: &str) -> Vec<String> {
        lock(&self.state)
            .volumes
            .keys()
            .filter(|(p, _)| p == pool)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn has_volume(&self, pool: &str, name: &str) -> bool {
        lock(&self.state)
            .volumes
            .contains_key(&(pool.to_string(), name.to_string()))
    }

    pub fn domain_state(&self, domain: &str) -> Option<DomainState> {
        lock(&self.state).domains.get(domain).map(|d| d.info.state)
    }

    pub fn domain_spec(&self, domain: &str) -> Option<DomainSpec> {
        lock(&self.state)
            .domains
            .get(domain)
            .and_then(|d| d.spec.clone())
    }

    pub fn domain_names(&self) -> Vec<String> {
        lock(&self.state).domains.keys().cloned().collect()
    }

    fn enter(&self, op: &str, detail: &str) -> Result<MutexGuard<'_, HypervisorState>> {
        let mut state = lock(&self.state);
        state.calls.push(format!("{op} {detail}"));
        if state.failures.contains(op) {
            return Err(injected(op));
        }
        Ok(state)
    }
}

fn domain_mut<'a>(state: &'a mut HypervisorState, name: &str) -> Result<&'a mut FakeDomain> {
    state
        .domains
        .get_mut(name)
        .ok_or_else(|| CloudError::NotFound(format!("domain {name}")))
}

#[async_trait]
impl HypervisorClient for FakeHypervisor {
    fn node(&self) -> &str {
        &self.node
    }

    fn is_remote(&self) -> bool {
        self.remote
    }

    async fn get_pool(&self, pool: &str) -> Result<StoragePoolInfo> {
        let state = self.enter("get_pool", pool)?;
        state
            .pools
            .get(pool)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(format!("pool {pool}")))
    }

    async fn list_pools(&self) -> Result<Vec<StoragePoolInfo>> {
        let state = self.enter("list_pools", "")?;
        Ok(state.pools.values().cloned().collect())
    }

    async fn refresh_pool(&self, pool: &str) -> Result<()> {
        let mut state = self.enter("refresh_pool", pool)?;
        let pool_info = state
            .pools
            .get(pool)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(format!("pool {pool}")))?;

        let discovered: Vec<VolumeInfo> = state
            .files
            .iter()
            .filter_map(|(path, data)| {
                let path = PathBuf::from(path);
                if path.parent() != Some(pool_info.path.as_path()) {
                    return None;
                }
                let name = path.file_name()?.to_string_lossy().into_owned();
                let capacity_bytes = std::str::from_utf8(data)
                    .ok()
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .map(|gb| gb * GIB)
                    .unwrap_or(data.len() as u64);
                Some(VolumeInfo {
                    format: format_for(&name),
                    name,
                    pool: pool.to_string(),
                    path,
                    capacity_bytes,
                    allocation_bytes: data.len() as u64,
                })
            })
            .collect();
        for info in discovered {
            state
                .volumes
                .entry((pool.to_string(), info.name.clone()))
                .or_insert(info);
        }
        Ok(())
    }

    async fn create_volume(&self, pool: &str, spec: &VolumeSpec) -> Result<VolumeInfo> {
        let mut state = self.enter("create_volume", &format!("{pool}/{}", spec.name))?;
        let pool_info = state
            .pools
            .get(pool)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(format!("pool {pool}")))?;
        let key = (pool.to_string(), spec.name.clone());
        if state.volumes.contains_key(&key) {
            return Err(CloudError::InvalidState(format!(
                "volume {} already exists in {pool}",
                spec.name
            )));
        }
        let info = VolumeInfo {
            name: spec.name.clone(),
            pool: pool.to_string(),
            path: pool_info.path.join(&spec.name),
            capacity_bytes: spec.capacity_gb * GIB,
            allocation_bytes: 0,
            format: spec.format,
        };
        state.volumes.insert(key, info.clone());
        Ok(info)
    }

    async fn get_volume(&self, pool: &str, name: &str) -> Result<VolumeInfo> {
        let state = self.enter("get_volume", &format!("{pool}/{name}"))?;
        state
            .volumes
            .get(&(pool.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| CloudError::NotFound(format!("volume {pool}/{name}")))
    }

    async fn delete_volume(&self, pool: &str, name: &str) -> Result<()> {
        let mut state = self.enter("delete_volume", &format!("{pool}/{name}"))?;
        state
            .volumes
            .remove(&(pool.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| CloudError::NotFound(format!("volume {pool}/{name}")))
    }

    async fn resize_volume(&self, pool: &str, name: &str, size_gb: u64) -> Result<()> {
        let mut state = self.enter("resize_volume", &format!("{pool}/{name} {size_gb}"))?;
        let volume = state
            .volumes
            .get_mut(&(pool.to_string(), name.to_string()))
            .ok_or_else(|| CloudError::NotFound(format!("volume {pool}/{name}")))?;
        volume.capacity_bytes = size_gb * GIB;
        Ok(())
    }

    async fn define_and_start_domain(&self, spec: &DomainSpec) -> Result<DomainInfo> {
        let mut state = self.enter("define_and_start_domain", &spec.name)?;
        if state.domains.contains_key(&spec.name) {
            return Err(CloudError::InvalidState(format!(
                "domain {} already defined",
                spec.name
            )));
        }
        let info = DomainInfo {
            name: spec.name.clone(),
            uuid: vmcloud_common::uuid::Uuid::new_v4().to_string(),
            state: DomainState::Running,
            memory_mb: spec.memory_mb,
            vcpus: spec.vcpus,
        };
        state.domains.insert(
            spec.name.clone(),
            FakeDomain {
                info: info.clone(),
                disks: spec.disks.clone(),
                agent: false,
                spec: Some(spec.clone()),
            },
        );
        Ok(info)
    }

    async fn undefine_domain(&self, name: &str) -> Result<()> {
        let mut state = self.enter("undefine_domain", name)?;
        state
            .domains
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CloudError::NotFound(format!("domain {name}")))
    }

    async fn get_domain(&self, name: &str) -> Result<DomainInfo> {
        let state = self.enter("get_domain", name)?;
        state
            .domains
            .get(name)
            .map(|d| d.info.clone())
            .ok_or_else(|| CloudError::NotFound(format!("domain {name}")))
    }

    async fn list_domains(&self) -> Result<Vec<DomainInfo>> {
        let state = self.enter("list_domains", "")?;
        Ok(state.domains.values().map(|d| d.info.clone()).collect())
    }

    async fn domain_disks(&self, name: &str) -> Result<Vec<DomainDisk>> {
        let state = self.enter("domain_disks", name)?;
        state
            .domains
            .get(name)
            .map(|d| d.disks.clone())
            .ok_or_else(|| CloudError::NotFound(format!("domain {name}")))
    }

    async fn start_domain(&self, name: &str) -> Result<()> {
        let mut state = self.enter("start_domain", name)?;
        let domain = domain_mut(&mut state, name)?;
        if domain.info.state == DomainState::Running {
            return Err(CloudError::InvalidState(format!("domain {name} is already running")));
        }
        domain.info.state = DomainState::Running;
        Ok(())
    }

    async fn shutdown_domain(&self, name: &str) -> Result<()> {
        let mut state = self.enter("shutdown_domain", name)?;
        let hangs = state.shutdown_hangs;
        let domain = domain_mut(&mut state, name)?;
        if domain.info.state != DomainState::Running {
            return Err(CloudError::InvalidState(format!("domain {name} is not running")));
        }
        domain.info.state = if hangs {
            DomainState::ShuttingDown
        } else {
            DomainState::ShutOff
        };
        Ok(())
    }

    async fn destroy_domain(&self, name: &str) -> Result<()> {
        let mut state = self.enter("destroy_domain", name)?;
        let domain = domain_mut(&mut state, name)?;
        if domain.info.state == DomainState::ShutOff {
            return Err(CloudError::InvalidState(format!("domain {name} is not running")));
        }
        domain.info.state = DomainState::ShutOff;
        Ok(())
    }

    async fn reboot_domain(&self, name: &str) -> Result<()> {
        let mut state = self.enter("reboot_domain", name)?;
        let domain = domain_mut(&mut state, name)?;
        if domain.info.state != DomainState::Running {
            return Err(CloudError::InvalidState(format!("domain {name} is not running")));
        }
        Ok(())
    }

    async fn attach_disk(&self, domain: &str, disk: &DomainDisk, _live: bool) -> Result<()> {
        let mut state = self.enter("attach_disk", &format!("{domain} {}", disk.target))?;
        let entry = domain_mut(&mut state, domain)?;
        if entry.disks.iter().any(|d| d.target == disk.target) {
            return Err(CloudError::InvalidState(format!(
                "target {} already used on {domain}",
                disk.target
            )));
        }
        entry.disks.push(disk.clone());
        Ok(())
    }

    async fn detach_disk(&self, domain: &str, target: &str, _live: bool) -> Result<()> {
        let mut state = self.enter("detach_disk", &format!("{domain} {target}"))?;
        let entry = domain_mut(&mut state, domain)?;
        let before = entry.disks.len();
        entry.disks.retain(|d| d.target != target);
        if entry.disks.len() == before {
            return Err(CloudError::NotFound(format!("disk {target} on {domain}")));
        }
        Ok(())
    }

    async fn set_memory(&self, domain: &str, memory_mb: u64, _live: bool) -> Result<()> {
        let mut state = self.enter("set_memory", &format!("{domain} {memory_mb}"))?;
        domain_mut(&mut state, domain)?.info.memory_mb = memory_mb;
        Ok(())
    }

    async fn set_vcpus(&self, domain: &str, vcpus: u32, _live: bool) -> Result<()> {
        let mut state = self.enter("set_vcpus", &format!("{domain} {vcpus}"))?;
        domain_mut(&mut state, domain)?.info.vcpus = vcpus;
        Ok(())
    }

    async fn guest_agent_available(&self, domain: &str) -> Result<bool> {
        let mut state = self.enter("guest_agent_available", domain)?;
        let entry = domain_mut(&mut state, domain)?;
        Ok(entry.agent && entry.info.state == DomainState::Running)
    }

    async fn guest_agent_command(&self, domain: &str, command: &Value) -> Result<Value> {
        let mut state = self.enter("guest_agent_command", domain)?;
        state
            .agent_commands
            .push((domain.to_string(), command.clone()));
        let user = command["arguments"]["username"].as_str().unwrap_or_default();
        if state.failing_agent_users.contains(user) {
            return Err(CloudError::ToolFailure(format!("agent rejected user {user}")));
        }
        let entry = domain_mut(&mut state, domain)?;
        if !entry.agent || entry.info.state != DomainState::Running {
            return Err(CloudError::CapabilityUnavailable(format!(
                "guest agent not connected on {domain}"
            )));
        }
        Ok(json!({ "return": {} }))
    }

    async fn execute_remote(&self, command: &str) -> Result<CommandOutput> {
        let mut state = self.enter("execute_remote", command)?;
        state.remote_commands.push(command.to_string());
        let exit_code = state.remote_exit_code;
        Ok(CommandOutput {
            exit_code,
            stdout: String::new(),
            stderr: if exit_code == 0 {
                String::new()
            } else {
                "injected remote failure".to_string()
            },
        })
    }

    async fn list_remote_files(&self, dir: &str) -> Result<Vec<String>> {
        let state = self.enter("list_remote_files", dir)?;
        Ok(state
            .files
            .keys()
            .filter(|path| Path::new(path.as_str()).parent() == Some(Path::new(dir)))
            .cloned()
            .collect())
    }

    async fn read_remote_file(&self, path: &str) -> Result<Vec<u8>> {
        let state = self.enter("read_remote_file", path)?;
        state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(format!("file {path}")))
    }

    async fn write_remote_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut state = self.enter("write_remote_file", path)?;
        state.files.insert(path.to_string(), data.to_vec());
        Ok(())
    }
}

/// Disk tool that only records what it was asked to do.
#[derive(Default)]
pub struct FakeDiskTool {
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashSet<String>>,
}

impl FakeDiskTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, op: &str) {
        lock(&self.failures).insert(op.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Operation names in call order.
    pub fn ops(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| c.split(' ').next().map(str::to_string))
            .collect()
    }

    fn record(&self, op: &str, detail: String) -> Result<()> {
        lock(&self.calls).push(format!("{op} {detail}"));
        if lock(&self.failures).contains(op) {
            return Err(injected(op));
        }
        Ok(())
    }
}

#[async_trait]
impl DiskToolClient for FakeDiskTool {
    async fn convert(
        &self,
        src_format: VolumeFormat,
        dst_format: VolumeFormat,
        src: &Path,
        dst: &Path,
    ) -> Result<()> {
        self.record(
            "convert",
            format!("{src_format} {dst_format} {} {}", src.display(), dst.display()),
        )
    }

    async fn convert_snapshot(
        &self,
        src_format: VolumeFormat,
        dst_format: VolumeFormat,
        src: &Path,
        snapshot: &str,
        dst: &Path,
    ) -> Result<()> {
        self.record(
            "convert_snapshot",
            format!(
                "{src_format} {dst_format} {} {snapshot} {}",
                src.display(),
                dst.display()
            ),
        )
    }

    async fn clone_from_backing(
        &self,
        backing_format: VolumeFormat,
        format: VolumeFormat,
        backing: &Path,
        dst: &Path,
    ) -> Result<()> {
        self.record(
            "clone",
            format!("{backing_format} {format} {} {}", backing.display(), dst.display()),
        )
    }

    async fn resize(&self, path: &Path, size_gb: u64) -> Result<()> {
        self.record("resize", format!("{} {size_gb}", path.display()))
    }

    async fn snapshot_create(&self, path: &Path, name: &str) -> Result<()> {
        self.record("snapshot_create", format!("{} {name}", path.display()))
    }

    async fn snapshot_delete(&self, path: &Path, name: &str) -> Result<()> {
        self.record("snapshot_delete", format!("{} {name}", path.display()))
    }
}

/// Offline customization that records password resets per disk.
#[derive(Default)]
pub struct FakeCustomize {
    resets: Mutex<Vec<(PathBuf, BTreeMap<String, String>)>>,
    validated: Mutex<Vec<PathBuf>>,
    missing: Mutex<HashSet<PathBuf>>,
    fail_reset: Mutex<bool>,
}

impl FakeCustomize {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_missing(&self, path: impl Into<PathBuf>) {
        lock(&self.missing).insert(path.into());
    }

    pub fn fail_resets(&self) {
        *lock(&self.fail_reset) = true;
    }

    pub fn resets(&self) -> Vec<(PathBuf, BTreeMap<String, String>)> {
        lock(&self.resets).clone()
    }

    pub fn validated(&self) -> Vec<PathBuf> {
        lock(&self.validated).clone()
    }
}

#[async_trait]
impl GuestCustomizeClient for FakeCustomize {
    async fn validate_disk_path(&self, path: &Path) -> Result<()> {
        lock(&self.validated).push(path.to_path_buf());
        if lock(&self.missing).contains(path) {
            return Err(CloudError::NotFound(format!("disk {}", path.display())));
        }
        Ok(())
    }

    async fn reset_passwords(&self, path: &Path, passwords: &BTreeMap<String, String>) -> Result<()> {
        if *lock(&self.fail_reset) {
            return Err(injected("reset_passwords"));
        }
        lock(&self.resets).push((path.to_path_buf(), passwords.clone()));
        Ok(())
    }
}

/// Writes a marker file through the hypervisor's file channel; `refresh_pool` on
/// [`FakeHypervisor`] turns it into a volume of `size_gb`.
pub struct FakeFetcher {
    size_gb: u64,
    fetched: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::with_size_gb(8)
    }

    pub fn with_size_gb(size_gb: u64) -> Self {
        Self {
            size_gb,
            fetched: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_url(&self, url: &str) {
        lock(&self.failing).insert(url.to_string());
    }

    pub fn fetched(&self) -> Vec<String> {
        lock(&self.fetched).clone()
    }
}

impl Default for FakeFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(
        &self,
        url: &str,
        hypervisor: Arc<dyn HypervisorClient>,
        dest: &Path,
    ) -> Result<u64> {
        lock(&self.fetched).push(url.to_string());
        if lock(&self.failing).contains(url) {
            return Err(CloudError::ToolFailure(format!("HTTP 404 for {url}")));
        }
        hypervisor
            .write_remote_file(&dest.to_string_lossy(), self.size_gb.to_string().as_bytes())
            .await?;
        Ok(self.size_gb * GIB)
    }
}

/// Queues work until [`ManualRunner::run_pending`] is awaited.
#[derive(Default)]
pub struct ManualRunner {
    queue: Mutex<Vec<BoxFuture<'static, ()>>>,
}

impl ManualRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        lock(&self.queue).len()
    }

    pub async fn run_pending(&self) {
        loop {
            let batch: Vec<_> = lock(&self.queue).drain(..).collect();
            if batch.is_empty() {
                return;
            }
            for work in batch {
                work.await;
            }
        }
    }
}

impl TaskRunner for ManualRunner {
    fn run(&self, work: BoxFuture<'static, ()>) {
        lock(&self.queue).push(work);
    }
}

/// Hands out registered fakes by node name and counts connects.
#[derive(Default)]
pub struct FakeConnector {
    hypervisors: Mutex<HashMap<String, Arc<FakeHypervisor>>>,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, hypervisor: Arc<FakeHypervisor>) {
        lock(&self.hypervisors).insert(hypervisor.node().to_string(), hypervisor);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, node: &NodeConfig) -> Result<Arc<dyn HypervisorClient>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let hypervisor: Arc<dyn HypervisorClient> = lock(&self.hypervisors)
            .get(&node.name)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(format!("node {}", node.name)))?;
        Ok(hypervisor)
    }
}

/// Size of the base image seeded by [`TestCloud`].
pub const BASE_IMAGE_GB: u64 = 10;

/// A full context over fakes, with a registered base image set as the default.
/// Background downloads queue on `runner` until the test drives them.
pub struct TestCloud {
    pub context: CloudContext,
    pub hypervisor: Arc<FakeHypervisor>,
    pub disk_tool: Arc<FakeDiskTool>,
    pub customize: Arc<FakeCustomize>,
    pub fetcher: Arc<FakeFetcher>,
    pub runner: Arc<ManualRunner>,
    pub store: Arc<MemoryStore>,
    pub base_image: Image,
}

impl TestCloud {
    pub async fn new() -> Self {
        Self::with_hypervisor(FakeHypervisor::new("local")).await
    }

    pub async fn with_hypervisor(hypervisor: FakeHypervisor) -> Self {
        let hypervisor = Arc::new(hypervisor);
        let store = Arc::new(MemoryStore::new());
        let node = hypervisor.node().to_string();

        let base = hypervisor.add_volume("default", "base.qcow2", BASE_IMAGE_GB);
        let base_image = Image {
            id: vmcloud_common::new_id(vmcloud_common::id_prefix::IMAGE),
            name: "base".to_string(),
            node: node.clone(),
            pool: "default".to_string(),
            path: base.path,
            size_gb: BASE_IMAGE_GB,
            format: VolumeFormat::Qcow2,
            description: None,
            created_at: Utc::now(),
        };
        if let Err(e) = Repository::<Image>::new(store.clone()).save(&base_image).await {
            panic!("seeding base image failed: {e}");
        }

        let mut node_config = NodeConfig::local(node.clone());
        if hypervisor.is_remote() {
            node_config.uri = format!("qemu+ssh://{node}/system");
            node_config.ssh_host = Some(node.clone());
        }
        let config = CloudConfig {
            default_node: node,
            nodes: vec![node_config],
            default_image_id: Some(base_image.id.clone()),
            stop_timeout_secs: 1,
            stop_poll_interval_ms: 10,
            ..CloudConfig::default()
        };

        let connector = Arc::new(FakeConnector::new());
        connector.register(hypervisor.clone());
        let disk_tool = Arc::new(FakeDiskTool::new());
        let customize = Arc::new(FakeCustomize::new());
        let fetcher = Arc::new(FakeFetcher::new());
        let runner = Arc::new(ManualRunner::new());

        let collaborators = Collaborators {
            connector,
            disk_tool: disk_tool.clone(),
            customize: customize.clone(),
            store: store.clone(),
            fetcher: fetcher.clone(),
            runner: runner.clone(),
        };
        let context = match CloudContext::new(config, collaborators) {
            Ok(context) => context,
            Err(e) => panic!("test context rejected: {e}"),
        };

        Self {
            context,
            hypervisor,
            disk_tool,
            customize,
            fetcher,
            runner,
            store,
            base_image,
        }
    }

    /// Launch an instance from the base image with defaults.
    pub async fn run_default_instance(&self) -> vmcloud_common::Instance {
        match self
            .context
            .instances
            .run_instance(crate::instance::RunInstanceRequest::default())
            .await
        {
            Ok(instance) => instance,
            Err(e) => panic!("run_instance failed: {e}"),
        }
    }
}
