//! Capability surface of the hypervisor binding consumed by the control plane.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;

use crate::model::VolumeFormat;
use crate::Result;

/// Native domain states as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    ShuttingDown,
    ShutOff,
    Crashed,
    PmSuspended,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainInfo {
    pub name: String,
    pub uuid: String,
    pub state: DomainState,
    pub memory_mb: u64,
    pub vcpus: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainDisk {
    /// "disk" or "cdrom".
    pub device: String,
    /// Guest target such as `vda`.
    pub target: String,
    pub source: PathBuf,
    pub format: VolumeFormat,
    pub bus: String,
}

impl DomainDisk {
    pub fn virtio(target: impl Into<String>, source: impl Into<PathBuf>, format: VolumeFormat) -> Self {
        Self {
            device: "disk".to_string(),
            target: target.into(),
            source: source.into(),
            format,
            bus: "virtio".to_string(),
        }
    }

    pub fn is_disk(&self) -> bool {
        self.device == "disk"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    #[default]
    Network,
    Bridge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    pub kind: NetworkKind,
    pub source: String,
    pub mac: String,
    pub model: String,
}

/// Declarative domain definition handed to the binding for define+start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainSpec {
    pub name: String,
    pub memory_mb: u64,
    pub vcpus: u32,
    pub disks: Vec<DomainDisk>,
    pub networks: Vec<NetworkAttachment>,
    /// NoCloud seed contents (`user-data`, `meta-data`) for the binding to attach.
    pub cloud_init: Option<CloudInitSeed>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudInitSeed {
    pub user_data: String,
    pub meta_data: String,
}

impl DomainSpec {
    /// Render a libvirt domain document. The cloud-init seed is not part of the
    /// document; bindings attach it as a separate cdrom.
    pub fn to_xml(&self) -> String {
        let mut xml = String::new();
        let _ = writeln!(xml, "<domain type='kvm'>");
        let _ = writeln!(xml, "  <name>{}</name>", xml_escape(&self.name));
        let _ = writeln!(xml, "  <memory unit='MiB'>{}</memory>", self.memory_mb);
        let _ = writeln!(
            xml,
            "  <currentMemory unit='MiB'>{}</currentMemory>",
            self.memory_mb
        );
        let _ = writeln!(xml, "  <vcpu placement='static'>{}</vcpu>", self.vcpus);
        let _ = writeln!(xml, "  <os>");
        let _ = writeln!(xml, "    <type arch='x86_64' machine='pc'>hvm</type>");
        let _ = writeln!(xml, "    <boot dev='hd'/>");
        let _ = writeln!(xml, "  </os>");
        let _ = writeln!(xml, "  <features><acpi/><apic/></features>");
        let _ = writeln!(xml, "  <on_crash>destroy</on_crash>");
        let _ = writeln!(xml, "  <devices>");
        for disk in &self.disks {
            let _ = writeln!(xml, "    <disk type='file' device='{}'>", xml_escape(&disk.device));
            let _ = writeln!(
                xml,
                "      <driver name='qemu' type='{}'/>",
                disk.format.as_str()
            );
            let _ = writeln!(
                xml,
                "      <source file='{}'/>",
                xml_escape(&disk.source.to_string_lossy())
            );
            let _ = writeln!(
                xml,
                "      <target dev='{}' bus='{}'/>",
                xml_escape(&disk.target),
                xml_escape(&disk.bus)
            );
            let _ = writeln!(xml, "    </disk>");
        }
        for nic in &self.networks {
            let (iface_type, attr) = match nic.kind {
                NetworkKind::Network => ("network", "network"),
                NetworkKind::Bridge => ("bridge", "bridge"),
            };
            let _ = writeln!(xml, "    <interface type='{iface_type}'>");
            let _ = writeln!(
                xml,
                "      <source {attr}='{}'/>",
                xml_escape(&nic.source)
            );
            let _ = writeln!(xml, "      <mac address='{}'/>", xml_escape(&nic.mac));
            let _ = writeln!(xml, "      <model type='{}'/>", xml_escape(&nic.model));
            let _ = writeln!(xml, "    </interface>");
        }
        let _ = writeln!(xml, "    <channel type='unix'>");
        let _ = writeln!(
            xml,
            "      <target type='virtio' name='org.qemu.guest_agent.0'/>"
        );
        let _ = writeln!(xml, "    </channel>");
        let _ = writeln!(xml, "    <serial type='pty'/>");
        let _ = writeln!(xml, "    <console type='pty'/>");
        let _ = writeln!(xml, "  </devices>");
        xml.push_str("</domain>\n");
        xml
    }
}

fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoragePoolInfo {
    pub name: String,
    pub path: PathBuf,
    pub active: bool,
    pub capacity_bytes: u64,
    pub available_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    pub capacity_gb: u64,
    pub format: VolumeFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub name: String,
    pub pool: String,
    pub path: PathBuf,
    pub capacity_bytes: u64,
    pub allocation_bytes: u64,
    pub format: VolumeFormat,
}

impl VolumeInfo {
    /// Capacity rounded up to whole gigabytes.
    pub fn capacity_gb(&self) -> u64 {
        self.capacity_bytes.div_ceil(GIB)
    }
}

pub const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One connection to one node's hypervisor.
#[async_trait]
pub trait HypervisorClient: Send + Sync {
    /// Node this connection belongs to.
    fn node(&self) -> &str;
    /// Whether commands for this node must be dispatched over the remote channel.
    fn is_remote(&self) -> bool;

    // Storage
    async fn get_pool(&self, pool: &str) -> Result<StoragePoolInfo>;
    async fn list_pools(&self) -> Result<Vec<StoragePoolInfo>>;
    async fn refresh_pool(&self, pool: &str) -> Result<()>;
    async fn create_volume(&self, pool: &str, spec: &VolumeSpec) -> Result<VolumeInfo>;
    async fn get_volume(&self, pool: &str, name: &str) -> Result<VolumeInfo>;
    async fn delete_volume(&self, pool: &str, name: &str) -> Result<()>;
    async fn resize_volume(&self, pool: &str, name: &str, size_gb: u64) -> Result<()>;

    // Domains
    async fn define_and_start_domain(&self, spec: &DomainSpec) -> Result<DomainInfo>;
    async fn undefine_domain(&self, name: &str) -> Result<()>;
    async fn get_domain(&self, name: &str) -> Result<DomainInfo>;
    async fn list_domains(&self) -> Result<Vec<DomainInfo>>;
    async fn domain_disks(&self, name: &str) -> Result<Vec<DomainDisk>>;
    async fn start_domain(&self, name: &str) -> Result<()>;
    /// Graceful ACPI shutdown request; returns before the guest is down.
    async fn shutdown_domain(&self, name: &str) -> Result<()>;
    /// Forced power-off.
    async fn destroy_domain(&self, name: &str) -> Result<()>;
    async fn reboot_domain(&self, name: &str) -> Result<()>;
    async fn attach_disk(&self, domain: &str, disk: &DomainDisk, live: bool) -> Result<()>;
    async fn detach_disk(&self, domain: &str, target: &str, live: bool) -> Result<()>;
    async fn set_memory(&self, domain: &str, memory_mb: u64, live: bool) -> Result<()>;
    async fn set_vcpus(&self, domain: &str, vcpus: u32, live: bool) -> Result<()>;

    // Guest agent
    async fn guest_agent_available(&self, domain: &str) -> Result<bool>;
    async fn guest_agent_command(
        &self,
        domain: &str,
        command: &serde_json::Value,
    ) -> Result<serde_json::Value>;

    // Remote node access
    async fn execute_remote(&self, command: &str) -> Result<CommandOutput>;
    async fn list_remote_files(&self, dir: &str) -> Result<Vec<String>>;
    async fn read_remote_file(&self, path: &str) -> Result<Vec<u8>>;
    async fn write_remote_file(&self, path: &str, data: &[u8]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_xml_rendering() {
        let spec = DomainSpec {
            name: "i-0123".to_string(),
            memory_mb: 2048,
            vcpus: 2,
            disks: vec![DomainDisk::virtio(
                "vda",
                "/var/lib/libvirt/images/vol-1.qcow2",
                VolumeFormat::Qcow2,
            )],
            networks: vec![NetworkAttachment {
                kind: NetworkKind::Bridge,
                source: "br0".to_string(),
                mac: "52:54:00:aa:bb:cc".to_string(),
                model: "virtio".to_string(),
            }],
            cloud_init: None,
        };

        let xml = spec.to_xml();
        assert!(xml.contains("<name>i-0123</name>"));
        assert!(xml.contains("<memory unit='MiB'>2048</memory>"));
        assert!(xml.contains("<vcpu placement='static'>2</vcpu>"));
        assert!(xml.contains("<source file='/var/lib/libvirt/images/vol-1.qcow2'/>"));
        assert!(xml.contains("<target dev='vda' bus='virtio'/>"));
        assert!(xml.contains("<interface type='bridge'>"));
        assert!(xml.contains("<source bridge='br0'/>"));
        assert!(xml.contains("org.qemu.guest_agent.0"));
    }

    #[test]
    fn test_xml_escape() {
        assert_eq!(xml_escape("a<b>&'\""), "a&lt;b&gt;&amp;&apos;&quot;");
    }

    #[test]
    fn test_capacity_gb_rounds_up() {
        let info = VolumeInfo {
            name: "v".into(),
            pool: "default".into(),
            path: "/tmp/v".into(),
            capacity_bytes: 10 * GIB + 1,
            allocation_bytes: 0,
            format: VolumeFormat::Qcow2,
        };
        assert_eq!(info.capacity_gb(), 11);
    }
}
