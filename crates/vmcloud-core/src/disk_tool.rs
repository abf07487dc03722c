//! qemu-img backed disk tool, runnable locally or over a node's remote channel.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vmcloud_common::{DiskToolClient, HypervisorClient, Result, VolumeFormat};

use crate::command::{render, run_local, run_remote};

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub fn convert_args(
    src_format: VolumeFormat,
    dst_format: VolumeFormat,
    src: &Path,
    dst: &Path,
) -> Vec<String> {
    vec![
        "convert".to_string(),
        "-f".to_string(),
        src_format.to_string(),
        "-O".to_string(),
        dst_format.to_string(),
        path_arg(src),
        path_arg(dst),
    ]
}

pub fn convert_snapshot_args(
    src_format: VolumeFormat,
    dst_format: VolumeFormat,
    src: &Path,
    snapshot: &str,
    dst: &Path,
) -> Vec<String> {
    vec![
        "convert".to_string(),
        "-f".to_string(),
        src_format.to_string(),
        "-l".to_string(),
        format!("snapshot.name={snapshot}"),
        "-O".to_string(),
        dst_format.to_string(),
        path_arg(src),
        path_arg(dst),
    ]
}

pub fn clone_args(
    backing_format: VolumeFormat,
    format: VolumeFormat,
    backing: &Path,
    dst: &Path,
) -> Vec<String> {
    vec![
        "create".to_string(),
        "-f".to_string(),
        format.to_string(),
        "-F".to_string(),
        backing_format.to_string(),
        "-b".to_string(),
        path_arg(backing),
        path_arg(dst),
    ]
}

pub fn resize_args(path: &Path, size_gb: u64) -> Vec<String> {
    vec!["resize".to_string(), path_arg(path), format!("{size_gb}G")]
}

pub fn snapshot_args(flag: &str, path: &Path, name: &str) -> Vec<String> {
    vec![
        "snapshot".to_string(),
        flag.to_string(),
        name.to_string(),
        path_arg(path),
    ]
}

/// qemu-img on the control plane host.
pub struct QemuImg {
    binary: PathBuf,
}

impl QemuImg {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<()> {
        run_local(&self.binary, &args).await?;
        Ok(())
    }
}

#[async_trait]
impl DiskToolClient for QemuImg {
    async fn convert(
        &self,
        src_format: VolumeFormat,
        dst_format: VolumeFormat,
        src: &Path,
        dst: &Path,
    ) -> Result<()> {
        self.run(convert_args(src_format, dst_format, src, dst)).await
    }

    async fn convert_snapshot(
        &self,
        src_format: VolumeFormat,
        dst_format: VolumeFormat,
        src: &Path,
        snapshot: &str,
        dst: &Path,
    ) -> Result<()> {
        self.run(convert_snapshot_args(src_format, dst_format, src, snapshot, dst))
            .await
    }

    async fn clone_from_backing(
        &self,
        backing_format: VolumeFormat,
        format: VolumeFormat,
        backing: &Path,
        dst: &Path,
    ) -> Result<()> {
        self.run(clone_args(backing_format, format, backing, dst)).await
    }

    async fn resize(&self, path: &Path, size_gb: u64) -> Result<()> {
        self.run(resize_args(path, size_gb)).await
    }

    async fn snapshot_create(&self, path: &Path, name: &str) -> Result<()> {
        self.run(snapshot_args("-c", path, name)).await
    }

    async fn snapshot_delete(&self, path: &Path, name: &str) -> Result<()> {
        self.run(snapshot_args("-d", path, name)).await
    }
}

/// qemu-img on a remote node, each call a single shell command.
pub struct RemoteDiskTool {
    hypervisor: Arc<dyn HypervisorClient>,
    binary: PathBuf,
}

impl RemoteDiskTool {
    pub fn new(hypervisor: Arc<dyn HypervisorClient>, binary: impl Into<PathBuf>) -> Self {
        Self {
            hypervisor,
            binary: binary.into(),
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<()> {
        run_remote(self.hypervisor.as_ref(), &render(&self.binary, &args)).await?;
        Ok(())
    }
}

#[async_trait]
impl DiskToolClient for RemoteDiskTool {
    async fn convert(
        &self,
        src_format: VolumeFormat,
        dst_format: VolumeFormat,
        src: &Path,
        dst: &Path,
    ) -> Result<()> {
        self.run(convert_args(src_format, dst_format, src, dst)).await
    }

    async fn convert_snapshot(
        &self,
        src_format: VolumeFormat,
        dst_format: VolumeFormat,
        src: &Path,
        snapshot: &str,
        dst: &Path,
    ) -> Result<()> {
        self.run(convert_snapshot_args(src_format, dst_format, src, snapshot, dst))
            .await
    }

    async fn clone_from_backing(
        &self,
        backing_format: VolumeFormat,
        format: VolumeFormat,
        backing: &Path,
        dst: &Path,
    ) -> Result<()> {
        self.run(clone_args(backing_format, format, backing, dst)).await
    }

    async fn resize(&self, path: &Path, size_gb: u64) -> Result<()> {
        self.run(resize_args(path, size_gb)).await
    }

    async fn snapshot_create(&self, path: &Path, name: &str) -> Result<()> {
        self.run(snapshot_args("-c", path, name)).await
    }

    async fn snapshot_delete(&self, path: &Path, name: &str) -> Result<()> {
        self.run(snapshot_args("-d", path, name)).await
    }
}

/// Picks the local tool or a remote dispatcher depending on the node.
#[derive(Clone)]
pub struct DiskTools {
    local: Arc<dyn DiskToolClient>,
    remote_binary: PathBuf,
}

impl DiskTools {
    pub fn new(local: Arc<dyn DiskToolClient>, remote_binary: impl Into<PathBuf>) -> Self {
        Self {
            local,
            remote_binary: remote_binary.into(),
        }
    }

    pub fn for_node(&self, hypervisor: &Arc<dyn HypervisorClient>) -> Arc<dyn DiskToolClient> {
        if hypervisor.is_remote() {
            Arc::new(RemoteDiskTool::new(
                hypervisor.clone(),
                self.remote_binary.clone(),
            ))
        } else {
            self.local.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDiskTool, FakeHypervisor};

    #[test]
    fn test_clone_args_use_backing_file() {
        let args = clone_args(
            VolumeFormat::Qcow2,
            VolumeFormat::Qcow2,
            Path::new("/pool/img-1.qcow2"),
            Path::new("/pool/vol-1.qcow2"),
        );
        assert_eq!(
            args.join(" "),
            "create -f qcow2 -F qcow2 -b /pool/img-1.qcow2 /pool/vol-1.qcow2"
        );
    }

    #[test]
    fn test_convert_snapshot_args() {
        let args = convert_snapshot_args(
            VolumeFormat::Qcow2,
            VolumeFormat::Qcow2,
            Path::new("/pool/vol-1.qcow2"),
            "snap-1",
            Path::new("/snaps/snap-1.qcow2"),
        );
        assert!(args.contains(&"snapshot.name=snap-1".to_string()));
        assert_eq!(resize_args(Path::new("/p/v"), 30), vec!["resize", "/p/v", "30G"]);
    }

    #[tokio::test]
    async fn test_remote_tool_dispatches_single_command() {
        let hv = Arc::new(FakeHypervisor::new("edge").remote());
        let tool = RemoteDiskTool::new(hv.clone(), "qemu-img");
        tool.resize(Path::new("/pool/vol 1.qcow2"), 40).await.unwrap();

        assert_eq!(
            hv.remote_commands(),
            vec!["qemu-img resize '/pool/vol 1.qcow2' 40G".to_string()]
        );
    }

    #[tokio::test]
    async fn test_router_uses_local_tool_for_local_nodes() {
        let local = Arc::new(FakeDiskTool::new());
        let tools = DiskTools::new(local.clone(), "qemu-img");

        let hv: Arc<dyn HypervisorClient> = Arc::new(FakeHypervisor::new("local"));
        tools
            .for_node(&hv)
            .resize(Path::new("/pool/v.qcow2"), 5)
            .await
            .unwrap();
        assert_eq!(local.calls().len(), 1);

        let remote = Arc::new(FakeHypervisor::new("edge").remote());
        let remote_dyn: Arc<dyn HypervisorClient> = remote.clone();
        tools
            .for_node(&remote_dyn)
            .resize(Path::new("/pool/v.qcow2"), 5)
            .await
            .unwrap();
        assert_eq!(local.calls().len(), 1);
        assert_eq!(remote.remote_commands().len(), 1);
    }
}
