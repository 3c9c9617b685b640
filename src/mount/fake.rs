use super::error::{MountError, MountResult};
use super::{DeviceContents, Mounter};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// An entry in the in-memory mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub source: PathBuf,
    pub fs_type: Option<String>,
    pub options: Vec<String>,
}

#[derive(Debug, Default)]
struct State {
    filesystems: HashMap<PathBuf, String>,
    partition_tables: HashMap<PathBuf, String>,
    mounts: HashMap<PathBuf, MountRecord>,
    format_calls: HashMap<PathBuf, usize>,
    fail_next_format: Option<String>,
    fail_next_mount: Option<String>,
}

/// Mounter that keeps devices and mounts in memory.
///
/// Used to drive the node service without root or real block devices.
/// Failures can be injected for the next `format` or `mount` call.
#[derive(Debug, Default)]
pub struct InMemoryMounter {
    state: Mutex<State>,
}

impl InMemoryMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend `device` already carries a filesystem of `fs_type`.
    pub async fn add_filesystem(&self, device: impl Into<PathBuf>, fs_type: &str) {
        self.state.lock().await.filesystems.insert(device.into(), fs_type.to_string());
    }

    /// Pretend `device` carries a partition table of `pt_type` and no filesystem.
    pub async fn add_partition_table(&self, device: impl Into<PathBuf>, pt_type: &str) {
        self.state.lock().await.partition_tables.insert(device.into(), pt_type.to_string());
    }

    pub async fn format_count(&self, device: &Path) -> usize {
        self.state.lock().await.format_calls.get(device).copied().unwrap_or(0)
    }

    pub async fn mount_record(&self, target: &Path) -> Option<MountRecord> {
        self.state.lock().await.mounts.get(target).cloned()
    }

    pub async fn mount_count(&self) -> usize {
        self.state.lock().await.mounts.len()
    }

    pub async fn fail_next_format(&self, output: &str) {
        self.state.lock().await.fail_next_format = Some(output.to_string());
    }

    pub async fn fail_next_mount(&self, output: &str) {
        self.state.lock().await.fail_next_mount = Some(output.to_string());
    }
}

fn injected(program: &str, output: String) -> MountError {
    MountError::CommandFailed { program: program.to_string(), status: "exit status: 1".to_string(), output }
}

#[async_trait]
impl Mounter for InMemoryMounter {
    async fn format(&self, device: &Path, fs_type: &str) -> MountResult<()> {
        let mut state = self.state.lock().await;
        if let Some(output) = state.fail_next_format.take() {
            return Err(injected(&format!("mkfs.{}", fs_type), output));
        }

        *state.format_calls.entry(device.to_path_buf()).or_insert(0) += 1;
        state.filesystems.insert(device.to_path_buf(), fs_type.to_string());
        Ok(())
    }

    async fn probe(&self, device: &Path) -> MountResult<DeviceContents> {
        let state = self.state.lock().await;
        if let Some(fs_type) = state.filesystems.get(device) {
            return Ok(DeviceContents::Filesystem(fs_type.clone()));
        }
        Ok(match state.partition_tables.get(device) {
            Some(pt_type) => DeviceContents::PartitionTable(pt_type.clone()),
            None => DeviceContents::Blank,
        })
    }

    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: Option<&str>,
        options: &[String],
    ) -> MountResult<()> {
        let mut state = self.state.lock().await;
        if let Some(output) = state.fail_next_mount.take() {
            return Err(injected("mount", output));
        }

        if state.mounts.contains_key(target) {
            return Err(injected(
                "mount",
                format!("mount: {}: already mounted", target.display()),
            ));
        }

        state.mounts.insert(
            target.to_path_buf(),
            MountRecord {
                source: source.to_path_buf(),
                fs_type: fs_type.map(str::to_string),
                options: options.to_vec(),
            },
        );
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> MountResult<()> {
        let mut state = self.state.lock().await;
        match state.mounts.remove(target) {
            Some(_) => Ok(()),
            None => Err(injected("umount", format!("umount: {}: not mounted.", target.display()))),
        }
    }

    async fn is_mount_point(&self, path: &Path) -> MountResult<bool> {
        Ok(self.state.lock().await.mounts.contains_key(path))
    }

    async fn mount_source(&self, path: &Path) -> MountResult<Option<PathBuf>> {
        Ok(self.state.lock().await.mounts.get(path).map(|record| record.source.clone()))
    }
}
