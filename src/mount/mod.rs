// Host mount executor
//
// Formatting and mounting go through the `Mounter` trait so the node service
// can run against the real OS (`HostMounter`) or an in-memory table
// (`InMemoryMounter`).

pub mod error;
pub mod fake;
pub mod host;
pub mod mountinfo;

pub use error::{MountError, MountResult};
pub use fake::{InMemoryMounter, MountRecord};
pub use host::HostMounter;

use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Mount option that turns a mount into a bind mount.
pub const BIND: &str = "bind";

/// What a signature probe found on a block device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceContents {
    Blank,
    Filesystem(String),
    /// Partition table (`dos`, `gpt`, ...) without a filesystem on the whole device.
    PartitionTable(String),
}

#[async_trait]
pub trait Mounter: Send + Sync {
    /// Create a filesystem of `fs_type` on `device`, destroying its contents.
    async fn format(&self, device: &Path, fs_type: &str) -> MountResult<()>;

    /// Probe `device` for filesystem and partition table signatures.
    async fn probe(&self, device: &Path) -> MountResult<DeviceContents>;

    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: Option<&str>,
        options: &[String],
    ) -> MountResult<()>;

    async fn unmount(&self, target: &Path) -> MountResult<()>;

    /// Whether `path` appears as a mount point in the current mount table.
    async fn is_mount_point(&self, path: &Path) -> MountResult<bool>;

    /// Source of the topmost mount at `path`, `None` if nothing is mounted there.
    async fn mount_source(&self, path: &Path) -> MountResult<Option<PathBuf>>;

    async fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> MountResult<()> {
        let mut options = vec![BIND.to_string()];
        if read_only {
            options.push("ro".to_string());
        }
        self.mount(source, target, None, &options).await
    }
}
