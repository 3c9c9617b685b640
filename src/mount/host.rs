use super::error::{MountError, MountResult};
use super::{DeviceContents, Mounter, mountinfo};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use tokio::process::Command;

const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// blkid exit code when the probe found no recognizable signature.
const BLKID_NOTHING_FOUND: i32 = 2;

#[derive(Debug)]
struct CommandOutput {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

impl CommandOutput {
    fn combined(&self) -> String {
        let mut out = self.stdout.trim_end().to_string();
        if !self.stderr.trim().is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(self.stderr.trim_end());
        }
        out
    }
}

/// Mounter backed by mkfs, blkid, mount and umount on the host
#[derive(Debug, Clone)]
pub struct HostMounter {
    mountinfo_path: PathBuf,
}

impl HostMounter {
    pub fn new() -> Self {
        Self::with_mountinfo(MOUNTINFO_PATH)
    }

    pub fn with_mountinfo(path: impl Into<PathBuf>) -> Self {
        Self { mountinfo_path: path.into() }
    }

    async fn run(program: &str, args: Vec<OsString>) -> MountResult<CommandOutput> {
        let output = Command::new(program).args(&args).output().await.map_err(|e| {
            MountError::Spawn { program: program.to_string(), source: e }
        })?;

        let result = CommandOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        tracing::debug!(program, ?args, status = %result.status, output = %result.combined(), "command finished");

        Ok(result)
    }

    async fn run_checked(program: &str, args: Vec<OsString>) -> MountResult<CommandOutput> {
        let result = Self::run(program, args).await?;
        if !result.status.success() {
            return Err(MountError::CommandFailed {
                program: program.to_string(),
                status: result.status.to_string(),
                output: result.combined(),
            });
        }
        Ok(result)
    }
}

impl HostMounter {
    async fn read_table(&self) -> MountResult<String> {
        tokio::fs::read_to_string(&self.mountinfo_path).await.map_err(|e| {
            MountError::MountTable { path: self.mountinfo_path.clone(), source: e }
        })
    }
}

impl Default for HostMounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Arguments for `mkfs.<fs_type>`.
///
/// The ext family refuses whole-disk devices without `-F`.
fn format_args(device: &Path, fs_type: &str) -> Vec<OsString> {
    let mut args = Vec::new();
    if fs_type.starts_with("ext") {
        args.push(OsString::from("-F"));
    }
    args.push(device.as_os_str().to_owned());
    args
}

/// Classify `blkid -p -o export` output.
///
/// A filesystem signature wins over a partition table. `None` when blkid
/// reported neither.
fn parse_probe(export: &str) -> Option<DeviceContents> {
    let mut fs_type = None;
    let mut pt_type = None;

    for (key, value) in export.lines().filter_map(|line| line.trim().split_once('=')) {
        match key {
            "TYPE" if !value.is_empty() => fs_type = Some(value.to_string()),
            "PTTYPE" if !value.is_empty() => pt_type = Some(value.to_string()),
            _ => {}
        }
    }

    fs_type
        .map(DeviceContents::Filesystem)
        .or_else(|| pt_type.map(DeviceContents::PartitionTable))
}

fn mount_args(
    source: &Path,
    target: &Path,
    fs_type: Option<&str>,
    options: &[String],
) -> Vec<OsString> {
    let mut args = Vec::new();
    if let Some(fs_type) = fs_type {
        args.push(OsString::from("-t"));
        args.push(OsString::from(fs_type));
    }
    if !options.is_empty() {
        args.push(OsString::from("-o"));
        args.push(OsString::from(options.join(",")));
    }
    args.push(source.as_os_str().to_owned());
    args.push(target.as_os_str().to_owned());
    args
}

#[async_trait]
impl Mounter for HostMounter {
    async fn format(&self, device: &Path, fs_type: &str) -> MountResult<()> {
        let program = format!("mkfs.{}", fs_type);
        tracing::info!(device = %device.display(), fs_type, "formatting device");
        Self::run_checked(&program, format_args(device, fs_type)).await?;
        Ok(())
    }

    async fn probe(&self, device: &Path) -> MountResult<DeviceContents> {
        let args = vec![
            OsString::from("-p"),
            OsString::from("-o"),
            OsString::from("export"),
            device.as_os_str().to_owned(),
        ];
        let result = Self::run("blkid", args).await?;

        match result.status.code() {
            Some(0) => parse_probe(&result.stdout).ok_or_else(|| MountError::Unrecognized {
                device: device.to_path_buf(),
                output: result.combined(),
            }),
            Some(BLKID_NOTHING_FOUND) => Ok(DeviceContents::Blank),
            _ => Err(MountError::CommandFailed {
                program: "blkid".to_string(),
                status: result.status.to_string(),
                output: result.combined(),
            }),
        }
    }

    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: Option<&str>,
        options: &[String],
    ) -> MountResult<()> {
        tracing::info!(
            source = %source.display(),
            target = %target.display(),
            ?fs_type,
            ?options,
            "mounting"
        );
        Self::run_checked("mount", mount_args(source, target, fs_type, options)).await?;
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> MountResult<()> {
        tracing::info!(target = %target.display(), "unmounting");
        Self::run_checked("umount", vec![target.as_os_str().to_owned()]).await?;
        Ok(())
    }

    async fn is_mount_point(&self, path: &Path) -> MountResult<bool> {
        let table = self.read_table().await?;

        if mountinfo::contains(&table, path) {
            return Ok(true);
        }

        // The kernel records resolved paths; callers may hand us a symlinked one.
        match tokio::fs::canonicalize(path).await {
            Ok(resolved) if resolved != path => Ok(mountinfo::contains(&table, &resolved)),
            _ => Ok(false),
        }
    }

    async fn mount_source(&self, path: &Path) -> MountResult<Option<PathBuf>> {
        let table = self.read_table().await?;

        if let Some(source) = mountinfo::source_of(&table, path) {
            return Ok(Some(source));
        }

        match tokio::fs::canonicalize(path).await {
            Ok(resolved) if resolved != path => Ok(mountinfo::source_of(&table, &resolved)),
            _ => Ok(None),
        }
    }
}
