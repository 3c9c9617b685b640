use crate::config::NodeConfig;
use crate::csi::controller::DISK_ADDRESS_KEY;
use crate::csi::instance::InstanceData;
use crate::csi::metrics::CsiMetrics;
use crate::csi::proto::{
    NodeExpandVolumeRequest, NodeExpandVolumeResponse, NodeGetCapabilitiesRequest,
    NodeGetCapabilitiesResponse, NodeGetInfoRequest, NodeGetInfoResponse,
    NodeGetVolumeStatsRequest, NodeGetVolumeStatsResponse, NodePublishVolumeRequest,
    NodePublishVolumeResponse, NodeServiceCapability, NodeStageVolumeRequest,
    NodeStageVolumeResponse, NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse,
    NodeUnstageVolumeRequest, NodeUnstageVolumeResponse, Topology, VolumeCapability,
    node_server::Node, volume_capability::AccessType,
};
use crate::mount::{DeviceContents, Mounter};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tonic::{Request, Response, Status};

/// Map a disk address from the publish context to its device node.
///
/// The address must be a single path component; anything that could walk out
/// of `device_dir` is rejected.
pub fn resolve_device(device_dir: &Path, disk_address: &str) -> Result<PathBuf, Status> {
    if disk_address.is_empty()
        || disk_address == "."
        || disk_address.contains("..")
        || disk_address.contains('/')
        || disk_address.contains('\0')
    {
        return Err(Status::invalid_argument(format!(
            "invalid disk address {:?}",
            disk_address
        )));
    }

    Ok(device_dir.join(disk_address))
}

fn disk_address(publish_context: &HashMap<String, String>) -> Result<&str, Status> {
    publish_context
        .get(DISK_ADDRESS_KEY)
        .map(String::as_str)
        .ok_or_else(|| Status::invalid_argument("publish context has no disk address"))
}

fn access_type(capability: &Option<VolumeCapability>) -> Result<&AccessType, Status> {
    capability
        .as_ref()
        .ok_or_else(|| Status::invalid_argument("no volume capability"))?
        .access_type
        .as_ref()
        .ok_or_else(|| Status::invalid_argument("volume capability has no access type"))
}

async fn create_dir(path: &Path) -> Result<(), Status> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| Status::internal(format!("Failed to create {}: {}", path.display(), e)))
}

/// Create an empty regular file for a block bind mount, keeping one that exists.
async fn create_file(path: &Path) -> Result<(), Status> {
    if let Some(parent) = path.parent() {
        create_dir(parent).await?;
    }

    tokio::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .await
        .map(drop)
        .map_err(|e| Status::internal(format!("Failed to create {}: {}", path.display(), e)))
}

/// Resolve symlinks such as `/dev/disk/by-path/*`, keeping the path as given if that fails.
async fn canonical(path: &Path) -> PathBuf {
    tokio::fs::canonicalize(path).await.unwrap_or_else(|_| path.to_path_buf())
}

async fn remove_target(path: &Path) -> Result<(), Status> {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Status::internal(format!("Failed to remove {}: {}", path.display(), e))),
    }
}

/// Node Service implementation
///
/// Formats, stages and bind-mounts attached disks on this host.
#[derive(Clone)]
pub struct NodeService {
    mounter: Arc<dyn Mounter>,
    config: NodeConfig,
    metrics: Arc<CsiMetrics>,
}

impl NodeService {
    pub fn new(mounter: Arc<dyn Mounter>, config: NodeConfig, metrics: Arc<CsiMetrics>) -> Self {
        Self { mounter, config, metrics }
    }

    async fn is_mount_point(&self, path: &Path) -> Result<bool, Status> {
        self.mounter
            .is_mount_point(path)
            .await
            .map_err(|e| Status::internal(format!("Failed to inspect mount table: {}", e)))
    }

    async fn stage(&self, req: NodeStageVolumeRequest) -> Result<NodeStageVolumeResponse, Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("no volume id set"));
        }
        if req.staging_target_path.is_empty() {
            return Err(Status::invalid_argument("no staging target path set"));
        }

        let mount = match access_type(&req.volume_capability)? {
            AccessType::Block(_) => {
                tracing::debug!(volume_id = %req.volume_id, "block volume, nothing to stage");
                return Ok(NodeStageVolumeResponse {});
            }
            AccessType::Mount(mount) => mount,
        };

        let device = resolve_device(&self.config.device_dir, disk_address(&req.publish_context)?)?;
        let staging_path = Path::new(&req.staging_target_path);

        let mounted = self
            .mounter
            .mount_source(staging_path)
            .await
            .map_err(|e| Status::internal(format!("Failed to inspect mount table: {}", e)))?;

        if let Some(source) = mounted {
            if canonical(&source).await != canonical(&device).await {
                return Err(Status::already_exists(format!(
                    "{} is already staged from {}, not {}",
                    staging_path.display(),
                    source.display(),
                    device.display()
                )));
            }
            tracing::info!(volume_id = %req.volume_id, path = %staging_path.display(), "volume already staged");
            return Ok(NodeStageVolumeResponse {});
        }

        let fs_type = if mount.fs_type.is_empty() {
            self.config.default_fs_type.as_str()
        } else {
            mount.fs_type.as_str()
        };

        let contents = self
            .mounter
            .probe(&device)
            .await
            .map_err(|e| Status::internal(format!("Failed to probe {}: {}", device.display(), e)))?;

        match contents {
            DeviceContents::Blank => {
                tracing::info!(device = %device.display(), fs_type, "formatting device");
                self.mounter.format(&device, fs_type).await.map_err(|e| {
                    Status::internal(format!("Failed to format {}: {}", device.display(), e))
                })?;
            }
            DeviceContents::Filesystem(found) if found == fs_type => {
                tracing::debug!(device = %device.display(), fs_type, "device already formatted");
            }
            DeviceContents::Filesystem(found) => {
                return Err(Status::internal(format!(
                    "{} holds a {} filesystem, requested {}",
                    device.display(),
                    found,
                    fs_type
                )));
            }
            DeviceContents::PartitionTable(pt_type) => {
                return Err(Status::internal(format!(
                    "{} carries a {} partition table, refusing to format it",
                    device.display(),
                    pt_type
                )));
            }
        }

        create_dir(staging_path).await?;

        self.mounter
            .mount(&device, staging_path, Some(fs_type), &mount.mount_flags)
            .await
            .map_err(|e| Status::internal(format!("Failed to mount volume: {}", e)))?;

        tracing::info!(
            volume_id = %req.volume_id,
            device = %device.display(),
            path = %staging_path.display(),
            "volume staged"
        );

        Ok(NodeStageVolumeResponse {})
    }

    async fn unstage(
        &self,
        req: NodeUnstageVolumeRequest,
    ) -> Result<NodeUnstageVolumeResponse, Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("no volume id set"));
        }
        if req.staging_target_path.is_empty() {
            return Err(Status::invalid_argument("no staging target path set"));
        }

        let staging_path = Path::new(&req.staging_target_path);
        if !self.is_mount_point(staging_path).await? {
            tracing::info!(volume_id = %req.volume_id, "volume not staged");
            return Ok(NodeUnstageVolumeResponse {});
        }

        self.mounter
            .unmount(staging_path)
            .await
            .map_err(|e| Status::internal(format!("Failed to unmount volume: {}", e)))?;

        tracing::info!(volume_id = %req.volume_id, path = %staging_path.display(), "volume unstaged");

        Ok(NodeUnstageVolumeResponse {})
    }

    async fn publish(
        &self,
        req: NodePublishVolumeRequest,
    ) -> Result<NodePublishVolumeResponse, Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("no volume id set"));
        }
        if req.staging_target_path.is_empty() {
            return Err(Status::invalid_argument("no staging target path set"));
        }
        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("no target path set"));
        }
        let access = access_type(&req.volume_capability)?;

        let target = Path::new(&req.target_path);
        if self.is_mount_point(target).await? {
            tracing::info!(volume_id = %req.volume_id, "volume already published");
            return Ok(NodePublishVolumeResponse {});
        }

        let source = match access {
            AccessType::Mount(_) => {
                let staging_path = PathBuf::from(&req.staging_target_path);
                if !self.is_mount_point(&staging_path).await? {
                    return Err(Status::failed_precondition(format!(
                        "volume {} is not staged at {}",
                        req.volume_id,
                        staging_path.display()
                    )));
                }
                create_dir(target).await?;
                staging_path
            }
            AccessType::Block(_) => {
                let device =
                    resolve_device(&self.config.device_dir, disk_address(&req.publish_context)?)?;
                create_file(target).await?;
                device
            }
        };

        self.mounter
            .bind_mount(&source, target, req.readonly)
            .await
            .map_err(|e| Status::internal(format!("Failed to bind mount volume: {}", e)))?;

        tracing::info!(
            volume_id = %req.volume_id,
            source = %source.display(),
            target = %target.display(),
            readonly = req.readonly,
            "volume published"
        );

        Ok(NodePublishVolumeResponse {})
    }

    async fn unpublish(
        &self,
        req: NodeUnpublishVolumeRequest,
    ) -> Result<NodeUnpublishVolumeResponse, Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("no volume id set"));
        }
        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("no target path set"));
        }

        let target = Path::new(&req.target_path);
        if self.is_mount_point(target).await? {
            self.mounter
                .unmount(target)
                .await
                .map_err(|e| Status::internal(format!("Failed to unmount volume: {}", e)))?;
        }

        remove_target(target).await?;

        tracing::info!(volume_id = %req.volume_id, target = %target.display(), "volume unpublished");

        Ok(NodeUnpublishVolumeResponse {})
    }

    async fn info(&self) -> Result<NodeGetInfoResponse, Status> {
        let data = InstanceData::load(&self.config.instance_data_path)
            .await
            .map_err(|e| Status::internal(format!("Failed to read node identity: {:#}", e)))?;

        Ok(NodeGetInfoResponse {
            node_id: data.instance_id().to_string(),
            max_volumes_per_node: 0,
            accessible_topology: Some(Topology {
                segments: HashMap::from([(
                    self.config.topology_key.clone(),
                    self.config.topology_value.clone(),
                )]),
            }),
        })
    }
}

#[tonic::async_trait]
impl Node for NodeService {
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        self.metrics.track("NodeStageVolume", self.stage(request.into_inner())).await.map(Response::new)
    }

    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        self.metrics
            .track("NodeUnstageVolume", self.unstage(request.into_inner()))
            .await
            .map(Response::new)
    }

    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        self.metrics
            .track("NodePublishVolume", self.publish(request.into_inner()))
            .await
            .map(Response::new)
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        self.metrics
            .track("NodeUnpublishVolume", self.unpublish(request.into_inner()))
            .await
            .map(Response::new)
    }

    async fn node_get_volume_stats(
        &self,
        _request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        Err(Status::unimplemented("NodeGetVolumeStats not implemented"))
    }

    async fn node_expand_volume(
        &self,
        _request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        Err(Status::unimplemented("NodeExpandVolume not implemented"))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        use crate::csi::proto::node_service_capability::{Rpc, Type as CapabilityType, rpc::Type};

        let capabilities = [Type::StageUnstageVolume]
            .into_iter()
            .map(|t| NodeServiceCapability {
                r#type: Some(CapabilityType::Rpc(Rpc { r#type: t as i32 })),
            })
            .collect();

        Ok(Response::new(NodeGetCapabilitiesResponse { capabilities }))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        self.metrics.track("NodeGetInfo", self.info()).await.map(Response::new)
    }
}
