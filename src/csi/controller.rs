use crate::backend::{BackendError, CreateVolumeInput, VolumeBackend};
use crate::csi::metrics::CsiMetrics;
use crate::csi::proto::{
    CapacityRange, ControllerExpandVolumeRequest, ControllerExpandVolumeResponse,
    ControllerGetCapabilitiesRequest, ControllerGetCapabilitiesResponse,
    ControllerGetVolumeRequest, ControllerGetVolumeResponse, ControllerPublishVolumeRequest,
    ControllerPublishVolumeResponse, ControllerServiceCapability,
    ControllerUnpublishVolumeRequest, ControllerUnpublishVolumeResponse, CreateSnapshotRequest,
    CreateSnapshotResponse, CreateVolumeRequest, CreateVolumeResponse, DeleteSnapshotRequest,
    DeleteSnapshotResponse, DeleteVolumeRequest, DeleteVolumeResponse, GetCapacityRequest,
    GetCapacityResponse, ListSnapshotsRequest, ListSnapshotsResponse, ListVolumesRequest,
    ListVolumesResponse, ValidateVolumeCapabilitiesRequest, ValidateVolumeCapabilitiesResponse,
    Volume, controller_get_volume_response, controller_server::Controller, list_volumes_response,
};
use std::collections::HashMap;
use std::sync::Arc;
use tonic::{Request, Response, Status};

/// Key under which the attachment's disk address travels to the node.
pub const DISK_ADDRESS_KEY: &str = "disk_address";

const DEFAULT_CAPACITY_BYTES: i64 = 1024 * 1024 * 1024;

/// Controller Service implementation
///
/// Volume create/delete and attach/detach against restvirt. Holds no state;
/// every call reads through to the backend.
#[derive(Clone)]
pub struct ControllerService {
    backend: Arc<dyn VolumeBackend>,
    metrics: Arc<CsiMetrics>,
}

impl ControllerService {
    pub fn new(backend: Arc<dyn VolumeBackend>, metrics: Arc<CsiMetrics>) -> Self {
        Self { backend, metrics }
    }

    fn capacity_bytes(range: Option<&CapacityRange>) -> i64 {
        match range {
            Some(r) if r.required_bytes > 0 => r.required_bytes,
            Some(r) if r.limit_bytes > 0 => r.limit_bytes,
            _ => DEFAULT_CAPACITY_BYTES,
        }
    }

    fn to_csi_volume(volume: crate::backend::Volume) -> Volume {
        Volume {
            capacity_bytes: volume.size,
            volume_id: volume.id,
            volume_context: Default::default(),
            content_source: None,
            accessible_topology: vec![],
        }
    }

    async fn create(&self, req: CreateVolumeRequest) -> Result<CreateVolumeResponse, Status> {
        if req.name.is_empty() {
            return Err(Status::invalid_argument("no volume name set"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument("no volume capabilities set"));
        }

        let capacity = Self::capacity_bytes(req.capacity_range.as_ref());

        // restvirt has no name index, so a retried CreateVolume is detected by scanning.
        let existing = self
            .backend
            .list_volumes()
            .await
            .map_err(|e| Status::internal(format!("Failed to list volumes: {}", e)))?
            .into_iter()
            .find(|v| v.name == req.name);

        let volume = match existing {
            Some(volume) if volume.size == capacity => {
                tracing::info!(name = %req.name, volume_id = %volume.id, "volume already exists");
                volume
            }
            Some(volume) => {
                return Err(Status::already_exists(format!(
                    "volume {} exists as {} with {} bytes, requested {}",
                    req.name, volume.id, volume.size, capacity
                )));
            }
            None => {
                let mut volume = self
                    .backend
                    .create_volume(CreateVolumeInput { name: req.name.clone(), size: capacity })
                    .await
                    .map_err(|e| Status::internal(format!("Failed to create volume: {}", e)))?;
                if volume.id.is_empty() {
                    return Err(Status::internal("restvirt returned a volume without an id"));
                }
                volume.size = capacity;
                tracing::info!(name = %req.name, volume_id = %volume.id, capacity, "volume created");
                volume
            }
        };

        Ok(CreateVolumeResponse { volume: Some(Self::to_csi_volume(volume)) })
    }

    async fn delete(&self, req: DeleteVolumeRequest) -> Result<DeleteVolumeResponse, Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("no volume id set"));
        }

        match self.backend.delete_volume(&req.volume_id).await {
            Ok(()) => tracing::info!(volume_id = %req.volume_id, "volume deleted"),
            Err(e) if e.is_not_found() => {
                tracing::info!(volume_id = %req.volume_id, "volume already gone");
            }
            Err(e) => return Err(Status::internal(format!("Failed to delete volume: {}", e))),
        }

        Ok(DeleteVolumeResponse {})
    }

    async fn get(&self, req: ControllerGetVolumeRequest) -> Result<ControllerGetVolumeResponse, Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("no volume id set"));
        }

        let volume = self.backend.get_volume(&req.volume_id).await.map_err(|e| {
            if e.is_not_found() {
                Status::not_found(format!("volume {} not found", req.volume_id))
            } else {
                Status::internal(format!("Failed to get volume: {}", e))
            }
        })?;

        Ok(ControllerGetVolumeResponse {
            volume: Some(Self::to_csi_volume(volume)),
            // Attachments are not enumerable per volume in restvirt.
            status: Some(controller_get_volume_response::VolumeStatus {
                published_node_ids: vec![],
                volume_condition: None,
            }),
        })
    }

    async fn list(&self, req: ListVolumesRequest) -> Result<ListVolumesResponse, Status> {
        if !req.starting_token.is_empty() {
            return Err(Status::aborted(format!(
                "unknown starting token {}, pagination is not supported",
                req.starting_token
            )));
        }

        let volumes = self
            .backend
            .list_volumes()
            .await
            .map_err(|e| Status::internal(format!("Failed to list volumes: {}", e)))?;

        let entries = volumes
            .into_iter()
            .map(|volume| list_volumes_response::Entry {
                volume: Some(Self::to_csi_volume(volume)),
                status: Some(list_volumes_response::VolumeStatus {
                    published_node_ids: vec![],
                    volume_condition: None,
                }),
            })
            .collect();

        Ok(ListVolumesResponse { entries, next_token: String::new() })
    }

    async fn publish(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<ControllerPublishVolumeResponse, Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("no volume id set"));
        }
        if req.node_id.is_empty() {
            return Err(Status::invalid_argument("no node id set"));
        }
        if req.volume_capability.is_none() {
            return Err(Status::invalid_argument("no volume capability"));
        }

        let (node_id, volume_id) = (req.node_id.as_str(), req.volume_id.as_str());

        let attachment = match self.backend.get_attachment(node_id, volume_id).await {
            Ok(attachment) => {
                tracing::info!(%node_id, %volume_id, "volume already attached");
                attachment
            }
            Err(e) if e.is_not_found() => {
                match self.backend.create_attachment(node_id, volume_id).await {
                    Ok(attachment) => attachment,
                    // Lost a race with another publish of the same pair.
                    Err(e) if e.is_conflict() => {
                        self.backend.get_attachment(node_id, volume_id).await.map_err(|e| {
                            Status::internal(format!("Failed to get attachment: {}", e))
                        })?
                    }
                    Err(BackendError::NotFound(msg)) => {
                        return Err(Status::not_found(format!(
                            "cannot attach volume {} to node {}: {}",
                            volume_id, node_id, msg
                        )));
                    }
                    Err(e) => {
                        return Err(Status::internal(format!("Failed to attach volume: {}", e)));
                    }
                }
            }
            Err(e) => return Err(Status::internal(format!("Failed to get attachment: {}", e))),
        };

        if attachment.disk_address.is_empty() {
            return Err(Status::internal("restvirt returned an attachment without a disk address"));
        }

        tracing::info!(%node_id, %volume_id, disk_address = %attachment.disk_address, "volume published");

        Ok(ControllerPublishVolumeResponse {
            publish_context: HashMap::from([(
                DISK_ADDRESS_KEY.to_string(),
                attachment.disk_address,
            )]),
        })
    }

    async fn unpublish(
        &self,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<ControllerUnpublishVolumeResponse, Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("no volume id set"));
        }
        if req.node_id.is_empty() {
            return Err(Status::invalid_argument("no node id set"));
        }

        match self.backend.delete_attachment(&req.node_id, &req.volume_id).await {
            Ok(()) => {
                tracing::info!(node_id = %req.node_id, volume_id = %req.volume_id, "volume detached")
            }
            Err(e) if e.is_not_found() => tracing::info!(
                node_id = %req.node_id,
                volume_id = %req.volume_id,
                "volume already detached"
            ),
            Err(e) => return Err(Status::internal(format!("Failed to detach volume: {}", e))),
        }

        Ok(ControllerUnpublishVolumeResponse {})
    }
}

#[tonic::async_trait]
impl Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        self.metrics.track("CreateVolume", self.create(request.into_inner())).await.map(Response::new)
    }

    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        self.metrics.track("DeleteVolume", self.delete(request.into_inner())).await.map(Response::new)
    }

    async fn controller_publish_volume(
        &self,
        request: Request<ControllerPublishVolumeRequest>,
    ) -> Result<Response<ControllerPublishVolumeResponse>, Status> {
        self.metrics
            .track("ControllerPublishVolume", self.publish(request.into_inner()))
            .await
            .map(Response::new)
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<ControllerUnpublishVolumeResponse>, Status> {
        self.metrics
            .track("ControllerUnpublishVolume", self.unpublish(request.into_inner()))
            .await
            .map(Response::new)
    }

    async fn validate_volume_capabilities(
        &self,
        _request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        Err(Status::unimplemented("ValidateVolumeCapabilities not implemented"))
    }

    async fn list_volumes(
        &self,
        request: Request<ListVolumesRequest>,
    ) -> Result<Response<ListVolumesResponse>, Status> {
        self.metrics.track("ListVolumes", self.list(request.into_inner())).await.map(Response::new)
    }

    async fn get_capacity(
        &self,
        _request: Request<GetCapacityRequest>,
    ) -> Result<Response<GetCapacityResponse>, Status> {
        Err(Status::unimplemented("GetCapacity not implemented"))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        use crate::csi::proto::controller_service_capability::{Rpc, Type as CapabilityType, rpc::Type};

        let capabilities = [
            Type::GetVolume,
            Type::CreateDeleteVolume,
            Type::PublishUnpublishVolume,
            Type::ListVolumes,
        ]
        .into_iter()
        .map(|t| ControllerServiceCapability {
            r#type: Some(CapabilityType::Rpc(Rpc { r#type: t as i32 })),
        })
        .collect();

        Ok(Response::new(ControllerGetCapabilitiesResponse { capabilities }))
    }

    async fn create_snapshot(
        &self,
        _request: Request<CreateSnapshotRequest>,
    ) -> Result<Response<CreateSnapshotResponse>, Status> {
        Err(Status::unimplemented("CreateSnapshot not implemented"))
    }

    async fn delete_snapshot(
        &self,
        _request: Request<DeleteSnapshotRequest>,
    ) -> Result<Response<DeleteSnapshotResponse>, Status> {
        Err(Status::unimplemented("DeleteSnapshot not implemented"))
    }

    async fn list_snapshots(
        &self,
        _request: Request<ListSnapshotsRequest>,
    ) -> Result<Response<ListSnapshotsResponse>, Status> {
        Err(Status::unimplemented("ListSnapshots not implemented"))
    }

    async fn controller_expand_volume(
        &self,
        _request: Request<ControllerExpandVolumeRequest>,
    ) -> Result<Response<ControllerExpandVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerExpandVolume not implemented"))
    }

    async fn controller_get_volume(
        &self,
        request: Request<ControllerGetVolumeRequest>,
    ) -> Result<Response<ControllerGetVolumeResponse>, Status> {
        self.metrics.track("ControllerGetVolume", self.get(request.into_inner())).await.map(Response::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Attachment, MockVolumeBackend};
    use crate::csi::proto::VolumeCapability;
    use crate::csi::proto::volume_capability::{AccessType, MountVolume};
    use prometheus::Registry;
    use tonic::Code;

    fn service(backend: MockVolumeBackend) -> ControllerService {
        let metrics = Arc::new(CsiMetrics::new(Arc::new(Registry::new())).unwrap());
        ControllerService::new(Arc::new(backend), metrics)
    }

    fn mount_capability() -> VolumeCapability {
        VolumeCapability {
            access_mode: None,
            access_type: Some(AccessType::Mount(MountVolume {
                fs_type: "ext4".to_string(),
                mount_flags: vec![],
            })),
        }
    }

    fn volume(id: &str, name: &str, size: i64) -> crate::backend::Volume {
        crate::backend::Volume { id: id.to_string(), name: name.to_string(), size }
    }

    fn create_request(name: &str, required_bytes: i64) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: name.to_string(),
            capacity_range: Some(CapacityRange { required_bytes, limit_bytes: 0 }),
            volume_capabilities: vec![mount_capability()],
            ..Default::default()
        }
    }

    fn publish_request(node_id: &str, volume_id: &str) -> ControllerPublishVolumeRequest {
        ControllerPublishVolumeRequest {
            volume_id: volume_id.to_string(),
            node_id: node_id.to_string(),
            volume_capability: Some(mount_capability()),
            ..Default::default()
        }
    }

    #[test]
    fn test_capacity_bytes() {
        assert_eq!(ControllerService::capacity_bytes(None), DEFAULT_CAPACITY_BYTES);
        assert_eq!(
            ControllerService::capacity_bytes(Some(&CapacityRange {
                required_bytes: 5,
                limit_bytes: 10
            })),
            5
        );
        assert_eq!(
            ControllerService::capacity_bytes(Some(&CapacityRange {
                required_bytes: 0,
                limit_bytes: 10
            })),
            10
        );
    }

    #[tokio::test]
    async fn test_create_volume_forwards_name_and_size() {
        let mut backend = MockVolumeBackend::new();
        backend.expect_list_volumes().times(1).returning(|| Ok(vec![]));
        backend
            .expect_create_volume()
            .withf(|input| input.name == "data" && input.size == 10_000_000_000)
            .times(1)
            .returning(|input| Ok(volume("v1", &input.name, 0)));

        let response = service(backend)
            .create_volume(Request::new(create_request("data", 10_000_000_000)))
            .await
            .unwrap()
            .into_inner();

        let volume = response.volume.unwrap();
        assert_eq!(volume.volume_id, "v1");
        assert_eq!(volume.capacity_bytes, 10_000_000_000);
    }

    #[tokio::test]
    async fn test_create_volume_returns_existing_by_name() {
        let mut backend = MockVolumeBackend::new();
        backend.expect_list_volumes().returning(|| Ok(vec![volume("v7", "data", 4096)]));
        backend.expect_create_volume().never();

        let response = service(backend)
            .create_volume(Request::new(create_request("data", 4096)))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.volume.unwrap().volume_id, "v7");
    }

    #[tokio::test]
    async fn test_create_volume_name_conflict() {
        let mut backend = MockVolumeBackend::new();
        backend.expect_list_volumes().returning(|| Ok(vec![volume("v7", "data", 4096)]));
        backend.expect_create_volume().never();

        let err = service(backend)
            .create_volume(Request::new(create_request("data", 8192)))
            .await
            .unwrap_err();

        assert_eq!(err.code(), Code::AlreadyExists);
    }

    #[tokio::test]
    async fn test_create_volume_requires_name() {
        let backend = MockVolumeBackend::new();
        let err = service(backend)
            .create_volume(Request::new(create_request("", 4096)))
            .await
            .unwrap_err();

        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_create_volume_requires_capabilities() {
        let mut backend = MockVolumeBackend::new();
        backend.expect_list_volumes().never();
        backend.expect_create_volume().never();

        let mut request = create_request("data", 4096);
        request.volume_capabilities.clear();

        let err = service(backend).create_volume(Request::new(request)).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_create_volume_backend_failure_is_internal() {
        let mut backend = MockVolumeBackend::new();
        backend.expect_list_volumes().returning(|| Ok(vec![]));
        backend.expect_create_volume().returning(|_| {
            Err(BackendError::Status { status: 500, message: "pool exhausted".to_string() })
        });

        let err = service(backend)
            .create_volume(Request::new(create_request("data", 4096)))
            .await
            .unwrap_err();

        assert_eq!(err.code(), Code::Internal);
        assert!(err.message().contains("pool exhausted"));
    }

    #[tokio::test]
    async fn test_delete_volume_not_found_is_success() {
        let mut backend = MockVolumeBackend::new();
        backend
            .expect_delete_volume()
            .times(1)
            .returning(|id| Err(BackendError::NotFound(format!("volume {} not found", id))));

        let result = service(backend)
            .delete_volume(Request::new(DeleteVolumeRequest {
                volume_id: "v1".to_string(),
                ..Default::default()
            }))
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_delete_volume_other_failure_is_internal() {
        let mut backend = MockVolumeBackend::new();
        backend.expect_delete_volume().returning(|_| {
            Err(BackendError::Status { status: 409, message: "volume in use".to_string() })
        });

        let err = service(backend)
            .delete_volume(Request::new(DeleteVolumeRequest {
                volume_id: "v1".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap_err();

        assert_eq!(err.code(), Code::Internal);
        assert!(err.message().contains("volume in use"));
    }

    #[tokio::test]
    async fn test_get_volume_not_found() {
        let mut backend = MockVolumeBackend::new();
        backend.expect_get_volume().returning(|_| Err(BackendError::NotFound("gone".to_string())));

        let err = service(backend)
            .controller_get_volume(Request::new(ControllerGetVolumeRequest {
                volume_id: "v9".to_string(),
            }))
            .await
            .unwrap_err();

        assert_eq!(err.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_list_volumes_rejects_starting_token() {
        let mut backend = MockVolumeBackend::new();
        backend.expect_list_volumes().never();

        let err = service(backend)
            .list_volumes(Request::new(ListVolumesRequest {
                max_entries: 0,
                starting_token: "10".to_string(),
            }))
            .await
            .unwrap_err();

        assert_eq!(err.code(), Code::Aborted);
    }

    #[tokio::test]
    async fn test_publish_reuses_existing_attachment() {
        let mut backend = MockVolumeBackend::new();
        backend.expect_get_attachment().times(1).returning(|_, _| {
            Ok(Attachment { disk_address: "pci-0000:00:05.0".to_string() })
        });
        backend.expect_create_attachment().never();

        let response = service(backend)
            .controller_publish_volume(Request::new(publish_request("node-a", "v1")))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.publish_context[DISK_ADDRESS_KEY], "pci-0000:00:05.0");
    }

    #[tokio::test]
    async fn test_publish_creates_attachment() {
        let mut backend = MockVolumeBackend::new();
        backend
            .expect_get_attachment()
            .times(1)
            .returning(|_, _| Err(BackendError::NotFound("no attachment".to_string())));
        backend.expect_create_attachment().times(1).returning(|_, _| {
            Ok(Attachment { disk_address: "pci-0000:00:06.0".to_string() })
        });

        let response = service(backend)
            .controller_publish_volume(Request::new(publish_request("node-a", "v1")))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.publish_context[DISK_ADDRESS_KEY], "pci-0000:00:06.0");
    }

    #[tokio::test]
    async fn test_publish_conflict_rereads_attachment() {
        let mut backend = MockVolumeBackend::new();
        let mut seq = mockall::Sequence::new();
        backend
            .expect_get_attachment()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(BackendError::NotFound("no attachment".to_string())));
        backend
            .expect_create_attachment()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(BackendError::Conflict("already attached".to_string())));
        backend.expect_get_attachment().times(1).in_sequence(&mut seq).returning(|_, _| {
            Ok(Attachment { disk_address: "pci-0000:00:07.0".to_string() })
        });

        let response = service(backend)
            .controller_publish_volume(Request::new(publish_request("node-a", "v1")))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.publish_context[DISK_ADDRESS_KEY], "pci-0000:00:07.0");
    }

    #[tokio::test]
    async fn test_publish_unknown_volume_is_not_found() {
        let mut backend = MockVolumeBackend::new();
        backend
            .expect_get_attachment()
            .returning(|_, _| Err(BackendError::NotFound("no attachment".to_string())));
        backend
            .expect_create_attachment()
            .returning(|_, _| Err(BackendError::NotFound("no such volume".to_string())));

        let err = service(backend)
            .controller_publish_volume(Request::new(publish_request("node-a", "v404")))
            .await
            .unwrap_err();

        assert_eq!(err.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_publish_requires_capability() {
        let backend = MockVolumeBackend::new();
        let mut request = publish_request("node-a", "v1");
        request.volume_capability = None;

        let err = service(backend)
            .controller_publish_volume(Request::new(request))
            .await
            .unwrap_err();

        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_unpublish_already_detached_is_success() {
        let mut backend = MockVolumeBackend::new();
        backend
            .expect_delete_attachment()
            .times(1)
            .returning(|_, _| Err(BackendError::NotFound("no attachment".to_string())));

        let result = service(backend)
            .controller_unpublish_volume(Request::new(ControllerUnpublishVolumeRequest {
                volume_id: "v1".to_string(),
                node_id: "node-a".to_string(),
                ..Default::default()
            }))
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_unimplemented_rpcs() {
        let service = service(MockVolumeBackend::new());

        let err = service
            .get_capacity(Request::new(GetCapacityRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);

        let err = service
            .controller_expand_volume(Request::new(ControllerExpandVolumeRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);
    }
}
