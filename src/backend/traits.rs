use async_trait::async_trait;
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

use super::error::BackendResult;
use super::models::{Attachment, CreateVolumeInput, Volume};

/// Volume and attachment operations of the restvirt control plane.
///
/// One call is one round trip. Implementations do not retry.
#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait VolumeBackend: Send + Sync {
    async fn create_volume(&self, input: CreateVolumeInput) -> BackendResult<Volume>;
    async fn get_volume(&self, volume_id: &str) -> BackendResult<Volume>;
    async fn list_volumes(&self) -> BackendResult<Vec<Volume>>;
    async fn delete_volume(&self, volume_id: &str) -> BackendResult<()>;

    async fn create_attachment(&self, node_id: &str, volume_id: &str) -> BackendResult<Attachment>;
    async fn get_attachment(&self, node_id: &str, volume_id: &str) -> BackendResult<Attachment>;
    async fn delete_attachment(&self, node_id: &str, volume_id: &str) -> BackendResult<()>;
}
