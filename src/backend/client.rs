use super::error::{BackendError, BackendResult};
use super::models::{Attachment, CreateVolumeInput, ErrorMessage, Volume, VolumeList};
use super::traits::VolumeBackend;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::debug;

/// HTTP client for the restvirt REST API
///
/// Every method is a single request. Non-2xx responses are decoded from the
/// `{"Error": "..."}` body and classified by status code.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: Client,
    base: Url,
}

impl RestClient {
    pub fn new(endpoint: &str) -> BackendResult<Self> {
        Self::with_client(Client::new(), endpoint)
    }

    pub fn with_client(http: Client, endpoint: &str) -> BackendResult<Self> {
        let base = Url::parse(endpoint)
            .map_err(|e| BackendError::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;

        if base.cannot_be_a_base() {
            return Err(BackendError::InvalidEndpoint(endpoint.to_string()));
        }

        Ok(Self { http, base })
    }

    pub fn endpoint(&self) -> &Url {
        &self.base
    }

    fn url(&self, segments: &[&str]) -> BackendResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::InvalidEndpoint(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn attachment_url(&self, node_id: &str, volume_id: &str) -> BackendResult<Url> {
        self.url(&["domains", node_id, "volumes", volume_id])
    }
}

/// Pass 2xx responses through, turn everything else into a classified error.
async fn check(response: Response) -> BackendResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ErrorMessage>(&body) {
        Ok(msg) => msg.error,
        Err(_) if body.trim().is_empty() => {
            status.canonical_reason().unwrap_or("unknown error").to_string()
        }
        Err(_) => body.trim().to_string(),
    };

    Err(match status {
        StatusCode::NOT_FOUND => BackendError::NotFound(message),
        StatusCode::CONFLICT => BackendError::Conflict(message),
        _ => BackendError::Status { status: status.as_u16(), message },
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> BackendResult<T> {
    response.json::<T>().await.map_err(|e| BackendError::Decode(e.to_string()))
}

#[async_trait]
impl VolumeBackend for RestClient {
    async fn create_volume(&self, input: CreateVolumeInput) -> BackendResult<Volume> {
        let url = self.url(&["volumes"])?;
        debug!(%url, name = %input.name, size = input.size, "creating volume");

        let response =
            self.http.post(url).json(&input).send().await.map_err(BackendError::Transport)?;
        decode(check(response).await?).await
    }

    async fn get_volume(&self, volume_id: &str) -> BackendResult<Volume> {
        let url = self.url(&["volumes", volume_id])?;
        debug!(%url, "fetching volume");

        let response = self.http.get(url).send().await.map_err(BackendError::Transport)?;
        decode(check(response).await?).await
    }

    async fn list_volumes(&self) -> BackendResult<Vec<Volume>> {
        let url = self.url(&["volumes"])?;
        debug!(%url, "listing volumes");

        let response = self.http.get(url).send().await.map_err(BackendError::Transport)?;
        let list: VolumeList = decode(check(response).await?).await?;
        Ok(list.volumes)
    }

    async fn delete_volume(&self, volume_id: &str) -> BackendResult<()> {
        let url = self.url(&["volumes", volume_id])?;
        debug!(%url, "deleting volume");

        let response = self.http.delete(url).send().await.map_err(BackendError::Transport)?;
        check(response).await?;
        Ok(())
    }

    async fn create_attachment(&self, node_id: &str, volume_id: &str) -> BackendResult<Attachment> {
        let url = self.attachment_url(node_id, volume_id)?;
        debug!(%url, "attaching volume");

        let response = self.http.put(url).send().await.map_err(BackendError::Transport)?;
        decode(check(response).await?).await
    }

    async fn get_attachment(&self, node_id: &str, volume_id: &str) -> BackendResult<Attachment> {
        let url = self.attachment_url(node_id, volume_id)?;
        debug!(%url, "fetching attachment");

        let response = self.http.get(url).send().await.map_err(BackendError::Transport)?;
        decode(check(response).await?).await
    }

    async fn delete_attachment(&self, node_id: &str, volume_id: &str) -> BackendResult<()> {
        let url = self.attachment_url(node_id, volume_id)?;
        debug!(%url, "detaching volume");

        let response = self.http.delete(url).send().await.map_err(BackendError::Transport)?;
        check(response).await?;
        Ok(())
    }
}
