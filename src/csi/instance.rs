// cloud-init instance data
//
// Only `v1.instance_id` is required; it becomes the CSI node id and the
// restvirt domain id used for attachments.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceData {
    pub v1: InstanceDataV1,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceDataV1 {
    pub instance_id: String,
}

impl InstanceData {
    pub fn parse(raw: &str) -> Result<Self> {
        let data: InstanceData =
            serde_json::from_str(raw).context("couldn't decode instance data")?;

        if data.v1.instance_id.trim().is_empty() {
            bail!("instance data has an empty v1.instance_id");
        }

        Ok(data)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("couldn't read instance data from {}", path.display()))?;
        Self::parse(&raw)
    }

    pub fn instance_id(&self) -> &str {
        &self.v1.instance_id
    }
}
