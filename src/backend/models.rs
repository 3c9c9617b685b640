use serde::{Deserialize, Serialize};

/// Volume resource as stored by restvirt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVolumeInput {
    pub name: String,
    pub size: i64,
}

/// Attachment of a volume to a domain (node).
///
/// `disk_address` is the by-path name under which the disk shows up
/// inside the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub disk_address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeList {
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    #[serde(rename = "Error")]
    pub error: String,
}
