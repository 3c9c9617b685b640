use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_API_ENDPOINT: &str = "http://localhost:8090";
pub const DEFAULT_DEVICE_DIR: &str = "/dev/disk/by-path";
pub const DEFAULT_INSTANCE_DATA_PATH: &str = "/var/run/cloud-init/instance-data.json";
pub const DEFAULT_FS_TYPE: &str = "ext4";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub node: NodeConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Directory holding one symlink per attached disk, named by disk address
    pub device_dir: PathBuf,
    /// cloud-init instance data, source of the node id
    pub instance_data_path: PathBuf,
    pub default_fs_type: String,
    pub topology_key: String,
    pub topology_value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub metrics_address: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self { endpoint: DEFAULT_API_ENDPOINT.to_string() }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            device_dir: PathBuf::from(DEFAULT_DEVICE_DIR),
            instance_data_path: PathBuf::from(DEFAULT_INSTANCE_DATA_PATH),
            default_fs_type: DEFAULT_FS_TYPE.to_string(),
            topology_key: "host".to_string(),
            topology_value: "restvirt".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from an optional file, then `RESTVIRT_CSI_*` variables.
    ///
    /// Nested keys use `__`, e.g. `RESTVIRT_CSI_NODE__DEVICE_DIR`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("RESTVIRT_CSI")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .context("Failed to load configuration")?;

        config.try_deserialize().context("Invalid configuration")
    }
}
