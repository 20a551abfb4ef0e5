//! Filesystem and daemon configuration.

use davfs_client::DavConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tunables for the in-memory tree and its kernel-facing cache hints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// How long the kernel may cache attributes.
    #[serde(with = "secs")]
    pub attr_timeout: Duration,
    /// How long the kernel may cache name lookups.
    #[serde(with = "secs")]
    pub entry_timeout: Duration,
    /// Bound on lock-set recomputation rounds in rename.
    pub rename_retry_limit: usize,
    /// Bound on parent links followed when deriving a path.
    pub max_path_depth: usize,
    pub block_size: u32,
    /// Owner reported for every node.
    pub uid: u32,
    pub gid: u32,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            attr_timeout: Duration::from_secs(60),
            entry_timeout: Duration::from_secs(60),
            rename_retry_limit: 64,
            max_path_depth: 4096,
            block_size: 4096,
            uid: 0,
            gid: 0,
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Everything the daemon reads from its config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub mountpoint: PathBuf,
    /// Comma-separated mount options, see [`crate::mount::parse_mount_options`].
    pub mount_options: String,
    pub log_level: String,
    pub dav: DavConfig,
    pub fs: FsConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            mountpoint: PathBuf::from("/mnt/davfs"),
            mount_options: String::new(),
            log_level: String::from("info"),
            dav: DavConfig::default(),
            fs: FsConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: DaemonConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: DaemonConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }
}
