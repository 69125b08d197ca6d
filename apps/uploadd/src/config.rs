//! Daemon configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/chunkdock/uploadd.toml`
//! - Windows: `%APPDATA%/chunkdock/uploadd.toml`

use std::path::{Path, PathBuf};

use chunkdock_transfer::{
    DEFAULT_MAX_ALLOCATION_ATTEMPTS, DEFAULT_MAX_TOTAL_CHUNKS, DEFAULT_MAX_UPLOAD_SIZE,
    MergePolicy, StorageConfig,
};
use serde::{Deserialize, Serialize};

/// Upload daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// WebSocket server port (0 = auto-assign).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Base directory for chunk staging and merged artifacts.
    #[serde(default = "default_storage_path")]
    pub storage_path: String,

    /// Directory holding one JSON record per upload.
    #[serde(default = "default_records_path")]
    pub records_path: String,

    /// Largest total size a client may declare, in bytes.
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,

    #[serde(default)]
    pub merge_policy: MergePolicy,

    #[serde(default = "default_max_allocation_attempts")]
    pub max_allocation_attempts: u32,

    /// Largest chunk count a client may declare.
    #[serde(default = "default_max_total_chunks")]
    pub max_total_chunks: u32,

    /// Simultaneous client connections; extra handshakes are refused.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_port() -> u16 {
    8740
}

fn default_storage_path() -> String {
    "~/.local/share/chunkdock/uploads".into()
}

fn default_records_path() -> String {
    "~/.local/share/chunkdock/records".into()
}

fn default_max_upload_size() -> u64 {
    DEFAULT_MAX_UPLOAD_SIZE
}

fn default_max_allocation_attempts() -> u32 {
    DEFAULT_MAX_ALLOCATION_ATTEMPTS
}

fn default_max_total_chunks() -> u32 {
    DEFAULT_MAX_TOTAL_CHUNKS
}

fn default_max_connections() -> usize {
    chunkdock_server::DEFAULT_MAX_CONNECTIONS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            storage_path: default_storage_path(),
            records_path: default_records_path(),
            max_upload_size: default_max_upload_size(),
            merge_policy: MergePolicy::default(),
            max_allocation_attempts: default_max_allocation_attempts(),
            max_total_chunks: default_max_total_chunks(),
            max_connections: default_max_connections(),
        }
    }
}

impl Config {
    /// Loads configuration from disk, or creates a default if not found.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path()?)
    }

    fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // Restrict permissions on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Storage settings for the coordinator, with `~/` expanded.
    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig::new(expand_path(&self.storage_path))
            .with_max_upload_size(self.max_upload_size)
            .with_merge_policy(self.merge_policy)
            .with_max_allocation_attempts(self.max_allocation_attempts)
            .with_max_total_chunks(self.max_total_chunks)
    }

    /// Record directory with `~/` expanded.
    pub fn records_dir(&self) -> PathBuf {
        PathBuf::from(expand_path(&self.records_path))
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("chunkdock")
            .join("uploadd.toml"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("chunkdock").join("uploadd.toml"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Ok(PathBuf::from("/tmp/chunkdock/uploadd.toml"))
    }
}

/// Expands a leading `~/` against `$HOME`.
pub(crate) fn expand_path(path: &str) -> String {
    if path.starts_with("~/")
        && let Ok(home) = std::env::var("HOME")
    {
        return format!("{}{}", home, &path[1..]);
    }
    path.to_string()
}
