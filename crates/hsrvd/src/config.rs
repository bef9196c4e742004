//! Daemon settings: TOML file layered under command-line flags

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use hsrv_transport::ServerConfig;
use serde::Deserialize;

pub const DEFAULT_HASH_FILE: &str = "/usr/share/hsrv/hashes.txt";
pub const DEFAULT_PORT: u16 = 9120;
pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Keys accepted in the config file. Every key is optional.
///
/// ```toml
/// file = "/var/lib/hsrv/hashes.txt"
/// port = 9120
/// bind = "127.0.0.1"
/// log_level = "debug"
/// timeout = 15
/// status = true
/// old_protocol_only = false
/// metrics_port = 9121
/// max_line_bytes = 65535
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub file: Option<PathBuf>,
    pub port: Option<u16>,
    pub bind: Option<String>,
    pub log_level: Option<String>,
    /// Idle timeout in seconds
    pub timeout: Option<u64>,
    pub status: Option<bool>,
    pub old_protocol_only: Option<bool>,
    pub metrics_port: Option<u16>,
    pub max_line_bytes: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Layer `over` on top of `self`; set keys in `over` win
    pub fn merge(self, over: FileConfig) -> FileConfig {
        FileConfig {
            file: over.file.or(self.file),
            port: over.port.or(self.port),
            bind: over.bind.or(self.bind),
            log_level: over.log_level.or(self.log_level),
            timeout: over.timeout.or(self.timeout),
            status: over.status.or(self.status),
            old_protocol_only: over.old_protocol_only.or(self.old_protocol_only),
            metrics_port: over.metrics_port.or(self.metrics_port),
            max_line_bytes: over.max_line_bytes.or(self.max_line_bytes),
        }
    }
}

/// Fully resolved daemon settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub file: PathBuf,
    pub port: u16,
    pub bind: String,
    pub log_level: String,
    pub metrics_port: Option<u16>,
    pub server: ServerConfig,
}

impl From<FileConfig> for Settings {
    fn from(cfg: FileConfig) -> Self {
        let mut server = ServerConfig::new()
            .with_status(cfg.status.unwrap_or(false))
            .with_old_protocol_only(cfg.old_protocol_only.unwrap_or(false));
        if let Some(secs) = cfg.timeout {
            server = server.with_idle_timeout(Duration::from_secs(secs));
        }
        if let Some(max) = cfg.max_line_bytes {
            server = server.with_max_pending_bytes(max);
        }

        Settings {
            file: cfg.file.unwrap_or_else(|| PathBuf::from(DEFAULT_HASH_FILE)),
            port: cfg.port.unwrap_or(DEFAULT_PORT),
            bind: cfg.bind.unwrap_or_else(|| DEFAULT_BIND.to_string()),
            log_level: cfg.log_level.unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            metrics_port: cfg.metrics_port,
            server,
        }
    }
}
