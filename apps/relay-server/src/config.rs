//! Relay configuration.
//!
//! Stored as TOML next to the binary by default (`liverelay.toml`); every
//! field is optional and falls back to its default.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use liverelay_http::{DEFAULT_BODY_LIMIT, ServerConfig};
use liverelay_relay::{ConflictPolicy, OverflowPolicy, QueuePolicy, UploadOptions};
use serde::{Deserialize, Serialize};

/// Relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to listen on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: IpAddr,

    /// HTTP port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory holding uploaded files.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Runtime worker threads.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Largest accepted upload in bytes.
    #[serde(default = "default_body_limit")]
    pub body_limit: u64,

    /// Log filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for rotated log files; stdout only when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,

    /// Rotated log files kept in `log_dir`.
    #[serde(default = "default_log_max_files")]
    pub log_max_files: usize,

    /// `supersede` or `reject` a second upload to a busy path.
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,

    /// Chunks buffered per download; unbounded when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_queue_capacity: Option<usize>,

    /// `block` or `disconnect` when a bounded download queue is full.
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,

    /// Leave the `.tmp` file behind when an upload fails.
    #[serde(default)]
    pub keep_partial_uploads: bool,
}

fn default_listen_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8080
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_worker_threads() -> usize {
    8
}

fn default_body_limit() -> u64 {
    DEFAULT_BODY_LIMIT
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_max_files() -> usize {
    7
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            port: default_port(),
            root_dir: default_root_dir(),
            worker_threads: default_worker_threads(),
            body_limit: default_body_limit(),
            log_level: default_log_level(),
            log_dir: None,
            log_max_files: default_log_max_files(),
            conflict_policy: ConflictPolicy::default(),
            download_queue_capacity: None,
            overflow_policy: OverflowPolicy::default(),
            keep_partial_uploads: false,
        }
    }
}

impl Config {
    /// Loads configuration from `path`, or writes and returns the defaults
    /// if the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str::<Config>(&content)?
        } else {
            let config = Config::default();
            config.save(path)?;
            config
        };
        config.validate()?;
        Ok(config)
    }

    /// Saves the configuration to `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.worker_threads > 0, "worker_threads must be at least 1");
        anyhow::ensure!(self.body_limit > 0, "body_limit must be at least 1");
        Ok(())
    }

    pub fn queue_policy(&self) -> QueuePolicy {
        QueuePolicy::from_capacity(self.download_queue_capacity, self.overflow_policy)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            listen_addr: self.listen_addr,
            port: self.port,
            root_dir: self.root_dir.clone(),
            body_limit: self.body_limit,
            upload: UploadOptions {
                queue: self.queue_policy(),
                keep_partial_uploads: self.keep_partial_uploads,
            },
        }
    }
}
