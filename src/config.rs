//! Server configuration.
//!
//! Configuration is read from a YAML file named by `LANTERN_CONFIG`. Every key
//! has a default, so a missing file (or a partial one) is fine:
//!
//! ```yaml
//! server:
//!   listen_addr: "0.0.0.0:8080"
//!   max_connections: 65535
//! static_files:
//!   root: "/srv/www"
//! workers:
//!   threads: 8
//!   queue_capacity: 10000
//! ```
//!
//! `LISTEN` and `LANTERN_ROOT` override the listen address and the document
//! root after the file has been read.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub static_files: StaticFilesConfig,
    pub workers: WorkersConfig,
    pub logging: LoggingConfig,
}

/// Listener and per-connection limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Accepted sockets beyond this many live connections are dropped.
    pub max_connections: usize,
    /// Fixed capacity of each connection's request buffer.
    pub read_buffer_size: usize,
    /// Fixed capacity of each connection's response header buffer.
    pub write_buffer_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StaticFilesConfig {
    /// Document root prefixed to every request target.
    pub root: PathBuf,
    /// Upper bound on the length of `root` + target, in bytes.
    pub max_path_len: usize,
    /// Files larger than this are streamed in chunks instead of mapped.
    pub mmap_threshold: u64,
    pub stream_chunk_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub threads: usize,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            max_connections: 65535,
            read_buffer_size: 2048,
            write_buffer_size: 1024,
        }
    }
}

impl Default for StaticFilesConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./resources"),
            max_path_len: 200,
            mmap_threshold: 64 * 1024 * 1024,
            stream_chunk_size: 64 * 1024,
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            threads: 8,
            queue_capacity: 10000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Loads the file named by `LANTERN_CONFIG` (if set), then applies the
    /// `LISTEN` and `LANTERN_ROOT` overrides.
    pub fn load() -> Result<Self> {
        let mut cfg = match std::env::var("LANTERN_CONFIG") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read config file {path}"))?;
                Self::from_yaml(&raw).with_context(|| format!("invalid config file {path}"))?
            }
            Err(_) => Self::default(),
        };

        if let Ok(listen_addr) = std::env::var("LISTEN") {
            cfg.server.listen_addr = listen_addr;
        }
        if let Ok(root) = std::env::var("LANTERN_ROOT") {
            cfg.static_files.root = PathBuf::from(root);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(raw).context("failed to parse YAML")?;
        Ok(cfg)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address {:?}", self.server.listen_addr))
    }

    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;

        if self.server.max_connections == 0 {
            bail!("server.max_connections must be >= 1");
        }
        if self.server.read_buffer_size == 0 || self.server.write_buffer_size == 0 {
            bail!("buffer sizes must be >= 1");
        }
        if self.workers.threads == 0 {
            bail!("workers.threads must be >= 1");
        }
        if self.workers.queue_capacity == 0 {
            bail!("workers.queue_capacity must be >= 1");
        }
        if self.static_files.stream_chunk_size == 0 {
            bail!("static_files.stream_chunk_size must be >= 1");
        }
        Ok(())
    }

    /// Maximum level for the fmt subscriber; unknown names fall back to INFO.
    pub fn log_level(&self) -> tracing::Level {
        self.logging
            .level
            .parse()
            .unwrap_or(tracing::Level::INFO)
    }
}
