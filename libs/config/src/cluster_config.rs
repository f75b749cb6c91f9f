//! Cluster Configuration Module
//!
//! Loads the layout of one cluster process: who it is, how many peers it
//! has, how many workers it runs and which transport backend connects it
//! to the rest. Values come from a TOML file overridden by environment
//! variables (`PLACENET__PROCESS_ID=1`).

use crate::defaults;
use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Main cluster configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Index of this process inside the cluster
    pub process_id: u32,

    /// Number of cooperating processes
    pub process_count: usize,

    /// Worker threads in this process
    pub threads: usize,

    /// Quit the cluster automatically once it is quiescent
    pub autohalt: bool,

    /// Minimum pause between termination probes (milliseconds)
    pub probe_interval_ms: u64,

    /// Worker back-off after an idle iteration (microseconds)
    pub idle_sleep_us: u64,

    /// Transport backend connecting the processes
    pub backend: BackendConfig,

    /// Logging settings
    pub log: LogConfig,
}

/// Transport backend selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// All processes hosted in this OS process, exchanging packets through mailboxes
    Mailbox,
    /// One OS process per cluster process, connected over TCP
    Tcp(TcpSettings),
}

/// Network channel settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpSettings {
    /// Listen address of every process, indexed by process id
    pub peers: Vec<SocketAddr>,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    #[serde(default = "default_io_threads")]
    pub io_threads: usize,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter when `RUST_LOG` is not set
    pub level: String,

    /// Emit JSON lines instead of human readable output
    pub json: bool,

    /// Directory for per-worker execution traces
    pub trace_dir: Option<PathBuf>,
}

fn default_connect_timeout_ms() -> u64 {
    defaults::tcp::CONNECT_TIMEOUT_MS
}

fn default_max_frame_size() -> usize {
    defaults::tcp::MAX_FRAME_SIZE
}

fn default_io_threads() -> usize {
    defaults::tcp::IO_THREADS
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            process_id: 0,
            process_count: 1,
            threads: defaults::THREADS,
            autohalt: true,
            probe_interval_ms: defaults::PROBE_INTERVAL_MS,
            idle_sleep_us: defaults::IDLE_SLEEP_US,
            backend: BackendConfig::Mailbox,
            log: LogConfig::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            trace_dir: None,
        }
    }
}

impl TcpSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl ClusterConfig {
    /// Load configuration from an optional file with `PLACENET__*` overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, defaults::ENV_PREFIX)
    }

    /// Load configuration using a custom environment variable prefix
    pub fn load_with_prefix(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading cluster config: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(env_prefix)
                .separator("__")
                .try_parsing(true),
        );

        let config: ClusterConfig = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        debug!(
            process_id = config.process_id,
            process_count = config.process_count,
            threads = config.threads,
            "Cluster configuration loaded"
        );
        Ok(config)
    }

    /// Reject layouts no cluster can be started with
    pub fn validate(&self) -> Result<()> {
        if self.process_count == 0 {
            bail!("process_count must be at least 1");
        }
        if self.threads == 0 {
            bail!("threads must be at least 1");
        }
        if self.process_id as usize >= self.process_count {
            bail!(
                "process_id {} is outside a {}-process cluster",
                self.process_id,
                self.process_count
            );
        }
        if self.probe_interval_ms == 0 {
            bail!("probe_interval_ms must be positive");
        }
        if let BackendConfig::Tcp(tcp) = &self.backend {
            if tcp.peers.len() != self.process_count {
                bail!(
                    "tcp backend lists {} peers for {} processes",
                    tcp.peers.len(),
                    self.process_count
                );
            }
            if tcp.io_threads == 0 {
                bail!("tcp io_threads must be at least 1");
            }
            if tcp.max_frame_size < 64 {
                bail!("tcp max_frame_size {} is too small", tcp.max_frame_size);
            }
        }
        Ok(())
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_micros(self.idle_sleep_us)
    }

    /// Copy of this configuration for another process of the same cluster
    pub fn for_process(&self, process_id: u32) -> Result<Self> {
        let config = Self {
            process_id,
            ..self.clone()
        };
        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = ClusterConfig::default();
        config.validate().unwrap();
        assert_eq!(config.backend, BackendConfig::Mailbox);
        assert!(config.autohalt);
    }

    #[test]
    fn test_load_tcp_config() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("placenet.toml");

        let config_content = r#"
process_id = 1
process_count = 2
threads = 4
autohalt = false

[backend]
kind = "tcp"
peers = ["127.0.0.1:7100", "127.0.0.1:7101"]
connect_timeout_ms = 500

[log]
level = "debug"
json = true
"#;
        fs::write(&config_path, config_content).unwrap();

        let config = ClusterConfig::load_with_prefix(Some(&config_path), "PLACENET_TEST_TCP").unwrap();
        assert_eq!(config.process_id, 1);
        assert_eq!(config.threads, 4);
        assert!(!config.autohalt);
        assert_eq!(config.log.level, "debug");
        assert!(config.log.json);
        assert_eq!(config.probe_interval_ms, defaults::PROBE_INTERVAL_MS);

        match &config.backend {
            BackendConfig::Tcp(tcp) => {
                assert_eq!(tcp.peers.len(), 2);
                assert_eq!(tcp.connect_timeout(), Duration::from_millis(500));
                assert_eq!(tcp.max_frame_size, defaults::tcp::MAX_FRAME_SIZE);
            }
            other => panic!("expected tcp backend, got {:?}", other),
        }
    }

    #[test]
    fn test_environment_override() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("placenet.toml");
        fs::write(&config_path, "process_count = 3\nthreads = 1\n").unwrap();

        std::env::set_var("PLACENET_TEST_ENV__PROCESS_ID", "2");
        std::env::set_var("PLACENET_TEST_ENV__THREADS", "8");
        let config = ClusterConfig::load_with_prefix(Some(&config_path), "PLACENET_TEST_ENV").unwrap();
        std::env::remove_var("PLACENET_TEST_ENV__PROCESS_ID");
        std::env::remove_var("PLACENET_TEST_ENV__THREADS");

        assert_eq!(config.process_id, 2);
        assert_eq!(config.threads, 8);
        assert_eq!(config.process_count, 3);
    }

    #[test]
    fn test_invalid_layouts_are_rejected() {
        let out_of_range = ClusterConfig {
            process_id: 2,
            process_count: 2,
            ..Default::default()
        };
        assert!(out_of_range.validate().is_err());

        let no_threads = ClusterConfig {
            threads: 0,
            ..Default::default()
        };
        assert!(no_threads.validate().is_err());

        let peers_mismatch = ClusterConfig {
            process_count: 3,
            backend: BackendConfig::Tcp(TcpSettings {
                peers: vec!["127.0.0.1:7000".parse().unwrap()],
                connect_timeout_ms: 100,
                max_frame_size: 1024,
                io_threads: 1,
            }),
            ..Default::default()
        };
        let err = peers_mismatch.validate().unwrap_err();
        assert!(err.to_string().contains("1 peers for 3 processes"));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(ClusterConfig::load_with_prefix(Some(&missing), "PLACENET_TEST_MISSING").is_err());
    }

    #[test]
    fn test_for_process_and_toml_rendering() {
        let base = ClusterConfig {
            process_count: 2,
            ..Default::default()
        };
        let second = base.for_process(1).unwrap();
        assert_eq!(second.process_id, 1);
        assert!(base.for_process(2).is_err());

        let rendered = second.to_toml_string().unwrap();
        assert!(rendered.contains("process_id = 1"));
        assert!(rendered.contains("kind = \"mailbox\""));
    }
}
