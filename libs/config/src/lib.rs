//! # Placenet Cluster Configuration
//!
//! Configuration loading and defaults shared by every Placenet process.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cluster_config::ClusterConfig;
//! use std::path::Path;
//!
//! let config = ClusterConfig::load(Some(Path::new("config/placenet.toml"))).unwrap();
//! assert!(config.process_id < config.process_count as u32);
//! ```

pub mod cluster_config;
pub mod defaults;

// Re-export commonly used types
pub use cluster_config::{BackendConfig, ClusterConfig, LogConfig, TcpSettings};
