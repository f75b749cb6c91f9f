//! Default configuration values
//!
//! Constants used when a field is missing from the configuration file.

/// Configuration file looked up when none is given on the command line
pub const CONFIG_PATH: &str = "config/placenet.toml";

/// Prefix of environment variable overrides (`PLACENET__THREADS=4`)
pub const ENV_PREFIX: &str = "PLACENET";

/// Worker threads per process
pub const THREADS: usize = 2;

/// Minimum pause between two termination probes (milliseconds)
pub const PROBE_INTERVAL_MS: u64 = 20;

/// Worker back-off when a scheduling iteration found nothing to do (microseconds)
pub const IDLE_SLEEP_US: u64 = 200;

/// Network channel defaults
pub mod tcp {
    /// How long a peer may take to come up (milliseconds)
    pub const CONNECT_TIMEOUT_MS: u64 = 30_000;

    /// Maximum frame size accepted on the wire
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

    /// Threads of the channel's I/O runtime
    pub const IO_THREADS: usize = 1;
}
