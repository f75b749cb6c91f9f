//! Network Infrastructure
//!
//! Packet backends shared by every process of a cluster. A packet is a
//! tagged buffer (tokens or service) addressed to a process index; the
//! backends differ only in how it gets there:
//!
//! - [`transports::MailboxTransport`]: processes hosted in one OS process
//! - [`transports::TcpChannel`]: processes on different hosts
//!
//! Higher layers pick a backend once at startup and talk to it through the
//! [`Transport`] trait.

pub mod error;
pub mod packet;
pub mod transports;

// Re-export commonly used types
pub use error::{Result, TransportError};
pub use packet::{
    Packet, ProcessId, Tag, TokensHeader, FRAME_PREFIX_LEN, TAG_SERVICE, TAG_TOKENS,
    TOKENS_HEADER_LEN,
};
pub use transports::{
    MailboxHub, MailboxTransport, MemoryTransport, RequestPoll, TcpChannel, TcpChannelConfig,
    Transport, TransportMetrics, TransportStats, TransportType,
};

// Constants for configuration
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 30;
