//! Transport Backends
//!
//! Every backend implements the same non-blocking "send packet with tag to
//! target process" contract, so process-level routing never needs to know
//! which one is active:
//!
//! - [`MailboxTransport`]: all processes share one OS process and exchange
//!   packets through mutex-protected queues
//! - [`TcpChannel`]: processes exchange length-prefixed frames over TCP,
//!   tracking every outstanding send in a request table
//! - [`MemoryTransport`]: recording fake for tests
//!
//! Nothing here blocks a worker thread: sends enqueue, receives poll.

use crate::packet::{Packet, ProcessId};
use crate::{Result, TransportError};
use std::fmt;

pub mod mailbox;
pub mod memory;
pub mod metrics;
pub mod tcp;


pub use mailbox::{MailboxHub, MailboxTransport};
pub use memory::MemoryTransport;
pub use metrics::{TransportMetrics, TransportStats};
pub use tcp::{TcpChannel, TcpChannelConfig};

/// Which backend is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TransportType {
    /// Shared-memory mailbox between processes hosted in one OS process
    Mailbox,
    /// TCP network channel between OS processes
    Tcp,
    /// In-memory recording fake
    Memory,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::Mailbox => f.write_str("mailbox"),
            TransportType::Tcp => f.write_str("tcp"),
            TransportType::Memory => f.write_str("memory"),
        }
    }
}

/// Outcome of reaping the outstanding request table
#[derive(Debug, Default)]
pub struct RequestPoll {
    /// Requests that finished successfully since the last poll
    pub completed: usize,
    /// Requests that failed since the last poll
    pub failures: Vec<(ProcessId, TransportError)>,
}

impl RequestPoll {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Packet backend shared by all workers of one process
pub trait Transport: Send + Sync + fmt::Debug {
    fn transport_type(&self) -> TransportType;

    /// Process this backend endpoint belongs to
    fn local_process(&self) -> ProcessId;

    /// Number of processes reachable through this backend (including self)
    fn process_count(&self) -> usize;

    /// Hand a packet to the backend for delivery to `target`.
    ///
    /// Never blocks on the remote side. Sending to the local process is
    /// an error: local delivery bypasses the backend entirely.
    fn send(&self, target: ProcessId, packet: Packet) -> Result<()>;

    /// Take the next inbound packet, if any
    fn try_receive(&self) -> Result<Option<Packet>>;

    /// Whether inbound packets are waiting to be drained
    fn has_inbound(&self) -> bool;

    /// Reap finished asynchronous sends
    fn poll_requests(&self) -> RequestPoll {
        RequestPoll::default()
    }

    /// Sends accepted but not yet confirmed written
    fn pending_requests(&self) -> usize {
        0
    }

    fn is_healthy(&self) -> bool;

    fn metrics(&self) -> &TransportMetrics;

    /// Flush and stop the backend; later sends fail with `Closed`
    fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Validate a send target against the cluster size and the local process
pub(crate) fn check_target(local: ProcessId, count: usize, target: ProcessId) -> Result<()> {
    if target == local {
        return Err(TransportError::unroutable(
            target,
            "local delivery must not go through the transport",
        ));
    }
    if target.index() >= count {
        return Err(TransportError::unroutable(
            target,
            format!("cluster has only {} processes", count),
        ));
    }
    Ok(())
}
