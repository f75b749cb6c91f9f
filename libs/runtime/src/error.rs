//! Runtime Error Types
//!
//! Configuration problems are fatal when a process is built. Transport
//! failures are handed back to whoever routed the packet. Protocol
//! problems never become errors here: they are logged where they are
//! detected and the offending message is dropped.

use crate::arena::NetState;
use crate::ids::{NetId, WorkerId};
use network::TransportError;
use thiserror::Error;

/// Main runtime error type
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Invalid process layout or settings
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Spawn request for a template index outside the table
    #[error("Unknown template index {index} (table has {count} templates)")]
    UnknownTemplate { index: usize, count: usize },

    /// Net id with no slot in the arena
    #[error("Unknown net {net}")]
    UnknownNet { net: NetId },

    /// Spawn with an id that is already live or retired
    #[error("Net {net} already exists")]
    DuplicateNet { net: NetId },

    /// Lifecycle change the net state machine does not allow
    #[error("Net {net} cannot move from {from:?} to {to:?}")]
    IllegalTransition {
        net: NetId,
        from: NetState,
        to: NetState,
    },

    #[error("Worker {worker} does not exist")]
    UnknownWorker { worker: WorkerId },

    /// The per-process id counter ran out of room
    #[error("Net id space exhausted")]
    IdSpaceExhausted,

    /// start/join called out of order
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// Error reported by a net implementation
    #[error("Net {net} failed: {message}")]
    Net { net: NetId, message: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Report error: {0}")]
    Report(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

impl RuntimeError {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Create an error on behalf of a net implementation
    pub fn net(net: NetId, message: impl Into<String>) -> Self {
        Self::Net {
            net,
            message: message.into(),
        }
    }

    /// Whether this error was raised by the transport backend
    pub fn is_transport(&self) -> bool {
        matches!(self, RuntimeError::Transport(_))
    }

    /// Get error category for logs and reports
    pub fn category(&self) -> &'static str {
        match self {
            RuntimeError::Configuration { .. }
            | RuntimeError::UnknownTemplate { .. }
            | RuntimeError::UnknownWorker { .. } => "configuration",
            RuntimeError::UnknownNet { .. }
            | RuntimeError::DuplicateNet { .. }
            | RuntimeError::IllegalTransition { .. } => "ownership",
            RuntimeError::IdSpaceExhausted | RuntimeError::Lifecycle(_) => "lifecycle",
            RuntimeError::Net { .. } => "net",
            RuntimeError::Transport(_) => "transport",
            RuntimeError::Encoding(_) => "protocol",
            RuntimeError::Report(_) | RuntimeError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use network::ProcessId;

    #[test]
    fn test_transport_errors_convert() {
        let err: RuntimeError = TransportError::unroutable(ProcessId::new(3), "gone").into();
        assert!(err.is_transport());
        assert_eq!(err.category(), "transport");
        assert!(err.to_string().contains("P3"));
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            RuntimeError::UnknownTemplate { index: 4, count: 2 }.category(),
            "configuration"
        );
        assert_eq!(RuntimeError::UnknownNet { net: NetId::new(7) }.category(), "ownership");
        assert_eq!(RuntimeError::net(NetId::new(1), "bad place").category(), "net");
        assert_eq!(
            RuntimeError::UnknownTemplate { index: 4, count: 2 }.to_string(),
            "Unknown template index 4 (table has 2 templates)"
        );
    }
}
