//! Transport Errors
//!
//! One error type for every packet backend. Link failures carry the peer
//! address when one is known so a dead TCP peer can be named in logs.

use crate::packet::ProcessId;
use std::net::SocketAddr;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum TransportError {
    /// Reading from or writing to a peer link failed
    #[error("Link failure: {context}{}", peer_suffix(.addr))]
    Link {
        context: String,
        addr: Option<SocketAddr>,
        #[source]
        source: Option<BoxError>,
    },

    /// A frame or packet that cannot be decoded
    #[error("Malformed packet: {context}")]
    Protocol {
        context: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Invalid transport configuration: {context}")]
    Configuration { context: String, field: Option<String> },

    /// Unknown process id, closed peer or a send to self
    #[error("No route to process {target}: {reason}")]
    Unroutable { target: ProcessId, reason: String },

    #[error("Transport closed: {reason}")]
    Closed { reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;

fn peer_suffix(addr: &Option<SocketAddr>) -> String {
    addr.map(|addr| format!(" (peer {})", addr)).unwrap_or_default()
}

impl TransportError {
    /// Link failure with no known peer address
    pub fn network(context: impl Into<String>) -> Self {
        Self::Link {
            context: context.into(),
            addr: None,
            source: None,
        }
    }

    pub fn network_with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Link {
            context: context.into(),
            addr: None,
            source: Some(Box::new(source)),
        }
    }

    /// Link failure towards (or on) a known address
    pub fn connection(context: impl Into<String>, addr: Option<SocketAddr>) -> Self {
        Self::Link {
            context: context.into(),
            addr,
            source: None,
        }
    }

    pub fn connection_with_source(
        context: impl Into<String>,
        addr: Option<SocketAddr>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Link {
            context: context.into(),
            addr,
            source: Some(Box::new(source)),
        }
    }

    pub fn protocol(context: impl Into<String>) -> Self {
        Self::Protocol {
            context: context.into(),
            source: None,
        }
    }

    pub fn protocol_with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Protocol {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn configuration(context: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            context: context.into(),
            field: field.map(str::to_string),
        }
    }

    pub fn unroutable(target: ProcessId, reason: impl Into<String>) -> Self {
        Self::Unroutable {
            target,
            reason: reason.into(),
        }
    }

    pub fn closed(reason: impl Into<String>) -> Self {
        Self::Closed {
            reason: reason.into(),
        }
    }

    /// Whether the peer behind this error should be considered gone
    pub fn is_link_failure(&self) -> bool {
        matches!(self, Self::Link { .. } | Self::Io(_))
    }

    /// Short label used in log fields and counters
    pub fn category(&self) -> &'static str {
        match self {
            Self::Link { .. } => "link",
            Self::Protocol { .. } => "protocol",
            Self::Configuration { .. } => "configuration",
            Self::Unroutable { .. } => "unroutable",
            Self::Closed { .. } => "closed",
            Self::Io(_) => "io",
        }
    }
}

impl From<bincode::Error> for TransportError {
    fn from(err: bincode::Error) -> Self {
        Self::protocol_with_source("bincode decoding failed", err)
    }
}
