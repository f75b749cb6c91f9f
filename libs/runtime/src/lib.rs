//! Distributed Petri-Net Runtime
//!
//! Runs net instances across a cluster of processes, each with a fixed
//! pool of worker threads. Tokens for a net on the same process are handed
//! straight to the owning worker; everything else crosses a transport
//! backend (shared-memory mailbox or TCP).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────── Process P0 ────────────────┐        ┌──── Process P1 ────┐
//! │  ┌──────────┐  ┌──────────┐                │        │                    │
//! │  │ Worker 0 │  │ Worker 1 │   owned nets   │        │   copies of global │
//! │  └────┬─────┘  └────┬─────┘                │        │   nets, local nets │
//! │       │ inbox       │ inbox                │        │                    │
//! │  ┌────┴─────────────┴─────┐  ┌───────────┐ │ tokens │                    │
//! │  │ arena · ids · barrier  │──│ Transport │─┼────────┼─►                  │
//! │  │ quiescence             │  └───────────┘ │service │                    │
//! │  └────────────────────────┘                │        │                    │
//! └────────────────────────────────────────────┘        └────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use net_runtime::{LocalCluster, NetDefs, ProcessConfig};
//!
//! # fn templates() -> NetDefs { Vec::new() }
//! let cluster = LocalCluster::with_processes(2, ProcessConfig::default(), templates()).unwrap();
//! cluster.spawn_initial(0).unwrap();
//! cluster.run().unwrap();
//! ```

pub mod arena;
pub mod barrier;
pub mod cluster;
pub mod error;
pub mod ids;
pub mod messages;
pub mod net;
pub mod process;
pub mod quiescence;
pub mod report;
pub mod trace;
pub mod worker;

pub use arena::{NetArena, NetSlot, NetState};
pub use cluster::{build_process, build_transport, LocalCluster};
pub use error::{Result, RuntimeError};
pub use ids::{NetId, NetIdAllocator, PlaceIndex, TransitionIndex, WorkerId};
pub use messages::{BarrierPhase, ServiceMessage, WorkerMessage};
pub use net::{Context, Firing, Net, NetDef, NetDefs, SpawnContext, TokenBatch};
pub use process::{MulticastReport, Process, ProcessConfig};
pub use report::{NetReport, NetSummary, ProcessReport, ProcessStats, WorkerReport};
pub use trace::{TraceEvent, TraceLog};
pub use worker::Worker;

pub use network::{ProcessId, Transport, TransportType};
