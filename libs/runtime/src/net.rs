//! Net Collaborators
//!
//! The runtime never looks inside a net. It only needs to create instances
//! from templates, hand them tokens and ask them to fire transitions:
//!
//! - [`NetDef`]: a template in the process's read-only template table
//! - [`Net`]: a live instance, owned by exactly one worker at a time
//! - [`Context`]: what a firing transition may do to the outside world

use crate::ids::{NetId, PlaceIndex, TransitionIndex, WorkerId};
use crate::process::{MulticastReport, Process};
use crate::Result;
use bytes::Bytes;
use network::ProcessId;
use std::sync::Arc;

/// Serialized tokens: an opaque payload plus how many tokens it encodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBatch {
    pub tokens_count: u32,
    pub payload: Bytes,
}

impl TokenBatch {
    pub fn new(tokens_count: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            tokens_count,
            payload: payload.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens_count == 0
    }
}

/// Outcome of asking a net to fire one transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Firing {
    Fired,
    NotEnabled,
}

/// Where and why an instance is being created
#[derive(Debug, Clone, Copy)]
pub struct SpawnContext {
    pub net: NetId,
    pub def_index: usize,
    pub parent: Option<NetId>,
    pub process: ProcessId,
    pub process_count: usize,
    pub global: bool,
}

impl SpawnContext {
    /// Whether this copy initialises the net's marking
    pub fn is_main_process(&self) -> bool {
        self.net.main_process(self.process_count) == self.process
    }
}

/// Net template
pub trait NetDef: Send + Sync {
    fn name(&self) -> &str;

    fn instantiate(&self, ctx: SpawnContext) -> Box<dyn Net>;
}

/// Net instance
pub trait Net: Send {
    fn id(&self) -> NetId;

    fn transition_count(&self) -> u32;

    /// Fire `transition` if it is enabled
    fn fire_transition(&mut self, ctx: &mut Context<'_>, transition: TransitionIndex) -> Result<Firing>;

    /// Accept tokens produced elsewhere into `place`
    fn receive_tokens(&mut self, place: PlaceIndex, batch: TokenBatch) -> Result<()>;

    /// Free-form state for process reports
    fn report(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Template table shared by every process of a cluster
pub type NetDefs = Vec<Arc<dyn NetDef>>;

/// Capabilities handed to a net while one of its transitions fires
pub struct Context<'a> {
    process: &'a Process,
    worker: WorkerId,
    net: NetId,
    halted: bool,
}

impl<'a> Context<'a> {
    pub(crate) fn new(process: &'a Process, worker: WorkerId, net: NetId) -> Self {
        Self {
            process,
            worker,
            net,
            halted: false,
        }
    }

    /// The net whose transition is firing
    pub fn net(&self) -> NetId {
        self.net
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn process(&self) -> ProcessId {
        self.process.id()
    }

    pub fn process_count(&self) -> usize {
        self.process.process_count()
    }

    /// Deliver a single token to `place` of `net` on `target`
    pub fn send(&self, target: ProcessId, net: NetId, place: PlaceIndex, payload: Bytes) -> Result<()> {
        self.multisend(target, net, place, TokenBatch::new(1, payload))
    }

    pub fn multisend(&self, target: ProcessId, net: NetId, place: PlaceIndex, batch: TokenBatch) -> Result<()> {
        self.process.multisend(self.worker, target, net, place, batch)
    }

    pub fn send_multicast(
        &self,
        targets: &[ProcessId],
        net: NetId,
        place: PlaceIndex,
        payload: Bytes,
    ) -> MulticastReport {
        self.multisend_multicast(targets, net, place, TokenBatch::new(1, payload))
    }

    pub fn multisend_multicast(
        &self,
        targets: &[ProcessId],
        net: NetId,
        place: PlaceIndex,
        batch: TokenBatch,
    ) -> MulticastReport {
        self.process
            .multisend_multicast(self.worker, targets, net, place, batch)
    }

    /// Spawn a child of the firing net on this worker
    pub fn spawn(&self, def_index: usize, global: bool) -> Result<NetId> {
        self.process
            .spawn_net(self.worker, def_index, None, Some(self.net), global)
    }

    /// Halt the firing net; no further transitions of it fire
    pub fn halt(&mut self) -> Result<()> {
        self.halted = true;
        self.process.halt(self.worker, self.net)
    }

    /// Halt another net
    pub fn halt_net(&self, net: NetId) -> Result<()> {
        self.process.halt(self.worker, net)
    }

    /// Stop the whole cluster
    pub fn quit(&self) {
        self.process.quit_all();
    }

    pub(crate) fn halt_requested(&self) -> bool {
        self.halted
    }
}
