//! Worker
//!
//! A worker is one scheduling thread of a process. It exclusively owns the
//! net instances adopted through its inbox, fires their transitions, and
//! takes its turn draining the process's transport.

use crate::arena::NetState;
use crate::ids::{NetId, PlaceIndex, TransitionIndex, WorkerId};
use crate::messages::WorkerMessage;
use crate::net::{Context, Firing, Net, TokenBatch};
use crate::process::{MulticastReport, Process};
use crate::report::{NetReport, WorkerReport};
use crate::trace::{TraceEvent, TraceLog};
use crate::{Result, RuntimeError};
use bytes::Bytes;
use network::ProcessId;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Default)]
struct WorkerStats {
    messages: u64,
    firings: u64,
    tokens_received: u64,
    forwarded: u64,
    dropped: u64,
    reclaimed: u64,
}

pub struct Worker {
    id: WorkerId,
    process: Arc<Process>,
    nets: BTreeMap<NetId, Box<dyn Net>>,
    /// Stopped nets waiting for their reclaim
    halting: BTreeMap<NetId, Box<dyn Net>>,
    trace: Option<TraceLog>,
    stats: WorkerStats,
}

impl Worker {
    pub(crate) fn new(process: Arc<Process>, id: WorkerId) -> Self {
        Self {
            id,
            process,
            nets: BTreeMap::new(),
            halting: BTreeMap::new(),
            trace: None,
            stats: WorkerStats::default(),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    /// Thread body: schedule until the process quits
    pub fn run_scheduler(mut self) {
        let process = Arc::clone(&self.process);
        info!(process = %process.id(), worker = %self.id, "Worker started");
        process.start_barrier.wait();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            while !process.is_quitting() {
                if self.run_once() == 0 {
                    std::thread::sleep(process.config().idle_sleep);
                }
            }
        }));
        if outcome.is_err() {
            // The nets this worker held can never halt now
            error!(process = %process.id(), worker = %self.id, "Worker panicked, stopping the cluster");
            process.quit_all();
        }

        let discarded = self.clean_thread_messages();
        process.teardown_barrier.wait();
        self.close_trace();
        info!(
            process = %process.id(),
            worker = %self.id,
            firings = self.stats.firings,
            discarded,
            "Worker stopped"
        );
        process.store_worker_report(self.report());
        if let Err(payload) = outcome {
            panic::resume_unwind(payload);
        }
    }

    /// One scheduling iteration; returns how much progress it made
    pub fn run_once(&mut self) -> usize {
        let mut progress = self.process_messages();
        progress += self.fire_ready();
        progress += self.process.process_packets();
        self.process.poll_requests();
        if self.id.index() == 0 {
            self.process.quiescence_tick();
        }
        progress
    }

    /// Handle everything currently in the inbox
    pub fn process_messages(&mut self) -> usize {
        let messages = match self.process.inbox(self.id) {
            Ok(inbox) => inbox.drain(),
            Err(_) => return 0,
        };
        let count = messages.len();
        for message in messages {
            let counted = message.is_obligation();
            let reclaimed = self.handle_message(message);
            if counted {
                self.process.complete_obligation();
            }
            if let Some(net) = reclaimed {
                self.process.autohalt_check(net);
            }
        }
        self.stats.messages += count as u64;
        count
    }

    /// Returns the id of a net this message reclaimed
    fn handle_message(&mut self, message: WorkerMessage) -> Option<NetId> {
        match message {
            WorkerMessage::Adopt(net) => self.adopt(net),
            WorkerMessage::Tokens { net, place, batch } => self.deliver(net, place, batch),
            WorkerMessage::Halt { net, origin } => self.stop(net, origin),
            WorkerMessage::Reclaim(net) => return self.reclaim(net),
            WorkerMessage::Fire { net, transition } => self.fire_one(net, transition),
            WorkerMessage::StartLog(path) => self.open_trace(path),
            WorkerMessage::StopLog => self.close_trace(),
        }
        None
    }

    fn adopt(&mut self, net: Box<dyn Net>) {
        let id = net.id();
        match self.process.inform_new_network(id, self.id) {
            Ok(state) => {
                self.record(TraceEvent::Adopt { net: id });
                trace!(process = %self.process.id(), worker = %self.id, net = %id, ?state, "Adopted net");
                if self.nets.insert(id, net).is_some() {
                    error!(process = %self.process.id(), worker = %self.id, net = %id, "Adopted a net twice");
                }
            }
            Err(e) => {
                self.stats.dropped += 1;
                error!(process = %self.process.id(), worker = %self.id, net = %id, error = %e, "Adopted net has no slot");
                debug_assert!(self.process.arena().owner(id).is_some(), "adopted {} without an arena slot", id);
            }
        }
    }

    fn deliver(&mut self, net: NetId, place: PlaceIndex, batch: TokenBatch) {
        let tokens = batch.tokens_count;
        if let Some(instance) = self.nets.get_mut(&net) {
            self.stats.tokens_received += u64::from(tokens);
            if let Err(e) = instance.receive_tokens(place, batch) {
                warn!(process = %self.process.id(), worker = %self.id, net = %net, place, error = %e, "Net rejected tokens");
            }
            self.record(TraceEvent::Tokens { net, place, tokens });
            return;
        }
        self.reroute(net, WorkerMessage::Tokens { net, place, batch });
    }

    fn fire_one(&mut self, net: NetId, transition: TransitionIndex) {
        if !self.nets.contains_key(&net) {
            self.reroute(net, WorkerMessage::Fire { net, transition });
            return;
        }
        let Some(instance) = self.nets.get_mut(&net) else {
            return;
        };
        let mut ctx = Context::new(&self.process, self.id, net);
        match instance.fire_transition(&mut ctx, transition) {
            Ok(Firing::Fired) => {
                self.stats.firings += 1;
                self.record(TraceEvent::Fire { net, transition });
            }
            Ok(Firing::NotEnabled) => {
                debug!(worker = %self.id, net = %net, transition, "Requested transition not enabled")
            }
            Err(e) => {
                warn!(process = %self.process.id(), worker = %self.id, net = %net, transition, error = %e, "Firing failed")
            }
        }
    }

    /// Hand a message for a net this worker does not hold to its owner
    fn reroute(&mut self, net: NetId, message: WorkerMessage) {
        if self.halting.contains_key(&net) {
            self.stats.dropped += 1;
            debug!(worker = %self.id, net = %net, ?message, "Dropping message for halting net");
            return;
        }
        match self.process.arena().owner(net) {
            Some(owner) if owner != self.id => {
                self.stats.forwarded += 1;
                if let Err(e) = self.process.post(owner, message) {
                    error!(worker = %self.id, net = %net, error = %e, "Cannot forward message");
                }
            }
            Some(_) => {
                // Ownership moved here ahead of the Adopt; requeue behind it
                trace!(worker = %self.id, net = %net, "Requeueing message ahead of adoption");
                if let Err(e) = self.process.post(self.id, message) {
                    error!(worker = %self.id, net = %net, error = %e, "Cannot requeue message");
                }
            }
            None => {
                self.stats.dropped += 1;
                let state = self.process.net_state(net);
                if state == Some(NetState::Halted) {
                    debug!(worker = %self.id, net = %net, ?message, "Dropping message for retired net");
                } else {
                    error!(process = %self.process.id(), worker = %self.id, net = %net, ?message, "Message for a net this process never had");
                    debug_assert!(state.is_some(), "{} got a message for unknown {}", self.id, net);
                }
            }
        }
    }

    fn stop(&mut self, net: NetId, origin: Option<ProcessId>) {
        match self.nets.remove(&net) {
            Some(instance) => {
                self.halting.insert(net, instance);
                self.record(TraceEvent::Halt { net });
                debug!(process = %self.process.id(), worker = %self.id, net = %net, ?origin, "Net stopped");
                self.process.inform_halt_network(net, self.id, origin);
            }
            None if self.halting.contains_key(&net) => {
                debug!(worker = %self.id, net = %net, "Net already stopped");
            }
            None => self.reroute(net, WorkerMessage::Halt { net, origin }),
        }
    }

    fn reclaim(&mut self, net: NetId) -> Option<NetId> {
        if self.halting.remove(&net).is_none() {
            warn!(process = %self.process.id(), worker = %self.id, net = %net, "Reclaim for a net this worker is not halting");
        }
        match self.process.arena().retire(net) {
            Ok(_) => {
                self.stats.reclaimed += 1;
                self.record(TraceEvent::Reclaim { net });
                Some(net)
            }
            Err(e) => {
                warn!(process = %self.process.id(), worker = %self.id, net = %net, error = %e, "Cannot retire net");
                None
            }
        }
    }

    /// Give every owned net a chance to fire each of its transitions
    pub fn fire_ready(&mut self) -> usize {
        let ids: Vec<NetId> = self.nets.keys().copied().collect();
        let mut fired = 0;
        for id in ids {
            if self.process.is_quitting() {
                break;
            }
            let Some(instance) = self.nets.get_mut(&id) else {
                continue;
            };
            let mut ctx = Context::new(&self.process, self.id, id);
            for transition in 0..instance.transition_count() {
                if ctx.halt_requested() || self.process.is_quitting() {
                    break;
                }
                match instance.fire_transition(&mut ctx, transition) {
                    Ok(Firing::Fired) => {
                        fired += 1;
                        if let Some(log) = self.trace.as_mut() {
                            if let Err(e) = log.record(&TraceEvent::Fire { net: id, transition }) {
                                warn!(worker = %self.id, error = %e, "Trace write failed");
                            }
                        }
                    }
                    Ok(Firing::NotEnabled) => {}
                    Err(e) => {
                        warn!(process = %self.process.id(), worker = %self.id, net = %id, transition, error = %e, "Firing failed")
                    }
                }
            }
        }
        self.stats.firings += fired as u64;
        fired
    }

    /// Drop whatever is still queued at shutdown
    pub fn clean_thread_messages(&mut self) -> usize {
        let messages = match self.process.inbox(self.id) {
            Ok(inbox) => inbox.drain(),
            Err(_) => return 0,
        };
        let count = messages.len();
        for message in messages {
            if message.is_obligation() {
                self.process.complete_obligation();
            }
            trace!(worker = %self.id, ?message, "Discarding message at shutdown");
        }
        count
    }

    // ----- Net access -----

    /// An active net owned by this worker
    pub fn get_net(&self, net: NetId) -> Option<&dyn Net> {
        self.nets.get(&net).map(|instance| &**instance)
    }

    pub fn get_net_mut(&mut self, net: NetId) -> Option<&mut (dyn Net + 'static)> {
        self.nets.get_mut(&net).map(|instance| &mut **instance)
    }

    /// Take a net out of this worker without destroying it
    pub fn remove_net(&mut self, net: NetId) -> Option<Box<dyn Net>> {
        self.nets.remove(&net)
    }

    /// Move an owned net to another worker of the same process
    pub fn migrate_net(&mut self, net: NetId, target: WorkerId) -> Result<()> {
        self.process.check_worker(target)?;
        let instance = self.remove_net(net).ok_or(RuntimeError::UnknownNet { net })?;
        self.process.migrate_net(instance, target)
    }

    pub fn owned_nets(&self) -> Vec<NetId> {
        self.nets.keys().copied().collect()
    }

    /// Queue a message for this worker
    pub fn add_message(&self, message: WorkerMessage) -> Result<()> {
        self.process.post(self.id, message)
    }

    // ----- Token and lifecycle operations -----

    pub fn send(&self, target: ProcessId, net: NetId, place: PlaceIndex, payload: Bytes) -> Result<()> {
        self.multisend(target, net, place, TokenBatch::new(1, payload))
    }

    pub fn multisend(&self, target: ProcessId, net: NetId, place: PlaceIndex, batch: TokenBatch) -> Result<()> {
        self.process.multisend(self.id, target, net, place, batch)
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
            .multisend_multicast(self.id, targets, net, place, batch)
    }

    /// Spawn a local (non-global) net on this worker
    pub fn spawn_net(&self, def_index: usize, parent: Option<NetId>) -> Result<NetId> {
        self.process.spawn_net(self.id, def_index, None, parent, false)
    }

    /// Spawn a global net whose copies live on every process
    pub fn spawn_global(&self, def_index: usize, parent: Option<NetId>) -> Result<NetId> {
        self.process.spawn_net(self.id, def_index, None, parent, true)
    }

    pub fn halt(&self, net: NetId) -> Result<()> {
        self.process.halt(self.id, net)
    }

    // ----- Trace log -----

    fn open_trace(&mut self, path: PathBuf) {
        self.close_trace();
        match TraceLog::create(&path, self.process.id(), self.id) {
            Ok(log) => {
                debug!(worker = %self.id, path = %path.display(), "Trace log opened");
                self.trace = Some(log);
            }
            Err(e) => warn!(worker = %self.id, path = %path.display(), error = %e, "Cannot open trace log"),
        }
    }

    fn close_trace(&mut self) {
        if let Some(log) = self.trace.take() {
            let path = log.path().to_path_buf();
            match log.close() {
                Ok(events) => debug!(worker = %self.id, path = %path.display(), events, "Trace log closed"),
                Err(e) => warn!(worker = %self.id, path = %path.display(), error = %e, "Trace log flush failed"),
            }
        }
    }

    fn record(&mut self, event: TraceEvent) {
        if let Some(log) = self.trace.as_mut() {
            if let Err(e) = log.record(&event) {
                warn!(worker = %self.id, error = %e, "Trace write failed; closing log");
                self.trace = None;
            }
        }
    }

    pub fn report(&self) -> WorkerReport {
        let nets = self
            .nets
            .iter()
            .map(|(id, net)| (id, net, NetState::Active))
            .chain(self.halting.iter().map(|(id, net)| (id, net, NetState::Halting)))
            .map(|(id, net, state)| NetReport {
                net: *id,
                state,
                report: net.report(),
            })
            .collect();
        WorkerReport {
            worker: Some(self.id),
            messages: self.stats.messages,
            firings: self.stats.firings,
            tokens_received: self.stats.tokens_received,
            forwarded: self.stats.forwarded,
            dropped: self.stats.dropped,
            reclaimed: self.stats.reclaimed,
            nets,
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("process", &self.process.id())
            .field("id", &self.id)
            .field("nets", &self.nets.keys().collect::<Vec<_>>())
            .field("halting", &self.halting.keys().collect::<Vec<_>>())
            .finish()
    }
}
