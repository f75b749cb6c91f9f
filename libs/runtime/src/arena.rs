//! Net Instance Arena
//!
//! Process-wide bookkeeping for every net instance this process knows
//! about. The arena never holds the instance itself (the owning worker
//! does); it records who owns it, where it came from and how far along its
//! lifecycle it is:
//!
//! ```text
//! Spawned ──► Active ──► Halting ──► Halted (retired)
//!    └───────────────────────┘
//! ```
//!
//! Halting instances stay in the table until every acknowledgment they
//! wait for has arrived. The most recently retired ids are remembered so
//! late messages can be told apart from messages for ids that never
//! existed; older ones are forgotten and only counted.

use crate::ids::{NetId, WorkerId};
use crate::{Result, RuntimeError};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet, VecDeque};

/// Lifecycle state of a net instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NetState {
    /// Created, not yet bound to its worker
    Spawned,
    /// Bound to a worker, transitions may fire
    Active,
    /// No more firings; waiting for in-flight references to drain
    Halting,
    /// Instance released, id retired
    Halted,
}

impl NetState {
    pub fn is_live(self) -> bool {
        matches!(self, NetState::Spawned | NetState::Active)
    }
}

/// Bookkeeping for one instance
#[derive(Debug, Clone, Serialize)]
pub struct NetSlot {
    pub def_index: usize,
    pub owner: WorkerId,
    pub parent: Option<NetId>,
    pub global: bool,
    pub state: NetState,
    /// Halt acknowledgments still expected from peers
    pub pending_acks: usize,
}

/// Result of a halt request against the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltOutcome {
    /// The net moved to `Halting`
    Started { owner: WorkerId, global: bool },
    /// The net was already halting or retired
    AlreadyHalting,
}

/// Result of recording a halt acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// More acknowledgments are outstanding
    Waiting(usize),
    /// Last acknowledgment arrived; the owner may reclaim
    Complete { owner: WorkerId },
}

/// Number of reclaimed ids an arena remembers
pub const RETIRED_WINDOW: usize = 16 * 1024;

/// Bounded memory of reclaimed ids, oldest evicted first
#[derive(Debug)]
struct RetiredIds {
    order: VecDeque<NetId>,
    ids: HashSet<NetId>,
    capacity: usize,
    total: usize,
}

impl RetiredIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity: capacity.max(1),
            total: 0,
        }
    }

    fn insert(&mut self, net: NetId) {
        if !self.ids.insert(net) {
            return;
        }
        self.total += 1;
        self.order.push_back(net);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, net: &NetId) -> bool {
        self.ids.contains(net)
    }
}

#[derive(Debug)]
struct ArenaInner {
    slots: BTreeMap<NetId, NetSlot>,
    retired: RetiredIds,
}

/// Instance table of one process
#[derive(Debug)]
pub struct NetArena {
    inner: Mutex<ArenaInner>,
}

impl Default for NetArena {
    fn default() -> Self {
        Self::with_retired_window(RETIRED_WINDOW)
    }
}

impl NetArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arena that remembers at most `window` reclaimed ids
    pub fn with_retired_window(window: usize) -> Self {
        Self {
            inner: Mutex::new(ArenaInner {
                slots: BTreeMap::new(),
                retired: RetiredIds::new(window),
            }),
        }
    }

    /// Register a freshly spawned instance
    pub fn insert(
        &self,
        net: NetId,
        def_index: usize,
        owner: WorkerId,
        parent: Option<NetId>,
        global: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.retired.contains(&net) || inner.slots.contains_key(&net) {
            return Err(RuntimeError::DuplicateNet { net });
        }
        inner.slots.insert(
            net,
            NetSlot {
                def_index,
                owner,
                parent,
                global,
                state: NetState::Spawned,
                pending_acks: 0,
            },
        );
        Ok(())
    }

    /// Bind an instance to `worker`; also used when ownership migrates
    pub fn activate(&self, net: NetId, worker: WorkerId) -> Result<NetState> {
        let mut inner = self.inner.lock();
        let slot = inner
            .slots
            .get_mut(&net)
            .ok_or(RuntimeError::UnknownNet { net })?;
        slot.owner = worker;
        if slot.state == NetState::Spawned {
            slot.state = NetState::Active;
        }
        Ok(slot.state)
    }

    /// Move ownership without changing state.
    ///
    /// Allowed while halting so that a queued halt follows the instance to
    /// its new worker.
    pub fn set_owner(&self, net: NetId, worker: WorkerId) -> Result<()> {
        let mut inner = self.inner.lock();
        let slot = inner
            .slots
            .get_mut(&net)
            .ok_or(RuntimeError::UnknownNet { net })?;
        slot.owner = worker;
        Ok(())
    }

    /// Stop a live instance from firing
    pub fn begin_halt(&self, net: NetId) -> Result<HaltOutcome> {
        let mut inner = self.inner.lock();
        if inner.retired.contains(&net) {
            return Ok(HaltOutcome::AlreadyHalting);
        }
        let slot = inner
            .slots
            .get_mut(&net)
            .ok_or(RuntimeError::UnknownNet { net })?;
        match slot.state {
            NetState::Spawned | NetState::Active => {
                slot.state = NetState::Halting;
                Ok(HaltOutcome::Started {
                    owner: slot.owner,
                    global: slot.global,
                })
            }
            NetState::Halting | NetState::Halted => Ok(HaltOutcome::AlreadyHalting),
        }
    }

    /// Record how many peers must acknowledge the halt of `net`
    pub fn expect_acks(&self, net: NetId, count: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        let slot = inner
            .slots
            .get_mut(&net)
            .ok_or(RuntimeError::UnknownNet { net })?;
        if slot.state != NetState::Halting {
            return Err(RuntimeError::IllegalTransition {
                net,
                from: slot.state,
                to: NetState::Halting,
            });
        }
        slot.pending_acks = count;
        Ok(())
    }

    /// Count one acknowledgment for a halting instance
    pub fn acknowledge(&self, net: NetId) -> Result<AckOutcome> {
        let mut inner = self.inner.lock();
        let slot = inner
            .slots
            .get_mut(&net)
            .ok_or(RuntimeError::UnknownNet { net })?;
        if slot.state != NetState::Halting || slot.pending_acks == 0 {
            return Err(RuntimeError::IllegalTransition {
                net,
                from: slot.state,
                to: NetState::Halted,
            });
        }
        slot.pending_acks -= 1;
        if slot.pending_acks == 0 {
            Ok(AckOutcome::Complete { owner: slot.owner })
        } else {
            Ok(AckOutcome::Waiting(slot.pending_acks))
        }
    }

    /// Drop the slot of a halted instance and retire its id
    pub fn retire(&self, net: NetId) -> Result<NetSlot> {
        let mut inner = self.inner.lock();
        let state = inner
            .slots
            .get(&net)
            .map(|slot| slot.state)
            .ok_or(RuntimeError::UnknownNet { net })?;
        if state != NetState::Halting {
            return Err(RuntimeError::IllegalTransition {
                net,
                from: state,
                to: NetState::Halted,
            });
        }
        let mut slot = inner
            .slots
            .remove(&net)
            .ok_or(RuntimeError::UnknownNet { net })?;
        slot.state = NetState::Halted;
        inner.retired.insert(net);
        Ok(slot)
    }

    pub fn state(&self, net: NetId) -> Option<NetState> {
        let inner = self.inner.lock();
        match inner.slots.get(&net) {
            Some(slot) => Some(slot.state),
            None if inner.retired.contains(&net) => Some(NetState::Halted),
            None => None,
        }
    }

    pub fn slot(&self, net: NetId) -> Option<NetSlot> {
        self.inner.lock().slots.get(&net).cloned()
    }

    /// Owner of a live instance
    pub fn live_owner(&self, net: NetId) -> Option<WorkerId> {
        self.inner
            .lock()
            .slots
            .get(&net)
            .filter(|slot| slot.state.is_live())
            .map(|slot| slot.owner)
    }

    /// Owner of an instance that has not been retired yet
    pub fn owner(&self, net: NetId) -> Option<WorkerId> {
        self.inner.lock().slots.get(&net).map(|slot| slot.owner)
    }

    pub fn is_retired(&self, net: NetId) -> bool {
        self.inner.lock().retired.contains(&net)
    }

    /// Spawned + Active instances
    pub fn live_count(&self) -> usize {
        self.inner
            .lock()
            .slots
            .values()
            .filter(|slot| slot.state.is_live())
            .count()
    }

    pub fn halting_count(&self) -> usize {
        self.inner
            .lock()
            .slots
            .values()
            .filter(|slot| slot.state == NetState::Halting)
            .count()
    }

    /// Instances reclaimed over the arena's lifetime
    pub fn retired_count(&self) -> usize {
        self.inner.lock().retired.total
    }

    /// No instance is live or halting
    pub fn is_drained(&self) -> bool {
        self.inner.lock().slots.is_empty()
    }

    /// Copy of every slot, ordered by id
    pub fn snapshot(&self) -> Vec<(NetId, NetSlot)> {
        self.inner
            .lock()
            .slots
            .iter()
            .map(|(id, slot)| (*id, slot.clone()))
            .collect()
    }
}
