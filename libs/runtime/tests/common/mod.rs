//! Net templates shared by the runtime integration tests

#![allow(dead_code)]

use bytes::Bytes;
use net_runtime::{
    Context, Firing, Net, NetDef, NetDefs, NetId, PlaceIndex, ProcessId, Result, RuntimeError,
    SpawnContext, TokenBatch, TransitionIndex,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// A single token travels around every process; the copy that sees the
/// hop limit halts the net
pub struct RingDef {
    pub limit: u32,
    pub hops: Arc<AtomicU32>,
}

impl RingDef {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            hops: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl NetDef for RingDef {
    fn name(&self) -> &str {
        "ring"
    }

    fn instantiate(&self, ctx: SpawnContext) -> Box<dyn Net> {
        Box::new(RingNet {
            id: ctx.net,
            limit: self.limit,
            hops: Arc::clone(&self.hops),
            pending: if ctx.is_main_process() { vec![0] } else { Vec::new() },
        })
    }
}

struct RingNet {
    id: NetId,
    limit: u32,
    hops: Arc<AtomicU32>,
    pending: Vec<u32>,
}

impl Net for RingNet {
    fn id(&self) -> NetId {
        self.id
    }

    fn transition_count(&self) -> u32 {
        1
    }

    fn fire_transition(&mut self, ctx: &mut Context<'_>, _transition: TransitionIndex) -> Result<Firing> {
        let Some(hop) = self.pending.pop() else {
            return Ok(Firing::NotEnabled);
        };
        if hop >= self.limit {
            ctx.halt()?;
            return Ok(Firing::Fired);
        }
        self.hops.fetch_add(1, Ordering::SeqCst);
        let next = ProcessId::new((ctx.process().raw() + 1) % ctx.process_count() as u32);
        ctx.send(next, self.id, 0, Bytes::copy_from_slice(&(hop + 1).to_le_bytes()))?;
        Ok(Firing::Fired)
    }

    fn receive_tokens(&mut self, place: PlaceIndex, batch: TokenBatch) -> Result<()> {
        if place != 0 {
            return Err(RuntimeError::net(self.id, format!("no place {}", place)));
        }
        let bytes: [u8; 4] = batch
            .payload
            .as_ref()
            .try_into()
            .map_err(|_| RuntimeError::net(self.id, "bad hop counter"))?;
        self.pending.push(u32::from_le_bytes(bytes));
        Ok(())
    }

    fn report(&self) -> serde_json::Value {
        serde_json::json!({ "pending": self.pending.len() })
    }
}

/// Collects tokens per place and never fires
pub struct SinkDef;

impl NetDef for SinkDef {
    fn name(&self) -> &str {
        "sink"
    }

    fn instantiate(&self, ctx: SpawnContext) -> Box<dyn Net> {
        Box::new(SinkNet {
            id: ctx.net,
            places: BTreeMap::new(),
            fired: 0,
        })
    }
}

struct SinkNet {
    id: NetId,
    places: BTreeMap<PlaceIndex, u32>,
    fired: u32,
}

impl Net for SinkNet {
    fn id(&self) -> NetId {
        self.id
    }

    fn transition_count(&self) -> u32 {
        1
    }

    /// Transition 0 consumes one token from place 0, if any
    fn fire_transition(&mut self, _ctx: &mut Context<'_>, _transition: TransitionIndex) -> Result<Firing> {
        match self.places.get_mut(&0) {
            Some(count) if *count > 0 => {
                *count -= 1;
                self.fired += 1;
                Ok(Firing::Fired)
            }
            _ => Ok(Firing::NotEnabled),
        }
    }

    fn receive_tokens(&mut self, place: PlaceIndex, batch: TokenBatch) -> Result<()> {
        *self.places.entry(place).or_default() += batch.tokens_count;
        Ok(())
    }

    fn report(&self) -> serde_json::Value {
        serde_json::json!({ "places": self.places, "fired": self.fired })
    }
}

/// Panics the first time any transition fires
pub struct PanicDef;

impl NetDef for PanicDef {
    fn name(&self) -> &str {
        "panic"
    }

    fn instantiate(&self, ctx: SpawnContext) -> Box<dyn Net> {
        Box::new(PanicNet { id: ctx.net })
    }
}

struct PanicNet {
    id: NetId,
}

impl Net for PanicNet {
    fn id(&self) -> NetId {
        self.id
    }

    fn transition_count(&self) -> u32 {
        1
    }

    fn fire_transition(&mut self, _ctx: &mut Context<'_>, _transition: TransitionIndex) -> Result<Firing> {
        panic!("transition of {} failed", self.id);
    }

    fn receive_tokens(&mut self, _place: PlaceIndex, _batch: TokenBatch) -> Result<()> {
        Ok(())
    }

    fn report(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Template table: 0 = sink, 1 = ring
pub fn templates(ring: RingDef) -> NetDefs {
    vec![Arc::new(SinkDef), Arc::new(ring)]
}

pub const SINK: usize = 0;
pub const RING: usize = 1;

/// Tokens the sink holds in `place`
pub fn sink_tokens(report: &serde_json::Value, place: PlaceIndex) -> u64 {
    report["places"][place.to_string()].as_u64().unwrap_or(0)
}
