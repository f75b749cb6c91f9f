//! Demo Nets
//!
//! Template table shipped with the node binary:
//!
//! - `ring`: one token travels around every process; the copy that sees
//!   the hop limit halts the net
//! - `broadcast`: the main copy multicasts a token per round to every
//!   process and halts once its own copy consumed all of them

use anyhow::{bail, Result};
use bytes::Bytes;
use net_runtime::{
    Context, Firing, Net, NetDef, NetDefs, NetId, PlaceIndex, ProcessId, RuntimeError,
    SpawnContext, TokenBatch, TransitionIndex,
};
use std::sync::Arc;

pub const RING: usize = 0;
pub const BROADCAST: usize = 1;

/// Template table; `rounds` is the ring's hop limit and the broadcast's
/// round count
pub fn templates(rounds: u32) -> NetDefs {
    vec![Arc::new(RingDef { limit: rounds }), Arc::new(BroadcastDef { rounds })]
}

/// Template index for a name given on the command line
pub fn template_index(name: &str) -> Result<usize> {
    match name {
        "ring" => Ok(RING),
        "broadcast" => Ok(BROADCAST),
        other => bail!("unknown demo net '{}' (expected ring or broadcast)", other),
    }
}

fn all_processes(count: usize) -> Vec<ProcessId> {
    (0..count as u32).map(ProcessId::new).collect()
}

fn decode_u32(net: NetId, payload: &Bytes) -> net_runtime::Result<u32> {
    let bytes: [u8; 4] = payload
        .as_ref()
        .try_into()
        .map_err(|_| RuntimeError::net(net, format!("expected 4-byte token, got {}", payload.len())))?;
    Ok(u32::from_le_bytes(bytes))
}

struct RingDef {
    limit: u32,
}

impl NetDef for RingDef {
    fn name(&self) -> &str {
        "ring"
    }

    fn instantiate(&self, ctx: SpawnContext) -> Box<dyn Net> {
        Box::new(Ring {
            id: ctx.net,
            limit: self.limit,
            waiting: if ctx.is_main_process() { vec![0] } else { Vec::new() },
            forwarded: 0,
        })
    }
}

struct Ring {
    id: NetId,
    limit: u32,
    /// Hop counters of tokens sitting in place 0
    waiting: Vec<u32>,
    forwarded: u32,
}

impl Net for Ring {
    fn id(&self) -> NetId {
        self.id
    }

    fn transition_count(&self) -> u32 {
        1
    }

    fn fire_transition(&mut self, ctx: &mut Context<'_>, _transition: TransitionIndex) -> net_runtime::Result<Firing> {
        let Some(hop) = self.waiting.pop() else {
            return Ok(Firing::NotEnabled);
        };
        if hop >= self.limit {
            ctx.halt()?;
            return Ok(Firing::Fired);
        }
        let next = ProcessId::new((ctx.process().raw() + 1) % ctx.process_count() as u32);
        ctx.send(next, self.id, 0, Bytes::copy_from_slice(&(hop + 1).to_le_bytes()))?;
        self.forwarded += 1;
        Ok(Firing::Fired)
    }

    fn receive_tokens(&mut self, place: PlaceIndex, batch: TokenBatch) -> net_runtime::Result<()> {
        if place != 0 {
            return Err(RuntimeError::net(self.id, format!("ring has no place {}", place)));
        }
        self.waiting.push(decode_u32(self.id, &batch.payload)?);
        Ok(())
    }

    fn report(&self) -> serde_json::Value {
        serde_json::json!({ "forwarded": self.forwarded, "waiting": self.waiting.len() })
    }
}

struct BroadcastDef {
    rounds: u32,
}

impl NetDef for BroadcastDef {
    fn name(&self) -> &str {
        "broadcast"
    }

    fn instantiate(&self, ctx: SpawnContext) -> Box<dyn Net> {
        Box::new(Broadcast {
            id: ctx.net,
            main: ctx.is_main_process(),
            rounds: self.rounds,
            emitted: 0,
            inbox: 0,
            consumed: 0,
        })
    }
}

struct Broadcast {
    id: NetId,
    main: bool,
    rounds: u32,
    emitted: u32,
    inbox: u32,
    consumed: u32,
}

impl Broadcast {
    const EMIT: TransitionIndex = 0;
    const CONSUME: TransitionIndex = 1;
    const FINISH: TransitionIndex = 2;
}

impl Net for Broadcast {
    fn id(&self) -> NetId {
        self.id
    }

    fn transition_count(&self) -> u32 {
        3
    }

    fn fire_transition(&mut self, ctx: &mut Context<'_>, transition: TransitionIndex) -> net_runtime::Result<Firing> {
        match transition {
            Self::EMIT if self.main && self.emitted < self.rounds => {
                let targets = all_processes(ctx.process_count());
                let payload = Bytes::copy_from_slice(&self.emitted.to_le_bytes());
                ctx.send_multicast(&targets, self.id, 0, payload).into_result()?;
                self.emitted += 1;
                Ok(Firing::Fired)
            }
            Self::CONSUME if self.inbox > 0 => {
                self.inbox -= 1;
                self.consumed += 1;
                Ok(Firing::Fired)
            }
            Self::FINISH if self.main && self.consumed == self.rounds => {
                ctx.halt()?;
                Ok(Firing::Fired)
            }
            _ => Ok(Firing::NotEnabled),
        }
    }

    fn receive_tokens(&mut self, place: PlaceIndex, batch: TokenBatch) -> net_runtime::Result<()> {
        if place != 0 {
            return Err(RuntimeError::net(self.id, format!("broadcast has no place {}", place)));
        }
        self.inbox += batch.tokens_count;
        Ok(())
    }

    fn report(&self) -> serde_json::Value {
        serde_json::json!({
            "main": self.main,
            "emitted": self.emitted,
            "consumed": self.consumed,
        })
    }
}
