//! Quiescence Detection
//!
//! Counting-wave termination detection coordinated by process 0.
//!
//! Every process counts the work packets (token deliveries and global
//! spawns) it sent to and received from peers. The coordinator, while idle
//! itself, asks everyone for `(idle, sent, received)`. The cluster is
//! quiescent once two consecutive complete waves both report every process
//! idle with `sent == received`, and the totals did not move between them.
//! A packet still in flight shows up as `sent > received`; a packet that
//! was sent and consumed between the waves changes the totals.

use network::ProcessId;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// One process's answer to a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProbeSnapshot {
    pub idle: bool,
    pub sent: u64,
    pub received: u64,
}

/// Aggregate of one complete wave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WaveTotals {
    pub all_idle: bool,
    pub sent: u64,
    pub received: u64,
}

impl WaveTotals {
    fn balanced(&self) -> bool {
        self.all_idle && self.sent == self.received
    }
}

/// What the coordinator should do after a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The wave still waits for replies (or the reply was stale)
    Pending,
    /// The wave finished without proving termination
    Continue(WaveTotals),
    /// Two matching waves: nothing is left anywhere
    Quiescent(WaveTotals),
}

#[derive(Debug)]
struct Wave {
    id: u64,
    replies: BTreeMap<ProcessId, ProbeSnapshot>,
}

#[derive(Debug, Default)]
struct WaveState {
    next_wave: u64,
    current: Option<Wave>,
    previous: Option<WaveTotals>,
    last_probe: Option<Instant>,
    completed: u64,
}

/// Counters and wave state of one process
#[derive(Debug)]
pub struct Quiescence {
    local: ProcessId,
    process_count: usize,
    probe_interval: Duration,
    sent: AtomicU64,
    received: AtomicU64,
    waves: Mutex<WaveState>,
}

/// Counter snapshot for reports
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QuiescenceStats {
    pub work_sent: u64,
    pub work_received: u64,
    pub waves_completed: u64,
}

impl Quiescence {
    pub fn new(local: ProcessId, process_count: usize, probe_interval: Duration) -> Self {
        Self {
            local,
            process_count,
            probe_interval,
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            waves: Mutex::new(WaveState::default()),
        }
    }

    /// Process 0 runs the waves
    pub fn is_coordinator(&self) -> bool {
        self.local.raw() == 0
    }

    #[inline]
    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::AcqRel);
    }

    /// Counters paired with an idle flag computed afterwards
    pub fn snapshot(&self, idle: impl FnOnce() -> bool) -> ProbeSnapshot {
        let sent = self.sent.load(Ordering::Acquire);
        let received = self.received.load(Ordering::Acquire);
        ProbeSnapshot {
            idle: idle(),
            sent,
            received,
        }
    }

    /// Start a new wave if none is running and the probe interval elapsed.
    ///
    /// `own` is the coordinator's own answer. Returns the wave id to
    /// broadcast.
    pub fn begin_wave(&self, own: ProbeSnapshot, now: Instant) -> Option<u64> {
        if !self.is_coordinator() || self.process_count < 2 {
            return None;
        }
        let mut state = self.waves.lock();
        if state.current.is_some() {
            return None;
        }
        if let Some(last) = state.last_probe {
            if now.duration_since(last) < self.probe_interval {
                return None;
            }
        }

        let id = state.next_wave;
        state.next_wave += 1;
        state.last_probe = Some(now);
        let mut replies = BTreeMap::new();
        replies.insert(self.local, own);
        state.current = Some(Wave { id, replies });
        trace!(wave = id, "Starting termination wave");
        Some(id)
    }

    /// Record a peer's reply
    pub fn on_reply(&self, wave: u64, from: ProcessId, snapshot: ProbeSnapshot) -> Verdict {
        let mut state = self.waves.lock();
        let complete = match state.current.as_mut() {
            Some(current) if current.id == wave => {
                current.replies.insert(from, snapshot);
                current.replies.len() == self.process_count
            }
            _ => {
                debug!(wave, from = %from, "Dropping stale probe reply");
                return Verdict::Pending;
            }
        };
        if !complete {
            return Verdict::Pending;
        }

        let Some(finished) = state.current.take() else {
            return Verdict::Pending;
        };
        state.completed += 1;
        let totals = finished.replies.values().fold(
            WaveTotals {
                all_idle: true,
                sent: 0,
                received: 0,
            },
            |acc, reply| WaveTotals {
                all_idle: acc.all_idle && reply.idle,
                sent: acc.sent + reply.sent,
                received: acc.received + reply.received,
            },
        );

        let previous = state.previous.replace(totals);
        debug!(
            wave,
            all_idle = totals.all_idle,
            sent = totals.sent,
            received = totals.received,
            "Termination wave complete"
        );
        match previous {
            Some(previous) if totals.balanced() && previous == totals => Verdict::Quiescent(totals),
            _ => Verdict::Continue(totals),
        }
    }

    pub fn wave_in_progress(&self) -> bool {
        self.waves.lock().current.is_some()
    }

    pub fn stats(&self) -> QuiescenceStats {
        QuiescenceStats {
            work_sent: self.sent.load(Ordering::Acquire),
            work_received: self.received.load(Ordering::Acquire),
            waves_completed: self.waves.lock().completed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle(sent: u64, received: u64) -> ProbeSnapshot {
        ProbeSnapshot {
            idle: true,
            sent,
            received,
        }
    }

    fn run_wave(q: &Quiescence, own: ProbeSnapshot, peers: &[ProbeSnapshot], now: Instant) -> Verdict {
        let wave = q.begin_wave(own, now).expect("wave should start");
        let mut verdict = Verdict::Pending;
        for (i, reply) in peers.iter().enumerate() {
            verdict = q.on_reply(wave, ProcessId::new(i as u32 + 1), *reply);
        }
        verdict
    }

    #[test]
    fn test_two_matching_waves_declare_quiescence() {
        let q = Quiescence::new(ProcessId::new(0), 3, Duration::ZERO);
        let now = Instant::now();
        assert!(matches!(
            run_wave(&q, idle(2, 1), &[idle(1, 1), idle(0, 1)], now),
            Verdict::Continue(_)
        ));
        assert!(matches!(
            run_wave(&q, idle(2, 1), &[idle(1, 1), idle(0, 1)], now),
            Verdict::Quiescent(WaveTotals {
                all_idle: true,
                sent: 3,
                received: 3
            })
        ));
        assert_eq!(q.stats().waves_completed, 2);
    }

    #[test]
    fn test_busy_process_blocks_quiescence() {
        let q = Quiescence::new(ProcessId::new(0), 2, Duration::ZERO);
        let busy = ProbeSnapshot {
            idle: false,
            sent: 0,
            received: 0,
        };
        let now = Instant::now();
        for _ in 0..5 {
            assert!(matches!(
                run_wave(&q, idle(0, 0), &[busy], now),
                Verdict::Continue(_)
            ));
        }
    }

    #[test]
    fn test_in_flight_packet_blocks_quiescence() {
        let q = Quiescence::new(ProcessId::new(0), 2, Duration::ZERO);
        let now = Instant::now();
        // P0 sent one packet that P1 has not pulled yet
        run_wave(&q, idle(1, 0), &[idle(0, 0)], now);
        assert!(matches!(
            run_wave(&q, idle(1, 0), &[idle(0, 0)], now),
            Verdict::Continue(_)
        ));
    }

    #[test]
    fn test_changed_totals_need_another_wave() {
        let q = Quiescence::new(ProcessId::new(0), 2, Duration::ZERO);
        let now = Instant::now();
        run_wave(&q, idle(1, 0), &[idle(0, 1)], now);
        assert!(matches!(
            run_wave(&q, idle(2, 0), &[idle(0, 2)], now),
            Verdict::Continue(_)
        ));
        assert!(matches!(
            run_wave(&q, idle(2, 0), &[idle(0, 2)], now),
            Verdict::Quiescent(_)
        ));
    }

    #[test]
    fn test_stale_replies_and_pacing() {
        let q = Quiescence::new(ProcessId::new(0), 2, Duration::from_secs(60));
        let now = Instant::now();
        let wave = q.begin_wave(idle(0, 0), now).unwrap();
        assert!(q.wave_in_progress());
        assert!(q.begin_wave(idle(0, 0), now).is_none());
        assert_eq!(q.on_reply(wave + 7, ProcessId::new(1), idle(0, 0)), Verdict::Pending);
        assert!(matches!(
            q.on_reply(wave, ProcessId::new(1), idle(0, 0)),
            Verdict::Continue(_)
        ));
        // Interval not elapsed yet
        assert!(q.begin_wave(idle(0, 0), now).is_none());
        assert!(q.begin_wave(idle(0, 0), now + Duration::from_secs(61)).is_some());
    }

    #[test]
    fn test_only_coordinator_probes() {
        let q = Quiescence::new(ProcessId::new(1), 2, Duration::ZERO);
        assert!(!q.is_coordinator());
        assert!(q.begin_wave(idle(0, 0), Instant::now()).is_none());

        let single = Quiescence::new(ProcessId::new(0), 1, Duration::ZERO);
        assert!(single.begin_wave(idle(0, 0), Instant::now()).is_none());
    }

    #[test]
    fn test_snapshot_reads_counters() {
        let q = Quiescence::new(ProcessId::new(1), 2, Duration::ZERO);
        q.record_sent();
        q.record_sent();
        q.record_received();
        assert_eq!(q.snapshot(|| true), idle(2, 1));
        assert_eq!(q.stats().work_sent, 2);
    }
}
