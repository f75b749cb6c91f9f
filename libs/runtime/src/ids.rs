//! Identifiers
//!
//! Net ids are allocated per process from a shared counter and interleaved
//! across the cluster: process `p` of `n` hands out `p, p + n, p + 2n, ...`
//! so two processes never produce the same id and no id is handed out twice.

use crate::{Result, RuntimeError};
use network::ProcessId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a place inside a net
pub type PlaceIndex = u32;

/// Index of a transition inside a net
pub type TransitionIndex = u32;

/// Cluster-wide unique net instance id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NetId(u32);

impl NetId {
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Process whose copy of a global net owns its initial marking
    pub fn main_process(self, process_count: usize) -> ProcessId {
        ProcessId::new((self.0 as u64 % process_count.max(1) as u64) as u32)
    }
}

impl fmt::Display for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

/// Worker index inside one process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(u32);

impl WorkerId {
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "W{}", self.0)
    }
}

/// Id counter of one process
#[derive(Debug)]
pub struct NetIdAllocator {
    process: u32,
    process_count: u32,
    counter: Mutex<u32>,
}

impl NetIdAllocator {
    pub fn new(process: ProcessId, process_count: usize) -> Result<Self> {
        let count = u32::try_from(process_count)
            .ok()
            .filter(|count| *count > 0)
            .ok_or_else(|| {
                RuntimeError::configuration(
                    format!("invalid process count {}", process_count),
                    Some("process_count"),
                )
            })?;
        if process.raw() >= count {
            return Err(RuntimeError::configuration(
                format!("{} is outside a {}-process cluster", process, count),
                Some("process_id"),
            ));
        }
        Ok(Self {
            process: process.raw(),
            process_count: count,
            counter: Mutex::new(0),
        })
    }

    /// Next unused id; the lock is held only for the increment
    pub fn next(&self) -> Result<NetId> {
        let mut counter = self.counter.lock();
        let id = counter
            .checked_mul(self.process_count)
            .and_then(|base| base.checked_add(self.process))
            .ok_or(RuntimeError::IdSpaceExhausted)?;
        *counter = counter.checked_add(1).ok_or(RuntimeError::IdSpaceExhausted)?;
        Ok(NetId(id))
    }

    /// Ids handed out so far
    pub fn allocated(&self) -> u32 {
        *self.counter.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_interleave_by_process() {
        let p1 = NetIdAllocator::new(ProcessId::new(1), 3).unwrap();
        let ids: Vec<u32> = (0..4).map(|_| p1.next().unwrap().raw()).collect();
        assert_eq!(ids, vec![1, 4, 7, 10]);
        assert_eq!(p1.allocated(), 4);
        assert_eq!(NetId::new(7).main_process(3), ProcessId::new(1));
    }

    #[test]
    fn test_invalid_layout() {
        assert!(NetIdAllocator::new(ProcessId::new(0), 0).is_err());
        assert!(NetIdAllocator::new(ProcessId::new(2), 2).is_err());
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let alloc = NetIdAllocator::new(ProcessId::new(1), 2).unwrap();
        *alloc.counter.lock() = u32::MAX / 2 + 1;
        assert!(matches!(alloc.next(), Err(RuntimeError::IdSpaceExhausted)));
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let alloc = std::sync::Arc::new(NetIdAllocator::new(ProcessId::new(0), 1).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let alloc = alloc.clone();
                std::thread::spawn(move || {
                    (0..250).map(|_| alloc.next().unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(seen.len(), 1000);
    }

    proptest! {
        #[test]
        fn ids_never_collide_across_processes(
            process_count in 1usize..8,
            draws in proptest::collection::vec(0usize..8, 1..200),
        ) {
            let allocators: Vec<_> = (0..process_count)
                .map(|p| NetIdAllocator::new(ProcessId::new(p as u32), process_count).unwrap())
                .collect();
            let mut seen = HashSet::new();
            for draw in draws {
                let process = draw % process_count;
                let id = allocators[process].next().unwrap();
                prop_assert_eq!(id.main_process(process_count), ProcessId::new(process as u32));
                prop_assert!(seen.insert(id));
            }
        }
    }
}
