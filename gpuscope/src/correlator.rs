//! # Entry/Exit Correlator
//!
//! Pairs the entry half of an instrumented call with its exit. The original
//! probes kept this state in fixed-size kernel hash maps keyed by pid; this
//! is the same table in user space: pre-allocated at startup, sharded for
//! concurrent access, and strictly bounded: a full shard rejects the entry
//! (counted, never fatal) instead of growing.
//!
//! Entries are ephemeral: written at call entry, taken (looked up and
//! removed in one step) at the matching exit. An exit without a recorded
//! entry is an accepted lossy case; the process may have been attached
//! mid-call, or the entry may have been rejected or overwritten.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Entry-side data carried to the matching exit: the entry timestamp plus
/// whatever entry-only arguments the family needs (requested size, packed
/// graph metadata).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub source: u32,
    pub ts_ns: u64,
    pub args: [u64; 2],
}

const SHARDS: usize = 16;

pub struct Correlator {
    shards: Box<[Mutex<Vec<(u32, Entry)>>]>,
    shard_cap: usize,
    rejected: AtomicU64,
}

impl Correlator {
    /// Build a table for roughly `capacity` in-flight calls. All storage is
    /// allocated up front; nothing grows afterwards.
    ///
    /// # Panics
    ///
    /// A zero capacity is a startup configuration error.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "correlator capacity must be non-zero");
        let shard_cap = capacity.div_ceil(SHARDS);
        let shards = (0..SHARDS)
            .map(|_| Mutex::new(Vec::with_capacity(shard_cap)))
            .collect();
        Self { shards, shard_cap, rejected: AtomicU64::new(0) }
    }

    fn shard(&self, key: u32) -> &Mutex<Vec<(u32, Entry)>> {
        &self.shards[key as usize % SHARDS]
    }

    /// Record the entry half of a call. Unconditionally overwrites any prior
    /// entry for `key`; nested or re-entrant invocations take the latest,
    /// matching the `BPF_ANY` upsert the original probes used. A full shard
    /// rejects the entry; the matching exit will then miss and that
    /// invocation is lost.
    pub fn record_entry(&self, key: u32, entry: Entry) {
        let mut shard = self.shard(key).lock().unwrap();
        if let Some(slot) = shard.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = entry;
            return;
        }
        if shard.len() < self.shard_cap {
            shard.push((key, entry));
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            log::debug!("correlator full, rejecting entry for pid {key}");
        }
    }

    /// Look up and delete in one logical step. `None` means no matching
    /// entry was observed; the caller emits nothing for that invocation.
    pub fn take_exit(&self, key: u32) -> Option<Entry> {
        let mut shard = self.shard(key).lock().unwrap();
        let idx = shard.iter().position(|(k, _)| *k == key)?;
        Some(shard.swap_remove(idx).1)
    }

    /// Entries rejected because the table was full. Diagnostic only.
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}
