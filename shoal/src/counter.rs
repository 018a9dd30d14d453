//! Sharded counters for hot-path metrics.
//!
//! The reactor loop bumps counters on every task dispatch and poll
//! round, from one pinned OS thread per core. A single shared atomic
//! would bounce its cache line between every core on every increment,
//! so a [`CounterGroup`] spreads the storage across per-shard cache
//! lines: each reactor writes only its own shard, and reads sum across
//! all of them. Up to 16 counters pack into one group, each slot an
//! offset within every shard's line.
//!
//! [`ShardedCounter`] references one slot of a group and implements
//! [`metriken::Metric`], so it works with the `#[metric]` attribute.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

const CACHE_LINE: usize = 128;
/// Counters per group: one cache line of u64 slots per shard.
const SLOTS: usize = CACHE_LINE / 8;
const SHARDS: usize = 64;

thread_local! {
    /// This thread's shard index, set by `set_reactor_shard()` when a
    /// reactor takes ownership of the thread.
    static SHARD: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Pin the current thread to a counter shard. Called with the shard id
/// at reactor-thread startup so writers never collide.
pub fn set_reactor_shard(cpu: usize) {
    SHARD.set(Some(cpu % SHARDS));
}

/// The shard the current thread writes to. Threads outside a reactor
/// (startup, tests) fall back to a stable per-thread pick derived from
/// a thread-local address; a collision there only costs contention,
/// never correctness.
fn shard_index() -> usize {
    SHARD.get().unwrap_or_else(|| {
        thread_local! {
            static ANCHOR: u8 = const { 0 };
        }
        ANCHOR.with(|a| a as *const u8 as usize) % SHARDS
    })
}

#[repr(C, align(128))]
struct Shard {
    slots: [AtomicU64; SLOTS],
}

/// Striped storage for up to 16 counters.
pub struct CounterGroup {
    shards: [Shard; SHARDS],
}

impl CounterGroup {
    pub const fn new() -> CounterGroup {
        CounterGroup {
            shards: [const {
                Shard {
                    slots: [const { AtomicU64::new(0) }; SLOTS],
                }
            }; SHARDS],
        }
    }

    #[inline]
    fn add(&self, slot: usize, value: u64) {
        debug_assert!(slot < SLOTS, "counter slot out of range");
        self.shards[shard_index()].slots[slot].fetch_add(value, Ordering::Relaxed);
    }

    fn sum(&self, slot: usize) -> u64 {
        debug_assert!(slot < SLOTS, "counter slot out of range");
        self.shards
            .iter()
            .map(|s| s.slots[slot].load(Ordering::Relaxed))
            .sum()
    }
}

impl Default for CounterGroup {
    fn default() -> Self {
        CounterGroup::new()
    }
}

/// One counter slot within a [`CounterGroup`].
pub struct ShardedCounter {
    group: &'static CounterGroup,
    slot: usize,
}

impl ShardedCounter {
    /// Bind a counter to `slot` of `group`. Slots above 15 trip a debug
    /// assertion on first use.
    pub const fn new(group: &'static CounterGroup, slot: usize) -> ShardedCounter {
        ShardedCounter { group, slot }
    }

    #[inline]
    pub fn increment(&self) {
        self.add(1);
    }

    #[inline]
    pub fn add(&self, value: u64) {
        self.group.add(self.slot, value);
    }

    /// Current value, summed across all shards.
    pub fn value(&self) -> u64 {
        self.group.sum(self.slot)
    }
}

impl metriken::Metric for ShardedCounter {
    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn value(&self) -> Option<metriken::Value<'_>> {
        Some(metriken::Value::Counter(ShardedCounter::value(self)))
    }
}
