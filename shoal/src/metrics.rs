//! shoal runtime metrics.
//!
//! Counters bumped from the per-reactor hot path (every task dispatch,
//! every poll round, every disk and cross-core completion), exposed
//! through the metriken registry. Storage is sharded per reactor thread
//! (see [`counter`](crate::counter)) so the loop never bounces a shared
//! cache line between cores.

use metriken::metric;

use crate::counter::{CounterGroup, ShardedCounter};

// Counter groups: one cache line per shard, up to 16 counters each.
static SCHED: CounterGroup = CounterGroup::new();
static FUTURES: CounterGroup = CounterGroup::new();
static IO: CounterGroup = CounterGroup::new();
static SMP: CounterGroup = CounterGroup::new();

/// Counter slot indices for scheduler metrics.
pub mod sched {
    pub const TASKS: usize = 0;
    pub const HIGH_PRIORITY_TASKS: usize = 1;
    pub const POLLS: usize = 2;
    pub const SLEEPS: usize = 3;
    pub const TIMERS_FIRED: usize = 4;
}

/// Counter slot indices for future metrics.
pub mod futures {
    pub const IGNORED_FAILURES: usize = 0;
    pub const BROKEN_PROMISES: usize = 1;
}

/// Counter slot indices for disk I/O metrics.
pub mod io {
    pub const READS: usize = 0;
    pub const READ_BYTES: usize = 1;
    pub const WRITES: usize = 2;
    pub const WRITE_BYTES: usize = 3;
    pub const FSYNCS: usize = 4;
}

/// Counter slot indices for cross-core queue metrics.
pub mod smp {
    pub const SENT: usize = 0;
    pub const COMPLETED: usize = 1;
}

// ── Scheduler ────────────────────────────────────────────────────

#[metric(name = "shoal/scheduler/tasks", description = "Tasks executed")]
pub static TASKS_RUN: ShardedCounter = ShardedCounter::new(&SCHED, sched::TASKS);

#[metric(
    name = "shoal/scheduler/high_priority_tasks",
    description = "High-priority tasks executed"
)]
pub static HIGH_PRIORITY_TASKS_RUN: ShardedCounter =
    ShardedCounter::new(&SCHED, sched::HIGH_PRIORITY_TASKS);

#[metric(name = "shoal/scheduler/polls", description = "Reactor poll rounds")]
pub static POLLS: ShardedCounter = ShardedCounter::new(&SCHED, sched::POLLS);

#[metric(name = "shoal/scheduler/sleeps", description = "Times a reactor went to sleep")]
pub static SLEEPS: ShardedCounter = ShardedCounter::new(&SCHED, sched::SLEEPS);

#[metric(name = "shoal/timers/fired", description = "Timer callbacks invoked")]
pub static TIMERS_FIRED: ShardedCounter = ShardedCounter::new(&SCHED, sched::TIMERS_FIRED);

// ── Futures ──────────────────────────────────────────────────────

#[metric(
    name = "shoal/futures/ignored_failures",
    description = "Failed futures dropped without their error being observed"
)]
pub static IGNORED_FAILURES: ShardedCounter =
    ShardedCounter::new(&FUTURES, futures::IGNORED_FAILURES);

#[metric(
    name = "shoal/futures/broken_promises",
    description = "Promises dropped without being fulfilled"
)]
pub static BROKEN_PROMISES: ShardedCounter =
    ShardedCounter::new(&FUTURES, futures::BROKEN_PROMISES);

// ── Disk I/O ─────────────────────────────────────────────────────

#[metric(name = "shoal/io/reads", description = "Disk read operations completed")]
pub static IO_READS: ShardedCounter = ShardedCounter::new(&IO, io::READS);

#[metric(name = "shoal/io/read_bytes", description = "Bytes read from disk")]
pub static IO_READ_BYTES: ShardedCounter = ShardedCounter::new(&IO, io::READ_BYTES);

#[metric(name = "shoal/io/writes", description = "Disk write operations completed")]
pub static IO_WRITES: ShardedCounter = ShardedCounter::new(&IO, io::WRITES);

#[metric(name = "shoal/io/write_bytes", description = "Bytes written to disk")]
pub static IO_WRITE_BYTES: ShardedCounter = ShardedCounter::new(&IO, io::WRITE_BYTES);

#[metric(name = "shoal/io/fsyncs", description = "Fsync operations completed")]
pub static IO_FSYNCS: ShardedCounter = ShardedCounter::new(&IO, io::FSYNCS);

// ── Cross-core queues ────────────────────────────────────────────

#[metric(name = "shoal/smp/sent", description = "Work items sent to peer reactors")]
pub static SMP_SENT: ShardedCounter = ShardedCounter::new(&SMP, smp::SENT);

#[metric(
    name = "shoal/smp/completed",
    description = "Work item completions received back"
)]
pub static SMP_COMPLETED: ShardedCounter = ShardedCounter::new(&SMP, smp::COMPLETED);
