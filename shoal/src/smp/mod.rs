//! Sharded execution across reactors.
//!
//! Cross-core work always travels as a boxed item over the per-pair SPSC
//! rings; there is no other channel between reactors. `submit_to` is the
//! primitive; the collectives (`invoke_on_all`, `map_reduce0` via
//! [`Sharded`](crate::sharded::Sharded)) expand to it.

pub(crate) mod queue;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::future::{Future, Futurize, apply, iterate::parallel_for_each};
use crate::metrics;
use crate::reactor::{self, Reactor};
use crate::reactor::uring::Uring;

pub(crate) use queue::{BATCH_SIZE, QUEUE_LENGTH, SpscQueue, WorkItem};
use queue::AsyncWorkItem;

#[repr(align(128))]
struct AlignedBool(AtomicBool);

struct QueuePair {
    requests: SpscQueue<Box<dyn WorkItem>>,
    completions: SpscQueue<Box<dyn WorkItem>>,
}

/// Shared state of one runtime: the N×N ring matrix plus per-reactor
/// sleep flags and wake fds.
pub(crate) struct SmpContext {
    count: usize,
    /// `pairs[dst][src]`: requests flow src→dst, completions dst→src.
    pairs: Vec<Vec<QueuePair>>,
    sleeping: Vec<AlignedBool>,
    wake_fds: Vec<AtomicI32>,
}

impl SmpContext {
    pub fn new(count: usize) -> Arc<SmpContext> {
        let pairs = (0..count)
            .map(|_| {
                (0..count)
                    .map(|_| QueuePair {
                        requests: SpscQueue::new(),
                        completions: SpscQueue::new(),
                    })
                    .collect()
            })
            .collect();
        Arc::new(SmpContext {
            count,
            pairs,
            sleeping: (0..count).map(|_| AlignedBool(AtomicBool::new(false))).collect(),
            wake_fds: (0..count).map(|_| AtomicI32::new(-1)).collect(),
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn sleeping(&self, cpu: usize) -> &AtomicBool {
        &self.sleeping[cpu].0
    }

    pub fn set_wake_fd(&self, cpu: usize, fd: std::os::fd::RawFd) {
        self.wake_fds[cpu].store(fd, Ordering::Release);
    }

    /// Kick a peer's eventfd if it is (or is about to start) sleeping.
    fn maybe_wake(&self, cpu: usize) {
        if self.sleeping[cpu].0.load(Ordering::Acquire) {
            let fd = self.wake_fds[cpu].load(Ordering::Acquire);
            if fd >= 0 {
                Uring::notify(fd);
            }
        }
    }
}

/// Number of reactors in the running runtime.
pub fn count() -> usize {
    reactor::local().smp.as_ref().map_or(1, |ctx| ctx.count())
}

/// The current reactor's shard id.
pub fn this_cpu() -> usize {
    reactor::local().cpu_id()
}

/// Run `func` on reactor `cpu` and resolve with its result on the
/// calling reactor.
///
/// A local submission (`cpu` == current) short-circuits through
/// [`apply`], preserving the closure's lifetime semantics. A remote
/// submission boxes the closure into a work item; if the peer's queue is
/// saturated the returned future simply waits for capacity.
pub fn submit_to<F, R>(cpu: usize, func: F) -> Future<R::Output>
where
    F: FnOnce() -> R + Send + 'static,
    R: Futurize + 'static,
    R::Output: Send + 'static,
{
    let r = reactor::local();
    if cpu == r.cpu_id() {
        return apply(func);
    }
    let ctx = r.smp.as_ref().expect("no peer reactors in this runtime");
    assert!(cpu < ctx.count(), "no such cpu: {cpu}");

    let (item, fut) = AsyncWorkItem::new(func);
    metrics::SMP_SENT.increment();
    let r2 = r.clone();
    r.tx[cpu].tokens.wait().schedule(move |res| {
        debug_assert!(res.is_ok(), "smp token semaphore never fails");
        r2.tx[cpu].pending.borrow_mut().push_back(item as Box<dyn WorkItem>);
    });
    fut
}

/// Invoke `func` on every reactor (a fresh copy each); resolves when all
/// invocations finished.
pub fn invoke_on_all<F, R>(func: F) -> Future<()>
where
    F: Fn() -> R + Clone + Send + 'static,
    R: Futurize<Output = ()> + 'static,
{
    parallel_for_each(0..count(), move |cpu| submit_to(cpu, func.clone()))
}

/// One poll round over every peer: flush our outbound batches, process a
/// batch of incoming requests, reap a batch of completions. Returns true
/// if anything moved.
pub(crate) fn poll_queues(r: &Reactor) -> bool {
    let Some(ctx) = r.smp.clone() else {
        return false;
    };
    let me = r.cpu_id();
    let mut got = 0usize;
    for peer in 0..ctx.count() {
        if peer == me {
            continue;
        }
        got += flush_outbound(r, &ctx, me, peer);
        got += process_incoming(&ctx, me, peer);
        got += process_completions(r, &ctx, me, peer);
    }
    got != 0
}

/// Move locally batched items into the peer's request ring.
fn flush_outbound(r: &Reactor, ctx: &Arc<SmpContext>, me: usize, peer: usize) -> usize {
    let mut moved = 0;
    let mut pending = r.tx[peer].pending.borrow_mut();
    while let Some(item) = pending.pop_front() {
        match ctx.pairs[peer][me].requests.push(item) {
            Ok(()) => moved += 1,
            Err(item) => {
                pending.push_front(item);
                break;
            }
        }
    }
    drop(pending);
    if moved > 0 {
        ctx.maybe_wake(peer);
    }
    moved
}

/// Run up to a batch of requests sent to us by `peer`. Each item ships
/// back on the completion ring once its future resolves.
fn process_incoming(ctx: &Arc<SmpContext>, me: usize, peer: usize) -> usize {
    let mut n = 0;
    while n < BATCH_SIZE {
        let Some(mut item) = ctx.pairs[me][peer].requests.pop() else {
            break;
        };
        n += 1;
        let done = item.process();
        let ctx2 = ctx.clone();
        done.schedule(move |_| {
            // Result stored in the item; hand it back. The completion
            // ring cannot overflow: the sender holds one capacity token
            // per item in flight.
            if let Err(item) = ctx2.pairs[me][peer].completions.push(item) {
                // Unreachable by token accounting. Leak rather than drop:
                // dropping would touch the sender's promise on this core.
                debug_assert!(false, "completion ring overflow");
                std::mem::forget(item);
            }
            ctx2.maybe_wake(peer);
        });
    }
    n
}

/// Reap up to a batch of completed items from `peer`, resolving the
/// waiting promises and returning queue-capacity tokens.
fn process_completions(r: &Reactor, ctx: &Arc<SmpContext>, me: usize, peer: usize) -> usize {
    let mut n = 0;
    while n < BATCH_SIZE {
        let Some(item) = ctx.pairs[peer][me].completions.pop() else {
            break;
        };
        n += 1;
        metrics::SMP_COMPLETED.increment();
        item.complete();
        r.tx[peer].tokens.signal();
    }
    n
}
