//! Disk I/O fair scheduling.
//!
//! Every disk request enters its reactor's [`IoQueue`] under an
//! [`IoPriorityClass`]. When the bounded in-flight slot semaphore has
//! capacity, the queue dispatches from the eligible class with the lowest
//! accumulated work per share, so classes receive bandwidth proportional
//! to their registered shares while each class keeps strict FIFO order.
//!
//! Priority classes are registered process-wide (a class id means the
//! same thing on every reactor); the queues themselves are per-reactor
//! and unlocked.

use std::collections::VecDeque;
use std::sync::Once;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::semaphore::Semaphore;

const MAX_CLASSES: usize = 1024;

static REGISTERED_SHARES: [AtomicU32; MAX_CLASSES] =
    [const { AtomicU32::new(0) }; MAX_CLASSES];
// Slot 0 is reserved for the default class.
static NEXT_CLASS: AtomicU32 = AtomicU32::new(1);

/// A process-wide I/O priority class. Copyable; the id indexes the shared
/// share table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoPriorityClass(u32);

/// Register a new priority class with the given weight.
pub fn register_priority_class(shares: u32) -> IoPriorityClass {
    let id = NEXT_CLASS.fetch_add(1, Ordering::Relaxed);
    assert!((id as usize) < MAX_CLASSES, "too many io priority classes");
    REGISTERED_SHARES[id as usize].store(shares.max(1), Ordering::Relaxed);
    IoPriorityClass(id)
}

/// The class used when the caller does not name one.
pub fn default_priority_class() -> IoPriorityClass {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        REGISTERED_SHARES[0].store(100, Ordering::Relaxed);
    });
    IoPriorityClass(0)
}

/// Cost of one request: a fixed per-op term plus a size term, normalized
/// so one 128 KiB transfer costs about two base ops.
fn request_cost(len: usize) -> f64 {
    1.0 + len as f64 / (128.0 * 1024.0)
}

type SubmitFn = Box<dyn FnOnce()>;

struct ClassQueue {
    shares: u32,
    accumulated: f64,
    queue: VecDeque<(usize, SubmitFn)>,
}

pub(crate) struct IoQueue {
    slots: Semaphore,
    capacity: usize,
    classes: Vec<Option<ClassQueue>>,
    queued: usize,
}

impl IoQueue {
    /// A queue dispatching at most `capacity` requests in flight.
    pub fn new(capacity: usize) -> IoQueue {
        IoQueue {
            slots: Semaphore::new(capacity),
            capacity,
            classes: Vec::new(),
            queued: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Requests waiting for a slot.
    pub fn queued_requests(&self) -> usize {
        self.queued
    }

    /// Enqueue a request under `pc` and dispatch whatever now fits.
    pub fn queue_request(&mut self, pc: IoPriorityClass, len: usize, submit: SubmitFn) {
        let idx = pc.0 as usize;
        if idx >= self.classes.len() {
            self.classes.resize_with(idx + 1, || None);
        }
        let class = self.classes[idx].get_or_insert_with(|| {
            let shares = REGISTERED_SHARES[idx].load(Ordering::Relaxed).max(1);
            ClassQueue {
                shares,
                accumulated: 0.0,
                queue: VecDeque::new(),
            }
        });
        class.queue.push_back((len, submit));
        self.queued += 1;
        self.dispatch();
    }

    /// One in-flight request finished; its slot frees and the next
    /// eligible request dispatches.
    pub fn complete_request(&mut self) {
        self.slots.signal();
        self.dispatch();
    }

    fn dispatch(&mut self) {
        loop {
            // Pick the non-empty class with the lowest normalized work.
            let next = self
                .classes
                .iter()
                .enumerate()
                .filter(|(_, c)| c.as_ref().is_some_and(|c| !c.queue.is_empty()))
                .min_by(|(_, a), (_, b)| {
                    let a = a.as_ref().unwrap();
                    let b = b.as_ref().unwrap();
                    let wa = a.accumulated / a.shares as f64;
                    let wb = b.accumulated / b.shares as f64;
                    wa.total_cmp(&wb)
                })
                .map(|(i, _)| i);
            let Some(idx) = next else { return };
            if !self.slots.try_wait(1) {
                return;
            }
            let class = self.classes[idx].as_mut().unwrap();
            let (len, submit) = class.queue.pop_front().unwrap();
            class.accumulated += request_cost(len);
            self.queued -= 1;
            submit();
            self.maybe_renormalize();
        }
    }

    /// Keep the accumulated-work terms bounded: subtract the global
    /// minimum once it grows large, preserving relative order.
    fn maybe_renormalize(&mut self) {
        let min = self
            .classes
            .iter()
            .flatten()
            .map(|c| c.accumulated)
            .fold(f64::INFINITY, f64::min);
        if min > 1e9 {
            for c in self.classes.iter_mut().flatten() {
                c.accumulated -= min;
            }
        }
    }
}
