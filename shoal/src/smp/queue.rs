//! Cross-core message plumbing.
//!
//! For each ordered reactor pair there is a bounded single-producer /
//! single-consumer ring carrying boxed work items one way and a twin ring
//! carrying the same boxes back as completions. Item ownership alternates
//! strictly: the sender builds the item and pushes it, the receiver runs
//! it and stores the result, the sender reaps it and completes the
//! source-side promise. Capacity is enforced by a sender-side token
//! semaphore, so a full queue means the submit future waits rather than
//! fails.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::AsyncResult;
use crate::future::{Future, Futurize, Promise, apply};

/// Ring capacity per directed pair.
pub(crate) const QUEUE_LENGTH: usize = 128;
/// Items processed per poll round.
pub(crate) const BATCH_SIZE: usize = 16;

#[repr(align(128))]
struct CacheAligned<T>(T);

/// Bounded lock-free SPSC ring. Exactly one producer thread and one
/// consumer thread; enforced by the queue-matrix layout, not the type.
pub(crate) struct SpscQueue<T> {
    head: CacheAligned<AtomicUsize>,
    tail: CacheAligned<AtomicUsize>,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

unsafe impl<T: Send> Send for SpscQueue<T> {}
unsafe impl<T: Send> Sync for SpscQueue<T> {}

impl<T> SpscQueue<T> {
    pub fn new() -> SpscQueue<T> {
        let slots = (0..QUEUE_LENGTH)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        SpscQueue {
            head: CacheAligned(AtomicUsize::new(0)),
            tail: CacheAligned(AtomicUsize::new(0)),
            slots,
        }
    }

    /// Producer side. Returns the value back if the ring is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let tail = self.tail.0.load(Ordering::Relaxed);
        let head = self.head.0.load(Ordering::Acquire);
        if tail.wrapping_sub(head) == QUEUE_LENGTH {
            return Err(value);
        }
        let slot = tail & (QUEUE_LENGTH - 1);
        unsafe {
            (*self.slots[slot].get()).write(value);
        }
        self.tail.0.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Consumer side.
    pub fn pop(&self) -> Option<T> {
        let head = self.head.0.load(Ordering::Relaxed);
        let tail = self.tail.0.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let slot = head & (QUEUE_LENGTH - 1);
        let value = unsafe { (*self.slots[slot].get()).assume_init_read() };
        self.head.0.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    pub fn is_empty(&self) -> bool {
        self.head.0.load(Ordering::Acquire) == self.tail.0.load(Ordering::Acquire)
    }
}

impl<T> Drop for SpscQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

/// A unit of cross-core work.
///
/// `process` runs on the destination reactor and resolves once the result
/// has been stored into the item; `complete` runs back on the source
/// reactor and resolves the caller's promise.
pub(crate) trait WorkItem: Send {
    fn process(&mut self) -> Future<()>;
    fn complete(self: Box<Self>);
}

/// The standard work item: a function to run remotely, a slot for its
/// `Send` result, and the source-side promise.
///
/// The promise half is `!Send`; the item as a whole is declared `Send`
/// because the ownership protocol guarantees the promise is only ever
/// touched on the core that created it — the destination core only calls
/// `process`, which touches `func` and `result`.
pub(crate) struct AsyncWorkItem<F, R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Futurize + 'static,
    R::Output: Send,
{
    func: Option<F>,
    result: Option<AsyncResult<R::Output>>,
    promise: Option<Promise<R::Output>>,
}

unsafe impl<F, R> Send for AsyncWorkItem<F, R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Futurize + 'static,
    R::Output: Send,
{
}

impl<F, R> AsyncWorkItem<F, R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Futurize + 'static,
    R::Output: Send + 'static,
{
    pub fn new(func: F) -> (Box<AsyncWorkItem<F, R>>, Future<R::Output>) {
        let mut promise = Promise::new();
        let fut = promise.get_future();
        (
            Box::new(AsyncWorkItem {
                func: Some(func),
                result: None,
                promise: Some(promise),
            }),
            fut,
        )
    }
}

impl<F, R> WorkItem for AsyncWorkItem<F, R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Futurize + 'static,
    R::Output: Send + 'static,
{
    fn process(&mut self) -> Future<()> {
        let func = self.func.take().expect("work item processed twice");
        // The box holding this item stays put until the returned future
        // resolves, so the raw pointer outlives the continuation.
        let this: *mut Self = self;
        apply(func).then_wrapped(move |res| {
            unsafe {
                (*this).result = Some(res);
            }
            Ok(())
        })
    }

    fn complete(mut self: Box<Self>) {
        let promise = self.promise.take().expect("work item completed twice");
        match self.result.take() {
            Some(r) => promise.set_result(r),
            // Processing never stored a result (destination tore down);
            // dropping the promise breaks the caller's future.
            None => drop(promise),
        }
    }
}
