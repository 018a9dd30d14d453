//! The per-core event loop.
//!
//! One [`Reactor`] per participating CPU, owning that core's task FIFOs,
//! timer sets, io_uring instance, disk I/O fair queue and cross-core
//! queue endpoints. A reactor is strictly single-threaded: everything it
//! owns is unlocked and touched only from its OS thread.
//!
//! Each loop iteration drains the high-priority FIFO, runs a time-bounded
//! batch of normal tasks, then polls: outbound/inbound SMP queues, the
//! ring submission batch, ring completions, both timer sets, registered
//! user pollers and pending stream flushes. When nothing produced work
//! and every poller is wake-capable, the loop blocks in the ring bounded
//! by the nearest timer deadline; peers interrupt through the eventfd.

pub(crate) mod task_queue;
pub(crate) mod timer;
pub(crate) mod uring;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::{AsyncResult, Error};
use crate::future::{Future, Promise};
use crate::io_queue::{IoPriorityClass, IoQueue};
use crate::metrics;
use crate::smp::{self, SmpContext};
use crate::semaphore::Semaphore;

use self::task_queue::TaskQueues;
use self::timer::TimerSet;
use self::uring::{OpRes, Uring};

pub use self::timer::{LowresClock, Timer, sleep, sleep_until};

thread_local! {
    static CURRENT: RefCell<Option<Rc<Reactor>>> = const { RefCell::new(None) };
}

/// The reactor owning the current thread.
///
/// # Panics
///
/// Panics when the current thread is not a reactor thread.
pub fn local() -> Rc<Reactor> {
    try_local().expect("not running on a reactor thread")
}

pub(crate) fn try_local() -> Option<Rc<Reactor>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Sender-side state for one peer reactor: queue-capacity tokens and the
/// batch of items not yet moved into the ring.
pub(crate) struct TxPeer {
    pub tokens: Semaphore,
    pub pending: RefCell<VecDeque<Box<dyn smp::WorkItem>>>,
}

type ExitFn = Box<dyn FnOnce() -> Future<()>>;
type PollFn = Box<dyn FnMut() -> bool>;

pub struct Reactor {
    id: usize,
    task_quota: Duration,
    pub(crate) strict_o_direct: bool,
    pub(crate) thread_stack_size: usize,
    pub(crate) queues: Rc<TaskQueues>,
    pub(crate) ring: RefCell<Uring>,
    pub(crate) timers: RefCell<TimerSet>,
    pub(crate) lowres_timers: RefCell<TimerSet>,
    pub(crate) io_queue: RefCell<IoQueue>,
    pub(crate) smp: Option<Arc<SmpContext>>,
    pub(crate) tx: Box<[TxPeer]>,
    at_exit: RefCell<Vec<ExitFn>>,
    pollers: RefCell<HashMap<u64, PollFn>>,
    next_poller_key: Cell<u64>,
    batch_flushes: RefCell<Vec<Box<dyn FnOnce()>>>,
    stopping: Cell<bool>,
    pub(crate) stopped: Cell<bool>,
    exit_code: Cell<i32>,
}

impl Reactor {
    /// Build the reactor for `id` on the current thread. Does not install
    /// it; callers follow with [`make_current`](Self::make_current).
    pub(crate) fn new(
        id: usize,
        config: &Config,
        smp: Option<Arc<SmpContext>>,
        n_reactors: usize,
    ) -> Result<Rc<Reactor>, Error> {
        let ring = Uring::new(config.sq_entries).map_err(Error::from)?;
        if let Some(ctx) = &smp {
            ctx.set_wake_fd(id, ring.wake_fd());
        }
        let tx = (0..n_reactors)
            .map(|_| TxPeer {
                tokens: Semaphore::new(smp::QUEUE_LENGTH),
                pending: RefCell::new(VecDeque::new()),
            })
            .collect();
        Ok(Rc::new(Reactor {
            id,
            task_quota: config.task_quota,
            strict_o_direct: config.strict_o_direct,
            thread_stack_size: config.thread_stack_size,
            queues: TaskQueues::new(),
            ring: RefCell::new(ring),
            timers: RefCell::new(TimerSet::new()),
            lowres_timers: RefCell::new(TimerSet::new()),
            io_queue: RefCell::new(IoQueue::new(config.io_capacity_per_reactor(n_reactors))),
            smp,
            tx,
            at_exit: RefCell::new(Vec::new()),
            pollers: RefCell::new(HashMap::new()),
            next_poller_key: Cell::new(0),
            batch_flushes: RefCell::new(Vec::new()),
            stopping: Cell::new(false),
            stopped: Cell::new(false),
            exit_code: Cell::new(0),
        }))
    }

    /// Install this reactor as the current thread's engine.
    pub(crate) fn make_current(this: &Rc<Reactor>) {
        CURRENT.with(|c| *c.borrow_mut() = Some(this.clone()));
        task_queue::install(this.queues.clone());
    }

    /// Tear down the thread-local installation.
    pub(crate) fn clear_current() {
        CURRENT.with(|c| c.borrow_mut().take());
        task_queue::uninstall();
    }

    /// This reactor's CPU index (shard id).
    pub fn cpu_id(&self) -> usize {
        self.id
    }

    /// Enqueue a normal-priority task.
    pub fn add_task(&self, f: impl FnOnce() + 'static) {
        self.queues.push(Box::new(f));
    }

    /// Enqueue a high-priority task. The high-priority FIFO is drained
    /// completely before any normal task runs.
    pub fn add_high_priority_task(&self, f: impl FnOnce() + 'static) {
        self.queues.push_urgent(Box::new(f));
    }

    /// Register a cleanup to run (in reverse registration order) when the
    /// reactor exits.
    pub fn at_exit(&self, f: impl FnOnce() -> Future<()> + 'static) {
        self.at_exit.borrow_mut().push(Box::new(f));
    }

    /// Register a poller invoked once per loop iteration; it returns
    /// whether it found work. User pollers do not support interrupt-wake,
    /// so while any is registered the loop spins instead of sleeping.
    pub fn add_poller(&self, f: impl FnMut() -> bool + 'static) -> PollerRegistration {
        let key = self.next_poller_key.get();
        self.next_poller_key.set(key + 1);
        self.pollers.borrow_mut().insert(key, Box::new(f));
        PollerRegistration { key }
    }

    /// Queue a deferred flush; the batch-flush poller runs it at the end
    /// of the current loop iteration.
    pub(crate) fn add_batch_flush(&self, f: impl FnOnce() + 'static) {
        self.batch_flushes.borrow_mut().push(Box::new(f));
    }

    /// Begin an orderly shutdown: run the at-exit chain, then leave the
    /// loop with `code`.
    pub fn exit(&self, code: i32) {
        if self.stopping.replace(true) {
            return;
        }
        self.exit_code.set(code);
        let mut funcs: Vec<ExitFn> = self.at_exit.borrow_mut().drain(..).collect();
        funcs.reverse();
        self.add_task(move || {
            run_exit_chain(funcs)
                .then_wrapped(|_| {
                    local().stopped.set(true);
                    Ok(())
                })
                .ignore();
        });
    }

    /// Is an exit in progress?
    pub fn stopping(&self) -> bool {
        self.stopping.get()
    }

    /// Run the loop until [`exit`](Self::exit) completes. Returns the
    /// exit code.
    pub(crate) fn run(&self) -> i32 {
        // cpu 0 drives the shared low-resolution clock.
        let lowres_driver = if self.id == 0 {
            LowresClock::update();
            let t = Timer::new(LowresClock::update);
            t.arm_periodic(LowresClock::GRANULARITY);
            Some(t)
        } else {
            None
        };

        loop {
            // cpu 0 owns signal handling: SIGINT begins a graceful exit
            // everywhere.
            if self.id == 0 && crate::runtime::consume_sigint() {
                crate::runtime::broadcast_exit(0);
            }

            while let Some(t) = self.queues.pop_urgent() {
                metrics::HIGH_PRIORITY_TASKS_RUN.increment();
                t();
            }

            let deadline = Instant::now() + self.task_quota;
            let mut ran = 0usize;
            while let Some(t) = self.queues.pop() {
                metrics::TASKS_RUN.increment();
                t();
                ran += 1;
                // Check the clock every 16 tasks to amortise Instant::now().
                if ran & 0xF == 0 && Instant::now() >= deadline {
                    break;
                }
            }

            let mut worked = ran > 0;
            worked |= self.poll_once();

            if self.stopped.get() && !self.queues.have_ready() {
                break;
            }

            if !worked && !self.queues.have_ready() && self.pollers.borrow().is_empty() {
                self.try_sleep();
            }
        }

        drop(lowres_driver);
        self.exit_code.get()
    }

    /// Invoke every poller once. Returns true if any found work.
    fn poll_once(&self) -> bool {
        metrics::POLLS.increment();
        let mut worked = false;

        // Cross-CPU queues: flush outbound batches, process incoming
        // items, reap completions.
        worked |= smp::poll_queues(self);

        // Submission batch: one syscall for everything accumulated.
        worked |= self.ring.borrow_mut().flush();

        // Completions: reap, then run outside the ring borrow.
        let completions = self.ring.borrow_mut().take_completions();
        worked |= !completions.is_empty();
        for c in completions {
            c.run();
        }

        worked |= self.expire_hires_timers();
        worked |= self.expire_lowres_timers();
        worked |= self.run_user_pollers();
        worked |= self.run_batch_flushes();
        worked
    }

    fn run_user_pollers(&self) -> bool {
        let keys: Vec<u64> = self.pollers.borrow().keys().copied().collect();
        let mut worked = false;
        for key in keys {
            let f = self.pollers.borrow_mut().remove(&key);
            if let Some(mut f) = f {
                worked |= f();
                // Reinsert unless the poller deregistered itself.
                self.pollers.borrow_mut().entry(key).or_insert(f);
            }
        }
        worked
    }

    fn run_batch_flushes(&self) -> bool {
        let flushes: Vec<_> = self.batch_flushes.borrow_mut().drain(..).collect();
        let worked = !flushes.is_empty();
        for f in flushes {
            f();
        }
        worked
    }

    /// Block until a completion, an eventfd wake, or the nearest timer
    /// deadline.
    fn try_sleep(&self) {
        if let Some(ctx) = &self.smp {
            ctx.sleeping(self.id).store(true, Ordering::Release);
        }
        self.ring.borrow_mut().arm_wake();

        // A peer may have pushed between our last poll and the sleeping
        // flag becoming visible; look once more before blocking.
        if smp::poll_queues(self) || self.queues.have_ready() {
            if let Some(ctx) = &self.smp {
                ctx.sleeping(self.id).store(false, Ordering::Release);
            }
            return;
        }

        let timeout = self
            .next_timer_deadline()
            .map(|d| d.saturating_duration_since(Instant::now()));
        metrics::SLEEPS.increment();
        let _ = self.ring.borrow_mut().wait(timeout);

        if let Some(ctx) = &self.smp {
            ctx.sleeping(self.id).store(false, Ordering::Release);
        }
    }

    /// Queue a disk operation under a priority class. The request waits
    /// in the fair queue until an in-flight slot frees, then its SQE
    /// joins the pending batch.
    pub(crate) fn submit_disk_io<T: 'static>(
        &self,
        pc: IoPriorityClass,
        len: usize,
        res: OpRes,
        build: impl FnOnce(&mut OpRes) -> io_uring::squeue::Entry + 'static,
        map: impl FnOnce(i32, OpRes) -> AsyncResult<T> + 'static,
    ) -> Future<T> {
        let mut p = Promise::new();
        let fut = p.get_future();
        self.io_queue.borrow_mut().queue_request(
            pc,
            len,
            Box::new(move || {
                let r = local();
                r.ring.borrow_mut().submit_op(
                    res,
                    build,
                    Box::new(move |ret, res| {
                        local().io_queue.borrow_mut().complete_request();
                        p.set_result(map(ret, res));
                    }),
                );
            }),
        );
        fut
    }
}

fn run_exit_chain(mut funcs: Vec<ExitFn>) -> Future<()> {
    match funcs.pop() {
        None => Future::ready(()),
        Some(f) => f().then_wrapped(move |_| run_exit_chain(funcs)),
    }
}

/// Handle for a registered user poller; dropping it deregisters the
/// poller.
pub struct PollerRegistration {
    key: u64,
}

impl Drop for PollerRegistration {
    fn drop(&mut self) {
        if let Some(r) = try_local() {
            r.pollers.borrow_mut().remove(&self.key);
        }
    }
}
