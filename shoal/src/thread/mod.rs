//! User-level threads.
//!
//! A [`Thread`] is a stackful coroutine pinned to its creating reactor:
//! a dedicated heap stack plus a voluntary context switch. Inside a
//! thread, [`Future::get`] becomes a blocking point — the stack parks,
//! the reactor keeps running, and resolution schedules a task that
//! switches the stack back in. Threads are cooperative; they are never
//! preempted, only suspended at `get()`/`yield` points.
//!
//! [`ThreadSchedulingGroup`] gives a set of threads a (period, quota)
//! fair share: a thread that has exhausted its group's quota for the
//! current period parks in [`maybe_yield`] until the next period begins.

mod arch;

use std::alloc::{Layout, alloc, dealloc, handle_alloc_error};
use std::cell::{Cell, RefCell, UnsafeCell};
use std::ptr::NonNull;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::error::AsyncResult;
use crate::future::{Future, Promise};
use crate::reactor;

use self::arch::{SavedRegs, init_context, switch_context};

#[derive(Clone, Copy, PartialEq, Eq)]
enum ThreadState {
    Running,
    Parked,
    Finished,
}

struct StackMem {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl StackMem {
    fn new(size: usize) -> StackMem {
        let layout = Layout::from_size_align(size, 16).expect("invalid stack layout");
        let raw = unsafe { alloc(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| handle_alloc_error(layout));
        StackMem { ptr, layout }
    }

    fn top(&self) -> *mut u8 {
        unsafe { self.ptr.as_ptr().add(self.layout.size()) }
    }
}

impl Drop for StackMem {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

pub(crate) struct ThreadContext {
    stack: StackMem,
    /// The thread's saved registers while it is parked.
    regs: UnsafeCell<SavedRegs>,
    /// The reactor side's saved registers while the thread runs.
    link: UnsafeCell<SavedRegs>,
    state: Cell<ThreadState>,
    func: RefCell<Option<Box<dyn FnOnce()>>>,
    done: RefCell<Option<Promise<()>>>,
    done_future: RefCell<Option<Future<()>>>,
    group: Option<ThreadSchedulingGroup>,
    run_start: Cell<Option<Instant>>,
}

thread_local! {
    static CURRENT_THREAD: RefCell<Option<Rc<ThreadContext>>> = const { RefCell::new(None) };
}

fn current() -> Option<Rc<ThreadContext>> {
    CURRENT_THREAD.with(|c| c.borrow().clone())
}

/// Switch from the reactor into the thread. Returns when the thread
/// parks or finishes.
fn switch_in(ctx: &Rc<ThreadContext>) {
    if ctx.state.get() == ThreadState::Finished {
        return;
    }
    ctx.state.set(ThreadState::Running);
    if let Some(g) = &ctx.group {
        g.account_start();
    }
    ctx.run_start.set(Some(Instant::now()));
    let prev = CURRENT_THREAD.with(|c| c.borrow_mut().replace(ctx.clone()));
    unsafe { switch_context(ctx.link.get(), ctx.regs.get()) };
    CURRENT_THREAD.with(|c| *c.borrow_mut() = prev);
    if let Some(g) = &ctx.group {
        g.account_stop();
    }
    if ctx.state.get() == ThreadState::Finished
        && let Some(p) = ctx.done.borrow_mut().take()
    {
        p.set_value(());
    }
}

/// Park the current thread; runs on the thread's own stack.
fn switch_out(ctx: &ThreadContext) {
    unsafe { switch_context(ctx.regs.get(), ctx.link.get()) };
}

extern "C" fn thread_main(arg: usize) {
    let ctx: &ThreadContext = unsafe { &*(arg as *const ThreadContext) };
    let func = ctx.func.borrow_mut().take().expect("thread entered twice");
    func();
    ctx.state.set(ThreadState::Finished);
    // Final departure from this stack; never returns.
    unsafe { switch_context(ctx.regs.get(), ctx.link.get()) };
    unreachable!("finished thread resumed");
}

/// Attributes for [`Thread::spawn_with`].
#[derive(Default)]
pub struct ThreadAttributes {
    pub scheduling_group: Option<ThreadSchedulingGroup>,
}

/// A stackful thread of execution pinned to the current reactor.
pub struct Thread {
    ctx: Rc<ThreadContext>,
}

impl Thread {
    /// Spawn a thread and run `func` in it immediately (up to its first
    /// blocking point).
    pub fn spawn(func: impl FnOnce() + 'static) -> Thread {
        Thread::spawn_with(ThreadAttributes::default(), func)
    }

    /// Spawn with explicit attributes.
    pub fn spawn_with(attr: ThreadAttributes, func: impl FnOnce() + 'static) -> Thread {
        let stack_size = reactor::local().thread_stack_size;
        let mut done = Promise::new();
        let done_future = done.get_future();
        let ctx = Rc::new(ThreadContext {
            stack: StackMem::new(stack_size),
            regs: UnsafeCell::new(SavedRegs::default()),
            link: UnsafeCell::new(SavedRegs::default()),
            state: Cell::new(ThreadState::Parked),
            func: RefCell::new(Some(Box::new(func))),
            done: RefCell::new(Some(done)),
            done_future: RefCell::new(Some(done_future)),
            group: attr.scheduling_group,
            run_start: Cell::new(None),
        });
        unsafe {
            init_context(
                ctx.regs.get(),
                ctx.stack.top(),
                thread_main as usize,
                Rc::as_ptr(&ctx) as usize,
            );
        }
        switch_in(&ctx);
        Thread { ctx }
    }

    /// A future that resolves when the thread function returns. May be
    /// called once.
    pub fn join(&self) -> Future<()> {
        self.ctx
            .done_future
            .borrow_mut()
            .take()
            .expect("thread already joined")
    }

    /// Voluntarily let other tasks run; the thread resumes at the next
    /// task dispatch.
    pub fn yield_now() {
        let ctx = current().expect("yield_now() outside a thread");
        let ctx2 = ctx.clone();
        reactor::local().add_task(move || switch_in(&ctx2));
        ctx.state.set(ThreadState::Parked);
        switch_out(&ctx);
    }

    /// Should the current thread yield now (its scheduling group's quota
    /// for this period is spent)?
    pub fn should_yield() -> bool {
        current()
            .and_then(|ctx| {
                ctx.group
                    .as_ref()
                    .map(|g| g.next_scheduling_point().is_some())
            })
            .unwrap_or(false)
    }

    /// Yield if the scheduling group demands it, parking until the
    /// group's next period.
    pub fn maybe_yield() {
        let Some(ctx) = current() else { return };
        let Some(point) = ctx.group.as_ref().and_then(|g| g.next_scheduling_point()) else {
            return;
        };
        let ctx2 = ctx.clone();
        reactor::sleep_until(point)
            .then(move |()| {
                switch_in(&ctx2);
                Ok(())
            })
            .ignore();
        ctx.state.set(ThreadState::Parked);
        switch_out(&ctx);
    }
}

/// Suspend the current thread until `fut` resolves. The blocking half of
/// [`Future::get`].
pub(crate) fn wait_on<T: 'static>(fut: Future<T>) -> AsyncResult<T> {
    let ctx = current().expect("Future::get() on an unresolved future outside a thread");
    let slot: Rc<RefCell<Option<AsyncResult<T>>>> = Rc::new(RefCell::new(None));
    let slot2 = slot.clone();
    let ctx2 = ctx.clone();
    fut.schedule(move |res| {
        *slot2.borrow_mut() = Some(res);
        switch_in(&ctx2);
    });
    ctx.state.set(ThreadState::Parked);
    switch_out(&ctx);
    let out = slot.borrow_mut().take();
    out.expect("thread resumed without a result")
}

/// Run `func` in a fresh thread and return its result as a future.
pub fn async_run<F, T>(func: F) -> Future<T>
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    let mut p = Promise::new();
    let fut = p.get_future();
    let th = Thread::spawn(move || {
        p.set_value(func());
    });
    th.join().ignore();
    fut
}

struct GroupState {
    period: Duration,
    quota: Duration,
    this_period_ends: Option<Instant>,
    this_run_start: Option<Instant>,
    this_period_remain: Duration,
}

/// A (period, quota) fair share over the threads attached to it.
#[derive(Clone)]
pub struct ThreadSchedulingGroup {
    state: Rc<RefCell<GroupState>>,
}

impl ThreadSchedulingGroup {
    /// A group allowed `usage` (0..1) of each `period`.
    pub fn new(period: Duration, usage: f32) -> ThreadSchedulingGroup {
        ThreadSchedulingGroup {
            state: Rc::new(RefCell::new(GroupState {
                period,
                quota: period.mul_f32(usage),
                this_period_ends: None,
                this_run_start: None,
                this_period_remain: Duration::ZERO,
            })),
        }
    }

    fn account_start(&self) {
        let now = Instant::now();
        let mut s = self.state.borrow_mut();
        if s.this_period_ends.is_none_or(|ends| now >= ends) {
            s.this_period_ends = Some(now + s.period);
            s.this_period_remain = s.quota;
        }
        s.this_run_start = Some(now);
    }

    fn account_stop(&self) {
        let mut s = self.state.borrow_mut();
        if let Some(start) = s.this_run_start.take() {
            s.this_period_remain = s.this_period_remain.saturating_sub(start.elapsed());
        }
    }

    /// When the running thread must next hand the CPU back, or `None`
    /// while quota remains.
    fn next_scheduling_point(&self) -> Option<Instant> {
        let s = self.state.borrow();
        let start = s.this_run_start?;
        if start.elapsed() >= s.this_period_remain {
            s.this_period_ends
        } else {
            None
        }
    }
}
