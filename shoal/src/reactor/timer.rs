//! Timers and clocks.
//!
//! Two deadline-ordered sets per reactor: a high-resolution set checked
//! against the monotonic clock, and a low-resolution set (10 ms
//! granularity) checked against an atomic now-counter that cpu 0 advances
//! from a periodic high-resolution timer and every other reactor reads
//! without locking. Within a set, timers with equal deadlines fire in
//! insertion order; a sequence number breaks ties.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::future::{Future, Promise};
use crate::metrics;
use crate::reactor;

/// The low-resolution clock: 10 ms granularity, advanced by cpu 0,
/// readable from any reactor without synchronization beyond one relaxed
/// atomic load.
pub struct LowresClock;

#[repr(align(128))]
struct AlignedCounter(AtomicU64);

static LOWRES_NOW_MS: AlignedCounter = AlignedCounter(AtomicU64::new(0));
static LOWRES_BASE: OnceLock<Instant> = OnceLock::new();

impl LowresClock {
    /// Update period of the now-counter.
    pub const GRANULARITY: Duration = Duration::from_millis(10);

    fn base() -> Instant {
        *LOWRES_BASE.get_or_init(Instant::now)
    }

    /// The current low-resolution time. Advances in 10 ms steps.
    pub fn now() -> Instant {
        Self::base() + Duration::from_millis(LOWRES_NOW_MS.0.load(Ordering::Relaxed))
    }

    /// Advance the shared counter. Called from cpu 0's periodic driver.
    pub(crate) fn update() {
        let elapsed = Self::base().elapsed().as_millis() as u64;
        LOWRES_NOW_MS.0.store(elapsed, Ordering::Relaxed);
    }
}

struct TimerInner {
    deadline: Instant,
    period: Option<Duration>,
    armed: bool,
    /// Key under which the timer currently sits in its reactor's set.
    key: Option<(Instant, u64)>,
    callback: Option<Box<dyn FnMut()>>,
    lowres: bool,
}

/// A callback attached to a deadline, optionally periodic.
///
/// A timer is in exactly one of four states: idle, armed, expired, or
/// firing. `cancel()` while armed removes it from the wheel and returns
/// true; cancelling from inside the callback is permitted and does not
/// affect the firing already in progress. A periodic timer re-arms itself
/// from the firing point before its callback runs, so the callback can
/// cancel the next occurrence.
pub struct Timer {
    inner: Rc<RefCell<TimerInner>>,
}

impl Timer {
    /// A high-resolution timer with the given callback.
    pub fn new(callback: impl FnMut() + 'static) -> Timer {
        Timer::make(callback, false)
    }

    /// A low-resolution (10 ms granularity) timer with the given callback.
    pub fn new_lowres(callback: impl FnMut() + 'static) -> Timer {
        Timer::make(callback, true)
    }

    fn make(callback: impl FnMut() + 'static, lowres: bool) -> Timer {
        Timer {
            inner: Rc::new(RefCell::new(TimerInner {
                deadline: Instant::now(),
                period: None,
                armed: false,
                key: None,
                callback: Some(Box::new(callback)),
                lowres,
            })),
        }
    }

    fn clock_now(&self) -> Instant {
        if self.inner.borrow().lowres {
            LowresClock::now()
        } else {
            Instant::now()
        }
    }

    /// Arm to fire once after `delay`.
    pub fn arm(&self, delay: Duration) {
        self.arm_at(self.clock_now() + delay);
    }

    /// Arm to fire once at `deadline`.
    pub fn arm_at(&self, deadline: Instant) {
        self.arm_state(deadline, None);
    }

    /// Arm to fire every `period`, first firing one period from now.
    pub fn arm_periodic(&self, period: Duration) {
        self.arm_state(self.clock_now() + period, Some(period));
    }

    fn arm_state(&self, deadline: Instant, period: Option<Duration>) {
        {
            let mut inner = self.inner.borrow_mut();
            assert!(!inner.armed, "timer is already armed");
            inner.deadline = deadline;
            inner.period = period;
            inner.armed = true;
        }
        reactor::local().add_timer(&self.inner);
    }

    /// Cancel (if armed) and arm again at `deadline`.
    pub fn rearm_at(&self, deadline: Instant) {
        self.cancel();
        self.arm_at(deadline);
    }

    /// Cancel (if armed) and arm again after `delay`.
    pub fn rearm(&self, delay: Duration) {
        self.cancel();
        self.arm(delay);
    }

    /// Cancel an armed timer. Returns true if it was armed.
    pub fn cancel(&self) -> bool {
        let (was_armed, key, lowres) = {
            let mut inner = self.inner.borrow_mut();
            if !inner.armed {
                return false;
            }
            inner.armed = false;
            (true, inner.key.take(), inner.lowres)
        };
        if let (Some(key), Some(r)) = (key, reactor::try_local()) {
            r.del_timer(key, lowres);
        }
        was_armed
    }

    /// Is the timer currently armed?
    pub fn armed(&self) -> bool {
        self.inner.borrow().armed
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// One reactor's deadline-ordered timer storage.
pub(crate) struct TimerSet {
    entries: BTreeMap<(Instant, u64), Rc<RefCell<TimerInner>>>,
    next_seq: u64,
}

impl TimerSet {
    pub fn new() -> TimerSet {
        TimerSet {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    fn insert(&mut self, inner: &Rc<RefCell<TimerInner>>) {
        let key = {
            let mut t = inner.borrow_mut();
            let key = (t.deadline, self.next_seq);
            t.key = Some(key);
            key
        };
        self.next_seq += 1;
        self.entries.insert(key, inner.clone());
    }

    fn remove(&mut self, key: (Instant, u64)) {
        self.entries.remove(&key);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(d, _)| *d)
    }

    /// Pop every entry due at `now`, in deadline-then-insertion order.
    fn take_expired(&mut self, now: Instant) -> Vec<Rc<RefCell<TimerInner>>> {
        let mut expired = Vec::new();
        while let Some((&key, _)) = self.entries.first_key_value() {
            if key.0 > now {
                break;
            }
            expired.push(self.entries.remove(&key).unwrap());
        }
        expired
    }
}

/// Timer plumbing on the reactor.
impl reactor::Reactor {
    pub(crate) fn add_timer(&self, inner: &Rc<RefCell<TimerInner>>) {
        let lowres = inner.borrow().lowres;
        if lowres {
            self.lowres_timers.borrow_mut().insert(inner);
        } else {
            self.timers.borrow_mut().insert(inner);
        }
    }

    pub(crate) fn del_timer(&self, key: (Instant, u64), lowres: bool) {
        if lowres {
            self.lowres_timers.borrow_mut().remove(key);
        } else {
            self.timers.borrow_mut().remove(key);
        }
    }

    /// Deadline the sleep timeout must not overshoot. Low-resolution
    /// deadlines get one granularity of slack so the wake lands after
    /// cpu 0 has advanced the now-counter past them.
    pub(crate) fn next_timer_deadline(&self) -> Option<Instant> {
        let hi = self.timers.borrow().next_deadline();
        let lo = self
            .lowres_timers
            .borrow()
            .next_deadline()
            .map(|d| d + LowresClock::GRANULARITY);
        match (hi, lo) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fire due high-resolution timers. Returns true if any fired.
    pub(crate) fn expire_hires_timers(&self) -> bool {
        let expired = self.timers.borrow_mut().take_expired(Instant::now());
        self.fire_timers(expired)
    }

    /// Fire due low-resolution timers against the shared now-counter.
    pub(crate) fn expire_lowres_timers(&self) -> bool {
        let expired = self.lowres_timers.borrow_mut().take_expired(LowresClock::now());
        self.fire_timers(expired)
    }

    fn fire_timers(&self, expired: Vec<Rc<RefCell<TimerInner>>>) -> bool {
        let fired = !expired.is_empty();
        for entry in expired {
            {
                let mut t = entry.borrow_mut();
                t.key = None;
                t.armed = false;
                // Periodic timers re-arm from the firing point, so the
                // callback observes an armed timer it may cancel.
                if let Some(period) = t.period {
                    let now = if t.lowres {
                        LowresClock::now()
                    } else {
                        Instant::now()
                    };
                    let next = t.deadline + period;
                    t.deadline = if next > now { next } else { now };
                    t.armed = true;
                }
            }
            if entry.borrow().armed {
                self.add_timer(&entry);
            }
            // Run the callback without holding the borrow; it may cancel
            // or re-arm this very timer.
            let cb = entry.borrow_mut().callback.take();
            if let Some(mut cb) = cb {
                metrics::TIMERS_FIRED.increment();
                cb();
                let mut t = entry.borrow_mut();
                if t.callback.is_none() {
                    t.callback = Some(cb);
                }
            }
        }
        fired
    }
}

/// A future that resolves after at least `delay` has elapsed.
pub fn sleep(delay: Duration) -> Future<()> {
    let mut p = Promise::new();
    let fut = p.get_future();
    let mut slot = Some(p);
    let timer = Timer::new(move || {
        if let Some(p) = slot.take() {
            p.set_value(());
        }
    });
    timer.arm(delay);
    // The timer rides the chain so it stays alive until it fires.
    fut.then_wrapped(move |r| {
        drop(timer);
        Future::from_result(r)
    })
}

/// A future that resolves at `deadline`.
pub fn sleep_until(deadline: Instant) -> Future<()> {
    let mut p = Promise::new();
    let fut = p.get_future();
    let mut slot = Some(p);
    let timer = Timer::new(move || {
        if let Some(p) = slot.take() {
            p.set_value(());
        }
    });
    timer.arm_at(deadline);
    fut.then_wrapped(move |r| {
        drop(timer);
        Future::from_result(r)
    })
}
