//! Counting semaphore over futures.
//!
//! `wait()` returns a future that resolves once the requested units are
//! available; waiters are served strictly in FIFO order, so a large
//! request parked at the head blocks smaller requests behind it from
//! overtaking. Single-core, unlocked; clones share the same counter.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::future::{Future, Promise};

struct SemState {
    count: usize,
    waiters: VecDeque<(usize, Promise<()>)>,
}

#[derive(Clone)]
pub struct Semaphore {
    state: Rc<RefCell<SemState>>,
}

impl Semaphore {
    /// A semaphore holding `count` initial units.
    pub fn new(count: usize) -> Semaphore {
        Semaphore {
            state: Rc::new(RefCell::new(SemState {
                count,
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Acquire one unit.
    pub fn wait(&self) -> Future<()> {
        self.wait_units(1)
    }

    /// Acquire `units` units, resolving once they are all available.
    pub fn wait_units(&self, units: usize) -> Future<()> {
        let mut state = self.state.borrow_mut();
        if state.waiters.is_empty() && state.count >= units {
            state.count -= units;
            return Future::ready(());
        }
        let mut p = Promise::new();
        let fut = p.get_future();
        state.waiters.push_back((units, p));
        fut
    }

    /// Acquire `units` without waiting. Returns false (and takes nothing)
    /// if they are not immediately available.
    pub fn try_wait(&self, units: usize) -> bool {
        let mut state = self.state.borrow_mut();
        if state.waiters.is_empty() && state.count >= units {
            state.count -= units;
            true
        } else {
            false
        }
    }

    /// Return one unit.
    pub fn signal(&self) {
        self.signal_units(1);
    }

    /// Return `units` units, resuming any waiters they satisfy (in FIFO
    /// order).
    pub fn signal_units(&self, units: usize) {
        let mut woken = Vec::new();
        {
            let mut state = self.state.borrow_mut();
            state.count += units;
            while let Some((need, _)) = state.waiters.front() {
                if state.count < *need {
                    break;
                }
                let (need, p) = state.waiters.pop_front().unwrap();
                state.count -= need;
                woken.push(p);
            }
        }
        // Resolve outside the borrow: completing a promise enqueues tasks
        // and must not observe the semaphore mid-update.
        for p in woken {
            p.set_value(());
        }
    }

    /// Units currently available.
    pub fn available_units(&self) -> usize {
        self.state.borrow().count
    }

    /// Number of parked waiters.
    pub fn waiters(&self) -> usize {
        self.state.borrow().waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::task_queue::pump;
    use std::cell::Cell;

    #[test]
    fn immediate_acquire() {
        pump::drain(|| {
            let sem = Semaphore::new(2);
            assert!(sem.wait().available());
            assert!(sem.wait().available());
            assert_eq!(sem.available_units(), 0);
            assert!(!sem.try_wait(1));
        });
    }

    #[test]
    fn waiter_resumes_on_signal() {
        let r = pump::run_until(|| {
            let sem = Semaphore::new(0);
            let fut = sem.wait();
            sem.signal();
            fut
        });
        assert!(r.is_ok());
    }

    #[test]
    fn fifo_order() {
        pump::drain(|| {
            let sem = Semaphore::new(0);
            let order = Rc::new(RefCell::new(Vec::new()));

            for i in 0..3 {
                let o = order.clone();
                sem.wait().schedule(move |_| o.borrow_mut().push(i));
            }
            sem.signal_units(3);

            let order2 = order.clone();
            crate::reactor::task_queue::schedule(Box::new(move || {
                assert_eq!(*order2.borrow(), vec![0, 1, 2]);
            }));
        });
    }

    #[test]
    fn large_waiter_blocks_smaller_followers() {
        pump::drain(|| {
            let sem = Semaphore::new(1);
            let first_done = Rc::new(Cell::new(false));
            let second_done = Rc::new(Cell::new(false));

            let f = first_done.clone();
            sem.wait_units(3).schedule(move |_| f.set(true));
            // One unit is available, but the 3-unit waiter is ahead.
            let s = second_done.clone();
            sem.wait_units(1).schedule(move |_| s.set(true));

            assert_eq!(sem.waiters(), 2);
            sem.signal_units(2);

            let fd = first_done.clone();
            let sd = second_done.clone();
            crate::reactor::task_queue::schedule(Box::new(move || {
                assert!(fd.get());
                assert!(sd.get());
            }));
        });
    }

    #[test]
    fn parallelism_limiter_pattern() {
        // The pattern the disk tests use: N units bounding in-flight work.
        let completed = Rc::new(Cell::new(0));
        let c = completed.clone();
        let r = pump::run_until(move || {
            let sem = Semaphore::new(10);
            crate::future::iterate::parallel_for_each(0..100, move |_| {
                let sem = sem.clone();
                let c = c.clone();
                sem.wait().then(move |()| {
                    assert!(sem.available_units() < 10);
                    c.set(c.get() + 1);
                    sem.signal();
                    Ok(())
                })
            })
        });
        assert!(r.is_ok());
        assert_eq!(completed.get(), 100);
    }
}
