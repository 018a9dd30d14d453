//! Per-reactor task FIFOs.
//!
//! Two queues: normal tasks, scheduled by future resolution, and
//! high-priority tasks, drained completely at the top of every loop
//! iteration. Both are single-threaded and unlocked; the thread-local
//! handle is installed when a reactor takes ownership of its OS thread.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

pub(crate) type Task = Box<dyn FnOnce()>;

pub(crate) struct TaskQueues {
    normal: RefCell<VecDeque<Task>>,
    urgent: RefCell<VecDeque<Task>>,
}

thread_local! {
    static QUEUES: RefCell<Option<Rc<TaskQueues>>> = const { RefCell::new(None) };
}

impl TaskQueues {
    pub(crate) fn new() -> Rc<TaskQueues> {
        Rc::new(TaskQueues {
            normal: RefCell::new(VecDeque::with_capacity(64)),
            urgent: RefCell::new(VecDeque::new()),
        })
    }

    pub(crate) fn push(&self, t: Task) {
        self.normal.borrow_mut().push_back(t);
    }

    pub(crate) fn push_urgent(&self, t: Task) {
        self.urgent.borrow_mut().push_back(t);
    }

    pub(crate) fn pop(&self) -> Option<Task> {
        self.normal.borrow_mut().pop_front()
    }

    pub(crate) fn pop_urgent(&self) -> Option<Task> {
        self.urgent.borrow_mut().pop_front()
    }

    /// Any task ready on either queue?
    pub(crate) fn have_ready(&self) -> bool {
        !self.normal.borrow().is_empty() || !self.urgent.borrow().is_empty()
    }
}

/// Install the queues for the current thread. Returns the previous handle
/// so nested installs (tests) can restore it.
pub(crate) fn install(q: Rc<TaskQueues>) -> Option<Rc<TaskQueues>> {
    QUEUES.with(|cell| cell.borrow_mut().replace(q))
}

pub(crate) fn uninstall() -> Option<Rc<TaskQueues>> {
    QUEUES.with(|cell| cell.borrow_mut().take())
}

#[cfg(test)]
pub(crate) fn restore(q: Option<Rc<TaskQueues>>) {
    QUEUES.with(|cell| *cell.borrow_mut() = q);
}

/// Enqueue a normal-priority task on the current thread's reactor.
///
/// During teardown (no queues installed) the task is dropped: a
/// continuation that can no longer run has nothing left to notify.
pub(crate) fn schedule(t: Task) {
    QUEUES.with(|cell| {
        if let Some(q) = cell.borrow().as_ref() {
            q.push(t);
        }
    });
}

/// Enqueue a high-priority task on the current thread's reactor.
pub(crate) fn schedule_urgent(t: Task) {
    QUEUES.with(|cell| {
        if let Some(q) = cell.borrow().as_ref() {
            q.push_urgent(t);
        }
    });
}

/// Test-only task pump: drives the queues without a reactor so the
/// future laws can be exercised in plain unit tests.
#[cfg(test)]
pub(crate) mod pump {
    use super::*;
    use crate::error::AsyncResult;
    use crate::future::Future;

    /// Install fresh queues, build the future, and run tasks until it
    /// resolves. Panics if the queues drain while the future is still
    /// pending (a lost continuation).
    pub(crate) fn run_until<T: 'static>(build: impl FnOnce() -> Future<T>) -> AsyncResult<T> {
        let queues = TaskQueues::new();
        let prev = install(queues.clone());
        let fut = build();
        loop {
            if let Some(t) = queues.pop_urgent() {
                t();
                continue;
            }
            if let Some(t) = queues.pop() {
                t();
                continue;
            }
            break;
        }
        let result = match fut.try_into_result() {
            Ok(r) => r,
            Err(_) => panic!("task queues drained but future still pending"),
        };
        restore(prev);
        result
    }

    /// Install fresh queues, run `f`, then drain every task.
    pub(crate) fn drain(f: impl FnOnce()) {
        let queues = TaskQueues::new();
        let prev = install(queues.clone());
        f();
        loop {
            if let Some(t) = queues.pop_urgent() {
                t();
            } else if let Some(t) = queues.pop() {
                t();
            } else {
                break;
            }
        }
        restore(prev);
    }
}
