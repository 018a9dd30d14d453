//! Fan-out over a single resolution.
//!
//! A [`SharedFuture`] is the non-consuming variant of a future: every
//! [`get_future`](SharedFuture::get_future) call returns an independent
//! consumable future, and all of them resolve with the same outcome once
//! the underlying future does. This is the only fan-out primitive; the
//! value type must be `Clone` so each waiter gets its own copy.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::AsyncResult;
use crate::future::{Future, Promise};

enum SharedState<T: 'static> {
    Waiting(Vec<Promise<T>>),
    Done(AsyncResult<T>),
}

pub struct SharedFuture<T: Clone + 'static> {
    state: Rc<RefCell<SharedState<T>>>,
}

impl<T: Clone + 'static> SharedFuture<T> {
    /// Wrap a future for fan-out. The underlying future is consumed.
    pub fn new(fut: Future<T>) -> SharedFuture<T> {
        let state = Rc::new(RefCell::new(SharedState::Waiting(Vec::new())));
        let s = state.clone();
        fut.schedule(move |result| {
            let waiters = match std::mem::replace(
                &mut *s.borrow_mut(),
                SharedState::Done(result.clone()),
            ) {
                SharedState::Waiting(w) => w,
                SharedState::Done(_) => unreachable!("shared future resolved twice"),
            };
            for p in waiters {
                p.set_result(result.clone());
            }
        });
        SharedFuture { state }
    }

    /// An independent future that resolves with the shared outcome.
    /// May be called any number of times, before or after resolution.
    pub fn get_future(&self) -> Future<T> {
        match &mut *self.state.borrow_mut() {
            SharedState::Done(r) => Future::from_result(r.clone()),
            SharedState::Waiting(waiters) => {
                let mut p = Promise::new();
                let fut = p.get_future();
                waiters.push(p);
                fut
            }
        }
    }

    /// Has the underlying future resolved?
    pub fn available(&self) -> bool {
        matches!(*self.state.borrow(), SharedState::Done(_))
    }
}

impl<T: Clone + 'static> Clone for SharedFuture<T> {
    fn clone(&self) -> Self {
        SharedFuture {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + 'static> From<Future<T>> for SharedFuture<T> {
    fn from(fut: Future<T>) -> Self {
        SharedFuture::new(fut)
    }
}
