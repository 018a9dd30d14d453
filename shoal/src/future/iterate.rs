//! Looping and fan-out combinators.
//!
//! All loops here are trampolined: a body that resolves immediately is
//! consumed in a plain `loop`, and a pending body re-enters through the
//! task queue, so stack depth stays constant regardless of iteration
//! count. A long run of immediately-ready iterations yields to the
//! reactor every `LOOP_YIELD_PERIOD` steps so other tasks are not starved.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Error;
use crate::future::{Future, Futurize, Promise};
use crate::reactor::task_queue;

/// Loop control for [`repeat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopIteration {
    Yes,
    No,
}

/// Ready-path iterations between forced yields through the task queue.
const LOOP_YIELD_PERIOD: u32 = 256;

/// Invoke `body` until it resolves to [`StopIteration::Yes`]. The body's
/// first error stops the loop and fails the returned future.
pub fn repeat<F, R>(body: F) -> Future<()>
where
    F: FnMut() -> R + 'static,
    R: Futurize<Output = StopIteration>,
{
    let mut p = Promise::new();
    let fut = p.get_future();
    repeat_step(body, p);
    fut
}

fn repeat_step<F, R>(mut body: F, p: Promise<()>)
where
    F: FnMut() -> R + 'static,
    R: Futurize<Output = StopIteration>,
{
    let mut budget = LOOP_YIELD_PERIOD;
    loop {
        if budget == 0 {
            task_queue::schedule(Box::new(move || repeat_step(body, p)));
            return;
        }
        budget -= 1;
        match body().futurize().try_into_result() {
            Ok(Ok(StopIteration::Yes)) => {
                p.set_value(());
                return;
            }
            Ok(Ok(StopIteration::No)) => continue,
            Ok(Err(e)) => {
                p.set_error(e);
                return;
            }
            Err(pending) => {
                pending.schedule(move |r| match r {
                    Ok(StopIteration::Yes) => p.set_value(()),
                    Ok(StopIteration::No) => repeat_step(body, p),
                    Err(e) => p.set_error(e),
                });
                return;
            }
        }
    }
}

/// Invoke `body` until it resolves to `Some(value)`; the value resolves
/// the returned future.
pub fn repeat_until_value<F, R, V>(body: F) -> Future<V>
where
    F: FnMut() -> R + 'static,
    R: Futurize<Output = Option<V>>,
    V: 'static,
{
    let mut p = Promise::new();
    let fut = p.get_future();
    repeat_until_value_step(body, p);
    fut
}

fn repeat_until_value_step<F, R, V>(mut body: F, p: Promise<V>)
where
    F: FnMut() -> R + 'static,
    R: Futurize<Output = Option<V>>,
    V: 'static,
{
    let mut budget = LOOP_YIELD_PERIOD;
    loop {
        if budget == 0 {
            task_queue::schedule(Box::new(move || repeat_until_value_step(body, p)));
            return;
        }
        budget -= 1;
        match body().futurize().try_into_result() {
            Ok(Ok(Some(v))) => {
                p.set_value(v);
                return;
            }
            Ok(Ok(None)) => continue,
            Ok(Err(e)) => {
                p.set_error(e);
                return;
            }
            Err(pending) => {
                pending.schedule(move |r| match r {
                    Ok(Some(v)) => p.set_value(v),
                    Ok(None) => repeat_until_value_step(body, p),
                    Err(e) => p.set_error(e),
                });
                return;
            }
        }
    }
}

/// Invoke `body` until `stop()` returns true. `stop` is checked before
/// each iteration.
pub fn do_until<S, F, R>(mut stop: S, mut body: F) -> Future<()>
where
    S: FnMut() -> bool + 'static,
    F: FnMut() -> R + 'static,
    R: Futurize<Output = ()>,
{
    repeat(move || {
        if stop() {
            return Future::ready(StopIteration::Yes);
        }
        body().futurize().then(|()| Ok(StopIteration::No))
    })
}

/// Run an async body over every element, all in flight at once. The
/// returned future resolves only after *every* body future has resolved,
/// even if one fails early; the first error observed is surfaced.
pub fn parallel_for_each<I, F, R>(iter: I, mut body: F) -> Future<()>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> R + 'static,
    R: Futurize<Output = ()>,
{
    struct State {
        remaining: usize,
        first_error: Option<Error>,
        promise: Option<Promise<()>>,
    }
    impl State {
        fn complete_one(&mut self) {
            self.remaining -= 1;
            if self.remaining == 0 {
                let p = self.promise.take().unwrap();
                match self.first_error.take() {
                    Some(e) => p.set_error(e),
                    None => p.set_value(()),
                }
            }
        }
    }

    let mut p = Promise::new();
    let fut = p.get_future();
    let state = Rc::new(RefCell::new(State {
        remaining: 1, // driver token, released after the spawn loop
        first_error: None,
        promise: Some(p),
    }));

    for item in iter {
        state.borrow_mut().remaining += 1;
        let s = state.clone();
        body(item).futurize().schedule(move |r| {
            let mut st = s.borrow_mut();
            if let Err(e) = r
                && st.first_error.is_none()
            {
                st.first_error = Some(e);
            }
            st.complete_one();
        });
    }
    state.borrow_mut().complete_one();
    fut
}

/// Map every element through an async mapper, then fold the results with
/// `fold` starting from `initial`. Reduction order matches input order;
/// the first failed mapper fails the result (after all mappers resolved).
pub fn map_reduce<I, M, R, A, F>(iter: I, mut mapper: M, initial: A, mut fold: F) -> Future<A>
where
    I: IntoIterator,
    M: FnMut(I::Item) -> R,
    R: Futurize,
    A: 'static,
    F: FnMut(A, R::Output) -> A + 'static,
{
    let futures: Vec<Future<R::Output>> = iter.into_iter().map(|x| mapper(x).futurize()).collect();
    crate::future::join::when_all(futures).then(move |results| {
        let mut acc = initial;
        for r in results {
            match r {
                Ok(v) => acc = fold(acc, v),
                Err(e) => return Err(e),
            }
        }
        Ok(acc)
    })
}
