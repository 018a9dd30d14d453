//! The future/promise primitive.
//!
//! A [`Future`] is a single-consumer deferred value with three observable
//! states: not ready, ready, and failed. A [`Promise`] is the producing
//! half; resolving it hands the result to whatever continuation the
//! consumer attached. Continuations always run as tasks on the current
//! reactor — attaching to an already-resolved future enqueues the
//! continuation rather than calling it inline, which keeps stack depth
//! bounded no matter how long the chain is.
//!
//! Errors travel as [`Error`](crate::Error) values inside the chain, not
//! as panics: a continuation "throws" by returning `Err`, and the failure
//! propagates to every downstream future until something observes it.
//! Failed futures dropped without observation are counted as ignored
//! failures.

pub(crate) mod iterate;
pub(crate) mod join;
pub(crate) mod shared;

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{AsyncResult, Error};
use crate::metrics;
use crate::reactor::task_queue;

type Continuation<T> = Box<dyn FnOnce(AsyncResult<T>)>;

enum FutureState<T> {
    /// Not yet resolved. `continuation` is filled once the consumer chains.
    NotReady { continuation: Option<Continuation<T>> },
    /// Resolved, result not yet claimed.
    Resolved(AsyncResult<T>),
    /// Result claimed (or handed to a continuation).
    Consumed,
}

/// The shared cell between a promise and its future. Lives on one core
/// only; the reference count is non-atomic by design.
struct StateCell<T: 'static>(RefCell<FutureState<T>>);

impl<T: 'static> StateCell<T> {
    fn new() -> Rc<StateCell<T>> {
        Rc::new(StateCell(RefCell::new(FutureState::NotReady {
            continuation: None,
        })))
    }
}

impl<T: 'static> Drop for StateCell<T> {
    fn drop(&mut self) {
        if let FutureState::Resolved(Err(_)) = self.0.get_mut() {
            metrics::IGNORED_FAILURES.increment();
        }
    }
}

/// Hand the result to the cell: run the attached continuation as a task,
/// or store the result for a later consumer.
fn deliver<T: 'static>(cell: &StateCell<T>, result: AsyncResult<T>) {
    let mut state = cell.0.borrow_mut();
    match std::mem::replace(&mut *state, FutureState::Consumed) {
        FutureState::NotReady {
            continuation: Some(f),
        } => {
            drop(state);
            task_queue::schedule(Box::new(move || f(result)));
        }
        FutureState::NotReady { continuation: None } => {
            *state = FutureState::Resolved(result);
        }
        FutureState::Resolved(_) | FutureState::Consumed => {
            unreachable!("promise resolved twice");
        }
    }
}

/// The producing half of a future.
///
/// Exactly one future is paired with a promise via [`get_future`]
/// (`Promise::get_future`). Dropping a promise without fulfilling it fails
/// the paired future with [`Error::BrokenPromise`].
pub struct Promise<T: 'static> {
    cell: Option<Rc<StateCell<T>>>,
    future_taken: bool,
}

impl<T: 'static> Promise<T> {
    pub fn new() -> Promise<T> {
        Promise {
            cell: Some(StateCell::new()),
            future_taken: false,
        }
    }

    /// The paired future. May be called at most once.
    pub fn get_future(&mut self) -> Future<T> {
        assert!(!self.future_taken, "future already taken from this promise");
        self.future_taken = true;
        Future {
            cell: self.cell.clone().expect("promise already fulfilled"),
        }
    }

    /// Fulfill the future with a value.
    pub fn set_value(mut self, value: T) {
        deliver(&self.cell.take().unwrap(), Ok(value));
    }

    /// Fail the future.
    pub fn set_error(mut self, err: Error) {
        deliver(&self.cell.take().unwrap(), Err(err));
    }

    /// Resolve the future with either outcome.
    pub fn set_result(mut self, result: AsyncResult<T>) {
        deliver(&self.cell.take().unwrap(), result);
    }
}

impl<T: 'static> Default for Promise<T> {
    fn default() -> Self {
        Promise::new()
    }
}

impl<T: 'static> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            metrics::BROKEN_PROMISES.increment();
            deliver(&cell, Err(Error::BrokenPromise));
        }
    }
}

/// A single-consumer deferred value.
///
/// Chaining (`then`, `then_wrapped`, `finally`) consumes the future and
/// yields a new one for the continuation's result. Consuming a future a
/// second time is a programming error and panics.
pub struct Future<T: 'static> {
    cell: Rc<StateCell<T>>,
}

impl<T: 'static> Future<T> {
    /// A future that is already resolved with `value`.
    pub fn ready(value: T) -> Future<T> {
        Future::from_result(Ok(value))
    }

    /// A future that has already failed with `err`.
    pub fn err(err: Error) -> Future<T> {
        Future::from_result(Err(err))
    }

    pub fn from_result(result: AsyncResult<T>) -> Future<T> {
        Future {
            cell: Rc::new(StateCell(RefCell::new(FutureState::Resolved(result)))),
        }
    }

    /// Is the future resolved (with either outcome)?
    pub fn available(&self) -> bool {
        matches!(*self.cell.0.borrow(), FutureState::Resolved(_))
    }

    /// Is the future resolved with an error?
    pub fn failed(&self) -> bool {
        matches!(*self.cell.0.borrow(), FutureState::Resolved(Err(_)))
    }

    /// Claim the result of a resolved future, or get the future back.
    pub(crate) fn try_into_result(self) -> Result<AsyncResult<T>, Future<T>> {
        if self.available() {
            Ok(self.take_result())
        } else {
            Err(self)
        }
    }

    fn take_result(&self) -> AsyncResult<T> {
        let mut state = self.cell.0.borrow_mut();
        match std::mem::replace(&mut *state, FutureState::Consumed) {
            FutureState::Resolved(r) => r,
            other => {
                *state = other;
                panic!("future is not ready");
            }
        }
    }

    /// Attach the continuation that will receive the result. If the future
    /// is already resolved the continuation is enqueued as a task, never
    /// called inline.
    pub(crate) fn schedule(self, f: impl FnOnce(AsyncResult<T>) + 'static) {
        let mut state = self.cell.0.borrow_mut();
        match std::mem::replace(&mut *state, FutureState::Consumed) {
            FutureState::Resolved(r) => {
                drop(state);
                task_queue::schedule(Box::new(move || f(r)));
            }
            FutureState::NotReady { continuation: None } => {
                *state = FutureState::NotReady {
                    continuation: Some(Box::new(f)),
                };
            }
            FutureState::NotReady {
                continuation: Some(_),
            }
            | FutureState::Consumed => {
                panic!("continuation attached to a consumed future");
            }
        }
    }

    /// Chain a continuation on success. On failure the error propagates to
    /// the returned future without invoking `f`. The continuation may
    /// return a plain `Result` (a ready future) or another `Future`; the
    /// result type flattens either way.
    pub fn then<F, R>(self, f: F) -> Future<R::Output>
    where
        F: FnOnce(T) -> R + 'static,
        R: Futurize,
    {
        let mut p = Promise::new();
        let fut = p.get_future();
        self.schedule(move |res| match res {
            Ok(v) => f(v).futurize().forward_to(p),
            Err(e) => p.set_error(e),
        });
        fut
    }

    /// Chain a continuation that receives the outcome itself — invoked on
    /// both success and failure.
    pub fn then_wrapped<F, R>(self, f: F) -> Future<R::Output>
    where
        F: FnOnce(AsyncResult<T>) -> R + 'static,
        R: Futurize,
    {
        let mut p = Promise::new();
        let fut = p.get_future();
        self.schedule(move |res| f(res).futurize().forward_to(p));
        fut
    }

    /// Run `f` regardless of outcome, then pass the upstream result
    /// through. If `f` itself fails, its error replaces the upstream
    /// result.
    pub fn finally<F, R>(self, f: F) -> Future<T>
    where
        F: FnOnce() -> R + 'static,
        R: Futurize<Output = ()>,
    {
        let mut p = Promise::new();
        let fut = p.get_future();
        self.schedule(move |res| {
            f().futurize().schedule(move |fin| match fin {
                Ok(()) => p.set_result(res),
                Err(e) => p.set_error(e),
            });
        });
        fut
    }

    /// Wire this future's resolution into another promise of the same
    /// type. An already-resolved future resolves the promise immediately.
    pub fn forward_to(self, promise: Promise<T>) {
        match self.try_into_result() {
            Ok(r) => promise.set_result(r),
            Err(fut) => fut.schedule(move |res| promise.set_result(res)),
        }
    }

    /// Consume a resolved future, or — from a user-level thread — suspend
    /// until it resolves.
    ///
    /// # Panics
    ///
    /// Panics when called on an unresolved future outside a
    /// [`Thread`](crate::thread::Thread) context.
    pub fn get(self) -> AsyncResult<T> {
        match self.try_into_result() {
            Ok(r) => r,
            Err(fut) => crate::thread::wait_on(fut),
        }
    }

    /// Observe and discard the eventual result, suppressing the
    /// ignored-failure diagnostic.
    pub fn ignore(self) {
        match self.try_into_result() {
            Ok(_) => {}
            Err(fut) => fut.schedule(|_| {}),
        }
    }

    /// Discard the success value, keeping the outcome.
    pub fn discard_result(self) -> Future<()> {
        self.then(|_| Ok(()))
    }
}

/// Conversion of continuation return values into futures.
///
/// Implemented for `Future<T>` (identity) and for `Result<T, Error>`
/// (an already-resolved future), giving `then`-style continuations the
/// uniform value-or-future return contract.
pub trait Futurize {
    type Output: 'static;
    fn futurize(self) -> Future<Self::Output>;
}

impl<T: 'static> Futurize for Future<T> {
    type Output = T;
    fn futurize(self) -> Future<T> {
        self
    }
}

impl<T: 'static> Futurize for Result<T, Error> {
    type Output = T;
    fn futurize(self) -> Future<T> {
        Future::from_result(self)
    }
}

/// Invoke `f` with uniform result handling: a returned value or error
/// becomes a resolved future, a returned future flows through as-is.
pub fn apply<F, R>(f: F) -> Future<R::Output>
where
    F: FnOnce() -> R,
    R: Futurize,
{
    f().futurize()
}

/// A future that resolves at the next task dispatch — a cooperative
/// yield point.
pub fn later() -> Future<()> {
    let mut p = Promise::new();
    let fut = p.get_future();
    task_queue::schedule(Box::new(move || p.set_value(())));
    fut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::task_queue::pump;
    use std::cell::Cell;

    fn ready_unit() -> Future<()> {
        Future::ready(())
    }

    #[test]
    fn bare_value_can_be_returned_from_continuation() {
        let r = pump::run_until(|| {
            ready_unit()
                .then(|()| Ok(3))
                .then(|x: i32| Ok::<_, Error>(x + 1))
        });
        assert_eq!(r.unwrap(), 4);
    }

    #[test]
    fn error_skips_then_continuations() {
        let ran = Rc::new(Cell::new(false));
        let observed = ran.clone();
        let r = pump::run_until(move || {
            Future::<i32>::err(Error::message("boom")).then(move |_| {
                observed.set(true);
                Ok(0)
            })
        });
        assert!(r.is_err());
        assert!(!ran.get());
    }

    #[test]
    fn then_wrapped_sees_failure_and_recovers() {
        let r = pump::run_until(|| {
            Future::<i32>::err(Error::message("boom")).then_wrapped(|res| match res {
                Ok(v) => Ok(v),
                Err(_) => Ok(42),
            })
        });
        assert_eq!(r.unwrap(), 42);
    }

    #[test]
    fn error_returned_by_then_wrapped_fails_downstream() {
        let r = pump::run_until(|| {
            ready_unit()
                .then_wrapped(|_res| Err::<(), _>(Error::message("oops")))
                .then(|()| Ok(1))
        });
        assert!(r.is_err());
    }

    #[test]
    fn finally_is_called_on_success_and_failure() {
        let finally1 = Rc::new(Cell::new(false));
        let finally2 = Rc::new(Cell::new(false));
        let f1 = finally1.clone();
        let f2 = finally2.clone();
        let r = pump::run_until(move || {
            ready_unit()
                .then(|()| Ok(()))
                .finally(move || {
                    f1.set(true);
                    Ok(())
                })
                .then(|()| Err::<(), _>(Error::message("fail")))
                .finally(move || {
                    f2.set(true);
                    Ok(())
                })
        });
        assert!(finally1.get());
        assert!(finally2.get());
        assert!(r.is_err());
    }

    #[test]
    fn finally_is_called_when_upstream_resolves_later() {
        let called = Rc::new(Cell::new(false));
        let c = called.clone();
        let r = pump::run_until(move || {
            let mut p = Promise::<()>::new();
            let fut = p.get_future().finally(move || {
                c.set(true);
                Ok(())
            });
            // Resolve after the continuation is armed.
            task_queue::schedule(Box::new(move || p.set_value(())));
            fut
        });
        assert!(r.is_ok());
        assert!(called.get());
    }

    #[test]
    fn error_from_finally_replaces_the_result() {
        let downstream_ran = Rc::new(Cell::new(false));
        let d = downstream_ran.clone();
        let r = pump::run_until(move || {
            ready_unit()
                .finally(|| Err::<(), _>(Error::message("cleanup failed")))
                .then(move |()| {
                    d.set(true);
                    Ok(())
                })
        });
        assert!(r.is_err());
        assert!(!downstream_ran.get());
    }

    #[test]
    fn failing_intermediate_promise_fails_the_chain() {
        let r = pump::run_until(|| {
            let mut p1 = Promise::<()>::new();
            let mut p2 = Promise::<()>::new();
            let inner = p2.get_future();
            let fut = p1.get_future().then(move |()| inner).then(|()| Ok(1));
            p1.set_value(());
            p2.set_error(Error::message("boom"));
            fut
        });
        assert!(r.is_err());
    }

    // ── forward_to ────────────────────────────────────────────────

    #[test]
    fn forward_not_ready_to_unarmed() {
        let r = pump::run_until(|| {
            let mut p1 = Promise::<()>::new();
            let mut p2 = Promise::<()>::new();
            let f1 = p1.get_future();
            let f2 = p2.get_future();
            f1.forward_to(p2);
            assert!(!f2.available());
            let chained = f2.then(|()| Ok(1));
            p1.set_value(());
            chained
        });
        assert_eq!(r.unwrap(), 1);
    }

    #[test]
    fn forward_not_ready_to_armed() {
        let r = pump::run_until(|| {
            let mut p1 = Promise::<()>::new();
            let mut p2 = Promise::<()>::new();
            let f1 = p1.get_future();
            let f2 = p2.get_future();
            let chained = f2.then(|()| Ok(2));
            f1.forward_to(p2);
            p1.set_value(());
            chained
        });
        assert_eq!(r.unwrap(), 2);
    }

    #[test]
    fn forward_ready_resolves_target_immediately() {
        pump::drain(|| {
            let mut p2 = Promise::<()>::new();
            let f2 = p2.get_future();
            Future::ready(()).forward_to(p2);
            // No task dispatch needed: the target is resolved inline.
            assert!(f2.available());
            assert!(!f2.failed());
            f2.ignore();
        });
    }

    #[test]
    fn forward_to_dead_promise_is_harmless() {
        pump::drain(|| {
            let mut p1 = Promise::<()>::new();
            {
                let p2 = Promise::<()>::new();
                // p2's future is never taken; its result is simply dropped.
                p1.get_future().forward_to(p2);
            }
            p1.set_value(());
        });
    }

    // ── scheduling discipline ─────────────────────────────────────

    #[test]
    fn continuation_on_ready_future_is_not_inline() {
        pump::drain(|| {
            let observed = Rc::new(Cell::new(false));
            let o = observed.clone();
            Future::ready(())
                .then(move |()| {
                    assert!(o.get(), "continuation ran inline at attach time");
                    Ok(())
                })
                .ignore();
            // Runs before the pump dispatches the continuation.
            observed.set(true);
        });
    }

    #[test]
    fn observer_task_enqueued_before_then_runs_first() {
        pump::drain(|| {
            let order = Rc::new(RefCell::new(Vec::new()));
            let o1 = order.clone();
            task_queue::schedule(Box::new(move || o1.borrow_mut().push("observer")));
            let o2 = order.clone();
            Future::ready(())
                .then(move |()| {
                    o2.borrow_mut().push("continuation");
                    Ok(())
                })
                .ignore();
            let order2 = order.clone();
            task_queue::schedule(Box::new(move || {
                assert_eq!(*order2.borrow(), vec!["observer", "continuation"]);
            }));
        });
    }

    #[test]
    fn high_priority_task_runs_before_ready_continuations() {
        pump::drain(|| {
            let flag = Rc::new(Cell::new(false));
            let f = flag.clone();
            task_queue::schedule_urgent(Box::new(move || f.set(true)));
            let f2 = flag.clone();
            Future::ready(())
                .then(move |()| {
                    assert!(f2.get());
                    Ok(())
                })
                .ignore();
        });
    }

    #[test]
    fn million_link_chain_resolves_without_stack_growth() {
        let n = 1_000_000u32;
        let counted = pump::run_until(|| {
            let mut p = Promise::<u32>::new();
            let mut fut = p.get_future();
            for _ in 0..n {
                fut = fut.then(|x| Ok(x + 1));
            }
            p.set_value(0);
            fut
        });
        assert_eq!(counted.unwrap(), n);
    }

    // ── promise lifecycle ─────────────────────────────────────────

    #[test]
    fn dropped_promise_breaks_the_future() {
        let r = pump::run_until(|| {
            let mut p = Promise::<i32>::new();
            let fut = p.get_future();
            drop(p);
            fut.then_wrapped(|res| res)
        });
        assert!(matches!(r, Err(Error::BrokenPromise)));
    }

    #[test]
    #[should_panic(expected = "future already taken")]
    fn double_get_future_panics() {
        let mut p = Promise::<()>::new();
        let _a = p.get_future();
        let _b = p.get_future();
    }

    #[test]
    fn ignored_failure_is_counted() {
        let before = metrics::IGNORED_FAILURES.value();
        pump::drain(|| {
            let f: Future<()> = Future::err(Error::message("dropped"));
            drop(f);
        });
        assert!(metrics::IGNORED_FAILURES.value() > before);
    }

    // ── apply / later ─────────────────────────────────────────────

    #[test]
    fn apply_value_ok() {
        let r = pump::run_until(|| apply(|| Ok::<_, Error>(2 * 2)));
        assert_eq!(r.unwrap(), 4);
    }

    #[test]
    fn apply_error() {
        let r = pump::run_until(|| apply(|| Err::<i32, _>(Error::message("expected"))));
        assert!(r.is_err());
    }

    #[test]
    fn apply_future_flows_through() {
        let r = pump::run_until(|| apply(|| Future::ready(7)).then(|x| Ok(x * 100)));
        assert_eq!(r.unwrap(), 700);
    }

    #[test]
    fn later_resolves_after_queued_tasks() {
        let r = pump::run_until(|| later().then(|()| Ok(1)));
        assert_eq!(r.unwrap(), 1);
    }
}
