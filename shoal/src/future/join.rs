//! Joining independent futures.
//!
//! `join`/`join3` resolve two or three futures concurrently and deliver
//! every child's outcome; `when_all` does the same over a vector. None of
//! them short-circuit on failure — the combined future resolves only when
//! every child has resolved.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::AsyncResult;
use crate::future::{Future, Promise};

/// Resolve both futures, preserving each outcome independently.
pub fn join<A: 'static, B: 'static>(
    a: Future<A>,
    b: Future<B>,
) -> Future<(AsyncResult<A>, AsyncResult<B>)> {
    struct State<A: 'static, B: 'static> {
        a: Option<AsyncResult<A>>,
        b: Option<AsyncResult<B>>,
        promise: Option<Promise<(AsyncResult<A>, AsyncResult<B>)>>,
    }
    impl<A: 'static, B: 'static> State<A, B> {
        fn maybe_finish(&mut self) {
            if self.a.is_some() && self.b.is_some() {
                let result = (self.a.take().unwrap(), self.b.take().unwrap());
                self.promise.take().unwrap().set_value(result);
            }
        }
    }

    let mut p = Promise::new();
    let fut = p.get_future();
    let state = Rc::new(RefCell::new(State {
        a: None,
        b: None,
        promise: Some(p),
    }));

    let s = state.clone();
    a.schedule(move |r| {
        let mut st = s.borrow_mut();
        st.a = Some(r);
        st.maybe_finish();
    });
    let s = state.clone();
    b.schedule(move |r| {
        let mut st = s.borrow_mut();
        st.b = Some(r);
        st.maybe_finish();
    });
    fut
}

/// Resolve three futures, preserving each outcome independently.
pub fn join3<A: 'static, B: 'static, C: 'static>(
    a: Future<A>,
    b: Future<B>,
    c: Future<C>,
) -> Future<(AsyncResult<A>, AsyncResult<B>, AsyncResult<C>)> {
    join(a, join(b, c)).then(|(ra, rbc)| {
        let (rb, rc) = rbc.expect("join never fails");
        Ok((ra, rb, rc))
    })
}

/// Resolve every future in the vector. The output preserves each child's
/// outcome at its input position; nothing short-circuits on failure.
pub fn when_all<T: 'static>(futures: Vec<Future<T>>) -> Future<Vec<AsyncResult<T>>> {
    if futures.is_empty() {
        return Future::ready(Vec::new());
    }

    struct State<T: 'static> {
        results: Vec<Option<AsyncResult<T>>>,
        remaining: usize,
        promise: Option<Promise<Vec<AsyncResult<T>>>>,
    }

    let n = futures.len();
    let mut p = Promise::new();
    let fut = p.get_future();
    let state = Rc::new(RefCell::new(State {
        results: (0..n).map(|_| None).collect(),
        remaining: n,
        promise: Some(p),
    }));

    for (i, f) in futures.into_iter().enumerate() {
        let s = state.clone();
        f.schedule(move |r| {
            let mut st = s.borrow_mut();
            st.results[i] = Some(r);
            st.remaining -= 1;
            if st.remaining == 0 {
                let results = st.results.drain(..).map(|o| o.unwrap()).collect();
                st.promise.take().unwrap().set_value(results);
            }
        });
    }
    fut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::future::later;
    use crate::reactor::task_queue::pump;

    #[test]
    fn join_preserves_both_outcomes() {
        let r = pump::run_until(|| {
            join(
                Future::ready(1),
                Future::<i32>::err(Error::message("expected")),
            )
        })
        .unwrap();
        assert_eq!(r.0.unwrap(), 1);
        assert!(r.1.is_err());
    }

    #[test]
    fn join_waits_for_slower_side() {
        let r = pump::run_until(|| join(later().then(|()| Ok(10)), Future::ready(20))).unwrap();
        assert_eq!(r.0.unwrap(), 10);
        assert_eq!(r.1.unwrap(), 20);
    }

    #[test]
    fn join3_outcomes() {
        let r = pump::run_until(|| {
            join3(
                Future::ready(1u8),
                later().then(|()| Ok("two")),
                Future::<u8>::err(Error::message("three")),
            )
        })
        .unwrap();
        assert_eq!(r.0.unwrap(), 1);
        assert_eq!(r.1.unwrap(), "two");
        assert!(r.2.is_err());
    }

    #[test]
    fn when_all_empty() {
        let r = pump::run_until(|| when_all(Vec::<Future<()>>::new()));
        assert!(r.unwrap().is_empty());
    }

    #[test]
    fn when_all_preserves_positions_and_outcomes() {
        let r = pump::run_until(|| {
            when_all(vec![
                Future::ready(0usize),
                later().then(|()| Ok(1)),
                Future::err(Error::message("expected")),
                later().then(|()| later()).then(|()| Ok(3)),
            ])
        })
        .unwrap();
        assert_eq!(r.len(), 4);
        assert_eq!(*r[0].as_ref().unwrap(), 0);
        assert_eq!(*r[1].as_ref().unwrap(), 1);
        assert!(r[2].is_err());
        assert_eq!(*r[3].as_ref().unwrap(), 3);
    }

    #[test]
    fn when_all_large_mixed_readiness() {
        // A large mix of ready and deferred children; every child's value
        // must land at its own index.
        let n = 100_000usize;
        let r = pump::run_until(|| {
            let futures = (0..n)
                .map(|i| {
                    if i % 2 == 0 {
                        Future::ready(i)
                    } else {
                        later().then(move |()| Ok(i))
                    }
                })
                .collect();
            when_all(futures)
        })
        .unwrap();
        assert_eq!(r.len(), n);
        assert!(
            r.iter()
                .enumerate()
                .all(|(i, res)| *res.as_ref().unwrap() == i)
        );
    }
}
