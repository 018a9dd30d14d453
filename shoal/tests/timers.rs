//! Timer semantics: sleep floors, periodic cadence, cancellation, and
//! the shared low-resolution clock.

mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use shoal::{Future, LowresClock, Promise, Timer, sleep};

#[test]
fn hello_sleep() {
    let start = Instant::now();
    common::run(1, || {
        sleep(Duration::from_secs(1)).then(|()| {
            println!("Hello World");
            Ok(())
        })
    });
    assert!(start.elapsed() >= Duration::from_secs(1));
}

#[test]
fn sleep_never_resolves_early() {
    common::run(1, || {
        let start = Instant::now();
        sleep(Duration::from_millis(100)).then(move |()| {
            assert!(start.elapsed() >= Duration::from_millis(100));
            Ok(())
        })
    });
}

#[test]
fn periodic_firings_follow_the_schedule() {
    common::run(1, || {
        let period = Duration::from_millis(50);
        let firings: Rc<RefCell<Vec<Instant>>> = Rc::new(RefCell::new(Vec::new()));
        let mut done = Promise::<()>::new();
        let done_fut = done.get_future();
        let done = Rc::new(RefCell::new(Some(done)));

        let armed_at = Instant::now();
        let f = firings.clone();
        let timer: Rc<RefCell<Option<Timer>>> = Rc::new(RefCell::new(None));
        let t2 = timer.clone();
        let d2 = done.clone();
        let t = Timer::new(move || {
            f.borrow_mut().push(Instant::now());
            if f.borrow().len() == 4 {
                // Cancelling from inside the callback is allowed and
                // stops the re-armed next occurrence.
                t2.borrow().as_ref().unwrap().cancel();
                if let Some(p) = d2.borrow_mut().take() {
                    p.set_value(());
                }
            }
        });
        t.arm_periodic(period);
        *timer.borrow_mut() = Some(t);

        let timer_keep = timer.clone();
        done_fut.then(move |()| {
            let firings = firings.borrow();
            assert_eq!(firings.len(), 4);
            for (k, &t) in firings.iter().enumerate() {
                let scheduled = armed_at + period * (k as u32 + 1);
                assert!(t >= scheduled, "firing {k} came early");
                assert!(
                    t < scheduled + Duration::from_secs(2),
                    "firing {k} unreasonably late"
                );
            }
            // Monotonic by construction, but check anyway.
            assert!(firings.windows(2).all(|w| w[0] <= w[1]));
            drop(timer_keep);
            Ok(())
        })
    });
}

#[test]
fn cancel_semantics() {
    common::run(1, || {
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        let t = Timer::new(move || f.set(true));

        assert!(!t.cancel(), "cancel on an idle timer");
        t.arm(Duration::from_millis(20));
        assert!(t.armed());
        assert!(t.cancel(), "cancel on an armed timer");
        assert!(!t.armed());

        // Give the deadline a chance to pass; the callback must not run.
        sleep(Duration::from_millis(60)).then(move |()| {
            assert!(!fired.get(), "cancelled timer fired");
            drop(t);
            Ok(())
        })
    });
}

#[test]
fn rearm_replaces_deadline() {
    common::run(1, || {
        let fired_at = Rc::new(RefCell::new(None));
        let f = fired_at.clone();
        let t = Timer::new(move || *f.borrow_mut() = Some(Instant::now()));
        let start = Instant::now();
        t.arm(Duration::from_millis(10));
        t.rearm(Duration::from_millis(80));

        sleep(Duration::from_millis(200)).then(move |()| {
            let at = fired_at.borrow().expect("timer never fired");
            assert!(at >= start + Duration::from_millis(80));
            drop(t);
            Ok(())
        })
    });
}

#[test]
fn timers_with_same_deadline_fire_in_insertion_order() {
    common::run(1, || {
        let order = Rc::new(RefCell::new(Vec::new()));
        let deadline = Instant::now() + Duration::from_millis(30);
        let timers: Vec<Timer> = (0..5)
            .map(|i| {
                let o = order.clone();
                let t = Timer::new(move || o.borrow_mut().push(i));
                t.arm_at(deadline);
                t
            })
            .collect();
        sleep(Duration::from_millis(120)).then(move |()| {
            assert_eq!(*order.borrow(), vec![0, 1, 2, 3, 4]);
            drop(timers);
            Ok(())
        })
    });
}

#[test]
fn lowres_clock_advances_and_lowres_timers_fire() {
    common::run(1, || {
        let t0 = LowresClock::now();
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        let t = Timer::new_lowres(move || f.set(true));
        t.arm(Duration::from_millis(50));
        sleep(Duration::from_millis(300)).then(move |()| {
            assert!(LowresClock::now() > t0, "lowres clock did not advance");
            assert!(fired.get(), "lowres timer did not fire");
            drop(t);
            Ok(())
        })
    });
}

#[test]
fn early_failure_parallel_for_each_with_sleeps() {
    // The end-to-end form of the early-failure law: every body sleeps,
    // one in every 1777 fails, the combined future resolves only after
    // all 11000 bodies ran, surfacing a failing index.
    common::run(1, || {
        let counter = Rc::new(Cell::new(0u32));
        let c = counter.clone();
        shoal::parallel_for_each(0..11_000, move |i: i64| {
            let c = c.clone();
            sleep(Duration::from_millis((i % 31 + 1) as u64)).then(move |()| {
                c.set(c.get() + 1);
                if i % 1777 == 1337 {
                    Err(shoal::Error::message(i.to_string()))
                } else {
                    Ok(())
                }
            })
        })
        .then_wrapped(move |res| {
            assert_eq!(counter.get(), 11_000);
            match res {
                Err(shoal::Error::Message(msg)) => {
                    let i: i64 = msg.parse().unwrap();
                    assert_eq!(i % 1777, 1337);
                    Ok(())
                }
                other => panic!("expected an index failure, got {other:?}"),
            }
        })
    });
}

#[test]
fn repeat_fails_at_step_two() {
    common::run(1, || {
        let counter = Rc::new(Cell::new(0));
        let c = counter.clone();
        shoal::repeat(move || {
            c.set(c.get() + 1);
            if c.get() == 2 {
                return Future::err(shoal::Error::message("expected"));
            }
            sleep(Duration::from_millis(1)).then(|()| Ok(shoal::StopIteration::No))
        })
        .then_wrapped(move |res| {
            assert!(res.is_err());
            assert_eq!(counter.get(), 2);
            Ok(())
        })
    });
}
