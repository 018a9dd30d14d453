//! Sharded execution: remote submission, collectives, per-core service
//! instances, and error marshaling across cores.

mod common;

use std::cell::Cell;
use std::rc::Rc;

use shoal::{Error, Sharded, invoke_on_all, smp_count, submit_to, this_cpu};

const CPUS: usize = 4;

#[test]
fn submit_to_returns_remote_value() {
    common::run(CPUS, || {
        submit_to(CPUS - 1, || Ok(this_cpu() * 10)).then(|v| {
            assert_eq!(v, (CPUS - 1) * 10);
            Ok(())
        })
    });
}

#[test]
fn submit_to_local_short_circuits() {
    common::run(1, || {
        submit_to(0, || Ok(this_cpu())).then(|v| {
            assert_eq!(v, 0);
            Ok(())
        })
    });
}

#[test]
fn remote_errors_marshal_back() {
    common::run(2, || {
        submit_to(1, || Err::<(), _>(Error::message("remote boom"))).then_wrapped(|res| {
            match res {
                Err(Error::Message(msg)) => assert_eq!(&*msg, "remote boom"),
                other => panic!("expected the remote error, got {other:?}"),
            }
            Ok(())
        })
    });
}

#[test]
fn submit_to_runs_on_the_target_cpu() {
    common::run(CPUS, || {
        shoal::parallel_for_each(0..CPUS, |cpu| {
            submit_to(cpu, move || {
                assert_eq!(this_cpu(), cpu);
                Ok(())
            })
        })
    });
}

#[test]
fn many_concurrent_submissions_backpressure() {
    // Far more in-flight submissions than the per-pair queue capacity
    // (128): the extras wait for tokens instead of failing.
    common::run(2, || {
        let total = Rc::new(Cell::new(0u64));
        let t = total.clone();
        shoal::parallel_for_each(0..1000u64, move |i| {
            let t = t.clone();
            submit_to(1, move || Ok(i)).then(move |v| {
                t.set(t.get() + v);
                Ok(())
            })
        })
        .then(move |()| {
            assert_eq!(total.get(), 999 * 1000 / 2);
            Ok(())
        })
    });
}

#[test]
fn invoke_on_all_runs_everywhere_exactly_once() {
    struct Probe {
        hits: u32,
    }

    common::run(CPUS, || {
        Sharded::<Probe>::start(|_cpu| Probe { hits: 0 }).then(|service| {
            service
                .invoke_on_all(|p| {
                    p.hits += 1;
                    Ok(())
                })
                .then(move |()| {
                    service.map_reduce0(|p| Ok(p.hits), 0u32, |acc, h| {
                        assert_eq!(h, 1, "a reactor saw the call more than once");
                        acc + h
                    })
                })
                .then(move |total| {
                    assert_eq!(total as usize, smp_count());
                    service.stop()
                })
        })
    });
}

#[test]
fn map_reduce0_sums_cpu_id_squares() {
    struct X;

    common::run(CPUS, || {
        Sharded::<X>::start(|_| X).then(|service| {
            service
                .map_reduce0(
                    |_x| Ok(this_cpu() * this_cpu()),
                    0usize,
                    |acc, v| acc + v,
                )
                .then(move |sum| {
                    let n = smp_count();
                    assert_eq!(sum, (n - 1) * n * (2 * n - 1) / 6);
                    service.stop()
                })
        })
    });
}

#[test]
fn sharded_constructor_receives_shard_ids() {
    struct Owner {
        cpu: usize,
    }

    common::run(CPUS, || {
        Sharded::<Owner>::start(|cpu| Owner { cpu }).then(|service| {
            service
                .invoke_on_all(|o| {
                    assert_eq!(o.cpu, this_cpu());
                    Ok(())
                })
                .then(move |()| service.stop())
        })
    });
}

#[test]
fn invoke_on_reaches_a_single_shard() {
    struct Counter {
        n: u64,
    }

    common::run(2, || {
        Sharded::<Counter>::start(|_| Counter { n: 0 }).then(|service| {
            service
                .invoke_on(1, |c| {
                    c.n += 7;
                    Ok(c.n)
                })
                .then(move |n| {
                    assert_eq!(n, 7);
                    service.invoke_on(0, |c| Ok(c.n)).then(move |n0| {
                        assert_eq!(n0, 0, "the other shard was touched");
                        service.stop()
                    })
                })
        })
    });
}

#[test]
fn invoke_on_all_plain_closure() {
    // The collective without a service: every reactor observes one call.
    use std::sync::atomic::{AtomicUsize, Ordering};
    static CALLS: AtomicUsize = AtomicUsize::new(0);
    CALLS.store(0, Ordering::SeqCst);

    common::run(CPUS, || {
        invoke_on_all(|| {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .then(|()| {
            assert_eq!(CALLS.load(Ordering::SeqCst), CPUS);
            Ok(())
        })
    });
}
