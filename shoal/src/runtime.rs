//! Runtime startup and teardown.
//!
//! [`Runtime::new`] pins one OS thread per selected CPU, each running an
//! independent reactor. The calling thread becomes reactor 0. Before any
//! reactor enters its loop, all of them rendezvous at a barrier so the
//! cross-core queue matrix is safe to use from the first tick.
//! [`Runtime::run`] drives a main future on cpu 0 and returns the process
//! exit code once every reactor has finished its at-exit chain.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Barrier, Once};
use std::thread;

use crate::config::Config;
use crate::error::Error;
use crate::future::{Futurize, apply};
use crate::reactor::{self, Reactor};
use crate::reactor::uring::Uring;
use crate::smp::{self, SmpContext};

static SIGINT_REQUESTED: AtomicBool = AtomicBool::new(false);
static SIGINT_WAKE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn sigint_action(_signo: libc::c_int) {
    SIGINT_REQUESTED.store(true, Ordering::Release);
    let fd = SIGINT_WAKE_FD.load(Ordering::Acquire);
    if fd >= 0 {
        // write(2) is async-signal-safe; this kicks cpu 0 out of its sleep.
        Uring::notify(fd);
    }
}

fn install_sigint_handler() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = sigint_action as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
    });
}

/// True exactly once after a SIGINT arrived.
pub(crate) fn consume_sigint() -> bool {
    SIGINT_REQUESTED.swap(false, Ordering::AcqRel)
}

/// Ask every reactor to exit with `code`.
pub(crate) fn broadcast_exit(code: i32) {
    let me = smp::this_cpu();
    for cpu in 0..smp::count() {
        if cpu == me {
            reactor::local().exit(code);
        } else {
            smp::submit_to(cpu, move || {
                reactor::local().exit(code);
                Ok(())
            })
            .ignore();
        }
    }
}

/// Pin the current thread to a CPU core.
fn pin_to_core(core: usize) -> Result<(), Error> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if ret != 0 {
            return Err(Error::from(io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// A configured set of reactors, one per selected CPU.
///
/// The thread that calls [`new`](Runtime::new) becomes reactor 0 and must
/// also be the one that calls [`run`](Runtime::run); dropping a runtime
/// without running it leaves the worker threads parked at the startup
/// barrier.
pub struct Runtime {
    reactor0: std::rc::Rc<Reactor>,
    handles: Vec<thread::JoinHandle<()>>,
    barrier: Arc<Barrier>,
    smp: Arc<SmpContext>,
}

impl Runtime {
    /// Build the reactors and spawn the worker threads. Construction
    /// failures on the calling thread surface as `Err`; a worker thread
    /// that cannot build its reactor aborts the process, since a
    /// half-sharded runtime cannot satisfy cross-core submissions.
    pub fn new(config: Config) -> Result<Runtime, Error> {
        config.validate()?;
        let cpus = config.resolve_cpus();
        let n = cpus.len();
        let smp_ctx = SmpContext::new(n);
        let barrier = Arc::new(Barrier::new(n));

        if config.pin_to_core {
            pin_to_core(cpus[0])?;
        }
        crate::counter::set_reactor_shard(0);
        let reactor0 = Reactor::new(0, &config, Some(smp_ctx.clone()), n)?;
        Reactor::make_current(&reactor0);

        let mut handles = Vec::with_capacity(n.saturating_sub(1));
        for (i, &cpu) in cpus.iter().enumerate().skip(1) {
            let cfg = config.clone();
            let ctx = smp_ctx.clone();
            let barrier = barrier.clone();
            let handle = thread::Builder::new()
                .name(format!("shoal-reactor-{i}"))
                .spawn(move || {
                    if cfg.pin_to_core
                        && let Err(e) = pin_to_core(cpu)
                    {
                        eprintln!("shoal: cannot pin reactor {i} to cpu {cpu}: {e}");
                        std::process::abort();
                    }
                    crate::counter::set_reactor_shard(i);
                    let r = match Reactor::new(i, &cfg, Some(ctx), n) {
                        Ok(r) => r,
                        Err(e) => {
                            eprintln!("shoal: reactor {i} construction failed: {e}");
                            std::process::abort();
                        }
                    };
                    Reactor::make_current(&r);
                    barrier.wait();
                    r.run();
                    Reactor::clear_current();
                })
                .map_err(Error::from)?;
            handles.push(handle);
        }

        if config.handle_sigint {
            SIGINT_WAKE_FD.store(reactor0.ring.borrow().wake_fd(), Ordering::Release);
            install_sigint_handler();
        }

        Ok(Runtime {
            reactor0,
            handles,
            barrier,
            smp: smp_ctx,
        })
    }

    /// Run `main` on reactor 0 and block until the runtime exits.
    /// Resolves to the process exit code: 0 when the main future
    /// succeeded, 1 when it failed (the error is printed), or whatever
    /// [`Reactor::exit`] was called with.
    pub fn run<F, R>(self, main: F) -> i32
    where
        F: FnOnce() -> R + 'static,
        R: Futurize<Output = ()>,
    {
        let Runtime {
            reactor0,
            handles,
            barrier,
            smp,
        } = self;

        barrier.wait();
        reactor0.add_task(move || {
            apply(main)
                .then_wrapped(|res| {
                    let code = match res {
                        Ok(()) => 0,
                        Err(e) => {
                            eprintln!("shoal: main future failed: {e}");
                            1
                        }
                    };
                    broadcast_exit(code);
                    Ok(())
                })
                .ignore();
        });

        let code = reactor0.run();
        for h in handles {
            let _ = h.join();
        }
        drop(reactor0);
        Reactor::clear_current();
        drop(smp);
        code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;

    fn test_config(cpus: usize) -> Config {
        ConfigBuilder::new()
            .smp(cpus)
            .pin_to_core(false)
            .handle_sigint(false)
            .build()
            .unwrap()
    }

    #[test]
    fn run_returns_zero_on_success() {
        let rt = Runtime::new(test_config(1)).unwrap();
        let code = rt.run(|| Ok(()));
        assert_eq!(code, 0);
    }

    #[test]
    fn run_returns_one_on_failure() {
        let rt = Runtime::new(test_config(1)).unwrap();
        let code = rt.run(|| Err(Error::message("expected")));
        assert_eq!(code, 1);
    }

    #[test]
    fn at_exit_runs_in_reverse_order() {
        use std::sync::Mutex;
        static ORDER: Mutex<Vec<u32>> = Mutex::new(Vec::new());
        ORDER.lock().unwrap().clear();

        let rt = Runtime::new(test_config(1)).unwrap();
        let code = rt.run(|| {
            let r = reactor::local();
            r.at_exit(|| {
                ORDER.lock().unwrap().push(1);
                crate::future::Future::ready(())
            });
            r.at_exit(|| {
                ORDER.lock().unwrap().push(2);
                crate::future::Future::ready(())
            });
            Ok(())
        });
        assert_eq!(code, 0);
        assert_eq!(*ORDER.lock().unwrap(), vec![2, 1]);
    }
}
