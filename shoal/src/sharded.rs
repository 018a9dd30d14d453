//! Per-core service instances.
//!
//! A [`Sharded<S>`] owns one instance of `S` on every reactor. The
//! instances are constructed in place by `start` (the factory crosses
//! cores, the instances never do) and addressed afterwards through
//! `invoke_on` / `invoke_on_all` / `map_reduce0`, which expand to
//! [`submit_to`](crate::smp::submit_to) calls.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Error;
use crate::future::iterate::map_reduce;
use crate::future::{Future, Futurize};
use crate::smp;

thread_local! {
    /// This reactor's live service instances, keyed by sharded-service id.
    static SERVICES: RefCell<HashMap<u64, Rc<dyn Any>>> = RefCell::new(HashMap::new());
}

static NEXT_SERVICE_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a service with one instance per reactor.
///
/// The handle itself is plain data (an id); copies address the same
/// service from any reactor.
pub struct Sharded<S: 'static> {
    id: u64,
    _marker: PhantomData<fn() -> S>,
}

impl<S: 'static> Clone for Sharded<S> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<S: 'static> Copy for Sharded<S> {}

fn local_cell<S: 'static>(id: u64) -> Rc<RefCell<S>> {
    let any = SERVICES
        .with(|m| m.borrow().get(&id).cloned())
        .expect("sharded service not started on this reactor");
    any.downcast::<RefCell<S>>()
        .expect("sharded service id used with the wrong type")
}

impl<S: 'static> Sharded<S> {
    /// Construct one instance per reactor; the factory receives the shard
    /// id. Resolves once every reactor holds its instance.
    pub fn start<F>(factory: F) -> Future<Sharded<S>>
    where
        F: Fn(usize) -> S + Clone + Send + 'static,
    {
        let id = NEXT_SERVICE_ID.fetch_add(1, Ordering::Relaxed);
        smp::invoke_on_all(move || {
            let instance = factory(smp::this_cpu());
            SERVICES.with(|m| {
                m.borrow_mut().insert(id, Rc::new(RefCell::new(instance)));
            });
            Ok(())
        })
        .then(move |()| {
            Ok(Sharded {
                id,
                _marker: PhantomData,
            })
        })
    }

    /// The local reactor's instance.
    ///
    /// # Panics
    ///
    /// Panics if the service was not started (or already stopped) here.
    pub fn local(&self) -> Rc<RefCell<S>> {
        local_cell::<S>(self.id)
    }

    /// Run `f` against the instance on reactor `cpu`, resolving with its
    /// result on the calling reactor.
    pub fn invoke_on<F, R>(&self, cpu: usize, f: F) -> Future<R::Output>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Futurize + 'static,
        R::Output: Send + 'static,
    {
        let id = self.id;
        smp::submit_to(cpu, move || {
            let cell = local_cell::<S>(id);
            let r = f(&mut cell.borrow_mut());
            r
        })
    }

    /// Run `f` against every instance; resolves when all invocations
    /// finished.
    pub fn invoke_on_all<F, R>(&self, f: F) -> Future<()>
    where
        F: Fn(&mut S) -> R + Clone + Send + 'static,
        R: Futurize<Output = ()> + 'static,
    {
        let id = self.id;
        smp::invoke_on_all(move || {
            let cell = local_cell::<S>(id);
            let f = f.clone();
            let r = f(&mut cell.borrow_mut());
            r
        })
    }

    /// Map every instance through `map` and fold the results (in shard
    /// order) with `fold`, starting from `initial`.
    pub fn map_reduce0<M, R, A, F>(&self, map: M, initial: A, fold: F) -> Future<A>
    where
        M: Fn(&mut S) -> R + Clone + Send + 'static,
        R: Futurize + 'static,
        R::Output: Send + 'static,
        A: 'static,
        F: FnMut(A, R::Output) -> A + 'static,
    {
        let this = *self;
        map_reduce(
            0..smp::count(),
            move |cpu| this.invoke_on(cpu, map.clone()),
            initial,
            fold,
        )
    }

    /// Drop every instance. Further invocations fail; resolve this before
    /// the runtime exits.
    pub fn stop(self) -> Future<()> {
        let id = self.id;
        smp::invoke_on_all(move || {
            let removed = SERVICES.with(|m| m.borrow_mut().remove(&id));
            match removed {
                Some(_) => Ok(()),
                None => Err(Error::message("sharded service already stopped")),
            }
        })
    }
}
