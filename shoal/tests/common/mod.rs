use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};

use shoal::{AsyncResult, ConfigBuilder, Future, Runtime};

/// Run a future on a fresh runtime with `cpus` reactors; panics unless
/// it resolves successfully.
pub fn run(cpus: usize, main: impl FnOnce() -> Future<()> + 'static) {
    let result = try_run(cpus, main);
    result.expect("main future failed");
}

/// Run a future on a fresh runtime and hand back its outcome.
pub fn try_run(
    cpus: usize,
    main: impl FnOnce() -> Future<()> + 'static,
) -> AsyncResult<()> {
    let outcome: Arc<Mutex<Option<AsyncResult<()>>>> = Arc::new(Mutex::new(None));
    let slot = outcome.clone();

    let config = ConfigBuilder::new()
        .smp(cpus)
        .pin_to_core(false)
        .handle_sigint(false)
        .build()
        .unwrap();
    let code = Runtime::new(config).unwrap().run(move || {
        shoal::apply(main).then_wrapped(move |res| {
            *slot.lock().unwrap() = Some(res);
            Ok(())
        })
    });
    assert_eq!(code, 0);
    outcome
        .lock()
        .unwrap()
        .take()
        .expect("main future never resolved")
}

/// A unique scratch path under the system temp dir.
#[allow(dead_code)]
pub fn temp_path(name: &str) -> PathBuf {
    static SEQ: AtomicU32 = AtomicU32::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "shoal-test-{}-{}-{}",
        std::process::id(),
        name,
        seq
    ))
}
