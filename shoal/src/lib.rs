//! shoal — thread-per-core futures runtime for Linux.
//!
//! Each selected CPU runs an independent reactor: an event loop owning
//! its share of memory, descriptors and I/O queues, with no locks and no
//! shared mutable state between cores. Work is expressed as a
//! [`Future`]/[`Promise`] pair and continuations chained with
//! [`then`](Future::then); parallelism comes from sharding data and
//! passing messages over per-pair lock-free queues ([`submit_to`],
//! [`invoke_on_all`], [`Sharded`]).
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! fn main() {
//!     let config = shoal::Config::default();
//!     let code = shoal::Runtime::new(config).unwrap().run(|| {
//!         shoal::sleep(Duration::from_secs(1)).then(|()| {
//!             println!("Hello World");
//!             Ok(())
//!         })
//!     });
//!     std::process::exit(code);
//! }
//! ```
//!
//! # Platform
//!
//! Linux 5.11+ (io_uring with EXT_ARG and the file-op opcodes).

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod runtime;

// ── Public modules ──────────────────────────────────────────────────────
pub mod config;
pub mod counter;
pub mod dma;
pub mod error;
pub mod file;
pub mod fstream;
pub mod future;
pub mod io_config;
pub mod io_queue;
pub mod metrics;
pub mod net;
pub mod reactor;
pub mod rpc;
pub mod semaphore;
pub mod sharded;
pub mod smp;
pub mod stream;
pub mod thread;

// ── Re-exports: core primitives ────────────────────────────────────────

/// Result carried by futures; `Err` is the cross-core-safe error holder.
pub use error::AsyncResult;
/// Runtime errors.
pub use error::Error;
/// The deferred-value consumer half.
pub use future::Future;
/// Conversion of continuation return values into futures.
pub use future::Futurize;
/// The deferred-value producer half.
pub use future::Promise;
/// Uniform invocation: value, error or future, always a future out.
pub use future::apply;
/// A future resolving at the next task dispatch (yield point).
pub use future::later;
/// Non-consuming fan-out over a single resolution.
pub use future::shared::SharedFuture;

// ── Re-exports: combinators ────────────────────────────────────────────

/// Loop control for [`repeat`].
pub use future::iterate::StopIteration;
/// Loop until the condition holds.
pub use future::iterate::do_until;
/// Map elements through an async mapper, then fold in input order.
pub use future::iterate::map_reduce;
/// Run an async body over each element, all in flight at once.
pub use future::iterate::parallel_for_each;
/// Loop an async body until it says stop.
pub use future::iterate::repeat;
/// Loop an async body until it produces a value.
pub use future::iterate::repeat_until_value;
/// Resolve two futures, preserving both outcomes.
pub use future::join::join;
/// Resolve three futures, preserving all outcomes.
pub use future::join::join3;
/// Resolve a vector of futures, preserving every outcome.
pub use future::join::when_all;
/// Future-returning counting semaphore.
pub use semaphore::Semaphore;

// ── Re-exports: runtime ────────────────────────────────────────────────

/// Runtime configuration.
pub use config::Config;
/// Builder for [`Config`] with discoverable methods and `build()` validation.
pub use config::ConfigBuilder;
/// The per-core event loop.
pub use reactor::Reactor;
/// Handle for a registered reactor poller.
pub use reactor::PollerRegistration;
/// The reactor owning the current thread.
pub use reactor::local;
/// A future resolving after a duration.
pub use reactor::sleep;
/// A future resolving at an instant.
pub use reactor::sleep_until;
/// A callback attached to a deadline, optionally periodic.
pub use reactor::Timer;
/// The 10 ms shared clock.
pub use reactor::LowresClock;
/// The configured set of reactors.
pub use runtime::Runtime;

// ── Re-exports: sharding ───────────────────────────────────────────────

/// One service instance per reactor.
pub use sharded::Sharded;
/// Number of reactors in the running runtime.
pub use smp::count as smp_count;
/// Run a closure on every reactor.
pub use smp::invoke_on_all;
/// Run a closure on a specific reactor.
pub use smp::submit_to;
/// The current reactor's shard id.
pub use smp::this_cpu;

// ── Re-exports: disk and streams ───────────────────────────────────────

/// Alignment-aware buffer for direct I/O.
pub use dma::DmaBuffer;
/// A data file on persistent storage.
pub use file::File;
/// Open flags for [`open_file_dma`].
pub use file::OpenFlags;
/// Open (or create) a file for DMA access.
pub use file::open_file_dma;
/// Weighted I/O priority class.
pub use io_queue::IoPriorityClass;
/// The class used when the caller does not name one.
pub use io_queue::default_priority_class;
/// Register a new I/O priority class.
pub use io_queue::register_priority_class;
/// Parsed io.conf contents.
pub use io_config::IoConfig;
/// Read-ahead options for file input streams.
pub use fstream::FileInputStreamOptions;
/// Write-behind options for file output streams.
pub use fstream::FileOutputStreamOptions;
/// A buffered input stream over a whole file.
pub use fstream::make_file_input_stream;
/// A buffered input stream over a file region.
pub use fstream::make_file_input_stream_bounded;
/// A buffered, write-behind output stream over a file.
pub use fstream::make_file_output_stream;
/// Buffered reader over a byte source.
pub use stream::InputStream;
/// Buffered writer over a byte sink.
pub use stream::OutputStream;

// ── Re-exports: networking ─────────────────────────────────────────────

/// A connected TCP socket.
pub use net::ConnectedSocket;
/// Options for [`listen`].
pub use net::ListenOptions;
/// A listening socket.
pub use net::ServerSocket;
/// A bound UDP socket.
pub use net::UdpChannel;
/// Open a connection.
pub use net::connect;
/// Bind and listen.
pub use net::listen;
/// Bind a UDP socket.
pub use net::make_udp_channel;

// ── Re-exports: threads ────────────────────────────────────────────────

/// A stackful thread of execution pinned to its reactor.
pub use thread::Thread;
/// (period, quota) fair share across a set of threads.
pub use thread::ThreadSchedulingGroup;
/// Run a blocking-style closure in a fresh thread, result as a future.
pub use thread::async_run;
