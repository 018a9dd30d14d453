use std::path::PathBuf;
use std::time::Duration;

use crate::error::Error;
use crate::io_config::IoConfig;

/// Runtime configuration for [`Runtime`](crate::Runtime).
#[derive(Clone)]
pub struct Config {
    /// Number of reactors to start. 0 = one per online CPU.
    pub smp: usize,
    /// Explicit CPU set; overrides `smp` when set. Reactor i is pinned to
    /// `cpuset[i]`.
    pub cpuset: Option<Vec<usize>>,
    /// Pin each reactor thread to its CPU.
    pub pin_to_core: bool,
    /// Time slice a reactor spends on normal tasks before polling again.
    pub task_quota: Duration,
    /// Upper bound on disk requests in flight (shared across
    /// `num_io_queues` queues).
    pub max_io_requests: u32,
    /// Number of I/O queues dividing `max_io_requests`. 0 = one per
    /// reactor.
    pub num_io_queues: u32,
    /// Optional io.conf file applied over the two fields above.
    pub io_config_path: Option<PathBuf>,
    /// SQ entries per reactor ring. Must be a power of two.
    pub sq_entries: u32,
    /// Install a SIGINT handler that exits the runtime gracefully.
    pub handle_sigint: bool,
    /// Require O_DIRECT to work; when false, files fall back to buffered
    /// I/O on filesystems without O_DIRECT support (tmpfs, some overlay
    /// setups).
    pub strict_o_direct: bool,
    /// Stack size for user-level threads.
    pub thread_stack_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            smp: 0,
            cpuset: None,
            pin_to_core: true,
            task_quota: Duration::from_micros(500),
            max_io_requests: 128,
            num_io_queues: 0,
            io_config_path: None,
            sq_entries: 256,
            handle_sigint: true,
            strict_o_direct: false,
            thread_stack_size: 128 * 1024,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is
    /// out of range.
    pub fn validate(&self) -> Result<(), Error> {
        if !self.sq_entries.is_power_of_two() {
            return Err(Error::Config("sq_entries must be a power of two".into()));
        }
        if self.max_io_requests == 0 {
            return Err(Error::Config("max_io_requests must be > 0".into()));
        }
        if self.task_quota.is_zero() {
            return Err(Error::Config("task_quota must be > 0".into()));
        }
        if let Some(cpus) = &self.cpuset {
            if cpus.is_empty() {
                return Err(Error::Config("cpuset must not be empty".into()));
            }
        }
        if self.thread_stack_size < 16 * 1024 {
            return Err(Error::Config("thread_stack_size too small".into()));
        }
        Ok(())
    }

    /// Apply an [`IoConfig`] (parsed io.conf) over this config.
    pub fn apply_io_config(&mut self, io: IoConfig) {
        self.max_io_requests = io.max_io_requests;
        self.num_io_queues = io.num_io_queues;
    }

    /// The CPU ids this configuration selects.
    pub(crate) fn resolve_cpus(&self) -> Vec<usize> {
        if let Some(cpus) = &self.cpuset {
            return cpus.clone();
        }
        let n = if self.smp == 0 {
            online_cpus()
        } else {
            self.smp
        };
        (0..n).collect()
    }

    /// Per-reactor in-flight disk request capacity.
    pub(crate) fn io_capacity_per_reactor(&self, n_reactors: usize) -> usize {
        let queues = if self.num_io_queues == 0 {
            n_reactors as u32
        } else {
            self.num_io_queues
        };
        (self.max_io_requests / queues.max(1)).max(1) as usize
    }
}

/// Number of online CPUs.
pub(crate) fn online_cpus() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret < 1 { 1 } else { ret as usize }
}

/// Builder for [`Config`] with discoverable methods and `build()`
/// validation.
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Topology ─────────────────────────────────────────────────

    /// Number of reactors. 0 = one per online CPU.
    pub fn smp(mut self, n: usize) -> Self {
        self.config.smp = n;
        self
    }

    /// Explicit CPU set; reactor i runs on `cpus[i]`.
    pub fn cpuset(mut self, cpus: Vec<usize>) -> Self {
        self.config.cpuset = Some(cpus);
        self
    }

    /// Enable or disable CPU pinning.
    pub fn pin_to_core(mut self, enable: bool) -> Self {
        self.config.pin_to_core = enable;
        self
    }

    // ── Scheduling ───────────────────────────────────────────────

    /// Task-batch time slice.
    pub fn task_quota(mut self, quota: Duration) -> Self {
        self.config.task_quota = quota;
        self
    }

    // ── Disk I/O ─────────────────────────────────────────────────

    /// Bound on in-flight disk requests.
    pub fn max_io_requests(mut self, n: u32) -> Self {
        self.config.max_io_requests = n;
        self
    }

    /// Number of I/O queues sharing the bound. 0 = one per reactor.
    pub fn num_io_queues(mut self, n: u32) -> Self {
        self.config.num_io_queues = n;
        self
    }

    /// Load max-io-requests / num-io-queues from an io.conf file at
    /// build time.
    pub fn io_config_path(mut self, path: PathBuf) -> Self {
        self.config.io_config_path = Some(path);
        self
    }

    /// Require O_DIRECT support from the filesystem.
    pub fn strict_o_direct(mut self, strict: bool) -> Self {
        self.config.strict_o_direct = strict;
        self
    }

    // ── Ring / misc ──────────────────────────────────────────────

    /// SQ entries per reactor ring. Must be a power of two.
    pub fn sq_entries(mut self, n: u32) -> Self {
        self.config.sq_entries = n;
        self
    }

    /// Install the SIGINT graceful-exit handler.
    pub fn handle_sigint(mut self, enable: bool) -> Self {
        self.config.handle_sigint = enable;
        self
    }

    /// Stack size for user-level threads.
    pub fn thread_stack_size(mut self, bytes: usize) -> Self {
        self.config.thread_stack_size = bytes;
        self
    }

    // ── Terminal ─────────────────────────────────────────────────

    /// Validate and build the final [`Config`], loading the io.conf file
    /// if one was set.
    pub fn build(mut self) -> Result<Config, Error> {
        if let Some(path) = self.config.io_config_path.clone() {
            let io = IoConfig::load(&path)?;
            self.config.apply_io_config(io);
        }
        self.config.validate()?;
        Ok(self.config)
    }
}
