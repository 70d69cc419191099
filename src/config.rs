use std::time::Duration;

/// What the packet pool does when every pre-allocated packet is checked out.
///
/// The original C implementation fixed this at compile time via
/// `BUFFER_ALLOW_MALLOC`. Here it is a runtime choice so a single build can
/// serve both a throughput-oriented profile (allocate past the pool) and a
/// memory-bounded one (spin-flush other connections until a packet frees up).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PoolOverflow {
    /// Allocate a packet outside the pool when it is exhausted.
    Allocate,
    /// Block the caller, flushing other connections, until a pooled packet
    /// frees up. Never allocates past `packet_pool_capacity`.
    SpinFlush,
}

/// Runtime-configurable constants.
///
/// Every field here replaces a `#define` from the original design. None of
/// these are hard-coded in the engine itself; `Config::default()` documents
/// the defaults the original used as fixed constants.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum events returned by a single `Demux::wait` call.
    pub demux_batch: usize,
    /// How long the reactor blocks in `Demux::wait` when no deferred tasks
    /// are pending.
    pub reactor_idle_wait: Duration,
    /// Minimum spacing between idle-timeout sweeps of the registry.
    pub tick_interval: Duration,
    /// Hard watchdog: a connection idle this long is force-closed
    /// regardless of its own `timeout_s`, once `ping` has already fired.
    pub idle_watchdog: Duration,
    /// Size of one in-memory write packet / file read chunk.
    pub packet_size: usize,
    /// Number of packets kept pre-allocated in the pool.
    pub packet_pool_capacity: usize,
    /// Behavior when the packet pool is exhausted.
    pub packet_pool_overflow: PoolOverflow,
    /// `accept` stops servicing new connections once open slots are within
    /// this many of capacity.
    pub listener_accept_margin: usize,
    /// Dispatcher thread count. `0` means "use the available parallelism".
    pub dispatcher_threads: usize,
    /// Wrap each dispatched task body in `catch_unwind` and respawn a
    /// worker whose thread has died. See DESIGN.md for why this replaces
    /// the original's SIGSEGV-catching sentinel threads.
    pub worker_sentinel: bool,
    /// Number of shared-nothing worker processes. `1` (the default) runs a
    /// single process; values above `1` fork `processes - 1` additional
    /// workers, each with its own `Core`, before the dispatcher thread pool
    /// is created in that process.
    pub processes: u32,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            demux_batch: 64,
            reactor_idle_wait: Duration::from_millis(500),
            tick_interval: Duration::from_secs(1),
            idle_watchdog: Duration::from_secs(300),
            packet_size: 16 * 1024,
            packet_pool_capacity: 248,
            packet_pool_overflow: PoolOverflow::Allocate,
            listener_accept_margin: 8,
            dispatcher_threads: 0,
            worker_sentinel: true,
            processes: 1,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder(Config::default())
    }
}

/// Fluent builder over `Config`, mirroring the defaults-then-override shape
/// used by the listener/server setup calls in the external interface.
#[derive(Clone, Debug)]
pub struct ConfigBuilder(Config);

impl ConfigBuilder {
    pub fn demux_batch(mut self, n: usize) -> Self {
        self.0.demux_batch = n;
        self
    }

    pub fn reactor_idle_wait(mut self, d: Duration) -> Self {
        self.0.reactor_idle_wait = d;
        self
    }

    pub fn tick_interval(mut self, d: Duration) -> Self {
        self.0.tick_interval = d;
        self
    }

    pub fn idle_watchdog(mut self, d: Duration) -> Self {
        self.0.idle_watchdog = d;
        self
    }

    pub fn packet_size(mut self, n: usize) -> Self {
        self.0.packet_size = n;
        self
    }

    pub fn packet_pool_capacity(mut self, n: usize) -> Self {
        self.0.packet_pool_capacity = n;
        self
    }

    pub fn packet_pool_overflow(mut self, o: PoolOverflow) -> Self {
        self.0.packet_pool_overflow = o;
        self
    }

    pub fn listener_accept_margin(mut self, n: usize) -> Self {
        self.0.listener_accept_margin = n;
        self
    }

    pub fn dispatcher_threads(mut self, n: usize) -> Self {
        self.0.dispatcher_threads = n;
        self
    }

    pub fn worker_sentinel(mut self, enabled: bool) -> Self {
        self.0.worker_sentinel = enabled;
        self
    }

    pub fn processes(mut self, n: u32) -> Self {
        self.0.processes = n;
        self
    }

    pub fn build(self) -> Config {
        self.0
    }
}
