//! Public facade. Everything here delegates to `Core`; this module exists so
//! application code depends on a small, stable surface instead of reaching
//! into `Core` directly (though `Server::core` is there for the rare case
//! that needs to).

use std::fs::File;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::core::Core;
use crate::error::{CoreError, CoreResult, IoOutcome};
use crate::protocol::Protocol;
use crate::rwhook::RwHook;
use crate::token::ConnHandle;

pub struct Server {
    core: Arc<Core>,
}

impl Server {
    /// Builds and starts one process's worker pool and signal handling.
    ///
    /// When `config.processes > 1` this forks the additional workers first
    /// (each with its own `Core`, dispatcher, and reactor) before doing
    /// anything else in the calling process — every returned `Server`, in
    /// every resulting process, is independent and shares nothing with its
    /// siblings.
    pub fn new(config: Config) -> CoreResult<Server> {
        crate::lifecycle::fork_workers(config.processes).map_err(CoreError::DemuxFatal)?;
        let core = Core::new(config)?;
        crate::lifecycle::install(&core)?;
        Ok(Server { core })
    }

    pub fn listen(
        &self,
        addr: SocketAddr,
        factory: impl Fn(&Core) -> Box<dyn Protocol> + Send + Sync + 'static,
    ) -> CoreResult<ConnHandle> {
        self.core.listen(addr, factory)
    }

    pub fn attach(&self, fd: RawFd, protocol: Box<dyn Protocol>) -> CoreResult<ConnHandle> {
        self.core.attach(fd, protocol)
    }

    /// Blocks the calling thread, running the reactor loop, until `stop` is
    /// called — directly, or via `SIGINT`/`SIGTERM`.
    pub fn run(&self) {
        crate::reactor::run(Arc::clone(&self.core));
    }

    /// `run`, plus process-lifecycle hooks: `on_init` runs once before the
    /// reactor loop starts, `on_idle` runs once per `Demux::wait` that
    /// returned no events, and `on_finish` runs once after the graceful
    /// shutdown drain completes.
    pub fn run_with(
        &self,
        on_init: Option<Box<dyn FnOnce(&Core) + Send>>,
        on_idle: Option<Box<dyn FnMut(&Core) + Send>>,
        on_finish: Option<Box<dyn FnOnce(&Core) + Send>>,
    ) {
        crate::reactor::run_with_hooks(Arc::clone(&self.core), on_init, on_idle, on_finish);
    }

    pub fn stop(&self) {
        self.core.stop();
    }

    pub fn last_tick(&self) -> u64 {
        self.core.last_tick()
    }

    pub fn count(&self, service_tag: Option<&str>) -> usize {
        self.core.count(service_tag)
    }

    pub fn set_timeout(&self, handle: ConnHandle, seconds: u64) {
        self.core.set_timeout(handle, seconds);
    }

    pub fn get_timeout(&self, handle: ConnHandle) -> CoreResult<u64> {
        self.core.get_timeout(handle)
    }

    pub fn set_protocol(&self, handle: ConnHandle, protocol: Box<dyn Protocol>) -> CoreResult<()> {
        self.core.set_protocol(handle, protocol)
    }

    pub fn set_rw_hook(&self, handle: ConnHandle, hook: Option<Box<dyn RwHook>>) -> CoreResult<()> {
        self.core.set_rw_hook(handle, hook)
    }

    pub fn hijack(&self, handle: ConnHandle) -> CoreResult<RawFd> {
        self.core.hijack(handle)
    }

    pub fn read(&self, handle: ConnHandle, buf: &mut [u8]) -> CoreResult<IoOutcome> {
        self.core.read(handle, buf)
    }

    pub fn write(&self, handle: ConnHandle, bytes: Vec<u8>) -> CoreResult<()> {
        self.core.write(handle, bytes)
    }

    pub fn write_urgent(&self, handle: ConnHandle, bytes: Vec<u8>) -> CoreResult<()> {
        self.core.write_urgent(handle, bytes)
    }

    pub fn write_then_close(&self, handle: ConnHandle, bytes: Vec<u8>) -> CoreResult<()> {
        self.core.write_then_close(handle, bytes)
    }

    pub fn sendfile(
        &self,
        handle: ConnHandle,
        file: File,
        offset: u64,
        len: u64,
        keep_open: bool,
    ) -> CoreResult<()> {
        self.core.sendfile(handle, file, offset, len, keep_open)
    }

    pub fn flush(&self, handle: ConnHandle) -> CoreResult<()> {
        self.core.flush(handle)
    }

    pub fn close(&self, handle: ConnHandle) {
        self.core.force_close(handle);
    }

    pub fn defer(&self, body: impl FnOnce(&Core) + Send + 'static) {
        self.core.defer(body);
    }

    pub fn task(
        &self,
        handle: ConnHandle,
        body: impl FnOnce(&Core, ConnHandle) + Send + 'static,
        fallback: Option<Box<dyn FnOnce(&Core, ConnHandle) + Send>>,
    ) {
        self.core.task(handle, body, fallback);
    }

    pub fn each(
        &self,
        origin: Option<ConnHandle>,
        service_tag: impl Into<String>,
        body: impl Fn(&Core, ConnHandle) + Send + Sync + 'static,
        on_finish: Option<Box<dyn FnOnce(&Core) + Send>>,
    ) {
        self.core.each(origin, service_tag, body, on_finish);
    }

    pub fn run_every(
        &self,
        period: Duration,
        repeats: u64,
        task: impl FnMut(&Core) + Send + 'static,
        on_finish: Option<Box<dyn FnOnce(&Core) + Send>>,
    ) -> CoreResult<ConnHandle> {
        self.core.run_every(period, repeats, task, on_finish)
    }

    pub fn run_after(
        &self,
        delay: Duration,
        task: impl FnOnce(&Core) + Send + 'static,
    ) -> CoreResult<ConnHandle> {
        self.core.run_after(delay, task)
    }

    /// Escape hatch for application code that needs `&Arc<Core>` directly,
    /// e.g. to store a `Weak<Core>` inside a custom `Protocol`.
    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }
}
