use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::demux::Demux;
use crate::dispatcher::{Dispatcher, Task};
use crate::error::{classify_io, CoreError, CoreResult, IoOutcome};
use crate::packet::{Packet, PacketFlags, PacketPool};
use crate::protocol::Protocol;
use crate::ready::Ready;
use crate::registry::Registry;
use crate::rwhook::RwHook;
use crate::sys::socket::Socket;
use crate::token::{ConnHandle, Token};
use crate::writebuf::FlushOutcome;

/// Bounds how many times `write_with_flags` retries a `SpinFlush`-exhausted
/// packet pool before giving up with `ResourceExhausted`, so a pool that
/// genuinely never frees up (every other connection also stalled) fails
/// fast instead of spinning the calling thread forever.
const SPIN_FLUSH_ATTEMPTS: u32 = 32;

/// Shared engine state: one instance per process, reached through `Arc` by
/// the reactor thread, every dispatcher worker, and the public `Server`
/// facade. Nothing in here blocks on network I/O outside `demux.wait`.
pub struct Core {
    pub(crate) config: Config,
    pub(crate) registry: Registry,
    pub(crate) demux: Demux,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) packet_pool: PacketPool,
    pub(crate) running: AtomicBool,
    last_tick: AtomicU64,
    start: Instant,
}

impl Core {
    pub fn new(config: Config) -> CoreResult<Arc<Core>> {
        let demux = Demux::new()?;
        let dispatcher = Arc::new(Dispatcher::new(&config).map_err(CoreError::DemuxFatal)?);
        let capacity = crate::sys::raise_fd_limit().unwrap_or(4096) as usize;
        let packet_pool = PacketPool::new(&config);

        let core = Arc::new(Core {
            registry: Registry::new(capacity),
            demux,
            dispatcher,
            packet_pool,
            running: AtomicBool::new(true),
            last_tick: AtomicU64::new(0),
            start: Instant::now(),
            config,
        });

        core.dispatcher.start(Arc::downgrade(&core));
        Ok(core)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn demux(&self) -> &Demux {
        &self.demux
    }

    pub(crate) fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn packet_pool(&self) -> &PacketPool {
        &self.packet_pool
    }

    /// Cached monotonic clock, refreshed once per reactor cycle.
    pub fn last_tick(&self) -> u64 {
        self.last_tick.load(Ordering::Relaxed)
    }

    pub(crate) fn record_tick(&self) -> u64 {
        let now = self.start.elapsed().as_secs();
        self.last_tick.store(now, Ordering::Relaxed);
        now
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    // ---- Connections ------------------------------------------------------

    /// Adopts an already-open, externally-created fd. The caller hands over
    /// ownership of `fd`; this crate closes it when the connection closes.
    pub fn attach(self: &Arc<Core>, fd: RawFd, protocol: Box<dyn Protocol>) -> CoreResult<ConnHandle> {
        let socket = unsafe { Socket::from_raw_fd(fd) };
        socket.set_nonblocking(true).map_err(CoreError::DemuxFatal)?;
        self.register_socket(socket, protocol)
    }

    pub(crate) fn register_socket(
        &self,
        socket: Socket,
        protocol: Box<dyn Protocol>,
    ) -> CoreResult<ConnHandle> {
        let fd = socket.as_raw_fd();
        let handle = self.registry.open_fd(socket, protocol)?;
        let token = Token(handle.slot_index());

        if let Err(e) = self.demux.attach(fd, token, Ready::readable() | Ready::writable()) {
            let _ = self.registry.clear(handle);
            return Err(CoreError::DemuxFatal(e));
        }

        self.registry.touch(handle, self.last_tick());
        Ok(handle)
    }

    pub fn get_protocol_tag(&self, handle: ConnHandle) -> CoreResult<String> {
        self.with_protocol(handle, |p| p.service_tag().to_string())
    }

    /// Runs `f` against the protocol installed for `handle`. If `handle` was
    /// closed or re-`set_protocol`-ed by `f` itself (directly, or by a
    /// concurrent callback on another thread), the protocol `f` ran against
    /// is orphaned — `registry::with_protocol` hands it back rather than
    /// dropping it, since nothing else still holds it — and its `on_close`
    /// is deferred onto the dispatcher, same as `force_close`'s and
    /// `set_protocol`'s.
    pub(crate) fn with_protocol<R>(
        &self,
        handle: ConnHandle,
        f: impl FnOnce(&mut dyn Protocol) -> R,
    ) -> CoreResult<R> {
        let (result, orphaned) = self.registry.with_protocol(handle, f)?;
        if let Some(orphaned) = orphaned {
            self.dispatcher
                .defer(Task::Global(Box::new(move |_core| orphaned.on_close(handle))));
        }
        Ok(result)
    }

    pub fn set_protocol(&self, handle: ConnHandle, new: Box<dyn Protocol>) -> CoreResult<()> {
        if let Some(old) = self.registry.set_protocol(handle, new)? {
            // Per the resolved Open Question: the swap above is immediately
            // visible to new callbacks; `defer` queues the old protocol's
            // `on_close` behind whatever callback for this handle is still
            // in flight, rather than running it inline here.
            self.dispatcher
                .defer(Task::Global(Box::new(move |_core| old.on_close(handle))));
        }
        Ok(())
    }

    pub fn set_rw_hook(&self, handle: ConnHandle, hook: Option<Box<dyn RwHook>>) -> CoreResult<()> {
        self.registry.set_rw_hook(handle, hook)
    }

    pub fn set_timeout(&self, handle: ConnHandle, seconds: u64) {
        self.registry.set_timeout(handle, seconds);
    }

    pub fn get_timeout(&self, handle: ConnHandle) -> CoreResult<u64> {
        self.registry.timeout(handle)
    }

    pub fn count(&self, service_tag: Option<&str>) -> usize {
        self.registry.count(service_tag)
    }

    /// Detaches `handle` from the reactor and returns the bare fd, after
    /// flushing whatever was already queued. The handle is invalid for any
    /// further call once this returns.
    pub fn hijack(&self, handle: ConnHandle) -> CoreResult<RawFd> {
        let _ = self.flush(handle);
        let (_protocol, socket) = self.registry.clear(handle)?;
        let socket = socket.ok_or(CoreError::NotConnected(handle))?;
        let _ = self.demux.detach(socket.as_raw_fd());
        let _ = self.demux.detach_timer(Token(handle.slot_index()));
        Ok(socket.into_raw_fd())
    }

    /// Unconditionally tears down `handle`: clears the registry slot,
    /// detaches it from the reactor, and schedules the outgoing protocol's
    /// `on_close` on a worker thread. A no-op if the handle is already stale.
    pub fn force_close(&self, handle: ConnHandle) {
        let (protocol, socket) = match self.registry.clear(handle) {
            Ok(v) => v,
            Err(_) => return,
        };
        if let Some(socket) = &socket {
            let _ = self.demux.detach(socket.as_raw_fd());
        }
        let _ = self.demux.detach_timer(Token(handle.slot_index()));
        if let Some(protocol) = protocol {
            self.dispatcher
                .defer(Task::Global(Box::new(move |_core| protocol.on_close(handle))));
        }
    }

    // ---- I/O ----------------------------------------------------------------

    /// Reads once into `buf`. `Ok(IoOutcome::Done(0))` is peer EOF; the
    /// caller decides whether that means close. A read interrupted by a
    /// signal is retried in place — `IoOutcome` never comes back as
    /// `Interrupted` from here, only `Done` or `WouldBlock`.
    pub fn read(&self, handle: ConnHandle, buf: &mut [u8]) -> CoreResult<IoOutcome> {
        loop {
            let hooked = self
                .registry
                .with_rw_hook(handle, |hook| hook.map(|h| h.read(handle, buf)))?;

            let result = match hooked {
                Some(r) => r,
                None => self.registry.with_socket(handle, |s| s.read(buf))?,
            };

            match classify_io(result) {
                Ok(IoOutcome::Interrupted) => continue,
                Ok(outcome) => {
                    self.registry.touch(handle, self.last_tick());
                    return Ok(outcome);
                }
                Err(source) => {
                    self.force_close(handle);
                    return Err(CoreError::Transport { handle, source });
                }
            }
        }
    }

    fn write_with_flags(&self, handle: ConnHandle, bytes: Vec<u8>, flags: PacketFlags) -> CoreResult<()> {
        if !self.registry.validate(handle) {
            return Err(CoreError::NotConnected(handle));
        }

        let mut spins_left = SPIN_FLUSH_ATTEMPTS;
        let packets = crate::writebuf::split_large_write(bytes, &self.packet_pool, flags, || {
            if spins_left == 0 {
                return false;
            }
            spins_left -= 1;
            self.spin_flush_others(handle)
        })?;

        self.registry.with_write_queue(handle, |wb| {
            for packet in packets {
                wb.enqueue(packet);
            }
        })?;
        self.flush(handle)
    }

    /// Gives the packet pool's `SpinFlush` overflow policy a chance to free
    /// a packet by opportunistically flushing other open connections'
    /// write queues. Returns `true` if it found any open connection to
    /// flush (whether or not that actually freed a packet).
    fn spin_flush_others(&self, origin: ConnHandle) -> bool {
        let mut found = false;
        self.registry.for_each_open(None, |handle| {
            if handle == origin {
                return;
            }
            found = true;
            let _ = self.flush(handle);
        });
        found
    }

    pub fn write(&self, handle: ConnHandle, bytes: Vec<u8>) -> CoreResult<()> {
        self.write_with_flags(
            handle,
            bytes,
            PacketFlags {
                urgent: false,
                can_interrupt: true,
                close_after: false,
            },
        )
    }

    pub fn write_urgent(&self, handle: ConnHandle, bytes: Vec<u8>) -> CoreResult<()> {
        self.write_with_flags(
            handle,
            bytes,
            PacketFlags {
                urgent: true,
                can_interrupt: true,
                close_after: false,
            },
        )
    }

    /// Enqueues `bytes`, then force-closes the connection once the queue
    /// (including anything already pending ahead of it) fully drains.
    pub fn write_then_close(&self, handle: ConnHandle, bytes: Vec<u8>) -> CoreResult<()> {
        self.write_with_flags(
            handle,
            bytes,
            PacketFlags {
                urgent: false,
                can_interrupt: true,
                close_after: true,
            },
        )
    }

    /// Queues a file region for zero-copy transmission via `sendfile`, or
    /// through the installed `RwHook` if one is set.
    pub fn sendfile(
        &self,
        handle: ConnHandle,
        file: File,
        offset: u64,
        len: u64,
        keep_open: bool,
    ) -> CoreResult<()> {
        if !self.registry.validate(handle) {
            return Err(CoreError::NotConnected(handle));
        }
        let flags = PacketFlags {
            urgent: false,
            can_interrupt: true,
            close_after: false,
        };
        let packet = Packet::file(file, offset, len, keep_open, flags);
        self.registry.with_write_queue(handle, |wb| wb.enqueue(packet))?;
        self.flush(handle)
    }

    /// Opportunistically drains the write queue without blocking. Called
    /// after every enqueue and whenever the reactor sees writable readiness.
    pub fn flush(&self, handle: ConnHandle) -> CoreResult<()> {
        let outcome = self.registry.with_socket_and_hook(handle, |socket, hook| {
            self.registry
                .with_write_queue(handle, |wb| wb.flush(handle, socket, hook, &self.packet_pool))
        })??;

        match outcome {
            FlushOutcome::Drained | FlushOutcome::WouldBlock => Ok(()),
            FlushOutcome::DrainedThenClose => {
                self.force_close(handle);
                Ok(())
            }
            FlushOutcome::Error => {
                self.force_close(handle);
                Err(CoreError::Transport {
                    handle,
                    source: io::Error::new(io::ErrorKind::Other, "write queue flush failed"),
                })
            }
        }
    }

    // ---- Deferred work ------------------------------------------------------

    pub fn defer(&self, body: impl FnOnce(&Core) + Send + 'static) {
        self.dispatcher.defer(Task::Global(Box::new(body)));
    }

    /// Runs `body` on a worker thread under `handle`'s busy lock. If the
    /// lock is already held the task is rescheduled; if `handle` is stale by
    /// the time a worker picks it up, `fallback` runs instead (if given).
    pub fn task(
        &self,
        handle: ConnHandle,
        body: impl FnOnce(&Core, ConnHandle) + Send + 'static,
        fallback: Option<Box<dyn FnOnce(&Core, ConnHandle) + Send>>,
    ) {
        self.dispatcher.defer(Task::PerConnection {
            handle,
            body: Box::new(body),
            fallback,
        });
    }

    /// Broadcasts `body` to every open connection tagged `service_tag`,
    /// skipping `origin` if given, then calls `on_finish` once.
    pub fn each(
        &self,
        origin: Option<ConnHandle>,
        service_tag: impl Into<String>,
        body: impl Fn(&Core, ConnHandle) + Send + Sync + 'static,
        on_finish: Option<Box<dyn FnOnce(&Core) + Send>>,
    ) {
        self.dispatcher.defer(Task::Broadcast {
            origin,
            service_tag: service_tag.into(),
            body: Arc::new(body),
            on_finish,
            cursor: 0,
        });
    }

    // ---- Timers -------------------------------------------------------------

    /// Schedules `task` to run every `period`, `repeats` times (`0` means
    /// forever), calling `on_finish` once the timer stops — whether because
    /// its repeat count was exhausted or because it was force-closed.
    pub fn run_every(
        self: &Arc<Core>,
        period: Duration,
        repeats: u64,
        task: impl FnMut(&Core) + Send + 'static,
        on_finish: Option<Box<dyn FnOnce(&Core) + Send>>,
    ) -> CoreResult<ConnHandle> {
        let proto = crate::timer_proto::TimerProto::new(
            Arc::downgrade(self),
            Box::new(task),
            on_finish,
            repeats,
        );
        let handle = self.registry.open_virtual(Box::new(proto))?;
        let token = Token(handle.slot_index());

        if let Err(e) = self.demux.attach_timer(token, period) {
            let _ = self.registry.clear(handle);
            return Err(CoreError::DemuxFatal(e));
        }
        Ok(handle)
    }

    /// One-shot variant of `run_every`: fires `task` once after `delay`.
    pub fn run_after(
        self: &Arc<Core>,
        delay: Duration,
        task: impl FnOnce(&Core) + Send + 'static,
    ) -> CoreResult<ConnHandle> {
        let mut task = Some(task);
        self.run_every(
            delay,
            1,
            move |core| {
                if let Some(t) = task.take() {
                    t(core);
                }
            },
            None,
        )
    }

    /// Binds and starts accepting on `addr`; `factory` builds a protocol for
    /// each accepted connection.
    pub fn listen(
        self: &Arc<Core>,
        addr: std::net::SocketAddr,
        factory: impl Fn(&Core) -> Box<dyn Protocol> + Send + Sync + 'static,
    ) -> CoreResult<ConnHandle> {
        crate::listener_proto::bind(self, addr, Box::new(factory))
    }
}
