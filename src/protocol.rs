use crate::core::Core;
use crate::token::ConnHandle;

/// User-provided connection handler, installed per slot via
/// `Registry::set_protocol`/`Server::attach`.
///
/// All callbacks but `on_close` run with the slot's `busy_lock` held, which
/// is this crate's only cross-callback ordering guarantee: for one handle,
/// no two of `on_data`, `on_ready`, `ping`, or a per-connection task body
/// ever run at once.
pub trait Protocol: Send {
    /// Stable tag used to scope `Server::each` broadcasts. The default
    /// (empty string) opts a connection out of every broadcast.
    fn service_tag(&self) -> &str {
        ""
    }

    /// Bytes are readable; must read until `WouldBlock` (`core.read` already
    /// loops internally for a single call, but a protocol parsing a stream
    /// may need several calls before giving up for this wakeup).
    fn on_data(&mut self, core: &Core, handle: ConnHandle);

    /// The write queue has drained below a threshold, or the kernel
    /// reported writable readiness with nothing of our own queued yet.
    fn on_ready(&mut self, _core: &Core, _handle: ConnHandle) {}

    /// The server is shutting down; this fires once, before the final
    /// write-queue drain and `on_close`.
    fn on_shutdown(&mut self, _core: &Core, _handle: ConnHandle) {}

    /// Final cleanup. Runs on a worker thread after the slot is already
    /// cleared — `handle` is no longer valid for any `Core`/`Server` call.
    fn on_close(self: Box<Self>, _handle: ConnHandle) {}

    /// The idle watchdog tripped. Default behavior force-closes; override
    /// to send a keepalive instead.
    fn ping(&mut self, core: &Core, handle: ConnHandle) {
        core.force_close(handle);
    }
}
