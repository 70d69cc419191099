use std::io;

use crate::token::ConnHandle;

/// Per-connection transport interceptor — the TLS/instrumentation extension
/// point. Installing a hook on a slot disables `sendfile` for it: file
/// packets stream through `pread` and this trait's `write` instead.
///
/// `read`/`write` mirror the non-blocking contract of a raw socket:
/// `Ok(0)` means peer EOF, `io::ErrorKind::WouldBlock` means try later.
/// Every method but `on_clear` runs with the slot's `busy_lock` held, same
/// as `Protocol` callbacks.
pub trait RwHook: Send {
    fn read(&mut self, handle: ConnHandle, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, handle: ConnHandle, buf: &[u8]) -> io::Result<usize>;

    /// Drains any hook-internal buffering toward the underlying transport.
    /// Returns the number of bytes still pending after this call.
    fn flush(&mut self, handle: ConnHandle) -> io::Result<usize>;

    /// Called with `slot.lock` held when the connection closes. Must release
    /// hook-owned resources without re-entering the registry for `handle`.
    fn on_clear(&mut self, handle: ConnHandle);
}
