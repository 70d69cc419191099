//! The internal `Protocol` installed on a listening socket's slot.

use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use crate::core::Core;
use crate::error::{CoreError, CoreResult};
use crate::protocol::Protocol;
use crate::ready::Ready;
use crate::sys::socket::Socket;
use crate::token::{ConnHandle, Token};

type Factory = dyn Fn(&Core) -> Box<dyn Protocol> + Send + Sync;

pub(crate) struct ListenerProto {
    socket: Socket,
    factory: Box<Factory>,
}

pub(crate) fn bind(core: &Arc<Core>, addr: SocketAddr, factory: Box<Factory>) -> CoreResult<ConnHandle> {
    let socket = Socket::new(&addr, libc::SOCK_STREAM).map_err(CoreError::ListenFailed)?;
    socket.set_reuseaddr(true).map_err(CoreError::ListenFailed)?;
    socket.bind(&addr).map_err(CoreError::ListenFailed)?;
    socket.listen(1024).map_err(CoreError::ListenFailed)?;
    socket.set_nonblocking(true).map_err(CoreError::ListenFailed)?;

    let fd = socket.as_raw_fd();
    let proto = ListenerProto { socket, factory };

    let handle = core.registry().open_virtual(Box::new(proto))?;
    let token = Token(handle.slot_index());
    if let Err(e) = core.demux().attach(fd, token, Ready::readable()) {
        let _ = core.registry().clear(handle);
        return Err(CoreError::DemuxFatal(e));
    }
    Ok(handle)
}

impl Protocol for ListenerProto {
    fn service_tag(&self) -> &str {
        ""
    }

    /// Accepts until `EAGAIN`, per the edge-triggered contract: a single
    /// readiness notification can represent more than one pending
    /// connection, so this must drain the backlog instead of accepting once.
    fn on_data(&mut self, core: &Core, _handle: ConnHandle) {
        let margin = core.config().listener_accept_margin;

        loop {
            if core.count(None) + margin >= core.registry().capacity() {
                log::warn!(target: "core::listener", "near capacity, pausing accept loop");
                break;
            }

            match self.socket.accept_addr() {
                Ok((conn, _addr)) => {
                    if let Err(e) = conn.set_nonblocking(true) {
                        log::warn!(target: "core::listener", "accepted socket setup failed: {e}");
                        continue;
                    }
                    let _ = conn.set_nodelay(true);
                    let protocol = (self.factory)(core);
                    if let Err(e) = core.register_socket(conn, protocol) {
                        log::warn!(target: "core::listener", "failed to register accepted connection: {e}");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!(target: "core::listener", "accept failed: {e}");
                    break;
                }
            }
        }
    }
}
