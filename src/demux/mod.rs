//! Portable demultiplexer: `epoll` on Linux, `kqueue` on the BSD family.
//! This is the sole boundary between the reactor and raw `libc` event
//! polling; everything above `Demux` works in `Token`/`Ready` only.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crate::error::{CoreError, CoreResult};
use crate::ready::Ready;
use crate::token::Token;

mod timer;

pub use timer::TimerRegistry;

#[cfg(target_os = "linux")]
mod backend {
    pub use crate::sys::epoll::{Epoll as Inner, Events as SysEvents};
}

#[cfg(not(target_os = "linux"))]
mod backend {
    pub use crate::sys::kqueue::{Events as SysEvents, Kqueue as Inner};
}

use backend::{Inner, SysEvents};

/// A batch of readiness notifications produced by one `Demux::wait` call.
pub struct Events {
    inner: SysEvents,
}

impl Events {
    pub fn with_capacity(n: usize) -> Events {
        Events {
            inner: SysEvents::with_capacity(n),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> EventsIter<'_> {
        EventsIter {
            events: self,
            idx: 0,
        }
    }
}

pub struct EventsIter<'a> {
    events: &'a Events,
    idx: usize,
}

impl<'a> Iterator for EventsIter<'a> {
    type Item = (Token, Ready);

    fn next(&mut self) -> Option<(Token, Ready)> {
        let item = self.events.inner.get(self.idx)?;
        self.idx += 1;
        Some(item)
    }
}

/// Thin, portable wrapper over the kernel's edge-triggered readiness API.
/// Owns the kernel event object and the timer sources registered against it;
/// never exposes level-triggered mode.
pub struct Demux {
    inner: Inner,
    timers: TimerRegistry,
}

impl Demux {
    pub fn new() -> CoreResult<Demux> {
        let inner = Inner::new().map_err(CoreError::DemuxFatal)?;
        Ok(Demux {
            inner,
            timers: TimerRegistry::new(),
        })
    }

    pub fn attach(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        self.inner.add(fd, token, interest)
    }

    pub fn reattach(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        self.inner.modify(fd, token, interest)
    }

    pub fn detach(&self, fd: RawFd) -> io::Result<()> {
        self.inner.delete(fd)
    }

    /// Registers a repeating timer source firing every `period`, surfacing
    /// as a readable event on `token`. Linux backs this with `timerfd`;
    /// BSD uses `kqueue`'s native `EVFILT_TIMER`.
    pub fn attach_timer(&self, token: Token, period: Duration) -> io::Result<()> {
        self.timers.attach(&self.inner, token, period)
    }

    pub fn detach_timer(&self, token: Token) -> io::Result<()> {
        self.timers.detach(&self.inner, token)
    }

    /// Consumes a fired timer's expiration counter. A no-op on the kqueue
    /// backend, where `EVFILT_TIMER` auto-rearms.
    pub fn ack_timer(&self, token: Token) -> io::Result<()> {
        self.timers.ack(token)
    }

    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> CoreResult<usize> {
        self.inner
            .wait(&mut events.inner, timeout)
            .map_err(CoreError::DemuxFatal)?;
        Ok(events.len())
    }
}

impl AsRawFd for Demux {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
