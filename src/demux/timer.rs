use std::io;
use std::sync::Mutex;
use std::time::Duration;

use crate::token::Token;

#[cfg(target_os = "linux")]
mod platform {
    use super::*;
    use crate::sys::epoll::Epoll;
    use crate::sys::timerfd::{TimerFd, TimerSpec};
    use indexmap::IndexMap;

    /// Maps each registered timer `Token` to the `timerfd` backing it. Kept
    /// alive here since dropping a `TimerFd` closes it.
    pub struct Inner(Mutex<IndexMap<Token, TimerFd>>);

    impl Inner {
        pub fn new() -> Inner {
            Inner(Mutex::new(IndexMap::new()))
        }

        pub fn attach(&self, epoll: &Epoll, token: Token, period: Duration) -> io::Result<()> {
            let fd = TimerFd::new()?;
            fd.settime(TimerSpec {
                interval: period,
                value: period,
            })?;

            use std::os::unix::io::AsRawFd;
            epoll.add(fd.as_raw_fd(), token, crate::ready::Ready::readable())?;

            self.0.lock().unwrap().insert(token, fd);
            Ok(())
        }

        pub fn detach(&self, epoll: &Epoll, token: Token) -> io::Result<()> {
            if let Some(fd) = self.0.lock().unwrap().shift_remove(&token) {
                use std::os::unix::io::AsRawFd;
                epoll.delete(fd.as_raw_fd())?;
            }
            Ok(())
        }

        pub fn ack(&self, token: Token) -> io::Result<()> {
            if let Some(fd) = self.0.lock().unwrap().get(&token) {
                // A periodic timerfd may have ticked more than once between
                // reactor cycles; drain the expiration count and ignore it.
                let _ = fd.read()?;
            }
            Ok(())
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod platform {
    use super::*;
    use crate::sys::kqueue::Kqueue;

    pub struct Inner;

    impl Inner {
        pub fn new() -> Inner {
            Inner
        }

        pub fn attach(&self, kq: &Kqueue, token: Token, period: Duration) -> io::Result<()> {
            kq.add_timer(token, period)
        }

        pub fn detach(&self, kq: &Kqueue, token: Token) -> io::Result<()> {
            kq.delete_timer(token)
        }

        pub fn ack(&self, _token: Token) -> io::Result<()> {
            Ok(())
        }
    }
}

use super::Inner as DemuxInner;
use platform::Inner as PlatformInner;

pub struct TimerRegistry(PlatformInner);

impl TimerRegistry {
    pub fn new() -> TimerRegistry {
        TimerRegistry(PlatformInner::new())
    }

    pub fn attach(&self, demux: &DemuxInner, token: Token, period: Duration) -> io::Result<()> {
        self.0.attach(demux, token, period)
    }

    pub fn detach(&self, demux: &DemuxInner, token: Token) -> io::Result<()> {
        self.0.detach(demux, token)
    }

    pub fn ack(&self, token: Token) -> io::Result<()> {
        self.0.ack(token)
    }
}
