//! Raw `kqueue(2)` bindings: the BSD-family backend for the demultiplexer,
//! mirroring `sys::epoll`'s shape. `EV_CLEAR` gives edge-triggered readiness
//! for read/write filters; `EVFILT_TIMER` with `EV_CLEAR` auto-rearms a
//! periodic timer without an explicit consume step.

use std::io::{self, ErrorKind};
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;
use std::time::Duration;

use libc::{EVFILT_READ, EVFILT_TIMER, EVFILT_WRITE, EV_ADD, EV_CLEAR, EV_DELETE, EV_EOF, EV_ERROR};

use crate::ready::Ready;
use crate::token::Token;

pub struct Kqueue {
    kq: RawFd,
}

impl Kqueue {
    pub fn new() -> io::Result<Kqueue> {
        let kq = syscall!(kqueue())?;
        syscall!(fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC))?;
        Ok(Kqueue { kq })
    }

    pub fn wait(&self, evts: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let ts = timeout.map(|to| libc::timespec {
            tv_sec: to.as_secs() as libc::time_t,
            tv_nsec: to.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts.as_ref().map_or(ptr::null(), |t| t as *const _);

        // A spurious EINTR is not a demux failure; retry in place rather
        // than surfacing it to the reactor, same as `Socket::accept`'s
        // retry loop.
        let cnt = loop {
            match syscall!(kevent(
                self.kq,
                ptr::null(),
                0,
                evts.events.as_mut_ptr(),
                evts.events.capacity() as i32,
                ts_ptr
            )) {
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                other => break other,
            }
        }?;

        unsafe { evts.events.set_len(cnt as usize) };
        Ok(())
    }

    pub fn add(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        self.apply(fd, token, interest, EV_ADD | EV_CLEAR)
    }

    pub fn modify(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        // kqueue has no in-place modify; re-`EV_ADD` overwrites the filter.
        self.apply(fd, token, interest, EV_ADD | EV_CLEAR)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut changes = Vec::with_capacity(2);
        changes.push(kevent_entry(fd, EVFILT_READ, EV_DELETE, 0));
        changes.push(kevent_entry(fd, EVFILT_WRITE, EV_DELETE, 0));
        // Either filter may not have been registered; ignore ENOENT per-entry
        // by routing through `kevent` directly rather than `syscall!`.
        unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as i32,
                ptr::null_mut(),
                0,
                ptr::null(),
            );
        }
        Ok(())
    }

    fn apply(&self, fd: RawFd, token: Token, interest: Ready, flags: u16) -> io::Result<()> {
        let mut changes = Vec::with_capacity(2);

        if interest.is_readable() {
            changes.push(kevent_entry_udata(fd, EVFILT_READ, flags, token));
        }
        if interest.is_writable() {
            changes.push(kevent_entry_udata(fd, EVFILT_WRITE, flags, token));
        }

        syscall!(kevent(
            self.kq,
            changes.as_ptr(),
            changes.len() as i32,
            ptr::null_mut(),
            0,
            ptr::null()
        ))?;

        Ok(())
    }

    /// Registers a recurring `EVFILT_TIMER` source keyed by `token`, firing
    /// every `period`. kqueue timers auto-rearm; there is no read-to-consume
    /// step analogous to `timerfd`.
    pub fn add_timer(&self, token: Token, period: Duration) -> io::Result<()> {
        let millis = period.as_millis().max(1) as isize;
        let kev = libc::kevent {
            ident: usize::from(token),
            filter: EVFILT_TIMER,
            flags: EV_ADD | EV_CLEAR,
            fflags: 0,
            data: millis,
            udata: usize::from(token) as *mut libc::c_void,
        };

        syscall!(kevent(self.kq, &kev, 1, ptr::null_mut(), 0, ptr::null()))?;
        Ok(())
    }

    pub fn delete_timer(&self, token: Token) -> io::Result<()> {
        let kev = libc::kevent {
            ident: usize::from(token),
            filter: EVFILT_TIMER,
            flags: EV_DELETE,
            fflags: 0,
            data: 0,
            udata: ptr::null_mut(),
        };
        unsafe {
            libc::kevent(self.kq, &kev, 1, ptr::null_mut(), 0, ptr::null());
        }
        Ok(())
    }
}

fn kevent_entry(fd: RawFd, filter: i16, flags: u16, token: usize) -> libc::kevent {
    libc::kevent {
        ident: fd as usize,
        filter,
        flags,
        fflags: 0,
        data: 0,
        udata: token as *mut libc::c_void,
    }
}

fn kevent_entry_udata(fd: RawFd, filter: i16, flags: u16, token: Token) -> libc::kevent {
    kevent_entry(fd, filter, flags, usize::from(token))
}

impl AsRawFd for Kqueue {
    fn as_raw_fd(&self) -> RawFd {
        self.kq
    }
}

impl Drop for Kqueue {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.kq);
        }
    }
}

pub struct Events {
    events: Vec<libc::kevent>,
}

impl Events {
    pub fn with_capacity(n: usize) -> Events {
        Events {
            events: Vec::with_capacity(n),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.events.capacity()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Returns `(token, readiness)` for event `idx`. A fired `EVFILT_TIMER`
    /// event surfaces as `readable` so the reactor's generic event-dispatch
    /// path (which only branches on readability) handles it uniformly.
    #[inline]
    pub fn get(&self, idx: usize) -> Option<(Token, Ready)> {
        self.events.get(idx).map(|raw| {
            let mut kind = Ready::empty();

            if raw.flags & EV_ERROR != 0 {
                kind = kind | Ready::error();
            }
            if raw.flags & EV_EOF != 0 {
                kind = kind | Ready::hup();
            }

            match raw.filter {
                EVFILT_READ | EVFILT_TIMER => kind = kind | Ready::readable(),
                EVFILT_WRITE => kind = kind | Ready::writable(),
                _ => {}
            }

            (Token(raw.udata as usize), kind)
        })
    }
}
