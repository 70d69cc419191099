//! Cross-thread wake source the dispatcher uses to pull the reactor out of
//! a blocking `demux.wait` when a worker finishes flushing a connection's
//! write queue. Linux rides the existing `eventfd`; other platforms fall
//! back to a non-blocking self-pipe, read on wake and drained in one shot.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

#[cfg(target_os = "linux")]
pub struct Waker(super::eventfd::EventFd);

#[cfg(target_os = "linux")]
impl Waker {
    pub fn new() -> io::Result<Waker> {
        Ok(Waker(super::eventfd::EventFd::new()?))
    }

    pub fn wake(&self) -> io::Result<()> {
        self.0.write(1)
    }

    pub fn drain(&self) -> io::Result<()> {
        match self.0.read() {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(target_os = "linux")]
impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

#[cfg(not(target_os = "linux"))]
pub struct Waker {
    read_fd: super::fd::FileDesc,
    write_fd: super::fd::FileDesc,
}

#[cfg(not(target_os = "linux"))]
impl Waker {
    pub fn new() -> io::Result<Waker> {
        let mut fds = [0 as RawFd; 2];
        syscall!(pipe(fds.as_mut_ptr()))?;
        let read_fd = unsafe { super::fd::FileDesc::new(fds[0]) };
        let write_fd = unsafe { super::fd::FileDesc::new(fds[1]) };
        read_fd.set_nonblocking(true)?;
        write_fd.set_nonblocking(true)?;
        read_fd.set_cloexec()?;
        write_fd.set_cloexec()?;
        Ok(Waker { read_fd, write_fd })
    }

    pub fn wake(&self) -> io::Result<()> {
        use std::io::Write;
        match (&self.write_fd).write(&[1u8]) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn drain(&self) -> io::Result<()> {
        use std::io::Read;
        let mut buf = [0u8; 64];
        loop {
            match (&self.read_fd).read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) if n < buf.len() => return Ok(()),
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.read_fd.raw()
    }
}
