use std::cmp;
use std::io::{self, Error, ErrorKind, IoSlice, IoSliceMut};
use std::mem;
use std::net::{Shutdown, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use libc::{c_int, c_void, socklen_t, MSG_PEEK, SOCK_CLOEXEC};

use super::commom::{FromInner, IntoInner};
use super::fd::FileDesc;

fn setsockopt<T>(sock: &Socket, level: c_int, opt: c_int, payload: T) -> io::Result<()> {
    let payload = &payload as *const T as *const c_void;
    syscall!(setsockopt(
        sock.0.raw(),
        level,
        opt,
        payload,
        mem::size_of::<T>() as libc::socklen_t
    ))?;
    Ok(())
}

fn getsockopt<T: Copy>(sock: &Socket, level: c_int, opt: c_int) -> io::Result<T> {
    let mut slot: T = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<T>() as libc::socklen_t;
    syscall!(getsockopt(
        sock.0.raw(),
        level,
        opt,
        &mut slot as *mut _ as *mut _,
        &mut len
    ))?;
    assert_eq!(len as usize, mem::size_of::<T>());
    Ok(slot)
}

struct _SocketAddrV4 {
    #[allow(dead_code)]
    inner: libc::sockaddr_in,
}

struct _SocketAddrV6 {
    #[allow(dead_code)]
    inner: libc::sockaddr_in6,
}

impl FromInner<libc::sockaddr_in> for SocketAddrV4 {
    fn from_inner(addr: libc::sockaddr_in) -> SocketAddrV4 {
        unsafe { mem::transmute(_SocketAddrV4 { inner: addr }) }
    }
}

impl FromInner<libc::sockaddr_in6> for SocketAddrV6 {
    fn from_inner(addr: libc::sockaddr_in6) -> SocketAddrV6 {
        unsafe { mem::transmute(_SocketAddrV6 { inner: addr }) }
    }
}

impl<'a> IntoInner<(*const libc::sockaddr, libc::socklen_t)> for &'a SocketAddr {
    fn into_inner(self) -> (*const libc::sockaddr, libc::socklen_t) {
        match *self {
            SocketAddr::V4(ref a) => (
                a as *const _ as *const _,
                mem::size_of_val(a) as libc::socklen_t,
            ),
            SocketAddr::V6(ref a) => (
                a as *const _ as *const _,
                mem::size_of_val(a) as libc::socklen_t,
            ),
        }
    }
}

fn sockaddr_to_addr(storage: &libc::sockaddr_storage, len: usize) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            assert!(len >= mem::size_of::<libc::sockaddr_in>());
            Ok(SocketAddr::V4(FromInner::from_inner(unsafe {
                *(storage as *const _ as *const libc::sockaddr_in)
            })))
        }
        libc::AF_INET6 => {
            assert!(len >= mem::size_of::<libc::sockaddr_in6>());
            Ok(SocketAddr::V6(FromInner::from_inner(unsafe {
                *(storage as *const _ as *const libc::sockaddr_in6)
            })))
        }
        _ => Err(Error::new(ErrorKind::InvalidInput, "invalid address family")),
    }
}

/// A non-blocking, close-on-exec raw socket.
///
/// This is the primitive the listener and registry build connections on; it
/// never touches `std::net` so the engine can attach fds it did not itself
/// create (the external `attach` API).
pub struct Socket(FileDesc);

impl Socket {
    pub fn new(addr: &SocketAddr, ty: c_int) -> io::Result<Socket> {
        let fam = match *addr {
            SocketAddr::V4(..) => libc::AF_INET,
            SocketAddr::V6(..) => libc::AF_INET6,
        };
        Socket::new_raw(fam, ty)
    }

    pub fn new_raw(fam: c_int, ty: c_int) -> io::Result<Socket> {
        match syscall!(socket(fam, ty | SOCK_CLOEXEC, 0)) {
            Ok(fd) => return Ok(Socket(unsafe { FileDesc::new(fd) })),
            Err(ref e) if e.raw_os_error() == Some(libc::EINVAL) => {}
            Err(e) => return Err(e),
        }

        let fd = syscall!(socket(fam, ty, 0))?;
        let fd = unsafe { FileDesc::new(fd) };
        fd.set_cloexec()?;
        Ok(Socket(fd))
    }

    pub fn connect_timeout(&self, addr: &SocketAddr, timeout: Duration) -> io::Result<()> {
        self.set_nonblocking(true)?;
        let (addrp, len) = addr.into_inner();
        let r = syscall!(connect(self.0.raw(), addrp, len));

        match r {
            Ok(_) => return Ok(()),
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(e),
        }

        if timeout.as_secs() == 0 && timeout.subsec_nanos() == 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "cannot set a 0 duration timeout",
            ));
        }

        let mut pollfd = libc::pollfd {
            fd: self.0.raw(),
            events: libc::POLLOUT,
            revents: 0,
        };

        let start = Instant::now();
        loop {
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(Error::new(ErrorKind::TimedOut, "connection timed out"));
            }

            let remaining = timeout - elapsed;
            let mut ms = remaining
                .as_secs()
                .saturating_mul(1_000)
                .saturating_add(remaining.subsec_millis() as u64);
            if ms == 0 {
                ms = 1;
            }
            let ms = cmp::min(ms, c_int::MAX as u64) as c_int;

            match unsafe { libc::poll(&mut pollfd, 1, ms) } {
                -1 => {
                    let err = Error::last_os_error();
                    if err.kind() != ErrorKind::Interrupted {
                        return Err(err);
                    }
                }
                0 => {}
                _ => {
                    if pollfd.revents & libc::POLLHUP != 0 {
                        let e = self.take_error()?.unwrap_or_else(|| {
                            Error::new(ErrorKind::Other, "no error set after POLLHUP")
                        });
                        return Err(e);
                    }
                    return Ok(());
                }
            }
        }
    }

    pub fn accept(
        &self,
        storage: *mut libc::sockaddr,
        len: *mut socklen_t,
    ) -> io::Result<Socket> {
        let res = loop {
            match syscall!(accept4(self.0.raw(), storage, len, SOCK_CLOEXEC)) {
                Err(ref e) if e.kind() == ErrorKind::Interrupted => (),
                other => break other,
            }
        };

        match res {
            Ok(fd) => return Ok(Socket(unsafe { FileDesc::new(fd) })),
            Err(ref e) if e.raw_os_error() == Some(libc::ENOSYS) => {}
            Err(e) => return Err(e),
        }

        let fd = loop {
            match syscall!(accept(self.0.raw(), storage, len)) {
                Err(ref e) if e.kind() == ErrorKind::Interrupted => (),
                other => break other,
            }
        }?;

        let fd = unsafe { FileDesc::new(fd) };
        fd.set_cloexec()?;
        Ok(Socket(fd))
    }

    pub fn accept_addr(&self) -> io::Result<(Socket, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;
        let sock = self.accept(&mut storage as *mut _ as *mut _, &mut len)?;
        let addr = sockaddr_to_addr(&storage, len as usize)?;
        Ok((sock, addr))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;
        syscall!(getsockname(
            self.0.raw(),
            &mut storage as *mut _ as *mut _,
            &mut len
        ))?;
        sockaddr_to_addr(&storage, len as usize)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;
        syscall!(getpeername(
            self.0.raw(),
            &mut storage as *mut _ as *mut _,
            &mut len
        ))?;
        sockaddr_to_addr(&storage, len as usize)
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let (addrp, len) = addr.into_inner();
        syscall!(bind(self.0.raw(), addrp, len)).map(|_| ())
    }

    pub fn listen(&self, backlog: c_int) -> io::Result<()> {
        syscall!(listen(self.0.raw(), backlog)).map(|_| ())
    }

    pub fn duplicate(&self) -> io::Result<Socket> {
        self.0.duplicate().map(Socket)
    }

    fn recv_with_flags(&self, buf: &mut [u8], flags: c_int) -> io::Result<usize> {
        let ret = syscall!(recv(
            self.0.raw(),
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            flags
        ))?;
        Ok(ret as usize)
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv_with_flags(buf, 0)
    }

    pub fn peek(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv_with_flags(buf, MSG_PEEK)
    }

    pub fn read_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        let ret = syscall!(readv(
            self.0.raw(),
            bufs.as_ptr() as *const libc::iovec,
            cmp::min(bufs.len(), c_int::MAX as usize) as c_int
        ))?;
        Ok(ret as usize)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let ret = syscall!(send(
            self.0.raw(),
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL
        ))?;
        Ok(ret as usize)
    }

    pub fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let ret = syscall!(writev(
            self.0.raw(),
            bufs.as_ptr() as *const libc::iovec,
            cmp::min(bufs.len(), c_int::MAX as usize) as c_int
        ))?;
        Ok(ret as usize)
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        let how = match how {
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Both => libc::SHUT_RDWR,
        };
        syscall!(shutdown(self.0.raw(), how))?;
        Ok(())
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        setsockopt(self, libc::IPPROTO_TCP, libc::TCP_NODELAY, nodelay as c_int)
    }

    pub fn set_reuseaddr(&self, reuse: bool) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_REUSEADDR, reuse as c_int)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.0.set_nonblocking(nonblocking)
    }

    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let raw: c_int = getsockopt(self, libc::SOL_SOCKET, libc::SO_ERROR)?;
        if raw == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(raw)))
        }
    }

    pub fn fd(&self) -> &FileDesc {
        &self.0
    }

    pub fn into_fd(self) -> FileDesc {
        self.0
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.raw()
    }
}

impl std::os::unix::io::FromRawFd for Socket {
    /// # Safety
    /// `fd` must be an open, non-shared file descriptor the caller is
    /// transferring ownership of (e.g. the external `attach` API adopting a
    /// socket the embedder opened itself).
    unsafe fn from_raw_fd(fd: RawFd) -> Socket {
        Socket(FileDesc::new(fd))
    }
}

impl std::os::unix::io::IntoRawFd for Socket {
    fn into_raw_fd(self) -> RawFd {
        self.0.into_raw()
    }
}
