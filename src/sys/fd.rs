use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

/// An owned raw file descriptor, closed on drop.
///
/// Every socket, timerfd, eventfd, and open()'d file the engine touches is
/// held as a `FileDesc` so closing is never forgotten on an error path.
#[derive(Debug)]
pub struct FileDesc(File);

impl FileDesc {
    /// Takes ownership of an already-open fd.
    ///
    /// # Safety
    /// `fd` must be a valid, open file descriptor not owned elsewhere.
    pub unsafe fn new(fd: RawFd) -> Self {
        FileDesc(File::from_raw_fd(fd))
    }

    pub fn raw(&self) -> RawFd {
        self.0.as_raw_fd()
    }

    pub fn into_raw(self) -> RawFd {
        self.0.into_raw_fd()
    }

    pub fn try_clone(&self) -> io::Result<FileDesc> {
        Ok(FileDesc(self.0.try_clone()?))
    }

    pub fn duplicate(&self) -> io::Result<FileDesc> {
        let fd = syscall!(fcntl(self.raw(), libc::F_DUPFD_CLOEXEC, 0))?;
        Ok(unsafe { FileDesc::new(fd) })
    }

    pub fn set_cloexec(&self) -> io::Result<()> {
        syscall!(fcntl(self.raw(), libc::F_SETFD, libc::FD_CLOEXEC)).map(|_| ())
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let flags = syscall!(fcntl(self.raw(), libc::F_GETFL, 0))?;
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        syscall!(fcntl(self.raw(), libc::F_SETFL, flags)).map(|_| ())
    }

    /// `pread(2)`: read `buf.len()` bytes at `offset` without disturbing the
    /// fd's own seek position. Used by the file-packet flush path when a
    /// read/write hook is installed and `sendfile` cannot be used.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.0.read_at(buf, offset)
    }
}

impl FromRawFd for FileDesc {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        FileDesc(File::from_raw_fd(fd))
    }
}

impl AsRawFd for FileDesc {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl IntoRawFd for FileDesc {
    fn into_raw_fd(self) -> RawFd {
        self.0.into_raw_fd()
    }
}

impl Read for FileDesc {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Read for &FileDesc {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.0).read(buf)
    }
}

impl Write for FileDesc {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for &FileDesc {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.0).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for FileDesc {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.0.seek(pos)
    }
}
