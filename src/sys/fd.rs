use std::cmp;
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use libc::{self, c_int, c_void};

use super::commom::{AsInner, FromInner, IntoInner};

/// An owned, raw Unix file descriptor with `std`-free read/write primitives.
///
/// Grounded on the pattern `sys::socket::Socket` expects of its inner
/// descriptor (`raw`, `duplicate`, vectored read/write, `set_cloexec`).
#[derive(Debug)]
pub struct FileDesc(RawFd);

const READ_LIMIT: usize = libc::ssize_t::MAX as usize;

impl FileDesc {
    pub fn new(fd: RawFd) -> FileDesc {
        FileDesc(fd)
    }

    pub fn raw(&self) -> RawFd {
        self.0
    }

    /// Extracts the raw file descriptor without closing it.
    pub fn into_raw(self) -> RawFd {
        let fd = self.0;
        mem::forget(self);
        fd
    }

    pub fn try_clone(&self) -> io::Result<FileDesc> {
        self.duplicate()
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let ret = syscall!(read(
            self.0,
            buf.as_mut_ptr() as *mut c_void,
            cmp::min(buf.len(), READ_LIMIT),
        ))?;
        Ok(ret as usize)
    }

    pub fn read_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        let ret = syscall!(readv(
            self.0,
            bufs.as_mut_ptr() as *mut libc::iovec,
            cmp::min(bufs.len(), c_int::MAX as usize) as c_int,
        ))?;
        Ok(ret as usize)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let ret = syscall!(write(
            self.0,
            buf.as_ptr() as *const c_void,
            cmp::min(buf.len(), READ_LIMIT),
        ))?;
        Ok(ret as usize)
    }

    pub fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let ret = syscall!(writev(
            self.0,
            bufs.as_ptr() as *const libc::iovec,
            cmp::min(bufs.len(), c_int::MAX as usize) as c_int,
        ))?;
        Ok(ret as usize)
    }

    pub fn set_cloexec(&self) -> io::Result<()> {
        syscall!(ioctl(self.0, libc::FIOCLEX))?;
        Ok(())
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let mut flag = nonblocking as c_int;
        syscall!(ioctl(self.0, libc::FIONBIO, &mut flag))?;
        Ok(())
    }

    pub fn duplicate(&self) -> io::Result<FileDesc> {
        let fd = syscall!(fcntl(self.0, libc::F_DUPFD_CLOEXEC, 0))?;
        Ok(FileDesc(fd))
    }
}

impl Read for FileDesc {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        FileDesc::read(self, buf)
    }
}

impl Read for &FileDesc {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        FileDesc::read(self, buf)
    }
}

impl Write for FileDesc {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        FileDesc::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for &FileDesc {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        FileDesc::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl FromRawFd for FileDesc {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        FileDesc(fd)
    }
}

impl AsRawFd for FileDesc {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl IntoRawFd for FileDesc {
    fn into_raw_fd(self) -> RawFd {
        self.into_raw()
    }
}

impl AsInner<c_int> for FileDesc {
    fn as_inner(&self) -> &c_int {
        &self.0
    }
}

impl FromInner<c_int> for FileDesc {
    fn from_inner(fd: c_int) -> FileDesc {
        FileDesc(fd)
    }
}

impl IntoInner<c_int> for FileDesc {
    fn into_inner(self) -> c_int {
        self.into_raw()
    }
}

impl Drop for FileDesc {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.0);
        }
    }
}
