//! Self-pipe primitive used to bridge UNIX signal delivery into the poll
//! loop. A signal handler may only call async-signal-safe functions; a
//! `write(2)` of one byte into a non-blocking pipe is the traditional way
//! to get a signal's occurrence onto an `epoll_wait` return without doing
//! any real work on the signal stack.

use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};

use crate::epoll::{Epoll, EpollOpt, Ready, Source, Token};

use super::fd::FileDesc;

#[derive(Debug)]
pub struct Awakener {
    reader: FileDesc,
    writer: FileDesc,
}

impl Awakener {
    pub fn new() -> io::Result<Awakener> {
        let mut fds = [0 as RawFd; 2];
        syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK))?;

        Ok(Awakener {
            reader: FileDesc::new(fds[0]),
            writer: FileDesc::new(fds[1]),
        })
    }

    /// Async-signal-safe: only calls `write(2)` on the write end's raw fd.
    pub fn wakeup(&self) -> io::Result<()> {
        match (&self.writer).write(&[1]) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Drain every byte queued on the read end after a wakeup is observed.
    pub fn cleanup(&self) {
        let mut buf = [0u8; 128];

        loop {
            match (&self.reader).read(&mut buf) {
                Ok(i) if i > 0 => {}
                _ => return,
            }
        }
    }

    fn reader(&self) -> &FileDesc {
        &self.reader
    }

    /// Raw fd of the write end, stashed in a `static` for the signal
    /// handler to use — the handler cannot close over anything.
    pub fn writer_raw_fd(&self) -> RawFd {
        self.writer.raw()
    }
}

impl AsRawFd for Awakener {
    fn as_raw_fd(&self) -> RawFd {
        self.reader.raw()
    }
}

impl Source for Awakener {
    fn add(&self, epoll: &Epoll, token: Token, interest: Ready, opts: EpollOpt) -> io::Result<()> {
        epoll.add(&self.reader().raw(), token, interest, opts)
    }

    fn modify(&self, epoll: &Epoll, token: Token, interest: Ready, opts: EpollOpt) -> io::Result<()> {
        epoll.modify(&self.reader().raw(), token, interest, opts)
    }

    fn delete(&self, epoll: &Epoll) -> io::Result<()> {
        epoll.delete(&self.reader().raw())
    }
}

#[cfg(test)]
mod test {
    use super::Awakener;

    #[test]
    fn wakeup_and_cleanup() {
        let awakener = Awakener::new().unwrap();
        awakener.wakeup().unwrap();
        awakener.cleanup();
    }
}
