//! Listener & Dialer (`spec.md` §4.5): bind/listen setup for TCP and
//! local-domain sockets, non-blocking connect. Duplicate-listener
//! detection is the caller's job (`registry::RegistryState::is_duplicate_listen`).

use std::net::SocketAddr;
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};

use libc::SOCK_STREAM;

use crate::error::{ConMgrError, Result};
use crate::net::unix::{UnixListener, UnixStream};
use crate::sys::{IntoInner, Socket};

pub fn bind_tcp(addr: &SocketAddr, backlog: i32) -> Result<RawFd> {
    let sock =
        Socket::new(addr, SOCK_STREAM).unwrap_or_else(|e| ConMgrError::fatal(format!("socket {}: {}", addr, e)));
    sock.set_reuseaddr(true)
        .unwrap_or_else(|e| ConMgrError::fatal(format!("setsockopt {}: {}", addr, e)));
    sock.bind(addr)
        .unwrap_or_else(|e| ConMgrError::fatal(format!("bind {}: {}", addr, e)));
    sock.listen(backlog)
        .unwrap_or_else(|e| ConMgrError::fatal(format!("listen {}: {}", addr, e)));
    sock.set_nonblocking(true)
        .unwrap_or_else(|e| ConMgrError::fatal(format!("set_nonblocking {}: {}", addr, e)));

    Ok(sock.into_inner())
}

/// Unlinks `path` first (`ENOENT` tolerated) so a stale socket file left by
/// a crashed previous run doesn't make `bind` fail with `EADDRINUSE`. Built
/// from the raw socket (rather than `std`'s `UnixListener::bind`, which
/// listens with its own fixed backlog) so `backlog` actually reaches
/// `listen()`, matching `bind_tcp`.
pub fn bind_unix(path: &str, backlog: i32) -> Result<RawFd> {
    unlink_unix_path(path);

    let sock = Socket::new_raw(libc::AF_UNIX, SOCK_STREAM)
        .unwrap_or_else(|e| ConMgrError::fatal(format!("socket {}: {}", path, e)));
    sock.bind_unix(path)
        .unwrap_or_else(|e| ConMgrError::fatal(format!("bind {}: {}", path, e)));
    sock.listen(backlog)
        .unwrap_or_else(|e| ConMgrError::fatal(format!("listen {}: {}", path, e)));
    sock.set_nonblocking(true)
        .unwrap_or_else(|e| ConMgrError::fatal(format!("set_nonblocking {}: {}", path, e)));

    Ok(sock.into_inner())
}

/// Outcome of a dial attempt. `Pending` means the connect has not
/// completed yet; the caller registers the fd with `PollingKind::Connected`
/// and learns the final result from `take_connect_error` on write-readiness.
pub enum DialOutcome {
    Connected(RawFd),
    Pending(RawFd),
}

pub fn dial_tcp(addr: &SocketAddr) -> Result<DialOutcome> {
    let sock =
        Socket::new(addr, SOCK_STREAM).unwrap_or_else(|e| ConMgrError::fatal(format!("socket {}: {}", addr, e)));

    match sock.connect_nonblocking(addr) {
        Ok(()) => Ok(DialOutcome::Connected(sock.into_inner())),
        Err(e) if is_in_progress(&e) => Ok(DialOutcome::Pending(sock.into_inner())),
        Err(e) => Err(ConMgrError::ConnectionError(e)),
    }
}

/// `AF_UNIX` `connect()` does not have a meaningful `EINPROGRESS` phase;
/// it either rendezvous with a listening peer immediately or fails.
pub fn dial_unix(path: &str) -> Result<DialOutcome> {
    let stream = UnixStream::connect(path).map_err(ConMgrError::ConnectionError)?;
    Ok(DialOutcome::Connected(stream.into_raw_fd()))
}

fn is_in_progress(e: &std::io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EINPROGRESS) | Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK)
    )
}

/// Accept loop helper: `Ok(None)` on `EAGAIN`/`EWOULDBLOCK` means nothing
/// else is pending this round.
pub fn accept_tcp(fd: RawFd) -> std::io::Result<Option<(RawFd, SocketAddr)>> {
    use crate::net::tcp::TcpListener;

    let listener = unsafe { TcpListener::from_raw_fd(fd) };
    let result = listener.accept();
    let _ = listener.into_raw_fd(); // fd ownership stays with the registry

    match result {
        Ok((stream, addr)) => Ok(Some((stream.into_raw_fd(), addr))),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn accept_unix(fd: RawFd) -> std::io::Result<Option<RawFd>> {
    let listener = unsafe { UnixListener::from_raw_fd(fd) };
    let result = listener.accept();
    let _ = listener.into_raw_fd();

    match result {
        Ok((stream, _addr)) => Ok(Some(stream.into_raw_fd())),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}

/// `SO_ERROR` after a writable event on a `CONNECTED`-polling fd: `Ok(None)`
/// means the connect finished successfully.
pub fn take_connect_error(fd: RawFd) -> std::io::Result<Option<std::io::Error>> {
    use crate::net::tcp::TcpStream;

    let stream = unsafe { TcpStream::from_raw_fd(fd) };
    let result = stream.take_error();
    let _ = stream.into_raw_fd();
    result
}

pub fn unlink_unix_path(path: &str) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("failed to unlink local-domain socket {}: {}", path, e),
    }
}
