//! Thin wrapper over `epoll::Epoll` implementing the Poll Controller
//! contract from `spec.md` §4.1: link/relink/unlink interest by fd, and an
//! `interrupt()` that unblocks a concurrently-blocked `poll()`.

use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::connection::PollingKind;
use crate::epoll::{Epoll, EpollOpt, Events, Ready, Token};
use crate::error::{ConMgrError, Result};
use crate::waker::Waker;

/// Reserved token for the controller's own wakeup fd; never handed out to
/// callers of `link_fd`.
pub const WAKE_TOKEN: Token = Token(usize::MAX);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Linked,
    /// The fd cannot be polled (e.g. a regular file, `EPERM` from
    /// `epoll_ctl`). Sticky: callers latch `*_unsupported` on the
    /// connection and stop attempting to relink that half.
    Unsupported,
}

pub struct PollController {
    epoll: Epoll,
    waker: Waker,
}

fn to_ready(kind: PollingKind) -> Option<Ready> {
    use PollingKind::*;
    match kind {
        PollingKind::None => None,
        ReadOnly => Some(Ready::readable()),
        WriteOnly => Some(Ready::writable()),
        ReadWrite => Some(Ready::readable() | Ready::writable()),
        Connected => Some(Ready::writable()),
        Listen => Some(Ready::readable()),
    }
}

impl PollController {
    pub fn new() -> Result<PollController> {
        let epoll = Epoll::new().unwrap_or_else(|e| ConMgrError::fatal(e.to_string()));
        let waker = Waker::new().unwrap_or_else(|e| ConMgrError::fatal(e.to_string()));

        epoll
            .add(&waker, WAKE_TOKEN, Ready::readable(), EpollOpt::level())
            .unwrap_or_else(|e| ConMgrError::fatal(format!("registering wakeup fd: {}", e)));

        Ok(PollController { epoll, waker })
    }

    /// Register interest for `fd` under `token`. A `kind` of `None` instead
    /// unlinks the fd — `epoll_ctl` itself rejects an empty interest set.
    pub fn link_fd(&self, fd: RawFd, kind: PollingKind, token: Token) -> Result<LinkOutcome> {
        let ready = match to_ready(kind) {
            Some(r) => r,
            None => {
                self.unlink_fd(fd)?;
                return Ok(LinkOutcome::Linked);
            }
        };

        match self.epoll.add(&fd, token, ready, EpollOpt::level()) {
            Ok(()) => Ok(LinkOutcome::Linked),
            Err(e) if e.raw_os_error() == Some(libc::EPERM) => Ok(LinkOutcome::Unsupported),
            Err(e) => ConMgrError::fatal(format!("registering fd {}: {}", fd, e)),
        }
    }

    pub fn relink_fd(&self, fd: RawFd, kind: PollingKind, token: Token) -> Result<LinkOutcome> {
        let ready = match to_ready(kind) {
            Some(r) => r,
            None => {
                self.unlink_fd(fd)?;
                return Ok(LinkOutcome::Linked);
            }
        };

        match self.epoll.modify(&fd, token, ready, EpollOpt::level()) {
            Ok(()) => Ok(LinkOutcome::Linked),
            Err(e) if e.raw_os_error() == Some(libc::EPERM) => Ok(LinkOutcome::Unsupported),
            Err(e) => ConMgrError::fatal(format!("relinking fd {}: {}", fd, e)),
        }
    }

    pub fn unlink_fd(&self, fd: RawFd) -> Result<()> {
        match self.epoll.delete(&fd) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            Err(e) => ConMgrError::fatal(format!("unlinking fd {}: {}", fd, e)),
        }
    }

    /// Cause a concurrently-blocked `poll()` to return immediately.
    pub fn interrupt(&self) -> Result<()> {
        self.waker
            .wakeup()
            .unwrap_or_else(|e| ConMgrError::fatal(e.to_string()));
        Ok(())
    }

    /// Block until readiness or `interrupt()`. The wakeup token
    /// (`WAKE_TOKEN`) may appear in `events`; callers filter it out and
    /// call `Waker::finish` once drained.
    pub fn poll(&self, events: &mut Events, timeout: Option<Duration>) -> Result<usize> {
        Ok(self
            .epoll
            .wait(events, timeout)
            .unwrap_or_else(|e| ConMgrError::fatal(format!("epoll_wait: {}", e))))
    }

    pub fn ack_wake(&self) -> Result<()> {
        self.waker
            .finish()
            .unwrap_or_else(|e| ConMgrError::fatal(e.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::epoll::{Events, Token};

    #[test]
    fn interrupt_wakes_a_blocked_poll() {
        let controller = PollController::new().unwrap();
        controller.interrupt().unwrap();

        let mut events = Events::with_capacity(8);
        let n = controller.poll(&mut events, None).unwrap();
        assert!(n >= 1);
        assert!(events.iter().any(|e| e.token() == WAKE_TOKEN));
        controller.ack_wake().unwrap();
    }

    #[test]
    fn none_kind_unlinks_rather_than_links() {
        let controller = PollController::new().unwrap();
        // fd 0 (stdin) is always a valid, already-open fd in test harnesses.
        let outcome = controller
            .link_fd(0, PollingKind::None, Token(1))
            .unwrap();
        assert_eq!(outcome, LinkOutcome::Linked);
    }
}
