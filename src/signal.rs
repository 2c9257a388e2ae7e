//! Signal Bridge (`spec.md` §4.7): a `sigaction` handler writes the raw
//! signal number into a self-pipe using only async-signal-safe operations;
//! the owning connection's read side drains it in `sizeof(i32)` increments
//! and turns each one into unattached work for the worker pool.
//!
//! The handler itself cannot close over Rust state, so the write end's raw
//! fd is stashed in a process-wide `AtomicI32` (`WRITE_FD`) rather than
//! captured — the same trick `queen-io`'s `Awakener` assumes a caller will
//! apply when registering it with a signal.

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Condvar, Mutex, RwLock};

use libc::{c_int, c_void};

use crate::connection::WorkItem;
use crate::registry::RegistryState;
use crate::sys::awakener::Awakener;

static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handle_signal(signum: c_int) {
    let fd = WRITE_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }

    let bytes = signum.to_ne_bytes();
    let mut off = 0;
    while off < bytes.len() {
        let ret = unsafe {
            libc::write(
                fd,
                bytes[off..].as_ptr() as *const c_void,
                bytes.len() - off,
            )
        };
        if ret >= 0 {
            off += ret as usize;
            continue;
        }

        let errno = unsafe { *libc::__errno_location() };
        if errno == libc::EINTR || errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
            continue;
        }
        // EPIPE/EBADF: the bridge is mid-shutdown. Swallow and return, per
        // spec.md §4.7's "shutdown race" note.
        return;
    }
}

/// Per-signal-number dispatch table, guarded by its own `RwLock` so signal
/// registration never contends with the primary registry mutex
/// (`spec.md` §5).
pub struct SignalBridge {
    awakener: Awakener,
    table: RwLock<HashMap<i32, Vec<Box<dyn Fn() -> WorkItem + Send + Sync>>>>,
}

impl SignalBridge {
    pub fn new() -> std::io::Result<SignalBridge> {
        Ok(SignalBridge {
            awakener: Awakener::new()?,
            table: RwLock::new(HashMap::new()),
        })
    }

    pub fn reader_fd(&self) -> RawFd {
        self.awakener.as_raw_fd()
    }

    /// Installs a `sigaction` for `signum` the first time it is registered
    /// and records `make_work` to produce a fresh `WorkItem` every time
    /// that signal is observed.
    pub fn register(
        &self,
        signum: i32,
        make_work: impl Fn() -> WorkItem + Send + Sync + 'static,
    ) -> std::io::Result<()> {
        let mut table = self.table.write().unwrap();
        let first_for_signum = !table.contains_key(&signum);
        table.entry(signum).or_default().push(Box::new(make_work));

        if first_for_signum {
            WRITE_FD.store(self.awakener.writer_raw_fd(), Ordering::Relaxed);
            install_handler(signum)?;
        }
        Ok(())
    }

    /// Drains the self-pipe in `sizeof(i32)` increments and, for each
    /// signal observed, enqueues its registered work onto `state`'s
    /// unattached-work queue, waking the watch loop.
    pub fn drain_and_dispatch(&self, state: &Mutex<RegistryState>, watch_sleep: &Condvar) {
        let mut signums = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            let n = unsafe {
                libc::read(self.reader_fd(), buf.as_mut_ptr() as *mut c_void, buf.len())
            };
            if n == buf.len() as isize {
                signums.push(i32::from_ne_bytes(buf));
                continue;
            }
            break;
        }

        if signums.is_empty() {
            return;
        }

        let table = self.table.read().unwrap();
        let mut guard = state.lock().unwrap();
        for signum in signums {
            match table.get(&signum) {
                Some(makers) => {
                    for make_work in makers {
                        guard.unattached_work.push_back(make_work());
                    }
                }
                None => log::warn!("unmatched signal {}", signum),
            }
        }
        drop(guard);
        watch_sleep.notify_all();
    }

    /// Resets the handler table to uninitialized without touching
    /// installed `sigaction`s — the child of a `fork()` gets a fresh
    /// `SignalBridge` and reinstalls its own handlers on first
    /// `register()` (`spec.md` §13).
    pub fn reset_after_fork(&self) {
        self.table.write().unwrap().clear();
        WRITE_FD.store(-1, Ordering::Relaxed);
    }
}

fn install_handler(signum: i32) -> std::io::Result<()> {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handle_signal as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);

        if libc::sigaction(signum, &sa, std::ptr::null_mut()) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::WorkStatus;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn register_and_dispatch_on_raise() {
        let bridge = SignalBridge::new().unwrap();
        let (tx, rx) = mpsc::channel();

        bridge
            .register(libc::SIGUSR1, move || {
                let tx = tx.clone();
                WorkItem::run(move |status| {
                    tx.send(status).unwrap();
                })
            })
            .unwrap();

        unsafe {
            libc::raise(libc::SIGUSR1);
        }

        let state = Mutex::new(RegistryState::new());
        let watch_sleep = Condvar::new();

        // Give the (synchronously delivered) handler a moment to land; on
        // Linux `raise` delivers before returning, so this is immediate.
        bridge.drain_and_dispatch(&state, &watch_sleep);

        let item = state.lock().unwrap().unattached_work.pop_front().unwrap();
        if let crate::connection::WorkKind::Run(f) = item.kind {
            f(WorkStatus::Run);
        }
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), WorkStatus::Run);
    }

    #[test]
    fn unmatched_signal_is_logged_not_panicking() {
        let bridge = SignalBridge::new().unwrap();
        bridge
            .register(libc::SIGUSR2, || WorkItem::run(|_| {}))
            .unwrap();

        unsafe {
            libc::raise(libc::SIGUSR2);
        }

        let state = Mutex::new(RegistryState::new());
        let watch_sleep = Condvar::new();
        bridge.drain_and_dispatch(&state, &watch_sleep);
        assert_eq!(state.lock().unwrap().unattached_work.len(), 1);
    }
}
