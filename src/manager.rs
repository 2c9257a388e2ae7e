//! Manager façade (`spec.md` §6): the caller-facing API surface wiring the
//! registry, poll controller, worker pool, watch loop, and signal bridge
//! behind one handle. A process normally holds a single `Manager` reached
//! through [`Manager::init`]/[`global`]; nothing here prevents building more
//! than one, which is mostly useful in tests.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use once_cell::sync::Lazy;

use crate::addr::{parse_host_port, parse_listen_targets, Address};
use crate::callbacks::{Arg, Callbacks};
use crate::close::queue_close;
use crate::config::Config;
use crate::connection::{Connection, ConnType, InBuffer, PollingKind, WorkItem, WorkStatus};
use crate::error::{ConMgrError, Result};
use crate::fdpass::{queue_receive_fd, queue_send_fd};
use crate::listener::{bind_tcp, bind_unix, dial_tcp, dial_unix, DialOutcome};
use crate::poll_controller::PollController;
use crate::registry::{ConnId, RegistryState};
use crate::signal::SignalBridge;
use crate::sys::fdpass::{peer_cred, PeerCred};
use crate::sys::{FromInner, IntoInner, Socket};
use crate::watch::WatchLoop;
use crate::worker::{Shared, WorkerPool};

static S: Lazy<Mutex<Option<Arc<Manager>>>> = Lazy::new(|| Mutex::new(None));

/// The currently initialized global `Manager`, if any.
pub fn global() -> Option<Arc<Manager>> {
    S.lock().unwrap().clone()
}

/// Status snapshot returned by [`Manager::fd_get_status`]. Only meaningful
/// when read from within a running callback, per `spec.md` §6 — once the
/// callback returns, the underlying connection may already be gone.
#[derive(Debug, Clone, Copy)]
pub struct FdStatus {
    pub is_socket: bool,
    pub is_unix_socket: bool,
    pub is_listen: bool,
    pub read_eof: bool,
    pub is_connected: bool,
}

fn fresh_connection(
    name: String,
    input_fd: RawFd,
    output_fd: RawFd,
    conn_type: ConnType,
    is_socket: bool,
    is_listen: bool,
    is_connected: bool,
    buffer_start_size: usize,
    address: Option<Address>,
    unix_socket_path: Option<String>,
    arg: Option<Arg>,
) -> Connection {
    Connection {
        name,
        input_fd,
        output_fd,
        conn_type,
        polling_input_kind: PollingKind::None,
        polling_output_kind: PollingKind::None,
        input_unsupported: false,
        output_unsupported: false,
        is_socket,
        is_listen,
        is_connected,
        read_eof: false,
        can_read: false,
        work_active: false,
        in_buffer: InBuffer::with_capacity(buffer_start_size),
        out_queue: Default::default(),
        work_queue: Default::default(),
        write_complete_queue: Default::default(),
        address,
        unix_socket_path,
        arg,
    }
}

pub struct Manager {
    shared: Arc<Shared>,
    signal_bridge: Arc<SignalBridge>,
    config: Config,
    watch_handle: Mutex<Option<JoinHandle<()>>>,
    signal_handle: Mutex<Option<JoinHandle<()>>>,
    worker_pool: Mutex<Option<WorkerPool>>,
}

impl Manager {
    /// Builds and starts a manager: spawns the worker pool, the watch loop
    /// thread, and a thread draining the signal bridge's self-pipe. Also
    /// installs itself as the process-wide [`global`] instance.
    pub fn init(config: Config, callbacks: Callbacks) -> Result<Arc<Manager>> {
        let poll = Arc::new(PollController::new().unwrap_or_else(|e| ConMgrError::fatal(e.to_string())));
        let shared = Arc::new(Shared {
            state: Mutex::new(RegistryState::new()),
            watch_sleep: Condvar::new(),
            poll,
            callbacks: Arc::new(callbacks),
            keep_alive: config.keep_alive,
            debug_conmgr: config.debug_conmgr,
        });

        let signal_bridge = Arc::new(SignalBridge::new().unwrap_or_else(|e| ConMgrError::fatal(e.to_string())));

        let worker_pool = WorkerPool::spawn(config.worker_count, shared.clone());

        let watch_loop = WatchLoop::new(shared.clone());
        let watch_handle = thread::Builder::new()
            .name("conmgr-watch".to_string())
            .spawn(move || watch_loop.run())
            .unwrap_or_else(|e| ConMgrError::fatal(e.to_string()));

        let signal_handle = {
            let bridge = signal_bridge.clone();
            let shared = shared.clone();
            thread::Builder::new()
                .name("conmgr-signal".to_string())
                .spawn(move || signal_drain_loop(bridge, shared))
                .unwrap_or_else(|e| ConMgrError::fatal(e.to_string()))
        };

        let manager = Arc::new(Manager {
            shared,
            signal_bridge,
            config,
            watch_handle: Mutex::new(Some(watch_handle)),
            signal_handle: Mutex::new(Some(signal_handle)),
            worker_pool: Mutex::new(Some(worker_pool)),
        });

        *S.lock().unwrap() = Some(manager.clone());
        Ok(manager)
    }

    /// Registers `signum` against `make_work`, forwarding to the signal
    /// bridge. See `spec.md` §4.7.
    pub fn register_signal(
        &self,
        signum: i32,
        make_work: impl Fn() -> crate::connection::WorkItem + Send + Sync + 'static,
    ) -> Result<()> {
        self.signal_bridge
            .register(signum, make_work)
            .unwrap_or_else(|e| ConMgrError::fatal(format!("registering signal {}: {}", signum, e)));
        Ok(())
    }

    /// `create_listen_sockets(type, host_or_unix_path, arg)`: binds and
    /// registers one listener per address `host_or_unix_path` resolves to
    /// (`spec.md`'s Listen(TCP) scenario: "resolve addresses; for each
    /// result, skip if duplicate..."). A local-domain path always resolves
    /// to exactly one target. `arg` is handed to the first listener
    /// actually created; later ones on a multi-address hostname get `None`,
    /// since `Arg` isn't `Clone`.
    pub fn create_listen_sockets(
        &self,
        conn_type: ConnType,
        host_or_unix_path: &str,
        arg: Option<Arg>,
    ) -> Result<Vec<ConnId>> {
        self.shared.callbacks.check_capability(conn_type)?;

        let targets = parse_listen_targets(host_or_unix_path)?;
        let mut guard = self.shared.state.lock().unwrap();

        let mut arg = arg;
        let mut ids = Vec::with_capacity(targets.len());
        for addr in targets {
            if guard.is_duplicate_listen(&addr) {
                continue;
            }

            let (fd, unix_path) = match &addr {
                Address::Tcp(a) => (bind_tcp(a, self.config.backlog_depth)?, None),
                Address::Unix(path) => (bind_unix(path, self.config.backlog_depth)?, Some(path.clone())),
            };

            let conn = fresh_connection(
                host_or_unix_path.to_string(),
                fd,
                crate::connection::INVALID_FD,
                conn_type,
                true,
                true,
                false,
                self.config.buffer_start_size,
                Some(addr),
                unix_path,
                arg.take(),
            );
            ids.push(guard.insert(conn, true));
        }
        drop(guard);

        if ids.is_empty() {
            return Err(ConMgrError::InvalidArgument(format!(
                "duplicate listener(s) for {:?}",
                host_or_unix_path
            )));
        }

        self.shared.watch_sleep.notify_all();
        let _ = self.shared.poll.interrupt();
        Ok(ids)
    }

    /// `process_fd_listen`: adopt an already-bound TCP listen fd.
    pub fn process_fd_listen(
        &self,
        conn_type: ConnType,
        fd: RawFd,
        arg: Option<Arg>,
    ) -> Result<ConnId> {
        self.shared.callbacks.check_capability(conn_type)?;
        let conn = fresh_connection(
            format!("fd:{}", fd),
            fd,
            crate::connection::INVALID_FD,
            conn_type,
            true,
            true,
            false,
            self.config.buffer_start_size,
            None,
            None,
            arg,
        );
        let mut guard = self.shared.state.lock().unwrap();
        let id = guard.insert(conn, true);
        drop(guard);
        self.shared.watch_sleep.notify_all();
        let _ = self.shared.poll.interrupt();
        Ok(id)
    }

    /// `process_fd_unix_listen`: adopt an already-bound local-domain listen
    /// fd owning `path` (unlinked on close).
    pub fn process_fd_unix_listen(
        &self,
        conn_type: ConnType,
        fd: RawFd,
        path: String,
        arg: Option<Arg>,
    ) -> Result<ConnId> {
        self.shared.callbacks.check_capability(conn_type)?;
        let conn = fresh_connection(
            path.clone(),
            fd,
            crate::connection::INVALID_FD,
            conn_type,
            true,
            true,
            false,
            self.config.buffer_start_size,
            Some(Address::Unix(path.clone())),
            Some(path),
            arg,
        );
        let mut guard = self.shared.state.lock().unwrap();
        let id = guard.insert(conn, true);
        drop(guard);
        self.shared.watch_sleep.notify_all();
        let _ = self.shared.poll.interrupt();
        Ok(id)
    }

    /// `create_connect_socket(type, addr, arg)`: non-blocking dial. Returns
    /// as soon as the connect is either complete or pending; the watch loop
    /// learns the final outcome from the first write-readiness event.
    pub fn create_connect_socket(
        &self,
        conn_type: ConnType,
        addr: &str,
        arg: Option<Arg>,
    ) -> Result<ConnId> {
        self.shared.callbacks.check_capability(conn_type)?;

        let parsed = parse_host_port(addr)?;
        let (outcome, address) = match &parsed {
            Address::Tcp(a) => (dial_tcp(a)?, Some(parsed.clone())),
            Address::Unix(path) => (dial_unix(path)?, Some(parsed.clone())),
        };

        let (fd, is_connected) = match outcome {
            DialOutcome::Connected(fd) => (fd, true),
            DialOutcome::Pending(fd) => (fd, false),
        };

        if matches!(parsed, Address::Tcp(_)) {
            let sock = Socket::from_inner(fd);
            if let Err(e) = sock.set_keepalive(self.shared.keep_alive) {
                log::warn!("set_keepalive on {}: {}", addr, e);
            }
            let _ = sock.into_inner();
        }

        let conn = fresh_connection(
            addr.to_string(),
            fd,
            fd,
            conn_type,
            true,
            false,
            is_connected,
            self.config.buffer_start_size,
            address,
            None,
            arg,
        );
        let mut guard = self.shared.state.lock().unwrap();
        let id = guard.insert(conn, false);
        drop(guard);
        self.shared.watch_sleep.notify_all();
        let _ = self.shared.poll.interrupt();
        Ok(id)
    }

    /// `process_fd(type, input_fd, output_fd, arg)`: adopt an already-open,
    /// already-connected fd pair (e.g. a pipe or a pre-split socketpair).
    pub fn process_fd(
        &self,
        conn_type: ConnType,
        input_fd: RawFd,
        output_fd: RawFd,
        arg: Option<Arg>,
    ) -> Result<ConnId> {
        self.shared.callbacks.check_capability(conn_type)?;
        let conn = fresh_connection(
            format!("fd:{}/{}", input_fd, output_fd),
            input_fd,
            output_fd,
            conn_type,
            false,
            false,
            true,
            self.config.buffer_start_size,
            None,
            None,
            arg,
        );
        let mut guard = self.shared.state.lock().unwrap();
        let id = guard.insert(conn, false);
        drop(guard);
        self.shared.watch_sleep.notify_all();
        let _ = self.shared.poll.interrupt();
        Ok(id)
    }

    /// Enqueues `bytes` on `con`'s write queue and nudges the watch loop so
    /// it relinks the fd for write-readiness on its next iteration.
    pub fn write(&self, con: ConnId, bytes: Vec<u8>) -> Result<()> {
        let mut guard = self.shared.state.lock().unwrap();
        let conn = guard
            .get_mut(con)
            .ok_or_else(|| ConMgrError::MissingSocket(format!("{:?} not found", con)))?;
        if conn.read_eof && conn.input_fd == crate::connection::INVALID_FD {
            return Err(ConMgrError::MissingSocket(format!("{:?} already closed", con)));
        }
        conn.out_queue.push_back(bytes);
        drop(guard);
        self.shared.watch_sleep.notify_all();
        let _ = self.shared.poll.interrupt();
        Ok(())
    }

    /// Like [`Manager::write`], but `on_complete` is deferred onto
    /// `write_complete_queue` and runs once `out_queue` empties — `RUN` if
    /// the bytes actually drained, `CANCELLED` if the connection closes
    /// with the callback still pending (`spec.md` §4.2/§4.4).
    pub fn write_notify(
        &self,
        con: ConnId,
        bytes: Vec<u8>,
        on_complete: impl FnOnce(WorkStatus) + Send + 'static,
    ) -> Result<()> {
        let mut guard = self.shared.state.lock().unwrap();
        let conn = guard
            .get_mut(con)
            .ok_or_else(|| ConMgrError::MissingSocket(format!("{:?} not found", con)))?;
        if conn.read_eof && conn.input_fd == crate::connection::INVALID_FD {
            return Err(ConMgrError::MissingSocket(format!("{:?} already closed", con)));
        }
        conn.out_queue.push_back(bytes);
        conn.write_complete_queue.push_back(WorkItem::run(on_complete));
        drop(guard);
        self.shared.watch_sleep.notify_all();
        let _ = self.shared.poll.interrupt();
        Ok(())
    }

    pub fn queue_send_fd(&self, con: ConnId, fd: RawFd) -> Result<()> {
        let mut guard = self.shared.state.lock().unwrap();
        queue_send_fd(&mut guard, con, fd)?;
        drop(guard);
        self.shared.watch_sleep.notify_all();
        let _ = self.shared.poll.interrupt();
        Ok(())
    }

    pub fn queue_receive_fd(
        &self,
        src: ConnId,
        conn_type: ConnType,
        arg: Option<Arg>,
    ) -> Result<()> {
        let mut guard = self.shared.state.lock().unwrap();
        queue_receive_fd(&mut guard, self.shared.clone(), src, conn_type, arg)?;
        drop(guard);
        self.shared.watch_sleep.notify_all();
        let _ = self.shared.poll.interrupt();
        Ok(())
    }

    /// `queue_close_fd(con)`: request a close, deferred if work is active.
    pub fn queue_close_fd(&self, con: ConnId) {
        let mut guard = self.shared.state.lock().unwrap();
        queue_close(&mut guard, &self.shared.poll, con);
        drop(guard);
        self.shared.watch_sleep.notify_all();
        let _ = self.shared.poll.interrupt();
    }

    /// `fd_change_mode(con, new_type)`: switch between RAW and RPC framing.
    /// Rechecks capability against the currently registered callbacks.
    pub fn fd_change_mode(&self, con: ConnId, new_type: ConnType) -> Result<()> {
        self.shared.callbacks.check_capability(new_type)?;
        let mut guard = self.shared.state.lock().unwrap();
        let conn = guard
            .get_mut(con)
            .ok_or_else(|| ConMgrError::MissingSocket(format!("{:?} not found", con)))?;
        conn.conn_type = new_type;
        Ok(())
    }

    /// `fd_get_status(con)`. Per `spec.md` §6, meaningful only when called
    /// from within a running callback — the connection may not exist by the
    /// time a caller outside that window inspects the result.
    pub fn fd_get_status(&self, con: ConnId) -> Result<FdStatus> {
        let guard = self.shared.state.lock().unwrap();
        let conn = guard
            .get(con)
            .ok_or_else(|| ConMgrError::MissingSocket(format!("{:?} not found", con)))?;
        Ok(FdStatus {
            is_socket: conn.is_socket,
            is_unix_socket: conn.unix_socket_path.is_some()
                || matches!(conn.address, Some(Address::Unix(_))),
            is_listen: conn.is_listen,
            read_eof: conn.read_eof,
            is_connected: conn.is_connected,
        })
    }

    /// `fd_get_auth_creds(con)`: local-domain peer credentials.
    pub fn fd_get_auth_creds(&self, con: ConnId) -> Result<PeerCred> {
        let guard = self.shared.state.lock().unwrap();
        let conn = guard
            .get(con)
            .ok_or_else(|| ConMgrError::MissingSocket(format!("{:?} not found", con)))?;
        if conn.unix_socket_path.is_none() && !matches!(conn.address, Some(Address::Unix(_))) {
            return Err(ConMgrError::NotSupported(
                "peer credentials require a local-domain socket".to_string(),
            ));
        }
        let fd = conn.input_fd;
        drop(guard);
        peer_cred(fd).map_err(|e| ConMgrError::NotSupported(e.to_string()))
    }

    /// `fd_get_name(con)`: stable string identifying the connection.
    pub fn fd_get_name(&self, con: ConnId) -> Result<String> {
        let guard = self.shared.state.lock().unwrap();
        guard
            .get(con)
            .map(|c| c.name.clone())
            .ok_or_else(|| ConMgrError::MissingSocket(format!("{:?} not found", con)))
    }

    /// Signals shutdown and blocks until the watch loop, worker pool, and
    /// signal-drain thread have all exited — i.e. until the registry is
    /// empty (`spec.md` §3 invariant 3).
    pub fn shutdown(&self) {
        {
            let mut guard = self.shared.state.lock().unwrap();
            guard.shutdown = true;
        }
        self.shared.watch_sleep.notify_all();
        let _ = self.shared.poll.interrupt();

        if let Some(handle) = self.watch_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(pool) = self.worker_pool.lock().unwrap().take() {
            pool.join();
        }
        if let Some(handle) = self.signal_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Resets both the signal bridge's static tables and the global
    /// singleton to uninitialized. Must be called by the caller immediately
    /// after `libc::fork()` returns `0` in the child (`spec.md` §3, §4.7,
    /// `SPEC_FULL.md` §13) — this crate does not install its own
    /// `pthread_atfork` handler.
    pub fn reset_after_fork(&self) {
        self.signal_bridge.reset_after_fork();
        *S.lock().unwrap() = None;
    }
}

const SIGNAL_DRAIN_POLL_TIMEOUT_MS: i32 = 250;

/// Blocks on the signal bridge's self-pipe reader fd via `libc::poll`,
/// waking up to drain and dispatch whenever a signal handler has written to
/// it, and periodically to notice shutdown.
fn signal_drain_loop(bridge: Arc<SignalBridge>, shared: Arc<Shared>) {
    let reader_fd = bridge.reader_fd();

    loop {
        {
            let guard = shared.state.lock().unwrap();
            if guard.shutdown && guard.is_empty() {
                return;
            }
        }

        let mut pfd = libc::pollfd {
            fd: reader_fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, SIGNAL_DRAIN_POLL_TIMEOUT_MS) };
        if ret > 0 && pfd.revents & libc::POLLIN != 0 {
            bridge.drain_and_dispatch(&shared.state, &shared.watch_sleep);
        }
    }
}
