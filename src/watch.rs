//! Watch Loop (`spec.md` §4.3): the single thread that reconciles desired
//! polling state with the Poll Controller and turns readiness into queued
//! work. Input/output halves of a split connection get distinct tokens so
//! a readiness event can be routed back to the right half without a second
//! registry scan.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use libc::c_void;

use crate::close::{close_con, finalize_if_drained, queue_close};
use crate::connection::{ConnType, PollingKind, WorkItem, WorkKind, WorkStatus};
use crate::epoll::{Events, Token};
use crate::listener::{accept_tcp, accept_unix, take_connect_error};
use crate::poll_controller::{LinkOutcome, WAKE_TOKEN};
use crate::registry::{ConnId, RegistryState};
use crate::sys::{FromInner, IntoInner, Socket};
use crate::worker::Shared;

const WATCH_TIMEOUT: Duration = Duration::from_millis(250);

fn input_token(id: ConnId) -> Token {
    Token(id.0 * 2)
}

fn output_token(id: ConnId) -> Token {
    Token(id.0 * 2 + 1)
}

/// `(id, is_output_half)` — `None` for the reserved wakeup token.
fn decode_token(token: Token) -> Option<(ConnId, bool)> {
    if token == WAKE_TOKEN {
        return None;
    }
    Some((ConnId(token.0 / 2), token.0 % 2 == 1))
}

/// Step 1 of `spec.md` §4.3: derive the desired polling kind purely from a
/// connection's current fields.
fn desired_kind(conn: &crate::connection::Connection) -> PollingKind {
    if conn.is_listen {
        return PollingKind::Listen;
    }
    if !conn.is_connected {
        return PollingKind::Connected;
    }
    if conn.read_eof && conn.out_queue.is_empty() && conn.work_queue.is_empty() {
        return PollingKind::None;
    }

    let want_read = !conn.read_eof && !conn.input_unsupported && !conn.in_buffer.is_full();
    let want_write = !conn.out_queue.is_empty() && !conn.output_unsupported;

    match (want_read, want_write) {
        (true, true) => PollingKind::ReadWrite,
        (true, false) => PollingKind::ReadOnly,
        (false, true) => PollingKind::WriteOnly,
        (false, false) => PollingKind::None,
    }
}

pub struct WatchLoop {
    shared: Arc<Shared>,
}

impl WatchLoop {
    pub fn new(shared: Arc<Shared>) -> WatchLoop {
        WatchLoop { shared }
    }

    pub fn run(&self) {
        let mut events = Events::with_capacity(256);

        loop {
            let mut guard = self.shared.state.lock().unwrap();
            if guard.shutdown && guard.is_empty() {
                return;
            }
            let mut finished = Vec::new();

            // Cancellation (`spec.md` §4.4): shutdown closes every
            // connection, listeners included — `desired_kind` never picks
            // that up on its own since a listener's desired kind is always
            // LISTEN. `queue_close` defers rather than closing outright so
            // a connection a worker currently holds isn't torn down from
            // under it.
            if guard.shutdown {
                let ids: Vec<ConnId> = guard.active_ids().chain(guard.listen_ids()).collect();
                for id in ids {
                    queue_close(&mut guard, &self.shared.poll, id);
                    self.try_finish(&mut guard, id, &mut finished);
                }
            }

            self.relink_all(&mut guard, &mut finished);
            drop(guard);
            self.run_on_finish(finished);

            let n = match self.shared.poll.poll(&mut events, Some(WATCH_TIMEOUT)) {
                Ok(n) => n,
                Err(e) => {
                    log::error!("epoll_wait failed: {}", e);
                    continue;
                }
            };

            if n == 0 {
                continue;
            }

            let mut guard = self.shared.state.lock().unwrap();
            let mut woke = false;
            let mut saw_wake_token = false;
            let mut finished = Vec::new();

            for i in 0..events.len() {
                let event = match events.get(i) {
                    Some(e) => e,
                    None => continue,
                };

                let (id, is_output) = match decode_token(event.token()) {
                    Some(pair) => pair,
                    None => {
                        saw_wake_token = true;
                        continue;
                    }
                };

                if self.shared.debug_conmgr {
                    log::trace!(
                        "watch: {:?} half={} readiness={:?}",
                        id,
                        if is_output { "out" } else { "in" },
                        event.readiness()
                    );
                }

                woke |= self.dispatch_ready(&mut guard, id, is_output, event.readiness(), &mut finished);
            }

            drop(guard);

            if saw_wake_token {
                let _ = self.shared.poll.ack_wake();
            }
            self.run_on_finish(finished);
            if woke {
                self.shared.watch_sleep.notify_all();
            }
        }
    }

    /// Invokes `on_finish` for each connection that drained to completion
    /// this iteration. Always called after the registry mutex is dropped.
    fn run_on_finish(&self, finished: Vec<(ConnId, crate::connection::Connection)>) {
        for (id, mut conn) in finished {
            run_pending_write_complete(&mut conn, WorkStatus::Cancelled);
            if let Some(on_finish) = &self.shared.callbacks.on_finish {
                on_finish(id, conn.arg, WorkStatus::Run);
            }
        }
    }

    /// Step 4 of `spec.md` §4.3 for one ready fd. Returns whether new work
    /// became runnable (i.e. the worker pool should be signalled).
    fn dispatch_ready(
        &self,
        guard: &mut RegistryState,
        id: ConnId,
        is_output: bool,
        readiness: crate::epoll::Ready,
        finished: &mut Vec<(ConnId, crate::connection::Connection)>,
    ) -> bool {
        let is_listen = match guard.get(id) {
            Some(c) => c.is_listen,
            None => return false,
        };

        if is_listen {
            return self.accept_all(guard, id);
        }

        let is_connected = guard.get(id).map(|c| c.is_connected).unwrap_or(true);
        if !is_connected {
            return self.complete_connect(guard, id, readiness, finished);
        }

        if readiness.is_error() || readiness.is_hup() {
            queue_close(guard, &self.shared.poll, id);
            self.try_finish(guard, id, finished);
            return true;
        }

        let mut woke = false;
        if readiness.is_readable() && !is_output {
            woke |= self.schedule_read(guard, id);
        }
        if readiness.is_writable() {
            woke |= self.drain_output(guard, id);
        }
        woke
    }

    /// Schedules one read-and-dispatch work item. Skipped while another
    /// work item is already queued or in flight for this connection, so a
    /// level-triggered readable event doesn't stack up duplicate reads.
    fn schedule_read(&self, guard: &mut RegistryState, id: ConnId) -> bool {
        let conn = match guard.get_mut(id) {
            Some(c) => c,
            None => return false,
        };
        if conn.work_active || !conn.work_queue.is_empty() {
            return false;
        }

        conn.can_read = true;
        let fd = conn.input_fd;
        let conn_type = conn.conn_type;
        let shared = self.shared.clone();
        conn.work_queue.push_back(WorkItem::run(move |status| {
            read_and_dispatch(shared, id, fd, conn_type, status)
        }));
        true
    }

    fn accept_all(&self, guard: &mut RegistryState, id: ConnId) -> bool {
        let (fd, conn_type) = match guard.get(id) {
            Some(c) => (c.input_fd, c.conn_type),
            None => return false,
        };
        let is_unix = guard.get(id).and_then(|c| c.unix_socket_path.as_ref()).is_some();

        let mut accepted = false;
        loop {
            let accepted_fd = if is_unix {
                match accept_unix(fd) {
                    Ok(Some(fd)) => Some(fd),
                    Ok(None) => None,
                    Err(e) => {
                        log::warn!("accept on {:?} failed: {}", id, e);
                        None
                    }
                }
            } else {
                match accept_tcp(fd) {
                    Ok(Some((fd, _addr))) => Some(fd),
                    Ok(None) => None,
                    Err(e) => {
                        log::warn!("accept on {:?} failed: {}", id, e);
                        None
                    }
                }
            };

            let accepted_fd = match accepted_fd {
                Some(fd) => fd,
                None => break,
            };

            if !is_unix {
                let sock = Socket::from_inner(accepted_fd);
                if let Err(e) = sock.set_keepalive(self.shared.keep_alive) {
                    log::warn!("set_keepalive on accepted fd {}: {}", accepted_fd, e);
                }
                let _ = sock.into_inner();
            }

            let callback_arg = self
                .shared
                .callbacks
                .on_connection
                .as_ref()
                .and_then(|cb| cb(id));

            // Accepted connections don't get a meaningful peer path, but
            // local-domain ones are tagged so `fd_get_auth_creds` knows
            // `SO_PEERCRED` applies.
            let address = if is_unix {
                Some(crate::addr::Address::Unix(String::new()))
            } else {
                None
            };

            let conn = crate::connection::Connection {
                name: format!("fd:{}", accepted_fd),
                input_fd: accepted_fd,
                output_fd: accepted_fd,
                conn_type,
                polling_input_kind: PollingKind::None,
                polling_output_kind: PollingKind::None,
                input_unsupported: false,
                output_unsupported: false,
                is_socket: true,
                is_listen: false,
                is_connected: true,
                read_eof: false,
                can_read: false,
                work_active: false,
                in_buffer: crate::connection::InBuffer::with_capacity(4096),
                out_queue: Default::default(),
                work_queue: Default::default(),
                write_complete_queue: Default::default(),
                address,
                unix_socket_path: None,
                arg: callback_arg,
            };
            guard.insert(conn, false);
            accepted = true;
        }
        accepted
    }

    fn complete_connect(
        &self,
        guard: &mut RegistryState,
        id: ConnId,
        readiness: crate::epoll::Ready,
        finished: &mut Vec<(ConnId, crate::connection::Connection)>,
    ) -> bool {
        if !readiness.is_writable() && !readiness.is_error() {
            return false;
        }
        let fd = match guard.get(id) {
            Some(c) => c.input_fd,
            None => return false,
        };

        match take_connect_error(fd) {
            Ok(None) => {
                if let Some(conn) = guard.get_mut(id) {
                    conn.is_connected = true;
                }
                true
            }
            Ok(Some(e)) => {
                log::warn!("connect on {:?} failed: {}", id, e);
                queue_close(guard, &self.shared.poll, id);
                self.try_finish(guard, id, finished);
                true
            }
            Err(e) => {
                log::warn!("SO_ERROR lookup on {:?} failed: {}", id, e);
                queue_close(guard, &self.shared.poll, id);
                self.try_finish(guard, id, finished);
                true
            }
        }
    }

    /// Schedules one write-drain work item if `out_queue` has bytes and no
    /// drain is already in flight.
    fn drain_output(&self, guard: &mut RegistryState, id: ConnId) -> bool {
        let conn = match guard.get_mut(id) {
            Some(c) => c,
            None => return false,
        };
        if conn.out_queue.is_empty() || conn.work_active {
            return false;
        }

        let fd = conn.output_fd;
        let shared = self.shared.clone();
        conn.work_queue
            .push_back(WorkItem::run(move |status| drain_out_queue(shared, id, fd, status)));
        true
    }

    fn try_finish(
        &self,
        guard: &mut RegistryState,
        id: ConnId,
        finished: &mut Vec<(ConnId, crate::connection::Connection)>,
    ) {
        if let Some(conn) = finalize_if_drained(guard, id) {
            finished.push((id, conn));
        }
    }

    /// Step 1-2 of `spec.md` §4.3: recompute and relink every active/listen
    /// connection whose desired kind changed since the last iteration.
    fn relink_all(
        &self,
        guard: &mut RegistryState,
        finished: &mut Vec<(ConnId, crate::connection::Connection)>,
    ) {
        let ids: Vec<ConnId> = guard.active_ids().chain(guard.listen_ids()).collect();

        for id in ids {
            let (kind, same_fd, input_fd, output_fd, cur_in, cur_out) = match guard.get(id) {
                Some(c) => (
                    desired_kind(c),
                    c.same_fd(),
                    c.input_fd,
                    c.output_fd,
                    c.polling_input_kind,
                    c.polling_output_kind,
                ),
                None => continue,
            };

            let (want_in, want_out) = kind.split(same_fd);

            if want_in != cur_in {
                self.relink_half(guard, id, input_fd, want_in, input_token(id), false);
            }
            if let Some(want_out) = want_out {
                if want_out != cur_out {
                    self.relink_half(guard, id, output_fd, want_out, output_token(id), true);
                }
            }

            if kind == PollingKind::None {
                self.maybe_close_drained(guard, id, finished);
            }
        }
    }

    fn relink_half(
        &self,
        guard: &mut RegistryState,
        id: ConnId,
        fd: std::os::unix::io::RawFd,
        kind: PollingKind,
        token: Token,
        is_output: bool,
    ) {
        if fd == crate::connection::INVALID_FD {
            return;
        }

        if self.shared.debug_conmgr {
            log::trace!(
                "watch: relinking {:?} half={} kind={:?}",
                id,
                if is_output { "out" } else { "in" },
                kind
            );
        }

        let outcome = self.shared.poll.relink_fd(fd, kind, token).unwrap_or_else(|e| {
            log::error!("relinking fd {} failed: {}", fd, e);
            LinkOutcome::Linked
        });

        if let Some(conn) = guard.get_mut(id) {
            if is_output {
                conn.polling_output_kind = kind;
                if outcome == LinkOutcome::Unsupported {
                    conn.output_unsupported = true;
                }
            } else {
                conn.polling_input_kind = kind;
                if outcome == LinkOutcome::Unsupported {
                    conn.input_unsupported = true;
                }
            }
        }
    }

    /// `close_con` is idempotent (`spec.md` §4.8 step 1), so this is safe to
    /// call every iteration a connection's desired kind is NONE, not only
    /// the first time it transitions there.
    fn maybe_close_drained(
        &self,
        guard: &mut RegistryState,
        id: ConnId,
        finished: &mut Vec<(ConnId, crate::connection::Connection)>,
    ) {
        close_con(guard, &self.shared.poll, id);
        self.try_finish(guard, id, finished);
    }
}

/// Drains `out_queue` over `fd` chunk by chunk, re-locking the registry
/// between chunks rather than holding it across the syscall (`spec.md`
/// §5: the primary mutex is never held across blocking work). A partial
/// write re-enqueues the unwritten remainder at the front of the queue so
/// bytes are never lost short of a hard write error. Once `out_queue`
/// empties, any `write_complete_queue` callbacks fire — `RUN` on a clean
/// drain, `CANCELLED` if a hard write error forced the queue to be
/// discarded instead.
fn drain_out_queue(shared: Arc<Shared>, id: ConnId, fd: RawFd, status: WorkStatus) {
    if status == WorkStatus::Cancelled {
        drain_write_complete(&shared, id, WorkStatus::Cancelled);
        return;
    }

    loop {
        let mut buf = {
            let mut guard = shared.state.lock().unwrap();
            match guard.get_mut(id).and_then(|c| c.out_queue.pop_front()) {
                Some(b) => b,
                None => {
                    drop(guard);
                    drain_write_complete(&shared, id, WorkStatus::Run);
                    return;
                }
            }
        };

        match write_chunk_nonblocking(fd, &buf) {
            Ok(n) if n == buf.len() => continue,
            Ok(n) => {
                buf.drain(0..n);
                let mut guard = shared.state.lock().unwrap();
                if let Some(conn) = guard.get_mut(id) {
                    conn.out_queue.push_front(buf);
                }
                return;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let mut guard = shared.state.lock().unwrap();
                if let Some(conn) = guard.get_mut(id) {
                    conn.out_queue.push_front(buf);
                }
                return;
            }
            Err(e) => {
                log::warn!("write on fd {} failed: {}", fd, e);
                {
                    let mut guard = shared.state.lock().unwrap();
                    if let Some(conn) = guard.get_mut(id) {
                        conn.output_unsupported = true;
                        conn.out_queue.clear();
                    }
                }
                drain_write_complete(&shared, id, WorkStatus::Cancelled);
                return;
            }
        }
    }
}

/// Pops every pending `write_complete_queue` item for `id` and runs it with
/// `status`, outside the registry lock like any other per-connection
/// callback.
fn drain_write_complete(shared: &Arc<Shared>, id: ConnId, status: WorkStatus) {
    let items: Vec<WorkItem> = {
        let mut guard = shared.state.lock().unwrap();
        match guard.get_mut(id) {
            Some(conn) => conn.write_complete_queue.drain(..).collect(),
            None => return,
        }
    };

    for item in items {
        if let WorkKind::Run(f) = item.kind {
            f(status);
        }
    }
}

/// Runs any `write_complete_queue` callbacks still pending on a connection
/// that is being finalized — they never got the chance to fire via
/// `drain_write_complete` (`spec.md` §4.4: unstarted work is delivered
/// `CANCELLED` on shutdown/teardown).
pub(crate) fn run_pending_write_complete(conn: &mut crate::connection::Connection, status: WorkStatus) {
    for item in conn.write_complete_queue.drain(..) {
        if let WorkKind::Run(f) = item.kind {
            f(status);
        }
    }
}

/// Reads everything currently available on `fd` into `in_buffer`, then
/// dispatches `on_data`/`on_msg` against the unread bytes. `arg` is taken
/// out of the connection for the duration of the callback so the registry
/// mutex is never held across user code.
fn read_and_dispatch(
    shared: Arc<Shared>,
    id: ConnId,
    fd: RawFd,
    conn_type: ConnType,
    status: crate::connection::WorkStatus,
) {
    if status == crate::connection::WorkStatus::Cancelled {
        return;
    }

    let mut chunk = [0u8; 4096];
    loop {
        let n = unsafe { libc::read(fd, chunk.as_mut_ptr() as *mut c_void, chunk.len()) };
        if n > 0 {
            let mut guard = shared.state.lock().unwrap();
            if let Some(conn) = guard.get_mut(id) {
                conn.in_buffer.append(&chunk[..n as usize]);
            }
            continue;
        }
        if n == 0 {
            let mut guard = shared.state.lock().unwrap();
            if let Some(conn) = guard.get_mut(id) {
                conn.read_eof = true;
            }
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        if err.kind() != io::ErrorKind::WouldBlock {
            log::warn!("read on fd {} failed: {}", fd, err);
            let mut guard = shared.state.lock().unwrap();
            if let Some(conn) = guard.get_mut(id) {
                conn.read_eof = true;
            }
        }
        break;
    }

    let (bytes, arg) = {
        let mut guard = shared.state.lock().unwrap();
        match guard.get_mut(id) {
            Some(conn) => (conn.in_buffer.unread().to_vec(), conn.arg.take()),
            None => return,
        }
    };

    let mut arg = match arg {
        Some(a) => a,
        None => return,
    };

    let mut consumed_total = 0usize;
    match conn_type {
        ConnType::Raw => {
            if let Some(on_data) = &shared.callbacks.on_data {
                consumed_total = on_data(id, &bytes, &mut arg);
            }
        }
        ConnType::Rpc => {
            let mut offset = 0;
            if let Some(on_msg) = &shared.callbacks.on_msg {
                loop {
                    let n = on_msg(id, &bytes[offset..], &mut arg);
                    if n == 0 {
                        break;
                    }
                    offset += n;
                    if offset >= bytes.len() {
                        break;
                    }
                }
            }
            consumed_total = offset;
        }
    }

    let mut guard = shared.state.lock().unwrap();
    if let Some(conn) = guard.get_mut(id) {
        conn.in_buffer.consume(consumed_total);
        conn.arg = Some(arg);
        conn.can_read = false;
    }
}

fn write_chunk_nonblocking(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    loop {
        let ret = unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) };
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    }
}
