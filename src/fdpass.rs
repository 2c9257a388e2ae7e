//! FD-passing work items (`spec.md` §4.6), built on the raw `SCM_RIGHTS`
//! primitives in `sys::fdpass`. Both operations are queued as ordinary
//! per-connection work so they serialize with everything else on the
//! source connection.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::callbacks::Arg;
use crate::connection::{Connection, ConnType, InBuffer, PollingKind, WorkItem, WorkStatus};
use crate::error::{ConMgrError, Result};
use crate::registry::{ConnId, RegistryState};
use crate::sys::fdpass;
use crate::worker::Shared;

/// Validates the common precondition for both operations: `con` must be a
/// live socket that hasn't seen EOF.
fn require_open_socket(state: &RegistryState, con: ConnId) -> Result<RawFd> {
    let conn = state
        .get(con)
        .ok_or_else(|| ConMgrError::MissingSocket(format!("{:?} not found", con)))?;

    if !conn.is_socket || conn.read_eof || conn.input_fd < 0 {
        return Err(ConMgrError::MissingSocket(format!(
            "{:?} is not an open socket",
            con
        )));
    }
    Ok(conn.output_fd)
}

/// Queues a send-fd work item on `con`. The worker writes `fd` as
/// ancillary data over `con`'s `output_fd`, then always closes the local
/// copy regardless of outcome — ownership of `fd` transfers to the queue
/// call, not to the eventual write.
pub fn queue_send_fd(state: &mut RegistryState, con: ConnId, fd: RawFd) -> Result<()> {
    let sock_fd = require_open_socket(state, con)?;

    let conn = state.get_mut(con).unwrap();
    conn.work_queue.push_back(WorkItem::run(move |status| {
        if status == WorkStatus::Cancelled {
            unsafe {
                libc::close(fd);
            }
            return;
        }
        if let Err(e) = fdpass::send_fd(sock_fd, fd) {
            log::warn!("send_fd on fd {} failed: {}", sock_fd, e);
        }
        unsafe {
            libc::close(fd);
        }
    }));
    Ok(())
}

/// Queues a receive-fd work item on `src`. On success the received fd is
/// registered as a fresh connection of `conn_type` with `arg`; on read
/// failure `src` is closed, since its framing state is now indeterminate.
pub fn queue_receive_fd(
    state: &mut RegistryState,
    shared: Arc<Shared>,
    src: ConnId,
    conn_type: ConnType,
    arg: Option<Arg>,
) -> Result<()> {
    let sock_fd = require_open_socket(state, src)?;

    let conn = state.get_mut(src).unwrap();
    let mut arg = arg;
    conn.work_queue.push_back(WorkItem::run(move |status| {
        if status == WorkStatus::Cancelled {
            return;
        }

        match fdpass::recv_fd(sock_fd) {
            Ok(Some(fd)) => {
                let mut guard = shared.state.lock().unwrap();
                let new_conn = Connection {
                    name: format!("fd:{}", fd),
                    input_fd: fd,
                    output_fd: fd,
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
                    in_buffer: InBuffer::with_capacity(4096),
                    out_queue: Default::default(),
                    work_queue: Default::default(),
                    write_complete_queue: Default::default(),
                    address: None,
                    unix_socket_path: None,
                    arg: arg.take(),
                };
                guard.insert(new_conn, false);
                drop(guard);
                shared.watch_sleep.notify_all();
                let _ = shared.poll.interrupt();
            }
            Ok(None) => {
                log::warn!("receive_fd on {:?}: peer closed before sending an fd", src);
            }
            Err(e) => {
                log::warn!("receive_fd on {:?} failed: {}", src, e);
                let mut guard = shared.state.lock().unwrap();
                if let Some(conn) = guard.get_mut(src) {
                    conn.read_eof = true;
                }
            }
        }
    }));
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::VecDeque;

    fn stub_connection(fd: RawFd) -> Connection {
        Connection {
            name: format!("fd:{}", fd),
            input_fd: fd,
            output_fd: fd,
            conn_type: ConnType::Raw,
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
            in_buffer: InBuffer::with_capacity(4096),
            out_queue: VecDeque::new(),
            work_queue: VecDeque::new(),
            write_complete_queue: VecDeque::new(),
            address: None,
            unix_socket_path: None,
            arg: None,
        }
    }

    #[test]
    fn rejects_eof_source() {
        let mut state = RegistryState::new();
        let mut conn = stub_connection(3);
        conn.read_eof = true;
        let id = state.insert(conn, false);

        assert!(queue_send_fd(&mut state, id, 99).is_err());
    }

    #[test]
    fn queues_one_work_item_on_success() {
        let mut state = RegistryState::new();
        let id = state.insert(stub_connection(3), false);
        queue_send_fd(&mut state, id, 99).unwrap();
        assert_eq!(state.get(id).unwrap().work_queue.len(), 1);
    }
}
