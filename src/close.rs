//! Close Coordinator (`spec.md` §4.8). `close_con` is the sole path to
//! close a connection; it defers while `work_active` and otherwise runs
//! immediately — the single branch the spec's own note (§9, "Ambiguity
//! observed") says the reference code obscured behind an inverted helper.

use std::os::unix::io::RawFd;

use crate::connection::{Connection, PollingKind, WorkItem, INVALID_FD};
use crate::listener::unlink_unix_path;
use crate::poll_controller::PollController;
use crate::registry::{ConnId, RegistryState};

/// Request a close. If work is active on the connection the close is
/// deferred by queuing a retry; otherwise it runs immediately.
pub fn queue_close(state: &mut RegistryState, poll: &PollController, id: ConnId) {
    let work_active = match state.get(id) {
        Some(c) => c.work_active,
        None => return,
    };

    if work_active {
        state
            .get_mut(id)
            .unwrap()
            .work_queue
            .push_back(WorkItem::close());
        return;
    }

    close_con(state, poll, id);
}

/// Steps 1-6 of `spec.md` §4.8. Idempotent: a connection whose `input_fd`
/// is already `-1` returns immediately.
pub fn close_con(state: &mut RegistryState, poll: &PollController, id: ConnId) {
    let conn = match state.get_mut(id) {
        Some(c) => c,
        None => return,
    };

    if conn.input_fd == INVALID_FD {
        return;
    }

    if conn.is_listen {
        if let Some(path) = conn.unix_socket_path.take() {
            unlink_unix_path(&path);
        }
    }

    let _ = poll.unlink_fd(conn.input_fd);
    if conn.output_fd != INVALID_FD && conn.output_fd != conn.input_fd {
        let _ = poll.unlink_fd(conn.output_fd);
    }

    conn.polling_input_kind = PollingKind::None;
    conn.polling_output_kind = PollingKind::None;
    conn.read_eof = true;
    conn.can_read = false;
    conn.in_buffer.reset();

    close_input_half(conn);

    conn.input_fd = INVALID_FD;
}

fn close_input_half(conn: &mut Connection) {
    if conn.is_listen {
        close_raw(conn.input_fd);
        return;
    }

    if conn.output_fd == INVALID_FD || conn.output_fd == conn.input_fd {
        // Shared socket fd: shut down the read half only, writes still
        // need to drain.
        shutdown_read(conn.input_fd);
    } else {
        close_raw(conn.input_fd);
    }
}

fn shutdown_read(fd: RawFd) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_RD);
    }
}

fn close_raw(fd: RawFd) {
    if fd != INVALID_FD {
        unsafe {
            libc::close(fd);
        }
    }
}

/// Finalization once both queues are empty and no work remains: closes
/// `output_fd`, removes the connection from the registry and hands it back
/// so the caller can run `on_finish` with its `arg` outside the lock.
pub fn finalize_if_drained(state: &mut RegistryState, id: ConnId) -> Option<Connection> {
    let ready = match state.get(id) {
        Some(c) => {
            c.input_fd == INVALID_FD
                && c.out_queue.is_empty()
                && c.work_queue.is_empty()
                && !c.work_active
        }
        None => false,
    };

    if !ready {
        return None;
    }

    state.move_to_complete(id);
    let conn = state.finalize(id)?;
    if conn.output_fd != INVALID_FD {
        close_raw(conn.output_fd);
    }
    Some(conn)
}
