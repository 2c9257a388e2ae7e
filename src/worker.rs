//! Worker pool (`spec.md` §4.4): a bounded set of threads dequeuing work
//! items, serialized per connection by the `work_active` flag.
//!
//! Workers and the watch loop share one registry mutex plus the
//! `watch_sleep` condition variable (`spec.md` §5); a worker that finds no
//! runnable connection waits on it rather than busy-polling, exactly the
//! primitive the teacher's `Queue`/`Waker` pair otherwise provides for an
//! epoll-driven consumer — here the consumer is a plain thread, so the
//! condvar is the idiomatic `std::sync` equivalent.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::callbacks::Callbacks;
use crate::close::{close_con, finalize_if_drained};
use crate::connection::{Connection, WorkItem, WorkKind, WorkStatus};
use crate::watch::run_pending_write_complete;
use crate::poll_controller::PollController;
use crate::registry::{ConnId, RegistryState};

pub struct Shared {
    pub state: Mutex<RegistryState>,
    pub watch_sleep: Condvar,
    pub poll: Arc<PollController>,
    pub callbacks: Arc<Callbacks>,
    /// `SO_KEEPALIVE` default applied to accepted and dialed TCP sockets.
    pub keep_alive: bool,
    /// Gates the watch loop's per-event `trace!` lines.
    pub debug_conmgr: bool,
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(count: usize, shared: Arc<Shared>) -> WorkerPool {
        let handles = (0..count.max(1))
            .map(|i| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("conmgr-worker-{}", i))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn connection-manager worker thread")
            })
            .collect();

        WorkerPool { handles }
    }

    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    let mut guard = shared.state.lock().unwrap();

    loop {
        if let Some(id) = guard.find_runnable() {
            let status = if guard.shutdown {
                WorkStatus::Cancelled
            } else {
                WorkStatus::Run
            };
            let item = {
                let conn = guard.get_mut(id).unwrap();
                conn.work_active = true;
                conn.work_queue.pop_front()
            };

            match item.map(|i| i.kind) {
                Some(WorkKind::Close) => {
                    // No user code runs here, so there is no need to drop
                    // the lock — this is the retry path for a close that
                    // was deferred while work was active on this
                    // connection (`spec.md` §4.8).
                    close_con(&mut guard, &shared.poll, id);
                    let finished = finalize_if_drained(&mut guard, id);
                    if let Some(conn) = guard.get_mut(id) {
                        conn.work_active = false;
                    }
                    shared.watch_sleep.notify_all();
                    if let Some(conn) = finished {
                        drop(guard);
                        run_on_finish(&shared, id, conn);
                        guard = shared.state.lock().unwrap();
                    }
                }
                Some(WorkKind::Run(f)) => {
                    drop(guard);
                    f(status);
                    guard = shared.state.lock().unwrap();
                    if let Some(conn) = guard.get_mut(id) {
                        conn.work_active = false;
                    }
                    shared.watch_sleep.notify_all();
                }
                None => {
                    if let Some(conn) = guard.get_mut(id) {
                        conn.work_active = false;
                    }
                }
            }
            continue;
        }

        if !guard.unattached_work.is_empty() {
            let item = guard.unattached_work.pop_front().unwrap();
            drop(guard);
            if let WorkKind::Run(f) = item.kind {
                f(WorkStatus::Run);
            }
            guard = shared.state.lock().unwrap();
            continue;
        }

        if guard.shutdown && guard.is_empty() {
            return;
        }

        guard = shared.watch_sleep.wait(guard).unwrap();
    }
}

fn run_on_finish(shared: &Arc<Shared>, id: ConnId, mut conn: Connection) {
    run_pending_write_complete(&mut conn, WorkStatus::Cancelled);
    if let Some(on_finish) = &shared.callbacks.on_finish {
        on_finish(id, conn.arg, WorkStatus::Run);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::{ConnType, InBuffer, PollingKind};
    use std::collections::VecDeque;
    use std::sync::mpsc;
    use std::time::Duration;

    fn stub_connection(fd: i32) -> crate::connection::Connection {
        crate::connection::Connection {
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
    fn runs_one_work_item_and_clears_work_active() {
        let shared = Arc::new(Shared {
            state: Mutex::new(RegistryState::new()),
            watch_sleep: Condvar::new(),
            poll: Arc::new(PollController::new().unwrap()),
            callbacks: Arc::new(Callbacks::default()),
            keep_alive: true,
            debug_conmgr: false,
        });

        let (tx, rx) = mpsc::channel();
        let id = {
            let mut state = shared.state.lock().unwrap();
            let id = state.insert(stub_connection(3), false);
            state
                .get_mut(id)
                .unwrap()
                .work_queue
                .push_back(WorkItem::run(move |status| {
                    tx.send(status).unwrap();
                }));
            shared.watch_sleep.notify_all();
            id
        };

        let pool = WorkerPool::spawn(1, shared.clone());
        let status = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(status, WorkStatus::Run);

        {
            let mut state = shared.state.lock().unwrap();
            assert!(!state.get_mut(id).unwrap().work_active);
            state.shutdown = true;
            shared.watch_sleep.notify_all();
        }
        pool.join();
    }
}
