//! Connection registry: three membership lists (active, listen, complete)
//! guarded by the single registry mutex (`spec.md` §3, §5).

use std::collections::VecDeque;
use std::os::unix::io::RawFd;

use slab::Slab;

use crate::addr::Address;
use crate::connection::{Connection, WorkItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Membership {
    Active,
    Listen,
    Complete,
}

/// All registry-protected state. Lives behind `Manager`'s `Mutex`.
pub struct RegistryState {
    conns: Slab<Connection>,
    membership: Vec<Option<Membership>>,
    active: Vec<usize>,
    listen: Vec<usize>,
    complete: Vec<usize>,
    pub shutdown: bool,
    /// FIFO of work not bound to a connection — the signal bridge's
    /// per-signal-number dispatches land here (`spec.md` §4.4, §4.7).
    pub unattached_work: VecDeque<WorkItem>,
}

impl RegistryState {
    pub fn new() -> RegistryState {
        RegistryState {
            conns: Slab::new(),
            membership: Vec::new(),
            active: Vec::new(),
            listen: Vec::new(),
            complete: Vec::new(),
            shutdown: false,
            unattached_work: VecDeque::new(),
        }
    }

    fn ensure_membership_slot(&mut self, idx: usize) {
        if self.membership.len() <= idx {
            self.membership.resize(idx + 1, None);
        }
    }

    /// Insert a connection already validated by the caller, placing it in
    /// the active or listen list per invariant 5 (exactly one list).
    pub fn insert(&mut self, conn: Connection, listen: bool) -> ConnId {
        let is_listen = conn.is_listen;
        debug_assert_eq!(is_listen, listen);

        let idx = self.conns.insert(conn);
        self.ensure_membership_slot(idx);

        if listen {
            self.membership[idx] = Some(Membership::Listen);
            self.listen.push(idx);
        } else {
            self.membership[idx] = Some(Membership::Active);
            self.active.push(idx);
        }

        ConnId(idx)
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.conns.get(id.0)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.conns.get_mut(id.0)
    }

    /// Lookup by fd: scans active then listen. Complete entries have no
    /// live fds and are never matched.
    pub fn find_by_fd(&self, fd: RawFd) -> Option<ConnId> {
        self.active
            .iter()
            .chain(self.listen.iter())
            .find(|&&idx| {
                let c = &self.conns[idx];
                c.input_fd == fd || c.output_fd == fd
            })
            .map(|&idx| ConnId(idx))
    }

    pub fn active_ids(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.active.iter().map(|&idx| ConnId(idx))
    }

    /// Selection rule from `spec.md` §4.4: the first active connection with
    /// queued work and no worker currently holding it.
    pub fn find_runnable(&self) -> Option<ConnId> {
        self.active
            .iter()
            .find(|&&idx| {
                let c = &self.conns[idx];
                !c.work_active && !c.work_queue.is_empty()
            })
            .map(|&idx| ConnId(idx))
    }

    pub fn listen_ids(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.listen.iter().map(|&idx| ConnId(idx))
    }

    /// AF_INET compares (addr,port); AF_INET6 compares (addr,port,scope);
    /// AF_UNIX compares path. See `Address::family_eq`.
    pub fn is_duplicate_listen(&self, addr: &Address) -> bool {
        self.listen
            .iter()
            .any(|&idx| match &self.conns[idx].address {
                Some(existing) => existing.family_eq(addr),
                None => false,
            })
    }

    /// Move a connection from active/listen into the complete list. Called
    /// by the watch loop once a close has fully drained.
    pub fn move_to_complete(&mut self, id: ConnId) {
        let idx = id.0;
        match self.membership.get(idx).copied().flatten() {
            Some(Membership::Active) => self.active.retain(|&i| i != idx),
            Some(Membership::Listen) => self.listen.retain(|&i| i != idx),
            Some(Membership::Complete) | None => return,
        }
        self.membership[idx] = Some(Membership::Complete);
        self.complete.push(idx);
    }

    /// Finalize: remove and return the connection for `on_finish` plus
    /// drop. Complete-list entries are never looked up by fd.
    pub fn finalize(&mut self, id: ConnId) -> Option<Connection> {
        let idx = id.0;
        self.complete.retain(|&i| i != idx);
        self.membership[idx] = None;
        if self.conns.contains(idx) {
            Some(self.conns.remove(idx))
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn all_ids(&self) -> Vec<ConnId> {
        self.conns.iter().map(|(idx, _)| ConnId(idx)).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::{ConnType, InBuffer, PollingKind, INVALID_FD};
    use std::collections::VecDeque;

    fn stub_connection(fd: RawFd, listen: bool) -> Connection {
        Connection {
            name: format!("fd:{}", fd),
            input_fd: fd,
            output_fd: if listen { INVALID_FD } else { fd },
            conn_type: ConnType::Raw,
            polling_input_kind: PollingKind::None,
            polling_output_kind: PollingKind::None,
            input_unsupported: false,
            output_unsupported: false,
            is_socket: true,
            is_listen: listen,
            is_connected: !listen,
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
    fn insert_and_find_by_fd() {
        let mut reg = RegistryState::new();
        let id = reg.insert(stub_connection(3, false), false);
        assert_eq!(reg.find_by_fd(3), Some(id));
        assert_eq!(reg.find_by_fd(4), None);
    }

    #[test]
    fn move_to_complete_then_finalize() {
        let mut reg = RegistryState::new();
        let id = reg.insert(stub_connection(3, false), false);
        reg.move_to_complete(id);
        assert!(reg.active_ids().next().is_none());
        let conn = reg.finalize(id).unwrap();
        assert_eq!(conn.input_fd, 3);
        assert!(reg.finalize(id).is_none());
    }

    #[test]
    fn duplicate_listen_detection() {
        let mut reg = RegistryState::new();
        let mut conn = stub_connection(3, true);
        conn.address = Some(Address::Unix("/tmp/e".to_string()));
        reg.insert(conn, true);

        assert!(reg.is_duplicate_listen(&Address::Unix("/tmp/e".to_string())));
        assert!(!reg.is_duplicate_listen(&Address::Unix("/tmp/other".to_string())));
    }
}
