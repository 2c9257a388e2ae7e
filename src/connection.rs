//! Per-connection state: polling kind, buffers, work queues, flags.
//!
//! `PollingKind` is a tagged enum rather than a C-style sticky int (§9,
//! "Polling-kind as sum type"); `UNSUPPORTED` is carried as a flag
//! orthogonal to the desired kind on each half so it can never be silently
//! clobbered by a later `relink`.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;

use crate::addr::Address;

pub const INVALID_FD: RawFd = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingKind {
    None,
    ReadOnly,
    WriteOnly,
    ReadWrite,
    Connected,
    Listen,
}

impl PollingKind {
    /// Table in spec.md §4.9: splits a desired kind into (input, output)
    /// polling kinds depending on whether the connection shares one fd for
    /// both halves or has a distinct input/output pair.
    pub fn split(self, same_fd: bool) -> (PollingKind, Option<PollingKind>) {
        use PollingKind::*;

        if same_fd {
            return (self, None);
        }

        match self {
            None => (PollingKind::None, Some(PollingKind::None)),
            Listen => (Listen, None),
            Connected => (Connected, Some(Connected)),
            ReadOnly => (ReadOnly, None),
            WriteOnly => (PollingKind::None, Some(WriteOnly)),
            ReadWrite => (ReadOnly, Some(WriteOnly)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnType {
    Raw,
    Rpc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    Run,
    Cancelled,
}

/// A runnable unit of work. Attached work lives in a connection's
/// `work_queue`/`write_complete_queue`; unattached (signal) work lives in
/// the signal bridge's dispatch table (`signal.rs`).
pub enum WorkKind {
    Close,
    Run(Box<dyn FnOnce(WorkStatus) + Send>),
}

pub struct WorkItem {
    pub kind: WorkKind,
}

impl WorkItem {
    pub fn run(f: impl FnOnce(WorkStatus) + Send + 'static) -> WorkItem {
        WorkItem {
            kind: WorkKind::Run(Box::new(f)),
        }
    }

    pub fn close() -> WorkItem {
        WorkItem {
            kind: WorkKind::Close,
        }
    }
}

/// Bounded append-only byte buffer with a read cursor. Cleared on close.
#[derive(Debug, Default)]
pub struct InBuffer {
    data: Vec<u8>,
    cursor: usize,
}

impl InBuffer {
    pub fn with_capacity(cap: usize) -> InBuffer {
        InBuffer {
            data: Vec::with_capacity(cap),
            cursor: 0,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Bytes not yet consumed by the reading callback.
    pub fn unread(&self) -> &[u8] {
        &self.data[self.cursor..]
    }

    pub fn consume(&mut self, n: usize) {
        self.cursor = (self.cursor + n).min(self.data.len());
        if self.cursor == self.data.len() {
            self.data.clear();
            self.cursor = 0;
        }
    }

    pub fn is_full(&self) -> bool {
        self.data.capacity() != 0 && self.data.len() >= self.data.capacity()
    }

    pub fn reset(&mut self) {
        self.data.clear();
        self.cursor = 0;
    }
}

/// Per-fd state tracked by the registry. See `spec.md` §3 for invariants.
pub struct Connection {
    pub name: String,
    pub input_fd: RawFd,
    pub output_fd: RawFd,

    pub conn_type: ConnType,

    pub polling_input_kind: PollingKind,
    pub polling_output_kind: PollingKind,
    pub input_unsupported: bool,
    pub output_unsupported: bool,

    pub is_socket: bool,
    pub is_listen: bool,
    pub is_connected: bool,
    pub read_eof: bool,
    pub can_read: bool,
    pub work_active: bool,

    pub in_buffer: InBuffer,
    pub out_queue: VecDeque<Vec<u8>>,
    pub work_queue: VecDeque<WorkItem>,
    pub write_complete_queue: VecDeque<WorkItem>,

    pub address: Option<Address>,
    pub unix_socket_path: Option<String>,

    /// Opaque per-connection handle, owned by the caller. The core never
    /// dereferences it; it is returned to `on_finish` and then dropped.
    pub arg: Option<Box<dyn std::any::Any + Send>>,
}

impl Connection {
    pub fn same_fd(&self) -> bool {
        self.output_fd == INVALID_FD || self.input_fd == self.output_fd
    }

    pub fn bytes_enqueued(&self) -> usize {
        self.out_queue.iter().map(|b| b.len()).sum()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn split_same_fd_keeps_kind() {
        assert_eq!(
            PollingKind::ReadWrite.split(true),
            (PollingKind::ReadWrite, None)
        );
    }

    #[test]
    fn split_distinct_fds_per_table() {
        assert_eq!(
            PollingKind::ReadWrite.split(false),
            (PollingKind::ReadOnly, Some(PollingKind::WriteOnly))
        );
        assert_eq!(
            PollingKind::WriteOnly.split(false),
            (PollingKind::None, Some(PollingKind::WriteOnly))
        );
        assert_eq!(
            PollingKind::ReadOnly.split(false),
            (PollingKind::ReadOnly, None)
        );
        assert_eq!(
            PollingKind::Connected.split(false),
            (PollingKind::Connected, Some(PollingKind::Connected))
        );
    }

    #[test]
    fn in_buffer_consume_resets_when_drained() {
        let mut buf = InBuffer::with_capacity(16);
        buf.append(b"hi\n");
        assert_eq!(buf.unread(), b"hi\n");
        buf.consume(3);
        assert_eq!(buf.unread(), b"");
    }
}
