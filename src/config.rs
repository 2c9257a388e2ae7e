//! Manager configuration.

use std::thread::available_parallelism;

#[derive(Debug, Clone)]
pub struct Config {
    /// `listen()` backlog depth for every TCP and local-domain listener.
    pub backlog_depth: i32,
    /// Initial capacity of a connection's `in_buffer`.
    pub buffer_start_size: usize,
    /// Worker pool size. Defaults to available parallelism, floored at 1.
    pub worker_count: usize,
    /// Gates `trace!`-level per-event logging in the watch loop.
    pub debug_conmgr: bool,
    /// `SO_KEEPALIVE` default for non-listen, non-unix stream sockets.
    pub keep_alive: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            backlog_depth: 10,
            buffer_start_size: 4096,
            worker_count: available_parallelism().map(|n| n.get()).unwrap_or(1),
            debug_conmgr: false,
            keep_alive: true,
        }
    }
}
