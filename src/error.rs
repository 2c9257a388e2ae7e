//! Error taxonomy surfaced across the public API.
//!
//! `TransientRetry` is intentionally absent here: `EINTR`/`EAGAIN`/
//! `EINPROGRESS` are handled internally by the dial/accept/read/write loops
//! and never escape as an error variant (see `RetryOutcome` in `listener.rs`
//! and `watch.rs`).

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConMgrError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported address family")]
    UnsupportedFamily,

    #[error("operation requires a live socket: {0}")]
    MissingSocket(String),

    #[error("connection error: {0}")]
    ConnectionError(#[source] io::Error),

    #[error("not supported on this platform: {0}")]
    NotSupported(String),

    /// Setup-time failures that are neither success nor a recognized
    /// unsupported case: `epoll_create1`/bind/listen/registration errors
    /// surfaced from `manager.rs`, `listener.rs`, and `poll_controller.rs`.
    /// These indicate a programmer error (bad address, fd exhaustion during
    /// setup, a kernel that rejects epoll registration outright) rather
    /// than a condition the caller can recover from, so nothing ever
    /// constructs this variant and returns it — see [`ConMgrError::fatal`].
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ConMgrError {
    /// Logs `msg` at `error!` and aborts the process. The only way a
    /// `Fatal` condition is ever surfaced; call sites use this instead of
    /// building `ConMgrError::Fatal` and returning it so that a fatal
    /// setup failure can never be mistaken for a recoverable `Result::Err`.
    pub fn fatal(msg: impl std::fmt::Display) -> ! {
        log::error!("fatal: {}", msg);
        std::process::abort();
    }
}

pub type Result<T> = std::result::Result<T, ConMgrError>;
