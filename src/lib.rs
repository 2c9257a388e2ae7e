//! A single-process, event-driven connection manager: an `epoll`-backed
//! poll controller, a bounded worker pool, and a self-pipe signal bridge,
//! wired together behind one [`manager::Manager`] handle.
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! conmgr = "0.1"
//! ```
//!
//! A caller builds a [`callbacks::Callbacks`] table, starts a [`manager::Manager`]
//! with a [`config::Config`], and then drives the rest of its program through
//! the manager's handle:
//!
//! ```no_run
//! use conmgr::callbacks::Callbacks;
//! use conmgr::config::Config;
//! use conmgr::connection::ConnType;
//! use conmgr::manager::Manager;
//!
//! let mut callbacks = Callbacks::default();
//! callbacks.on_data = Some(Box::new(|_con, data, _arg| data.len()));
//!
//! let manager = Manager::init(Config::default(), callbacks).unwrap();
//! manager
//!     .create_listen_sockets(ConnType::Raw, "127.0.0.1:0", None)
//!     .unwrap();
//! manager.shutdown();
//! ```

#[macro_use]
mod macros;

pub mod epoll;
mod net;
mod sys;
mod waker;

pub mod addr;
pub mod callbacks;
pub mod close;
pub mod config;
pub mod connection;
pub mod error;
pub mod fdpass;
pub mod listener;
pub mod manager;
pub mod poll_controller;
pub mod registry;
pub mod signal;
mod watch;
mod worker;

pub use callbacks::Callbacks;
pub use config::Config;
pub use connection::ConnType;
pub use error::{ConMgrError, Result};
pub use manager::Manager;
pub use registry::ConnId;
