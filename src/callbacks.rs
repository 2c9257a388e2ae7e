//! Capability-checked callback table (`spec.md` §6, §9 "Callback
//! indirection"): four slots plus a per-type check that RAW carries
//! `on_data` and RPC carries `on_msg`.

use crate::connection::{ConnType, WorkStatus};
use crate::error::{ConMgrError, Result};
use crate::registry::ConnId;

pub type Arg = Box<dyn std::any::Any + Send>;

pub trait OnConnection: Fn(ConnId) -> Option<Arg> + Send + Sync {}
impl<F: Fn(ConnId) -> Option<Arg> + Send + Sync> OnConnection for F {}

/// Returns the number of bytes consumed from `unread` — the rest stays in
/// `in_buffer` for the next invocation. Taking the slice directly (rather
/// than a reentrant handle back into the registry) avoids the cyclic
/// ownership the design note in `spec.md` §9 warns about.
pub trait OnData: Fn(ConnId, &[u8], &mut Arg) -> usize + Send + Sync {}
impl<F: Fn(ConnId, &[u8], &mut Arg) -> usize + Send + Sync> OnData for F {}

/// Returns the number of bytes consumed by one framed message, or `0` if
/// `unread` does not yet hold a complete frame. Called in a loop so a
/// single read that delivered several frames dispatches all of them.
pub trait OnMsg: Fn(ConnId, &[u8], &mut Arg) -> usize + Send + Sync {}
impl<F: Fn(ConnId, &[u8], &mut Arg) -> usize + Send + Sync> OnMsg for F {}

pub trait OnFinish: Fn(ConnId, Option<Arg>, WorkStatus) + Send + Sync {}
impl<F: Fn(ConnId, Option<Arg>, WorkStatus) + Send + Sync> OnFinish for F {}

#[derive(Default)]
pub struct Callbacks {
    pub on_connection: Option<Box<dyn OnConnection>>,
    pub on_data: Option<Box<dyn OnData>>,
    pub on_msg: Option<Box<dyn OnMsg>>,
    pub on_finish: Option<Box<dyn OnFinish>>,
}

impl Callbacks {
    /// RAW connections must have `on_data`; RPC connections must have
    /// `on_msg`. Validated once at registration, not on every dispatch.
    pub fn check_capability(&self, conn_type: ConnType) -> Result<()> {
        match conn_type {
            ConnType::Raw if self.on_data.is_none() => Err(ConMgrError::InvalidArgument(
                "RAW connection requires on_data".to_string(),
            )),
            ConnType::Rpc if self.on_msg.is_none() => Err(ConMgrError::InvalidArgument(
                "RPC connection requires on_msg".to_string(),
            )),
            _ => Ok(()),
        }
    }
}
