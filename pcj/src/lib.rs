//! A PGAS runtime for SPMD computation across a cluster of processes.
//!
//! Every process hosts one or more logical threads of the same user program.
//! Each thread owns a private storage area and communicates through explicit
//! one-sided operations (get/put/accumulate), broadcasts, barriers and
//! reductions over named groups. Collectives fan in and out over a
//! binary-heap shaped communication tree, giving O(log N) latency.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod config;
pub mod ctx;
pub mod error;
pub mod future;
pub mod group;
pub mod logging;
pub mod msg;
pub mod net;
pub mod node;
pub mod runtime;
pub mod state;
pub mod storage;
pub mod wire;

pub use crate::config::Properties;
pub use crate::ctx::{CollectFuture, Ctx, GroupHandle, PcjFuture};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::runtime::{start, EntryFn, Job, Settings, TaskCtx, TaskFn};
pub use crate::storage::CombineFn;
pub use crate::wire::{from_bytes, to_bytes, Decode, Encode};

/// Dense identifier of a process (node) in the job. Node 0 is the coordinator.
pub type PhysicalId = u32;

/// Identifier of a logical thread, unique across the whole job.
pub type GlobalThreadId = u32;

/// A thread's index within a group, dense in `[0..|G|)`.
pub type GroupThreadId = u32;

/// Identifier of a thread group. Group 0 is the global group.
pub type GroupId = u32;

/// Monotonic per-originator request number.
pub type RequestNum = u32;

/// The group containing every thread of the job, created before user code runs.
pub const GLOBAL_GROUP: GroupId = 0;

/// Name under which the global group is registered.
pub const GLOBAL_GROUP_NAME: &str = "global";
