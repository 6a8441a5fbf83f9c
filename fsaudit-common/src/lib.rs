#![cfg_attr(not(test), no_std)]

//! Types shared by the fsaudit eBPF programs and the userspace agent.
//!
//! Everything in this crate must build for `bpfel-unknown-none`: no heap,
//! no panicking paths, fixed-size buffers only. The `user` feature adds the
//! `aya::Pod` impls the agent needs to read records out of perf buffers.

pub mod capture;
pub mod event;
pub mod tracepoint;

pub use capture::{EventSink, TaskContext, UserCopy, capture_open, capture_unlink, capture_write};
pub use event::{FileEvent, MAX_FILENAME_LEN, NO_FD, SyscallKind, TASK_COMM_LEN};

/// Name of the per-CPU perf event array the probes submit to.
pub const FILE_EVENTS_MAP: &str = "FILE_EVENTS";
