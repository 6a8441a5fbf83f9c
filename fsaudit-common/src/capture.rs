//! Record population for the open, write and unlink probes.
//!
//! The handlers here run inside `sys_enter_*` tracepoints, so they are
//! written against two small traits instead of the aya helpers directly:
//! [`TaskContext`] for the calling task and its memory, [`EventSink`] for the
//! transport. The BPF programs supply kernel-backed impls; tests supply fakes.
//!
//! Every handler builds exactly one [`FileEvent`] on its own stack, submits
//! it once and returns. Nothing loops over caller-controlled input and
//! nothing can fail: an unreadable path still yields a record.

use crate::event::{FileEvent, MAX_FILENAME_LEN, NO_FD, SyscallKind, TASK_COMM_LEN};

/// The task that entered the syscall.
pub trait TaskContext {
    /// `tgid << 32 | tid`, as returned by `bpf_get_current_pid_tgid`.
    fn pid_tgid(&self) -> u64;

    /// Executable name of the task. Zeroed when the helper fails.
    fn comm(&self) -> [u8; TASK_COMM_LEN];

    /// Copies a nul-terminated string out of the task's address space.
    ///
    /// Returns the number of bytes copied, not counting the terminator. Must
    /// fail immediately (never wait for a page fault to be serviced) when
    /// `src` is not readable. Bytes written to `dst` before a failure are
    /// discarded by the caller.
    fn read_user_str(&self, src: u64, dst: &mut [u8]) -> Result<usize, i64>;
}

/// Where finished records go.
///
/// `submit` must not block or retry. A transport without room drops the
/// record; the caller is never told.
pub trait EventSink {
    fn submit(&self, event: &FileEvent);
}

/// Result of a fault-tolerant copy from user memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UserCopy {
    /// Bytes copied, not counting the terminator.
    pub copied: usize,
    /// The copy filled the buffer, so the source may have been longer.
    pub truncated: bool,
    /// The source could not be read; the destination is empty.
    pub faulted: bool,
}

impl UserCopy {
    const FAULT: Self = Self {
        copied: 0,
        truncated: false,
        faulted: true,
    };
}

/// Copies the string at `src` into `dst`, leaving `dst` nul-terminated no
/// matter what the source looked like.
#[inline(always)]
pub fn copy_user_str<C: TaskContext>(ctx: &C, src: u64, dst: &mut [u8; MAX_FILENAME_LEN]) -> UserCopy {
    let limit = MAX_FILENAME_LEN - 1;

    let outcome = if src == 0 {
        UserCopy::FAULT
    } else {
        match ctx.read_user_str(src, dst) {
            Ok(n) => {
                let copied = if n > limit { limit } else { n };
                UserCopy {
                    copied,
                    truncated: copied == limit,
                    faulted: false,
                }
            }
            Err(_) => UserCopy::FAULT,
        }
    };

    if outcome.faulted {
        // A failed read may have written part of the string first.
        *dst = [0; MAX_FILENAME_LEN];
    } else if let Some(end) = dst.get_mut(outcome.copied) {
        *end = 0;
    }
    dst[limit] = 0;
    outcome
}

/// Handler body for `open`/`openat`.
#[inline(always)]
pub fn capture_open<C: TaskContext, S: EventSink>(ctx: &C, sink: &S, filename: u64) -> UserCopy {
    capture_path(ctx, sink, SyscallKind::Open, filename)
}

/// Handler body for `unlink`/`unlinkat`.
#[inline(always)]
pub fn capture_unlink<C: TaskContext, S: EventSink>(ctx: &C, sink: &S, pathname: u64) -> UserCopy {
    capture_path(ctx, sink, SyscallKind::Unlink, pathname)
}

/// Handler body for `write`. `fd` and `count` are the raw entry arguments.
#[inline(always)]
pub fn capture_write<C: TaskContext, S: EventSink>(ctx: &C, sink: &S, fd: i32, count: u64) {
    let mut event = FileEvent::zeroed();
    stamp(ctx, &mut event, SyscallKind::Write);
    event.filename[0] = 0;
    event.fd = fd;
    event.byte_count = count;
    sink.submit(&event);
}

#[inline(always)]
fn capture_path<C: TaskContext, S: EventSink>(
    ctx: &C,
    sink: &S,
    kind: SyscallKind,
    path: u64,
) -> UserCopy {
    let mut event = FileEvent::zeroed();
    stamp(ctx, &mut event, kind);
    let copy = copy_user_str(ctx, path, &mut event.filename);
    event.fd = NO_FD;
    event.byte_count = 0;
    sink.submit(&event);
    copy
}

#[inline(always)]
fn stamp<C: TaskContext>(ctx: &C, event: &mut FileEvent, kind: SyscallKind) {
    event.syscall_kind = kind as u32;
    event.pid = (ctx.pid_tgid() >> 32) as u32;
    event.comm = ctx.comm();
    event.comm[TASK_COMM_LEN - 1] = 0;
}
