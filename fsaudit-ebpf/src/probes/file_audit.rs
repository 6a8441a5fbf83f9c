//! `sys_enter_*` tracepoints for open, write and unlink.
//!
//! Each program reads its arguments from the tracepoint record, hands them
//! to the shared capture core and returns 0. Nothing here can reject or
//! delay the syscall, and the submitted record is the only output: an
//! unreadable path shows up as an empty filename, nothing else.

use aya_ebpf::{macros::tracepoint, programs::TracePointContext};
use fsaudit_common::{
    NO_FD, capture_open, capture_unlink, capture_write,
    tracepoint::{OPEN_FILENAME, OPENAT_FILENAME, UNLINK_PATHNAME, UNLINKAT_PATHNAME, WRITE_COUNT, WRITE_FD},
};

use crate::probes::{CurrentTask, PerfSink};

#[tracepoint]
pub fn sys_enter_openat(ctx: TracePointContext) -> u32 {
    let filename = read_arg(&ctx, OPENAT_FILENAME);
    capture_open(&CurrentTask, &PerfSink::new(&ctx), filename);
    0
}

#[tracepoint]
pub fn sys_enter_open(ctx: TracePointContext) -> u32 {
    let filename = read_arg(&ctx, OPEN_FILENAME);
    capture_open(&CurrentTask, &PerfSink::new(&ctx), filename);
    0
}

#[tracepoint]
pub fn sys_enter_write(ctx: TracePointContext) -> u32 {
    // fd is an unsigned int widened into an 8-byte slot; keep the low 32
    // bits so values like -1 passed by the caller survive.
    let fd = unsafe { ctx.read_at::<u64>(WRITE_FD) }.map_or(NO_FD, |fd| fd as u32 as i32);
    let count = read_arg(&ctx, WRITE_COUNT);
    capture_write(&CurrentTask, &PerfSink::new(&ctx), fd, count);
    0
}

#[tracepoint]
pub fn sys_enter_unlinkat(ctx: TracePointContext) -> u32 {
    let pathname = read_arg(&ctx, UNLINKAT_PATHNAME);
    capture_unlink(&CurrentTask, &PerfSink::new(&ctx), pathname);
    0
}

#[tracepoint]
pub fn sys_enter_unlink(ctx: TracePointContext) -> u32 {
    let pathname = read_arg(&ctx, UNLINK_PATHNAME);
    capture_unlink(&CurrentTask, &PerfSink::new(&ctx), pathname);
    0
}

/// Reads an 8-byte argument slot. A failed read yields 0, which the capture
/// core treats as an unreadable pointer or a zero count.
#[inline(always)]
fn read_arg(ctx: &TracePointContext, offset: usize) -> u64 {
    unsafe { ctx.read_at::<u64>(offset) }.unwrap_or(0)
}
