//! Kernel-side plumbing shared by the file audit tracepoints.

use aya_ebpf::{
    EbpfContext,
    helpers::{bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_probe_read_user_str_bytes},
    macros::map,
    maps::PerfEventArray,
};
use fsaudit_common::{EventSink, FileEvent, TASK_COMM_LEN, TaskContext};

pub mod file_audit;

/// One ring per CPU. A full ring drops the record and bumps the ring's
/// lost counter, which userspace reads back.
#[map]
pub static FILE_EVENTS: PerfEventArray<FileEvent> = PerfEventArray::new(0);

/// The task currently executing the probe.
pub struct CurrentTask;

impl TaskContext for CurrentTask {
    #[inline(always)]
    fn pid_tgid(&self) -> u64 {
        bpf_get_current_pid_tgid()
    }

    #[inline(always)]
    fn comm(&self) -> [u8; TASK_COMM_LEN] {
        bpf_get_current_comm().unwrap_or([0; TASK_COMM_LEN])
    }

    #[inline(always)]
    fn read_user_str(&self, src: u64, dst: &mut [u8]) -> Result<usize, i64> {
        // Non-faulting read: an unmapped or not-yet-faulted page fails here
        // instead of sleeping.
        unsafe { bpf_probe_read_user_str_bytes(src as *const u8, dst) }
            .map(|s| s.len())
            .map_err(|e| e as i64)
    }
}

/// Submits to [`FILE_EVENTS`] on behalf of the probe context `C`.
pub struct PerfSink<'a, C: EbpfContext> {
    ctx: &'a C,
}

impl<'a, C: EbpfContext> PerfSink<'a, C> {
    #[inline(always)]
    pub fn new(ctx: &'a C) -> Self {
        Self { ctx }
    }
}

impl<C: EbpfContext> EventSink for PerfSink<'_, C> {
    #[inline(always)]
    fn submit(&self, event: &FileEvent) {
        FILE_EVENTS.output(self.ctx, event, 0);
    }
}
