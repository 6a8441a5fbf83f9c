//! Argument layouts of the `syscalls:sys_enter_*` tracepoints.
//!
//! Every syscall-entry record starts with the common trace header followed
//! by `__syscall_nr` (padded to 8 bytes), then one 8-byte slot per argument.
//! See `/sys/kernel/tracing/events/syscalls/<name>/format`.

/// Common tracepoint header for syscall events (sys_enter_*, sys_exit_*)
#[repr(C)]
#[allow(dead_code)]
pub struct SyscallTraceHeader {
    pub common_type: u16,
    pub common_flags: u8,
    pub common_preempt_count: u8,
    pub common_pid: i32,
    pub __syscall_nr: i32,
    pub _pad: i32,
}

/// Offset of the first syscall argument slot.
pub const ARGS_OFFSET: usize = core::mem::size_of::<SyscallTraceHeader>();

const fn arg(index: usize) -> usize {
    ARGS_OFFSET + index * 8
}

/// `openat(int dfd, const char *filename, int flags, umode_t mode)`
#[repr(C)]
#[allow(dead_code)]
pub struct SysEnterOpenat {
    pub header: SyscallTraceHeader,
    pub dfd: i64,
    pub filename: u64,
    pub flags: i64,
    pub mode: i64,
}

/// `write(unsigned int fd, const char *buf, size_t count)`
#[repr(C)]
#[allow(dead_code)]
pub struct SysEnterWrite {
    pub header: SyscallTraceHeader,
    pub fd: u64,
    pub buf: u64,
    pub count: u64,
}

/// `unlinkat(int dfd, const char *pathname, int flag)`
#[repr(C)]
#[allow(dead_code)]
pub struct SysEnterUnlinkat {
    pub header: SyscallTraceHeader,
    pub dfd: i64,
    pub pathname: u64,
    pub flag: i64,
}

pub const OPENAT_FILENAME: usize = arg(1);
pub const WRITE_FD: usize = arg(0);
pub const WRITE_COUNT: usize = arg(2);
pub const UNLINKAT_PATHNAME: usize = arg(1);

// Legacy entry points, only present on architectures that still wire up
// open(2) and unlink(2) (x86_64 among them).
pub const OPEN_FILENAME: usize = arg(0);
pub const UNLINK_PATHNAME: usize = arg(0);

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    #[test]
    fn offsets_match_struct_layouts() {
        assert_eq!(ARGS_OFFSET, 16);
        assert_eq!(OPENAT_FILENAME, offset_of!(SysEnterOpenat, filename));
        assert_eq!(WRITE_FD, offset_of!(SysEnterWrite, fd));
        assert_eq!(WRITE_COUNT, offset_of!(SysEnterWrite, count));
        assert_eq!(UNLINKAT_PATHNAME, offset_of!(SysEnterUnlinkat, pathname));
    }

    #[test]
    fn offsets_match_tracefs_format() {
        assert_eq!(OPENAT_FILENAME, 24);
        assert_eq!(WRITE_FD, 16);
        assert_eq!(WRITE_COUNT, 32);
        assert_eq!(UNLINKAT_PATHNAME, 24);
        assert_eq!(OPEN_FILENAME, 16);
        assert_eq!(UNLINK_PATHNAME, 16);
    }
}
