//! The fixed-layout record every probe fills and the agent decodes.
//!
//! Producer and consumer negotiate nothing beyond this layout, so field
//! order, sizes and padding must stay put for the lifetime of a capture
//! session.

/// Size of the kernel's task comm buffer, terminator included.
pub const TASK_COMM_LEN: usize = 16;

/// Capacity of the filename buffer, terminator included.
pub const MAX_FILENAME_LEN: usize = 256;

/// `fd` value for records that carry no descriptor (OPEN, UNLINK).
pub const NO_FD: i32 = -1;

/// Which probe produced a record.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyscallKind {
    Open = 1,
    Write = 2,
    Unlink = 3,
}

impl SyscallKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            SyscallKind::Open => "OPEN",
            SyscallKind::Write => "WRITE",
            SyscallKind::Unlink => "UNLINK",
        }
    }
}

impl TryFrom<u32> for SyscallKind {
    type Error = u32;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        match raw {
            1 => Ok(SyscallKind::Open),
            2 => Ok(SyscallKind::Write),
            3 => Ok(SyscallKind::Unlink),
            other => Err(other),
        }
    }
}

/// One intercepted open, write or unlink, captured at syscall entry.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FileEvent {
    pub pid: u32,
    pub comm: [u8; TASK_COMM_LEN],
    /// Raw [`SyscallKind`] discriminant.
    pub syscall_kind: u32,
    /// Path argument for OPEN/UNLINK, empty for WRITE. Always nul-terminated.
    pub filename: [u8; MAX_FILENAME_LEN],
    pub fd: i32,
    pub _pad: [u8; 4],
    /// Requested length for WRITE, not the bytes actually written.
    pub byte_count: u64,
}

impl FileEvent {
    /// An all-zero record; every probe starts from this.
    pub const fn zeroed() -> Self {
        Self {
            pid: 0,
            comm: [0; TASK_COMM_LEN],
            syscall_kind: 0,
            filename: [0; MAX_FILENAME_LEN],
            fd: NO_FD,
            _pad: [0; 4],
            byte_count: 0,
        }
    }

    pub fn kind(&self) -> Option<SyscallKind> {
        SyscallKind::try_from(self.syscall_kind).ok()
    }

    /// Process name up to (not including) the first nul.
    pub fn comm_bytes(&self) -> &[u8] {
        until_nul(&self.comm)
    }

    /// Filename up to (not including) the first nul.
    pub fn filename_bytes(&self) -> &[u8] {
        until_nul(&self.filename)
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for FileEvent {}

fn until_nul(buf: &[u8]) -> &[u8] {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    &buf[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn layout_is_stable() {
        assert_eq!(offset_of!(FileEvent, pid), 0);
        assert_eq!(offset_of!(FileEvent, comm), 4);
        assert_eq!(offset_of!(FileEvent, syscall_kind), 20);
        assert_eq!(offset_of!(FileEvent, filename), 24);
        assert_eq!(offset_of!(FileEvent, fd), 280);
        assert_eq!(offset_of!(FileEvent, _pad), 284);
        assert_eq!(offset_of!(FileEvent, byte_count), 288);
        assert_eq!(size_of::<FileEvent>(), 296);
    }

    #[test]
    fn syscall_kind_round_trips_known_values_only() {
        for kind in [SyscallKind::Open, SyscallKind::Write, SyscallKind::Unlink] {
            assert_eq!(SyscallKind::try_from(kind as u32), Ok(kind));
        }
        assert_eq!(SyscallKind::try_from(0), Err(0));
        assert_eq!(SyscallKind::try_from(4), Err(4));
    }

    #[test]
    fn zeroed_record_uses_not_applicable_sentinels() {
        let event = FileEvent::zeroed();
        assert_eq!(event.fd, NO_FD);
        assert_eq!(event.byte_count, 0);
        assert!(event.filename_bytes().is_empty());
        assert!(event.kind().is_none());
    }

    #[test]
    fn byte_accessors_stop_at_first_nul() {
        let mut event = FileEvent::zeroed();
        event.comm[..6].copy_from_slice(b"logger");
        event.filename[..4].copy_from_slice(b"/tmp");
        event.filename[5] = b'x';
        assert_eq!(event.comm_bytes(), b"logger");
        assert_eq!(event.filename_bytes(), b"/tmp");
    }

    #[test]
    fn unterminated_comm_is_bounded_by_capacity() {
        let mut event = FileEvent::zeroed();
        event.comm = [b'a'; TASK_COMM_LEN];
        assert_eq!(event.comm_bytes().len(), TASK_COMM_LEN);
    }
}
