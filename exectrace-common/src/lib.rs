#![no_std]
//! Wire contract between the `enter_execve` kernel program and userspace.
//!
//! Every type here mirrors a struct emitted by the kernel side byte for byte
//! and must be kept in sync with it.

/// Maximum amount of argv entries copied per exec.
pub const ARGLEN: usize = 32;
/// Maximum byte length of each copied argument, including the NUL.
pub const ARGSIZE: usize = 1024;
/// Maximum byte length of a kernel log format string.
pub const LOGFMTSIZE: usize = 1024;
/// Amount of format arguments carried by each kernel log entry.
pub const LOGARGLEN: usize = 3;

/// `argc` value meaning more than [`ARGLEN`] arguments were supplied.
pub const ARGC_TRUNCATED: u32 = ARGLEN as u32 + 1;

pub const PROGRAM_NAME: &str = "enter_execve";
pub const TRACEPOINT_CATEGORY: &str = "syscalls";
pub const TRACEPOINT_NAME: &str = "sys_enter_execve";

pub const EVENTS_MAP: &str = "events";
pub const LOGS_MAP: &str = "logs";
pub const FILTERS_MAP: &str = "filters";

/// Index of the PID namespace filter inside the filters array.
pub const FILTER_PIDNS_IDX: u32 = 0;

/// One exec call as written to the events ring buffer.
#[repr(C)]
#[derive(Clone, Copy)]
#[cfg_attr(feature = "user", derive(bytemuck::Pod, bytemuck::Zeroable))]
pub struct RawEvent {
    pub filename: [u8; ARGSIZE],
    pub argv: [[u8; ARGSIZE]; ARGLEN],
    /// Populated argv slots, or [`ARGC_TRUNCATED`].
    pub argc: u32,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    /// Name of the calling process.
    pub comm: [u8; ARGSIZE],
}

/// One diagnostic entry as written to the logs ring buffer.
#[repr(C)]
#[derive(Clone, Copy)]
#[cfg_attr(feature = "user", derive(bytemuck::Pod, bytemuck::Zeroable))]
pub struct RawLogEntry {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    /// Format string with only `%u` and `%d` directives.
    pub fmt: [u8; LOGFMTSIZE],
    /// Unsigned on the wire, `%d` reinterprets them as signed.
    pub args: [u32; LOGARGLEN],
}

pub const RAW_EVENT_SIZE: usize = core::mem::size_of::<RawEvent>();
pub const RAW_LOG_ENTRY_SIZE: usize = core::mem::size_of::<RawLogEntry>();

const _: () = assert!(RAW_EVENT_SIZE == ARGSIZE * (ARGLEN + 2) + 16);
const _: () = assert!(RAW_LOG_ENTRY_SIZE == LOGFMTSIZE + 12 + 4 * LOGARGLEN);
