//! Diagnostics emitted by the kernel program through the logs ring buffer.

use std::fmt::Write;

use exectrace_common::{LOGARGLEN, RAW_LOG_ENTRY_SIZE, RawLogEntry};

use crate::endian::Endianness;
use crate::error::{Error, Result};

/// A formatted kernel log line along with the task that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelLog {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub line: String,
}

/// Parses and formats one record from the logs ring buffer.
pub fn decode_log(data: &[u8], order: Endianness) -> Result<KernelLog> {
    let Some(record) = data.get(..RAW_LOG_ENTRY_SIZE) else {
        return Err(Error::Decode {
            kind: "log entry",
            got: data.len(),
            need: RAW_LOG_ENTRY_SIZE,
        });
    };
    let raw: RawLogEntry = bytemuck::pod_read_unaligned(record);

    let end = raw.fmt.iter().position(|&b| b == 0).unwrap_or(raw.fmt.len());
    let fmt = String::from_utf8_lossy(&raw.fmt[..end]);
    let args = raw.args.map(|arg| order.u32(arg));

    Ok(KernelLog {
        uid: order.u32(raw.uid),
        gid: order.u32(raw.gid),
        pid: order.u32(raw.pid),
        line: format_log(&fmt, &args),
    })
}

/// Substitutes `args` into the `%u` and `%d` directives of `fmt`, left to
/// right. `%d` reinterprets the argument as an `i32`. Directives left over
/// once the arguments are used up are kept verbatim.
pub fn format_log(fmt: &str, args: &[u32; LOGARGLEN]) -> String {
    let mut line = String::with_capacity(fmt.len());
    let mut rest = fmt;
    for &arg in args {
        let Some(idx) = next_directive(rest) else {
            break;
        };
        line.push_str(&rest[..idx]);
        let _ = match rest.as_bytes()[idx + 1] {
            b'u' => write!(line, "{arg}"),
            _ => write!(line, "{}", arg as i32),
        };
        rest = &rest[idx + 2..];
    }
    line.push_str(rest);
    line
}

/// Byte offset of the earliest `%u` or `%d` in `s`.
fn next_directive(s: &str) -> Option<usize> {
    s.as_bytes()
        .windows(2)
        .position(|w| w[0] == b'%' && matches!(w[1], b'u' | b'd'))
}
