use std::borrow::Cow;

use exectrace_common::{ARGC_TRUNCATED, ARGLEN, ARGSIZE, RAW_EVENT_SIZE, RawEvent};
use serde::{Deserialize, Serialize};

use crate::endian::Endianness;
use crate::error::{Error, Result};

/// An exec call observed by the kernel program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub filename: String,
    /// The raw argv supplied to the process, including argv[0].
    pub argv: Vec<String>,
    /// Either more than 32 arguments were supplied or one of them did not fit
    /// in 1024 bytes.
    pub truncated: bool,

    // These belong to the new process. The exec may still fail, in which case
    // the PID is released again.
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,

    /// Name of the calling process, usually its executable name.
    pub comm: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cgroup: Option<Cgroup>,
}

/// cgroup of the calling process. Only the id is ever filled in, path lookup
/// is left to the consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cgroup {
    /// Equal to the inode number of the cgroup directory in cgroupfs.
    pub id: u64,
    pub paths_v1: Vec<String>,
    pub path_v2: String,
}

/// Decodes bytes up to the first NUL.
fn c_str(buf: &[u8]) -> &[u8] {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    &buf[..end]
}

fn c_string(buf: &[u8]) -> String {
    String::from_utf8_lossy(c_str(buf)).into_owned()
}

/// Parses one record from the events ring buffer.
///
/// Only a record shorter than [`RAW_EVENT_SIZE`] is an error. Oversized
/// arguments or argument lists are reported through [`Event::truncated`].
pub fn decode_event(data: &[u8], order: Endianness) -> Result<Event> {
    let Some(record) = data.get(..RAW_EVENT_SIZE) else {
        return Err(Error::Decode {
            kind: "event",
            got: data.len(),
            need: RAW_EVENT_SIZE,
        });
    };
    let raw: Box<RawEvent> = Box::new(bytemuck::pod_read_unaligned(record));

    let argc = order.u32(raw.argc);
    let mut event = Event {
        filename: c_string(&raw.filename),
        argv: Vec::new(),
        truncated: argc == ARGC_TRUNCATED,
        pid: order.u32(raw.pid),
        uid: order.u32(raw.uid),
        gid: order.u32(raw.gid),
        comm: c_string(&raw.comm),
        cgroup: None,
    };

    // Slots past argc are not zeroed by the kernel, never look at them.
    let argc = (argc as usize).min(ARGLEN);
    for slot in &raw.argv[..argc] {
        let bytes = c_str(slot);
        let arg = if bytes.len() >= ARGSIZE - 1 {
            event.truncated = true;
            let mut arg = String::from_utf8_lossy(&bytes[..ARGSIZE - 3]).into_owned();
            arg.push_str("...");
            Cow::Owned(arg)
        } else {
            String::from_utf8_lossy(bytes)
        };
        if !arg.trim().is_empty() {
            event.argv.push(arg.into_owned());
        }
    }

    Ok(event)
}
