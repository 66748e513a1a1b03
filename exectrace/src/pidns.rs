use std::io;
use std::num::ParseIntError;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PidNsError {
    #[error("readlink {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("unexpected namespace link format {0:?}")]
    Format(String),
    #[error("parse PID namespace inode: {0}")]
    Parse(#[from] ParseIntError),
}

/// PID namespace inode of the current process, suitable for
/// [`crate::TracerConfig::with_pid_ns`].
pub fn pid_namespace() -> Result<u32, PidNsError> {
    read_pid_namespace(PathBuf::from("/proc/self/ns/pid"))
}

/// PID namespace inode of process `pid`.
pub fn pid_namespace_of(pid: u32) -> Result<u32, PidNsError> {
    read_pid_namespace(PathBuf::from(format!("/proc/{pid}/ns/pid")))
}

fn read_pid_namespace(path: PathBuf) -> Result<u32, PidNsError> {
    let link = match path.read_link() {
        Ok(link) => link,
        Err(source) => return Err(PidNsError::Io { path, source }),
    };
    parse_ns_link(&link.to_string_lossy())
}

/// Parses a `pid:[4026531836]` style namespace link.
fn parse_ns_link(link: &str) -> Result<u32, PidNsError> {
    let inum = link
        .strip_prefix("pid:[")
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| PidNsError::Format(link.to_string()))?;
    Ok(inum.parse::<u32>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_link() {
        assert_eq!(parse_ns_link("pid:[4026531836]").unwrap(), 4026531836);
        assert!(matches!(parse_ns_link("net:[4026531840]"), Err(PidNsError::Format(_))));
        assert!(matches!(parse_ns_link("pid:[]"), Err(PidNsError::Parse(_))));
        assert!(matches!(parse_ns_link("pid:[99999999999]"), Err(PidNsError::Parse(_))));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn current_process() {
        let own = pid_namespace().unwrap();
        assert_ne!(own, 0);
        assert_eq!(pid_namespace_of(std::process::id()).unwrap(), own);
    }

    #[test]
    fn missing_process() {
        let err = pid_namespace_of(u32::MAX).unwrap_err();
        assert!(matches!(err, PidNsError::Io { .. }), "{err}");
    }
}
