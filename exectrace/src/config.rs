use std::fmt;
use std::sync::Arc;

use tracing::subscriber::NoSubscriber;
use tracing::warn;

/// Receives every kernel log line as `(uid, gid, pid, line)`.
pub type LogSink = Arc<dyn Fn(u32, u32, u32, &str) + Send + Sync>;

/// Tracer options. All of them are optional and fixed once the tracer is
/// created.
#[derive(Clone)]
pub struct TracerConfig {
    /// Only report processes in this PID namespace or one of its descendants.
    /// 0 disables the filter. Read the value for a process with
    /// `readlink /proc/<pid>/ns/pid` or [`crate::pid_namespace_of`].
    pub pid_ns: u32,
    pub log_sink: LogSink,
}

impl TracerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pid_ns(mut self, pid_ns: u32) -> Self {
        self.pid_ns = pid_ns;
        self
    }

    pub fn with_log_sink<F>(mut self, sink: F) -> Self
    where
        F: Fn(u32, u32, u32, &str) + Send + Sync + 'static,
    {
        self.log_sink = Arc::new(sink);
        self
    }
}

/// No PID namespace filter. Kernel log lines go to `tracing` at warn level,
/// or to stderr when no subscriber is installed.
impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            pid_ns: 0,
            log_sink: Arc::new(default_log_sink),
        }
    }
}

impl fmt::Debug for TracerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracerConfig")
            .field("pid_ns", &self.pid_ns)
            .finish_non_exhaustive()
    }
}

/// Logs through `tracing` when a subscriber is installed, otherwise writes
/// straight to stderr so kernel diagnostics are never dropped.
fn default_log_sink(uid: u32, gid: u32, pid: u32, line: &str) {
    if has_subscriber() {
        warn!(uid, gid, pid, "error log from exectrace tracer: {line}");
    } else {
        eprintln!("{}", stderr_line(uid, gid, pid, line));
    }
}

fn has_subscriber() -> bool {
    !tracing::dispatcher::get_default(|dispatch| dispatch.is::<NoSubscriber>())
}

fn stderr_line(uid: u32, gid: u32, pid: u32, line: &str) -> String {
    format!("error log from exectrace tracer: uid={uid} gid={gid} pid={pid}: {line}")
}
