//! Userspace half of an eBPF `execve()` tracer.
//!
//! A compiled handler object is loaded into the kernel and attached to the
//! `sys_enter_execve` tracepoint. Each exec is written to a ring buffer and
//! decoded into an [`Event`] by [`Tracer::read`]. Events can be limited to a
//! PID namespace tree, which is enforced in the kernel.

pub mod config;
pub mod endian;
pub mod error;
pub mod event;
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
mod guard;
pub mod kernel_log;
pub mod pidns;

#[cfg(target_os = "linux")]
mod objects;
#[cfg(target_os = "linux")]
pub mod ring;
#[cfg(target_os = "linux")]
mod tracer;
#[cfg(not(target_os = "linux"))]
mod unsupported;

pub use config::{LogSink, TracerConfig};
pub use endian::Endianness;
pub use error::{CloseErrors, Error, Result};
pub use event::{Cgroup, Event, decode_event};
pub use guard::leaked_resources;
pub use kernel_log::{KernelLog, decode_log, format_log};
pub use pidns::{pid_namespace, pid_namespace_of};

#[cfg(target_os = "linux")]
pub use objects::KernelObjects;
#[cfg(target_os = "linux")]
pub use tracer::Tracer;
#[cfg(not(target_os = "linux"))]
pub use unsupported::{KernelObjects, Tracer};
