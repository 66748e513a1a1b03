//! Leak detection for handles that own kernel resources.
//!
//! Kernel programs, maps and links outlive the process that created them if
//! they are never released, so every owner is expected to be closed
//! explicitly. Owners embed a [`LeakGuard`], disarm it when closed, and ask it
//! to report from their `Drop` impl otherwise.

use std::backtrace::Backtrace;
use std::fmt::Display;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tracing::error;

static LEAKED: AtomicUsize = AtomicUsize::new(0);

/// How many resources have been dropped without an explicit close since the
/// process started.
pub fn leaked_resources() -> usize {
    LEAKED.load(Ordering::SeqCst)
}

pub(crate) struct LeakGuard {
    resource: &'static str,
    location: &'static Location<'static>,
    backtrace: Backtrace,
    armed: AtomicBool,
}

impl LeakGuard {
    /// Records the caller as the acquisition site. The backtrace is only
    /// captured when `RUST_BACKTRACE` is set.
    #[track_caller]
    pub(crate) fn new(resource: &'static str) -> Self {
        Self {
            resource,
            location: Location::caller(),
            backtrace: Backtrace::capture(),
            armed: AtomicBool::new(true),
        }
    }

    /// Returns whether the guard was still armed.
    pub(crate) fn disarm(&self) -> bool {
        self.armed.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Called from the owner's `Drop` with the outcome of its best-effort
    /// close, after the owner found the guard armed.
    pub(crate) fn report_leak<E: Display>(&self, close_result: Result<(), E>) {
        LEAKED.fetch_add(1, Ordering::SeqCst);
        error!(
            resource = self.resource,
            created_at = %self.location,
            "{} was dropped but was not closed, created at: {}\n{}",
            self.resource,
            self.location,
            self.backtrace,
        );
        error!("{}", close_reminder(self.resource));
        if let Err(err) = close_result {
            error!(resource = self.resource, "closing {} failed: {err}", self.resource);
        }
    }
}

fn close_reminder(resource: &str) -> String {
    format!("{resource} must always be closed when finished with to avoid leaked kernel resources")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Handle {
        released: Mutex<u32>,
        guard: LeakGuard,
    }

    impl Handle {
        #[track_caller]
        fn new() -> Self {
            Self {
                released: Mutex::new(0),
                guard: LeakGuard::new("handle"),
            }
        }

        fn close(&self) -> Result<(), &'static str> {
            let mut released = self.released.lock().unwrap();
            self.guard.disarm();
            if *released > 0 {
                return Err("handle is already closed");
            }
            *released += 1;
            Ok(())
        }
    }

    impl Drop for Handle {
        fn drop(&mut self) {
            if self.guard.is_armed() {
                let res = self.close();
                self.guard.report_leak(res);
            }
            assert_eq!(*self.released.lock().unwrap(), 1);
        }
    }

    // Both cases live in one test since the counter is process wide.
    #[test]
    fn leak_counting() {
        let before = leaked_resources();

        let closed = Handle::new();
        assert!(closed.close().is_ok());
        assert_eq!(closed.close(), Err("handle is already closed"));
        drop(closed);
        assert_eq!(leaked_resources(), before);

        let leaked = Handle::new();
        let line = line!() - 1;
        assert_eq!(leaked.guard.location.line(), line);
        drop(leaked);
        assert_eq!(leaked_resources(), before + 1);
    }

    #[test]
    fn disarm_once() {
        let guard = LeakGuard::new("thing");
        assert!(guard.is_armed());
        assert!(guard.disarm());
        assert!(!guard.disarm());
        assert!(!guard.is_armed());
    }

    #[test]
    fn reminder_names_resource() {
        assert_eq!(
            close_reminder("BPF objects"),
            "BPF objects must always be closed when finished with to avoid leaked kernel resources"
        );
        assert!(close_reminder("tracer").starts_with("tracer must always be closed"));
    }
}
