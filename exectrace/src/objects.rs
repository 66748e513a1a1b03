use std::sync::{Mutex, MutexGuard, Once, PoisonError};

use aya::Ebpf;
use aya::maps::{Array, MapData, RingBuf};
use aya::programs::{ProgramError, TracePoint};
use aya::programs::trace_point::TracePointLink;
use exectrace_common::{
    EVENTS_MAP, FILTER_PIDNS_IDX, FILTERS_MAP, LOGS_MAP, PROGRAM_NAME, TRACEPOINT_CATEGORY,
    TRACEPOINT_NAME,
};
use tracing::{debug, warn};

use crate::error::{CloseErrors, Error, Result};
use crate::guard::LeakGuard;

static REMOVE_MEMLOCK: Once = Once::new();

/// Bump the memlock rlimit. This is needed for older kernels that don't use the
/// new memcg based accounting, see https://lwn.net/Articles/837122/
fn remove_memlock() {
    REMOVE_MEMLOCK.call_once(|| {
        let rlim = libc::rlimit {
            rlim_cur: libc::RLIM_INFINITY,
            rlim_max: libc::RLIM_INFINITY,
        };
        let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
        if ret != 0 {
            warn!("remove limit on locked memory failed, ret is: {ret}");
        }
    });
}

struct Loaded {
    ebpf: Ebpf,
    events: Option<RingBuf<MapData>>,
    logs: Option<RingBuf<MapData>>,
    filters: Array<MapData, u32>,
}

impl Loaded {
    fn program(&mut self) -> Result<&mut TracePoint> {
        let program = self
            .ebpf
            .program_mut(PROGRAM_NAME)
            .ok_or(Error::MissingProgram(PROGRAM_NAME))?;
        program
            .try_into()
            .map_err(|err| Error::program("resolve", PROGRAM_NAME, err))
    }
}

/// The `enter_execve` program and its maps, loaded into the kernel.
///
/// Must be closed to release the kernel resources. Dropping an unclosed
/// `KernelObjects` closes it and logs an error.
pub struct KernelObjects {
    inner: Mutex<Option<Loaded>>,
    guard: LeakGuard,
}

impl KernelObjects {
    /// Loads the compiled handler object in `image` into the kernel.
    #[track_caller]
    pub fn load(image: &[u8]) -> Result<Self> {
        remove_memlock();

        let mut ebpf = Ebpf::load(image).map_err(|err| Error::Load(Box::new(err)))?;
        let mut take_map = |name: &'static str| ebpf.take_map(name).ok_or(Error::MissingMap(name));
        let events = take_map(EVENTS_MAP)?;
        let logs = take_map(LOGS_MAP)?;
        let filters = take_map(FILTERS_MAP)?;

        let events = RingBuf::try_from(events).map_err(|err| Error::map("open", EVENTS_MAP, err))?;
        let logs = RingBuf::try_from(logs).map_err(|err| Error::map("open", LOGS_MAP, err))?;
        let filters = Array::try_from(filters).map_err(|err| Error::map("open", FILTERS_MAP, err))?;

        let mut loaded = Loaded {
            ebpf,
            events: Some(events),
            logs: Some(logs),
            filters,
        };
        loaded
            .program()?
            .load()
            .map_err(|err| Error::program("load", PROGRAM_NAME, err))?;
        debug!(program = PROGRAM_NAME, "loaded BPF objects");

        Ok(Self {
            inner: Mutex::new(Some(loaded)),
            guard: LeakGuard::new("BPF objects"),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<Loaded>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_loaded<T>(&self, f: impl FnOnce(&mut Loaded) -> Result<T>) -> Result<T> {
        match self.lock().as_mut() {
            Some(loaded) => f(loaded),
            None => Err(Error::Closed),
        }
    }

    /// Restricts events to processes in `pid_ns` or its descendant PID
    /// namespaces. Must be called before [`KernelObjects::attach`].
    pub fn set_pid_ns_filter(&self, pid_ns: u32) -> Result<()> {
        self.with_loaded(|loaded| {
            loaded
                .filters
                .set(FILTER_PIDNS_IDX, pid_ns, 0)
                .map_err(|err| Error::map("update", FILTERS_MAP, err))
        })
    }

    /// Attaches the program to `sys_enter_execve`. Dropping the returned link
    /// detaches it.
    pub fn attach(&self) -> Result<TracePointLink> {
        self.with_loaded(|loaded| {
            let program = loaded.program()?;
            let attach_err = |err: ProgramError| Error::Attach {
                category: TRACEPOINT_CATEGORY,
                name: TRACEPOINT_NAME,
                source: Box::new(err),
            };
            let link_id = program
                .attach(TRACEPOINT_CATEGORY, TRACEPOINT_NAME)
                .map_err(attach_err)?;
            program.take_link(link_id).map_err(attach_err)
        })
    }

    /// Hands the events ring buffer over to a reader. Can only be done once.
    pub fn take_events(&self) -> Result<RingBuf<MapData>> {
        self.with_loaded(|loaded| loaded.events.take().ok_or(Error::MissingMap(EVENTS_MAP)))
    }

    /// Hands the logs ring buffer over to a reader. Can only be done once.
    pub fn take_logs(&self) -> Result<RingBuf<MapData>> {
        self.with_loaded(|loaded| loaded.logs.take().ok_or(Error::MissingMap(LOGS_MAP)))
    }

    /// Releases the program and every map still owned. Ring buffers already
    /// handed to readers are released by those readers.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock();
        self.guard.disarm();
        let Some(mut loaded) = inner.take() else {
            return Err(Error::AlreadyClosed("BPF objects"));
        };

        let mut errs = CloseErrors::default();
        match loaded.program() {
            Ok(program) => {
                if let Err(err) = program.unload() {
                    errs.push(Error::program("close", PROGRAM_NAME, err));
                }
            }
            Err(err) => errs.push(err),
        }
        // Maps have no fallible release, their fds close on drop.
        drop(loaded);

        errs.into_result("BPF objects")
    }
}

impl Drop for KernelObjects {
    fn drop(&mut self) {
        if self.guard.is_armed() {
            let res = self.close();
            self.guard.report_leak(res);
        }
    }
}
