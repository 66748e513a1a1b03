use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use aya::maps::{MapData, RingBuf};
use aya::programs::links::Link;
use aya::programs::trace_point::TracePointLink;
use exectrace_common::{EVENTS_MAP, LOGS_MAP, PROGRAM_NAME};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::config::{LogSink, TracerConfig};
use crate::endian::Endianness;
use crate::error::{CloseErrors, Error, Result};
use crate::event::{Event, decode_event};
use crate::guard::LeakGuard;
use crate::kernel_log::decode_log;
use crate::objects::KernelObjects;
use crate::ring::{ReadError, RecordSource, RingReader};

type KernelRing = RingReader<RingBuf<MapData>>;

struct Attached {
    link: TracePointLink,
    objects: KernelObjects,
}

/// Reads exec events from the kernel. Every `execve()` syscall is traced by the
/// `enter_execve` program and reported through [`Tracer::read`].
///
/// The tracer MUST be closed to avoid leaking kernel resources. Dropping an
/// unclosed tracer closes it and logs an error.
pub struct Tracer {
    config: TracerConfig,
    order: Endianness,
    events: KernelRing,
    logs: Arc<KernelRing>,
    attached: Mutex<Option<Attached>>,
    guard: LeakGuard,
}

impl Tracer {
    /// Loads the compiled handler object in `image` into the running kernel,
    /// starts tracing and returns the tracer. Callers should start a
    /// [`Tracer::read`] loop right away.
    ///
    /// Must be called from within a tokio runtime, which hosts the background
    /// task forwarding kernel logs to [`TracerConfig::log_sink`].
    #[track_caller]
    pub fn new(image: &[u8], config: TracerConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let order = Endianness::native();

        let objects = KernelObjects::load(image)?;
        // If we don't start up successfully everything acquired so far must be
        // released, or kernel resources leak.
        let (link, events, logs) = match Self::start(&objects, &config) {
            Ok(started) => started,
            Err(err) => return Err(roll_back(err, || objects.close())),
        };

        let logs = Arc::new(logs);
        runtime.spawn(drain_logs(logs.clone(), config.log_sink.clone(), order));

        info!(pid_ns = config.pid_ns, endianness = %order, "exectrace tracer started");
        Ok(Self {
            config,
            order,
            events,
            logs,
            attached: Mutex::new(Some(Attached { link, objects })),
            guard: LeakGuard::new("tracer"),
        })
    }

    fn start(
        objects: &KernelObjects,
        config: &TracerConfig,
    ) -> Result<(TracePointLink, KernelRing, KernelRing)> {
        if config.pid_ns != 0 {
            objects.set_pid_ns_filter(config.pid_ns)?;
        }

        // Triggered at the beginning of each `execve()` syscall.
        let link = objects.attach()?;

        let events = RingReader::new(EVENTS_MAP, objects.take_events()?).map_err(|source| {
            Error::Reader {
                name: EVENTS_MAP,
                source,
            }
        })?;
        let logs = RingReader::new(LOGS_MAP, objects.take_logs()?).map_err(|source| {
            Error::Reader {
                name: LOGS_MAP,
                source,
            }
        })?;

        Ok((link, events, logs))
    }

    /// Waits for the next exec event and decodes it.
    ///
    /// Returns [`Error::Closed`] once the tracer is closed, including when the
    /// close happens while this call is pending. Any other error is transient
    /// and reading may continue.
    pub async fn read(&self) -> Result<Event> {
        read_event(&self.events, self.order).await
    }

    /// Closes and frees every resource held in reverse order of acquisition.
    /// Pending [`Tracer::read`] calls return [`Error::Closed`].
    ///
    /// Safe to call concurrently. Every call after the first returns
    /// [`Error::AlreadyClosed`].
    pub fn close(&self) -> Result<()> {
        let mut attached = self.lock();
        self.guard.disarm();
        let Some(Attached { link, objects }) = attached.take() else {
            return Err(Error::AlreadyClosed("tracer"));
        };

        let mut errs = CloseErrors::default();
        self.logs.close();
        self.events.close();
        if let Err(err) = link.detach() {
            errs.push(Error::program("detach", PROGRAM_NAME, err));
        }
        if let Err(err) = objects.close() {
            errs.push(err);
        }

        debug!("exectrace tracer closed");
        errs.into_result("tracer")
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    /// The PID namespace filter, 0 when disabled.
    pub fn pid_ns(&self) -> u32 {
        self.config.pid_ns
    }

    /// Byte order used to decode kernel records.
    pub fn endianness(&self) -> Endianness {
        self.order
    }

    fn lock(&self) -> MutexGuard<'_, Option<Attached>> {
        self.attached.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        if self.guard.is_armed() {
            let res = self.close();
            self.guard.report_leak(res);
        }
    }
}

/// Releases what a failed start acquired. The start error is the one worth
/// returning, a failed release is only logged.
fn roll_back(err: Error, release: impl FnOnce() -> Result<()>) -> Error {
    if let Err(release_err) = release() {
        warn!("release BPF objects after failed start ({err}): {release_err}");
    }
    err
}

async fn read_event<S: RecordSource>(reader: &RingReader<S>, order: Endianness) -> Result<Event> {
    let record = reader.read().await.map_err(|err| match err {
        ReadError::Closed => Error::Closed,
        ReadError::Io(source) => Error::Read {
            name: reader.name(),
            source,
        },
    })?;
    decode_event(&record, order)
}

/// Forwards every kernel log entry to `sink` until the reader is closed. A
/// bad record or a panic is reported through `sink` and skipped.
async fn drain_logs<S: RecordSource>(reader: Arc<RingReader<S>>, sink: LogSink, order: Endianness) {
    loop {
        let record = match reader.read().await {
            Ok(record) => record,
            Err(ReadError::Closed) => return,
            Err(ReadError::Io(err)) => {
                report(&sink, &format!("read from {} ringbuf: {err}", reader.name()));
                continue;
            }
        };

        let handled = panic::catch_unwind(AssertUnwindSafe(|| match decode_log(&record, order) {
            Ok(log) => sink(log.uid, log.gid, log.pid, &log.line),
            Err(err) => sink(0, 0, 0, &err.to_string()),
        }));
        if let Err(payload) = handled {
            report(
                &sink,
                &format!("panic in exectrace log reader: {}", panic_message(&*payload)),
            );
        }
    }
}

fn report(sink: &LogSink, line: &str) {
    let _ = panic::catch_unwind(AssertUnwindSafe(|| sink(0, 0, 0, line)));
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}
