//! Blocking-style reader over an epoll-able record source such as a BPF ring
//! buffer map.
//!
//! Closing the reader wakes every pending [`RingReader::read`] with
//! [`ReadError::Closed`] and releases the underlying file descriptor.

use std::io;
use std::os::fd::AsRawFd;

use aya::maps::{MapData, RingBuf};
use tokio::io::unix::AsyncFd;
use tokio::sync::{Mutex, MutexGuard, watch};

/// Something that hands out whole records once its fd polls readable.
pub trait RecordSource: AsRawFd {
    /// Next available record, `None` when drained.
    fn next_record(&mut self) -> io::Result<Option<Vec<u8>>>;
}

impl RecordSource for RingBuf<MapData> {
    fn next_record(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.next().map(|item| item.to_vec()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("reader closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub struct RingReader<S: RecordSource> {
    name: &'static str,
    source: Mutex<Option<AsyncFd<S>>>,
    closed: watch::Sender<bool>,
}

impl<S: RecordSource> RingReader<S> {
    /// Registers `source` with the current tokio reactor.
    pub fn new(name: &'static str, source: S) -> io::Result<Self> {
        let source = AsyncFd::new(source)?;
        let (closed, _) = watch::channel(false);
        Ok(Self {
            name,
            source: Mutex::new(Some(source)),
            closed,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Waits for the next record. Records are returned in the order the
    /// producer wrote them.
    pub async fn read(&self) -> Result<Vec<u8>, ReadError> {
        let mut closed = self.closed.subscribe();
        let mut slot = tokio::select! {
            biased;
            _ = closed_signal(&mut closed) => return Err(ReadError::Closed),
            slot = self.lock_source() => slot,
        };

        loop {
            let Some(source) = slot.source() else {
                return Err(ReadError::Closed);
            };
            let polled = tokio::select! {
                biased;
                _ = closed_signal(&mut closed) => None,
                ready = source.readable_mut() => Some(ready.and_then(|mut ready| {
                    let record = ready.get_inner_mut().next_record();
                    if matches!(record, Ok(None)) {
                        ready.clear_ready();
                    }
                    record
                })),
            };
            match polled {
                None => return Err(ReadError::Closed),
                Some(Ok(Some(record))) => return Ok(record),
                Some(Ok(None)) => continue,
                Some(Err(err)) => return Err(err.into()),
            }
        }
    }

    async fn lock_source(&self) -> SourceSlot<'_, S> {
        SourceSlot {
            reader: self,
            guard: Some(self.source.lock().await),
        }
    }

    /// Drops the source if the reader is closed and nobody holds it. Whoever
    /// releases the lock last, `close` or a finishing read, gets here after
    /// the flag is set.
    fn release_if_closed(&self) {
        if !self.is_closed() {
            return;
        }
        if let Ok(mut source) = self.source.try_lock() {
            source.take();
        }
    }

    /// Returns false if the reader was already closed. Never blocks: if a read
    /// currently owns the source, the source is dropped as soon as that read
    /// finishes or is cancelled.
    pub fn close(&self) -> bool {
        if self.closed.send_replace(true) {
            return false;
        }
        self.release_if_closed();
        true
    }
}

/// Exclusive access to the source for one read. Once the reader is closed the
/// source is released on every exit path, including a dropped read future.
struct SourceSlot<'a, S: RecordSource> {
    reader: &'a RingReader<S>,
    guard: Option<MutexGuard<'a, Option<AsyncFd<S>>>>,
}

impl<S: RecordSource> SourceSlot<'_, S> {
    fn source(&mut self) -> Option<&mut AsyncFd<S>> {
        self.guard.as_deref_mut()?.as_mut()
    }
}

impl<S: RecordSource> Drop for SourceSlot<'_, S> {
    fn drop(&mut self) {
        // Unlock first so a close racing with us can never miss the source.
        self.guard = None;
        self.reader.release_if_closed();
    }
}

/// Resolves once the reader is closed or its sender is gone.
async fn closed_signal(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::os::fd::RawFd;
    use std::os::unix::net::UnixDatagram;
    use std::sync::Arc;
    use std::time::Duration;

    /// Datagram socket standing in for a ring buffer, one record per datagram.
    pub(crate) struct DatagramSource(pub(crate) UnixDatagram);

    impl DatagramSource {
        pub(crate) fn pair() -> (Self, UnixDatagram) {
            let (rx, tx) = UnixDatagram::pair().unwrap();
            rx.set_nonblocking(true).unwrap();
            (Self(rx), tx)
        }
    }

    impl AsRawFd for DatagramSource {
        fn as_raw_fd(&self) -> RawFd {
            self.0.as_raw_fd()
        }
    }

    impl RecordSource for DatagramSource {
        fn next_record(&mut self) -> io::Result<Option<Vec<u8>>> {
            let mut buf = vec![0u8; 64 * 1024];
            match self.0.recv(&mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    Ok(Some(buf))
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(err) => Err(err),
            }
        }
    }

    #[tokio::test]
    async fn reads_in_order() {
        let (source, tx) = DatagramSource::pair();
        let reader = RingReader::new("events", source).unwrap();

        tx.send(b"first").unwrap();
        tx.send(b"second").unwrap();

        assert_eq!(reader.read().await.unwrap(), b"first");
        assert_eq!(reader.read().await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn waits_for_a_record() {
        let (source, tx) = DatagramSource::pair();
        let reader = Arc::new(RingReader::new("events", source).unwrap());

        let pending = tokio::spawn({
            let reader = reader.clone();
            async move { reader.read().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        tx.send(b"late").unwrap();
        let record = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(record, b"late");
    }

    #[tokio::test]
    async fn close_wakes_pending_read() {
        let (source, _tx) = DatagramSource::pair();
        let reader = Arc::new(RingReader::new("events", source).unwrap());

        let pending = tokio::spawn({
            let reader = reader.clone();
            async move { reader.read().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(reader.close());
        let res = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .expect("read did not return after close")
            .unwrap();
        assert!(matches!(res, Err(ReadError::Closed)));
        assert!(reader.source.lock().await.is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (source, tx) = DatagramSource::pair();
        let reader = RingReader::new("logs", source).unwrap();

        assert!(!reader.is_closed());
        assert!(reader.close());
        assert!(!reader.close());
        assert!(reader.is_closed());
        assert!(reader.source.lock().await.is_none());

        // Even with data queued, a closed reader reports closure.
        let _ = tx.send(b"ignored");
        assert!(matches!(reader.read().await, Err(ReadError::Closed)));
    }

    #[tokio::test]
    async fn close_while_source_is_held() {
        let (source, _tx) = DatagramSource::pair();
        let reader = RingReader::new("events", source).unwrap();

        // Stands in for a read that owns the source when close() runs and then
        // finishes without waking on the close signal.
        let slot = reader.lock_source().await;
        assert!(reader.close());
        assert!(reader.source.try_lock().is_err());
        drop(slot);

        assert!(reader.source.lock().await.is_none());
    }

    #[tokio::test]
    async fn cancelled_read_releases_source() {
        let (source, _tx) = DatagramSource::pair();
        let reader = Arc::new(RingReader::new("events", source).unwrap());

        let pending = tokio::spawn({
            let reader = reader.clone();
            async move { reader.read().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(reader.close());
        pending.abort();
        let _ = pending.await;
        assert!(reader.source.lock().await.is_none());
    }

    #[tokio::test]
    async fn cancelled_read_before_close_keeps_source() {
        let (source, tx) = DatagramSource::pair();
        let reader = RingReader::new("events", source).unwrap();

        let res = tokio::time::timeout(Duration::from_millis(20), reader.read()).await;
        assert!(res.is_err());
        assert!(reader.source.lock().await.is_some());

        tx.send(b"still readable").unwrap();
        assert_eq!(reader.read().await.unwrap(), b"still readable");
    }

    #[test]
    fn concurrent_close_releases_once() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .unwrap();
        let (source, _tx) = DatagramSource::pair();
        let reader = runtime.block_on(async { RingReader::new("events", source).unwrap() });

        let closed = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8).map(|_| scope.spawn(|| reader.close())).collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .filter(|closed| *closed)
                .count()
        });
        assert_eq!(closed, 1);
        assert!(reader.source.try_lock().unwrap().is_none());
    }
}
