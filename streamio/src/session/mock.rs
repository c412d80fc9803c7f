//! Scripted in-memory transport for session tests.
//!
//! Reads stay pending until the test feeds them; writes either complete
//! inline or stay pending until the test completes them; dispatched jobs run
//! inline unless manual dispatch is enabled.

use bytes::BytesMut;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    io,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::transport::{Addr, Job, RecvTarget, Transport, WriteCompletion};

pub(crate) enum ReadOutcome {
    Data(Vec<u8>),
    Fail(io::ErrorKind),
    Eof,
}

type PendingRead = Box<dyn FnOnce(ReadOutcome) + Send>;
type PendingWrite = (BytesMut, Box<dyn FnOnce(WriteCompletion) + Send>);

#[derive(Default)]
struct Inner {
    read: Mutex<Option<PendingRead>>,
    writes: Mutex<VecDeque<PendingWrite>>,
    jobs: Mutex<VecDeque<Job>>,
    wire: Mutex<Vec<u8>>,
    chunks: Mutex<Vec<usize>>,

    hold_writes: AtomicBool,
    manual_dispatch: AtomicBool,
    keep_pending_on_close: AtomicBool,

    read_shut: AtomicBool,
    write_shut: AtomicBool,
    closed: AtomicBool,

    read_submissions: AtomicUsize,
    write_shutdowns: AtomicUsize,
    closes: AtomicUsize,
}

#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    inner: Arc<Inner>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Writes stay pending until `complete_write*`.
    pub(crate) fn hold_writes(self) -> Self {
        self.inner.hold_writes.store(true, Ordering::SeqCst);
        self
    }

    /// Dispatched jobs are queued until `run_jobs`.
    pub(crate) fn manual_dispatch(self) -> Self {
        self.inner.manual_dispatch.store(true, Ordering::SeqCst);
        self
    }

    /// `close` does not abort pending operations.
    pub(crate) fn keep_pending_on_close(self) -> Self {
        self.inner.keep_pending_on_close.store(true, Ordering::SeqCst);
        self
    }

    fn finish_read(&self, outcome: ReadOutcome) -> bool {
        let pending = self.inner.read.lock().take();
        match pending {
            Some(read) => {
                read(outcome);
                true
            }
            None => false,
        }
    }

    pub(crate) fn feed(&self, data: &[u8]) -> bool {
        self.finish_read(ReadOutcome::Data(data.to_vec()))
    }

    pub(crate) fn fail_read(&self, kind: io::ErrorKind) -> bool {
        self.finish_read(ReadOutcome::Fail(kind))
    }

    pub(crate) fn eof(&self) -> bool {
        self.finish_read(ReadOutcome::Eof)
    }

    pub(crate) fn has_pending_read(&self) -> bool {
        self.inner.read.lock().is_some()
    }

    pub(crate) fn read_submissions(&self) -> usize {
        self.inner.read_submissions.load(Ordering::SeqCst)
    }

    pub(crate) fn pending_writes(&self) -> usize {
        self.inner.writes.lock().len()
    }

    /// Bytes of the oldest pending write.
    pub(crate) fn peek_write(&self) -> Option<Vec<u8>> {
        self.inner.writes.lock().front().map(|(buf, _)| buf.to_vec())
    }

    pub(crate) fn complete_write(&self) -> bool {
        let pending = self.inner.writes.lock().pop_front();
        match pending {
            Some((buf, done)) => {
                self.record(&buf);
                let written = buf.len();
                done(WriteCompletion {
                    buf,
                    written,
                    result: Ok(()),
                });
                true
            }
            None => false,
        }
    }

    /// Completes the oldest write with `written` bytes sent and an error.
    pub(crate) fn fail_write(&self, written: usize, kind: io::ErrorKind) -> bool {
        let pending = self.inner.writes.lock().pop_front();
        match pending {
            Some((buf, done)) => {
                self.record(&buf[..written]);
                done(WriteCompletion {
                    buf,
                    written,
                    result: Err(io::Error::from(kind)),
                });
                true
            }
            None => false,
        }
    }

    pub(crate) fn run_jobs(&self) -> usize {
        let mut n = 0;
        loop {
            let job = self.inner.jobs.lock().pop_front();
            match job {
                Some(job) => {
                    job();
                    n += 1;
                }
                None => return n,
            }
        }
    }

    pub(crate) fn wire(&self) -> Vec<u8> {
        self.inner.wire.lock().clone()
    }

    pub(crate) fn chunks(&self) -> Vec<usize> {
        self.inner.chunks.lock().clone()
    }

    pub(crate) fn write_shutdowns(&self) -> usize {
        self.inner.write_shutdowns.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    fn record(&self, bytes: &[u8]) {
        self.inner.wire.lock().extend_from_slice(bytes);
        self.inner.chunks.lock().push(bytes.len());
    }
}

impl Transport for MockTransport {
    fn submit_read<R, F>(&self, target: R, _deadline: Option<Duration>, done: F) -> Result<(), R>
    where
        R: RecvTarget,
        F: FnOnce(R, io::Result<usize>) + Send + 'static,
    {
        if self.inner.read_shut.load(Ordering::SeqCst) || self.inner.closed.load(Ordering::SeqCst)
        {
            return Err(target);
        }
        self.inner.read_submissions.fetch_add(1, Ordering::SeqCst);
        let read: PendingRead = Box::new(move |outcome| {
            let mut target = target;
            let result = match outcome {
                ReadOutcome::Data(data) => {
                    let buf = target.recv_buf();
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                ReadOutcome::Fail(kind) => Err(io::Error::from(kind)),
                ReadOutcome::Eof => Ok(0),
            };
            done(target, result);
        });
        *self.inner.read.lock() = Some(read);
        Ok(())
    }

    fn submit_write<F>(
        &self,
        buf: BytesMut,
        _deadline: Option<Duration>,
        done: F,
    ) -> Result<(), BytesMut>
    where
        F: FnOnce(WriteCompletion) + Send + 'static,
    {
        if self.inner.write_shut.load(Ordering::SeqCst) || self.inner.closed.load(Ordering::SeqCst)
        {
            return Err(buf);
        }
        if self.inner.hold_writes.load(Ordering::SeqCst) {
            self.inner.writes.lock().push_back((buf, Box::new(done)));
        } else {
            self.record(&buf);
            let written = buf.len();
            done(WriteCompletion {
                buf,
                written,
                result: Ok(()),
            });
        }
        Ok(())
    }

    fn dispatch(&self, job: Job) {
        if self.inner.manual_dispatch.load(Ordering::SeqCst) {
            self.inner.jobs.lock().push_back(job);
        } else {
            job();
        }
    }

    fn shutdown_read(&self) {
        if !self.inner.read_shut.swap(true, Ordering::SeqCst) {
            self.eof();
        }
    }

    fn shutdown_write(&self) {
        self.inner.write_shut.store(true, Ordering::SeqCst);
        self.inner.write_shutdowns.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.closes.fetch_add(1, Ordering::SeqCst);
        if self.inner.keep_pending_on_close.load(Ordering::SeqCst) {
            return;
        }
        self.fail_read(io::ErrorKind::ConnectionAborted);
        while self.fail_write(0, io::ErrorKind::BrokenPipe) {}
    }

    fn local_addr(&self) -> io::Result<Addr> {
        Ok(Addr::Inet(([127, 0, 0, 1], 4000).into()))
    }

    fn peer_addr(&self) -> io::Result<Addr> {
        Ok(Addr::Inet(([127, 0, 0, 1], 5000).into()))
    }
}
