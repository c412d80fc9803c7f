//! Blocking backend: one reader and one writer thread per session.
//!
//! ```text
//!   submit_read ──► [reader thread] ── blocking read ──► done(target, n)
//!   submit_write ─┐
//!   dispatch ─────┴► [writer thread] ── blocking write ─► done(completion)
//! ```
//!
//! Each thread runs the jobs posted to it in order, so reads never overlap
//! reads and writes never overlap writes. Threads start lazily on the first
//! job and exit once the transport is closed or dropped.

use bytes::BytesMut;
use crossbeam_channel::{unbounded, Sender};
use log::{trace, warn};
use parking_lot::Mutex;
use std::{
    io,
    net::Shutdown,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use streamio::{Addr, Job, RecvTarget, Transport, WriteCompletion};

use crate::{Backend, Stream};

/// Factory for [`SyncTransport`]s.
#[derive(Debug, Clone)]
pub struct SyncBackend {
    name: String,
    stack_size: Option<usize>,
}

impl Default for SyncBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncBackend {
    /// Backend naming its threads `streamio-sync-read` / `streamio-sync-write`.
    pub fn new() -> Self {
        Self {
            name: "streamio-sync".to_string(),
            stack_size: None,
        }
    }

    /// Prefix of the per-session thread names.
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Stack size of the per-session threads.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }
}

impl Backend for SyncBackend {
    type Transport = SyncTransport;

    fn bind(&self, stream: Stream) -> io::Result<SyncTransport> {
        stream.set_nonblocking(false)?;
        let ctl = stream.try_clone()?;
        Ok(SyncTransport {
            io: Mutex::new(Some(Arc::new(stream))),
            ctl,
            reader: Worker::new(format!("{}-read", self.name), self.stack_size),
            writer: Worker::new(format!("{}-write", self.name), self.stack_size),
            read_shut: AtomicBool::new(false),
            write_shut: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }
}

/// A lazily started thread running posted jobs in order.
struct Worker {
    name: String,
    stack_size: Option<usize>,
    tx: Mutex<Option<Sender<Job>>>,
    stopped: AtomicBool,
}

impl Worker {
    fn new(name: String, stack_size: Option<usize>) -> Self {
        Self {
            name,
            stack_size,
            tx: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    fn spawn(&self) -> io::Result<Sender<Job>> {
        let (tx, rx) = unbounded::<Job>();
        let mut builder = thread::Builder::new().name(self.name.clone());
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }
        builder.spawn(move || {
            for job in rx.iter() {
                job();
            }
            trace!("{} exit loop", thread::current().name().unwrap_or("worker"));
        })?;
        Ok(tx)
    }

    /// Queues `job`. Returns it back when the worker is stopped.
    fn post(&self, job: Job) -> Result<(), Job> {
        let mut tx = self.tx.lock();
        if self.stopped.load(Ordering::Acquire) {
            return Err(job);
        }
        if tx.is_none() {
            match self.spawn() {
                Ok(sender) => *tx = Some(sender),
                Err(err) => {
                    warn!("{} spawn failed: {}", self.name, err);
                    return Err(job);
                }
            }
        }
        match tx.as_ref().map(|sender| sender.send(job)) {
            Some(Ok(())) => Ok(()),
            Some(Err(err)) => {
                // the thread died with a panicking job; the next post respawns
                *tx = None;
                Err(err.into_inner())
            }
            None => Ok(()),
        }
    }

    /// Lets the thread exit after the jobs already queued.
    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.tx.lock().take();
    }
}

/// Blocking transport over one [`Stream`].
pub struct SyncTransport {
    io: Mutex<Option<Arc<Stream>>>,
    /// Duplicate handle used for shutdowns and addresses.
    ctl: Stream,
    reader: Worker,
    writer: Worker,
    read_shut: AtomicBool,
    write_shut: AtomicBool,
    closed: AtomicBool,
}

impl SyncTransport {
    fn stream(&self) -> Option<Arc<Stream>> {
        self.io.lock().clone()
    }
}

impl Transport for SyncTransport {
    fn submit_read<R, F>(&self, target: R, deadline: Option<Duration>, done: F) -> Result<(), R>
    where
        R: RecvTarget,
        F: FnOnce(R, io::Result<usize>) + Send + 'static,
    {
        if self.read_shut.load(Ordering::Acquire) {
            return Err(target);
        }
        let Some(stream) = self.stream() else {
            return Err(target);
        };
        // the target rides inside the job; a refused post hands it back
        let slot = Arc::new(Mutex::new(Some(target)));
        let job_slot = Arc::clone(&slot);
        let job: Job = Box::new(move || {
            let Some(mut target) = job_slot.lock().take() else {
                return;
            };
            let res = stream.read_with_deadline(target.recv_buf(), deadline);
            done(target, res);
        });
        match self.reader.post(job) {
            Ok(()) => Ok(()),
            Err(_) => match slot.lock().take() {
                Some(target) => Err(target),
                None => Ok(()),
            },
        }
    }

    fn submit_write<F>(
        &self,
        buf: BytesMut,
        deadline: Option<Duration>,
        done: F,
    ) -> Result<(), BytesMut>
    where
        F: FnOnce(WriteCompletion) + Send + 'static,
    {
        if self.write_shut.load(Ordering::Acquire) {
            return Err(buf);
        }
        let Some(stream) = self.stream() else {
            return Err(buf);
        };
        let slot = Arc::new(Mutex::new(Some(buf)));
        let job_slot = Arc::clone(&slot);
        let job: Job = Box::new(move || {
            let Some(buf) = job_slot.lock().take() else {
                return;
            };
            let mut written = 0;
            let result = stream.write_with_deadline(&buf, deadline, &mut written);
            done(WriteCompletion {
                buf,
                written,
                result,
            });
        });
        match self.writer.post(job) {
            Ok(()) => Ok(()),
            Err(_) => match slot.lock().take() {
                Some(buf) => Err(buf),
                None => Ok(()),
            },
        }
    }

    fn dispatch(&self, job: Job) {
        if let Err(job) = self.writer.post(job) {
            // the writer is gone; the job still has to run so the session
            // can observe the closed state and settle its accounting
            job();
        }
    }

    fn shutdown_read(&self) {
        if !self.read_shut.swap(true, Ordering::AcqRel) {
            if let Err(err) = self.ctl.shutdown(Shutdown::Read) {
                trace!("shutdown read: {}", err);
            }
        }
    }

    fn shutdown_write(&self) {
        if !self.write_shut.swap(true, Ordering::AcqRel) {
            if let Err(err) = self.ctl.shutdown(Shutdown::Write) {
                trace!("shutdown write: {}", err);
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.read_shut.store(true, Ordering::Release);
        self.write_shut.store(true, Ordering::Release);
        if let Err(err) = self.ctl.shutdown(Shutdown::Both) {
            trace!("shutdown both: {}", err);
        }
        self.io.lock().take();
        self.reader.stop();
        self.writer.stop();
    }

    fn local_addr(&self) -> io::Result<Addr> {
        self.ctl.local_addr()
    }

    fn peer_addr(&self) -> io::Result<Addr> {
        self.ctl.peer_addr()
    }
}

impl Drop for SyncTransport {
    fn drop(&mut self) {
        self.reader.stop();
        self.writer.stop();
    }
}
