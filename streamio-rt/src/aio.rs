//! Asynchronous backend: sessions share one tokio poller pool.
//!
//! Every read or write becomes a task on the pool; its completion closure
//! runs on whichever worker finished it. Deadlines are per operation. A
//! watch channel per direction cancels pending operations when the
//! transport shuts that direction or closes.
//!
//! Callbacks run on pool workers, so they should not block for long; a
//! blocking [`send_timeout`](streamio::StreamSession::send_timeout) from a
//! callback ties up a worker until space frees.

use bytes::BytesMut;
use core_affinity::CoreId;
use crossbeam_channel::Receiver;
use log::{trace, warn};
use parking_lot::Mutex;
use std::{
    future::Future,
    io,
    net::Shutdown,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    runtime::{Handle, Runtime},
    sync::watch,
};

use streamio::{Addr, Job, RecvTarget, Transport, WriteCompletion};

use crate::{Backend, Stream};

/// Configures an [`AsyncService`].
#[derive(Debug, Clone)]
pub struct AsyncServiceBuilder {
    name: String,
    workers: usize,
    core_ids: Vec<CoreId>,
}

impl Default for AsyncServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncServiceBuilder {
    /// One worker per available CPU, threads named `streamio-aio`.
    pub fn new() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            name: "streamio-aio".to_string(),
            workers,
            core_ids: Vec::new(),
        }
    }

    /// Names the worker threads.
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Number of poller worker threads.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Pins worker threads round-robin onto these cores.
    pub fn core_ids(mut self, core_ids: Vec<CoreId>) -> Self {
        self.core_ids = core_ids;
        self
    }

    /// Pins worker threads round-robin onto every core of the machine.
    pub fn pin_all_cores(self) -> Self {
        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        self.core_ids(core_ids)
    }

    /// Starts the pool.
    pub fn build(self) -> io::Result<AsyncService> {
        let cores = Arc::new(self.core_ids);
        let next = Arc::new(AtomicUsize::new(0));
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.workers)
            .thread_name(self.name)
            .enable_all()
            .on_thread_start(move || {
                if cores.is_empty() {
                    return;
                }
                let core = cores[next.fetch_add(1, Ordering::Relaxed) % cores.len()];
                if !core_affinity::set_for_current(core) {
                    warn!("failed to pin thread to core {}", core.id);
                }
            })
            .build()?;
        let handle = runtime.handle().clone();
        Ok(AsyncService {
            runtime: Some(runtime),
            handle,
        })
    }
}

/// Shared poller pool driving [`AsyncTransport`]s.
///
/// The service must outlive the sessions bound through it: once it is
/// dropped, pending operations are cancelled and their completions never run.
pub struct AsyncService {
    runtime: Option<Runtime>,
    handle: Handle,
}

impl AsyncService {
    /// Builder with default settings.
    pub fn builder() -> AsyncServiceBuilder {
        AsyncServiceBuilder::new()
    }

    /// Handle of the underlying runtime.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Stops the pool, waiting up to `timeout` for running tasks.
    pub fn shutdown_timeout(mut self, timeout: Duration) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(timeout);
        }
    }
}

impl Backend for AsyncService {
    type Transport = AsyncTransport;

    fn bind(&self, stream: Stream) -> io::Result<AsyncTransport> {
        let ctl = stream.try_clone()?;
        stream.set_nonblocking(true)?;
        let io = {
            let _enter = self.handle.enter();
            match stream {
                Stream::Tcp(s) => AioStream::Tcp(tokio::net::TcpStream::from_std(s)?),
                #[cfg(unix)]
                Stream::Unix(s) => AioStream::Unix(tokio::net::UnixStream::from_std(s)?),
            }
        };
        let (read_gate, _) = watch::channel(false);
        let (write_gate, _) = watch::channel(false);
        Ok(AsyncTransport {
            handle: self.handle.clone(),
            io: Mutex::new(Some(Arc::new(io))),
            ctl,
            read_gate,
            write_gate,
            read_shut: AtomicBool::new(false),
            write_shut: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }
}

enum AioStream {
    Tcp(tokio::net::TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl AioStream {
    async fn readable(&self) -> io::Result<()> {
        match self {
            AioStream::Tcp(s) => s.readable().await,
            #[cfg(unix)]
            AioStream::Unix(s) => s.readable().await,
        }
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            AioStream::Tcp(s) => s.try_read(buf),
            #[cfg(unix)]
            AioStream::Unix(s) => s.try_read(buf),
        }
    }

    async fn writable(&self) -> io::Result<()> {
        match self {
            AioStream::Tcp(s) => s.writable().await,
            #[cfg(unix)]
            AioStream::Unix(s) => s.writable().await,
        }
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            AioStream::Tcp(s) => s.try_write(buf),
            #[cfg(unix)]
            AioStream::Unix(s) => s.try_write(buf),
        }
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            self.readable().await?;
            match self.try_read(buf) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                res => return res,
            }
        }
    }

    async fn write_all(&self, buf: &[u8], written: &mut usize) -> io::Result<()> {
        while *written < buf.len() {
            self.writable().await?;
            match self.try_write(&buf[*written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => *written += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

async fn with_deadline<T, F>(deadline: Option<Duration>, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match deadline {
        Some(deadline) => match tokio::time::timeout(deadline, fut).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::from(io::ErrorKind::TimedOut)),
        },
        None => fut.await,
    }
}

async fn gate_closed(mut gate: watch::Receiver<bool>) {
    let _ = gate.wait_for(|shut| *shut).await;
}

/// Transport driven by an [`AsyncService`].
pub struct AsyncTransport {
    handle: Handle,
    io: Mutex<Option<Arc<AioStream>>>,
    /// Duplicate handle used for shutdowns and addresses.
    ctl: Stream,
    read_gate: watch::Sender<bool>,
    write_gate: watch::Sender<bool>,
    read_shut: AtomicBool,
    write_shut: AtomicBool,
    closed: AtomicBool,
}

impl AsyncTransport {
    fn stream(&self) -> Option<Arc<AioStream>> {
        self.io.lock().clone()
    }
}

impl Transport for AsyncTransport {
    fn submit_read<R, F>(&self, target: R, deadline: Option<Duration>, done: F) -> Result<(), R>
    where
        R: RecvTarget,
        F: FnOnce(R, io::Result<usize>) + Send + 'static,
    {
        if self.read_shut.load(Ordering::Acquire) {
            return Err(target);
        }
        let Some(io) = self.stream() else {
            return Err(target);
        };
        let gate = self.read_gate.subscribe();
        self.handle.spawn(async move {
            let mut target = target;
            let res = {
                let buf = target.recv_buf();
                tokio::select! {
                    biased;
                    _ = gate_closed(gate) => Ok(0),
                    res = with_deadline(deadline, io.read(buf)) => res,
                }
            };
            done(target, res);
        });
        Ok(())
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
        let Some(io) = self.stream() else {
            return Err(buf);
        };
        let gate = self.write_gate.subscribe();
        self.handle.spawn(async move {
            let mut written = 0;
            let result = {
                let write = with_deadline(deadline, io.write_all(&buf, &mut written));
                tokio::select! {
                    biased;
                    _ = gate_closed(gate) => Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "transport closed",
                    )),
                    res = write => res,
                }
            };
            done(WriteCompletion {
                buf,
                written,
                result,
            });
        });
        Ok(())
    }

    fn dispatch(&self, job: Job) {
        self.handle.spawn(async move { job() });
    }

    fn shutdown_read(&self) {
        if !self.read_shut.swap(true, Ordering::AcqRel) {
            self.read_gate.send_replace(true);
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
        self.read_gate.send_replace(true);
        self.write_gate.send_replace(true);
        if let Err(err) = self.ctl.shutdown(Shutdown::Both) {
            trace!("shutdown both: {}", err);
        }
        self.io.lock().take();
    }

    fn local_addr(&self) -> io::Result<Addr> {
        self.ctl.local_addr()
    }

    fn peer_addr(&self) -> io::Result<Addr> {
        self.ctl.peer_addr()
    }

    fn linger(&self, grace: Duration, drained: Receiver<()>, then: Job) {
        self.handle.spawn_blocking(move || {
            if drained.recv_timeout(grace).is_err() {
                trace!("linger: grace period of {:?} elapsed", grace);
            }
            then();
        });
    }
}
