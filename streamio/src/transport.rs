//! The I/O backend contract.
//!
//! A [`Transport`] owns one connected byte stream and executes the primitive
//! operations a session needs: submit a read, submit a write, run a job on the
//! backend's execution context, shut a half, hard-close. Completions are
//! delivered by calling the supplied closure exactly once, on a thread chosen
//! by the backend.
//!
//! Rules every implementation follows:
//!
//! * a submission after `shutdown_read` (reads), `shutdown_write` (writes) or
//!   `close` (both) fails synchronously and hands the buffer back;
//! * an expired deadline completes with `WouldBlock` or `TimedOut`, see
//!   [`is_timeout`](crate::is_timeout);
//! * a read completing with `Ok(0)` means the peer closed its write half.

use bytes::BytesMut;
use crossbeam_channel::Receiver;
use log::{trace, warn};
use std::{fmt, io, net::SocketAddr, path::PathBuf, thread, time::Duration};

/// Work item run on a backend execution context.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Memory a read is performed into.
///
/// The target is moved into the transport for the duration of the read and
/// handed back with the completion, so no one else can touch the buffer while
/// the operation is pending.
pub trait RecvTarget: Send + 'static {
    /// Writable region for the read.
    fn recv_buf(&mut self) -> &mut [u8];
}

impl RecvTarget for Vec<u8> {
    fn recv_buf(&mut self) -> &mut [u8] {
        &mut self[..]
    }
}

impl RecvTarget for BytesMut {
    fn recv_buf(&mut self) -> &mut [u8] {
        &mut self[..]
    }
}

/// Result of a submitted write.
#[derive(Debug)]
pub struct WriteCompletion {
    /// The submitted buffer, returned for reuse or resubmission.
    pub buf: BytesMut,
    /// Bytes of `buf` accepted by the kernel before the operation ended.
    pub written: usize,
    /// `Ok` when all of `buf` was written.
    pub result: io::Result<()>,
}

/// Address of either end of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Addr {
    /// TCP endpoint.
    Inet(SocketAddr),
    /// Unix domain socket endpoint; unnamed sockets carry no path.
    Unix(Option<PathBuf>),
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::Inet(addr) => write!(f, "{}", addr),
            Addr::Unix(Some(path)) => write!(f, "unix:{}", path.display()),
            Addr::Unix(None) => f.write_str("unix:(unnamed)"),
        }
    }
}

impl From<SocketAddr> for Addr {
    fn from(addr: SocketAddr) -> Self {
        Addr::Inet(addr)
    }
}

/// One connected byte stream driven by a backend.
pub trait Transport: Send + Sync + 'static {
    /// Reads into `target` with an optional deadline.
    fn submit_read<R, F>(&self, target: R, deadline: Option<Duration>, done: F) -> Result<(), R>
    where
        R: RecvTarget,
        F: FnOnce(R, io::Result<usize>) + Send + 'static;

    /// Writes all of `buf` with an optional deadline covering the whole
    /// buffer.
    fn submit_write<F>(
        &self,
        buf: BytesMut,
        deadline: Option<Duration>,
        done: F,
    ) -> Result<(), BytesMut>
    where
        F: FnOnce(WriteCompletion) + Send + 'static;

    /// Runs `job` on the context that services this transport's writes.
    fn dispatch(&self, job: Job);

    /// Stops the read direction. Pending reads complete promptly.
    fn shutdown_read(&self);

    /// Sends FIN after the last submitted write.
    fn shutdown_write(&self);

    /// Shuts both directions and releases the connection. Idempotent.
    fn close(&self);

    /// Local endpoint.
    fn local_addr(&self) -> io::Result<Addr>;

    /// Remote endpoint.
    fn peer_addr(&self) -> io::Result<Addr>;

    /// Runs `then` once `drained` yields or `grace` elapses, whichever comes
    /// first, without blocking the caller.
    fn linger(&self, grace: Duration, drained: Receiver<()>, then: Job) {
        let (job_tx, job_rx) = crossbeam_channel::bounded::<Job>(1);
        let _ = job_tx.send(then);
        let fallback = job_rx.clone();
        let spawned = thread::Builder::new()
            .name("streamio-linger".to_string())
            .spawn(move || {
                if drained.recv_timeout(grace).is_err() {
                    trace!("linger: grace period of {:?} elapsed", grace);
                }
                if let Ok(then) = job_rx.try_recv() {
                    then();
                }
            });
        if let Err(err) = spawned {
            warn!("linger thread spawn failed, closing now: {}", err);
            if let Ok(then) = fallback.try_recv() {
                then();
            }
        }
    }
}
