//! The [`StreamSession`] façade.
//!
//! A session is a cheap, clonable handle over shared per-connection state:
//!
//! ```text
//!  StreamSession ──► Shared ─┬─ SendQueue ──► outbound pipeline ─┐
//!  (Clone handle)            │                                   ├─► Transport
//!                            ├─ Unpacker ◄── inbound pipeline ◄──┘
//!                            └─ close coordinator (state, in-flight, latch)
//! ```
//!
//! Every backend completion re-enters the session through
//! `Shared::complete`, which routes it to the owning pipeline and then
//! updates the in-flight count.

mod close;
mod inbound;
mod outbound;

#[cfg(test)]
mod mock;

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::{
    any::Any,
    fmt, io,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};

use crate::{
    codec::{Encoder, Outgoing, Passthrough, Unpacker},
    error::SessionError,
    queue::{SendQueue, DEFAULT_SEND_QUEUE_SIZE},
    state::{SessionState, StateCell},
    transport::{Addr, Transport, WriteCompletion},
};

use inbound::Inbound;
use outbound::WriterState;

/// Upper bound on the bytes coalesced into one write.
pub const DEFAULT_MAX_BATCH_BYTES: usize = 64 * 1024;

/// Upper bound on the queue entries drained per batch.
pub const DEFAULT_MAX_BATCH_ITEMS: usize = 64;

/// Invoked once per unpacked message, in order, one at a time.
pub type MessageCallback<T, Out, In> =
    Box<dyn Fn(&StreamSession<T, Out, In>, In) + Send + Sync + 'static>;

/// Invoked for timeouts, encode failures and fatal I/O or framing errors.
pub type ErrorCallback<T, Out, In> =
    Arc<dyn Fn(&StreamSession<T, Out, In>, &SessionError) + Send + Sync + 'static>;

/// Invoked exactly once after the session closed and all I/O quiesced.
pub type CloseCallback<T, Out, In> =
    Arc<dyn Fn(&StreamSession<T, Out, In>, Option<&SessionError>) + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy)]
pub(crate) struct BatchLimits {
    pub(crate) max_bytes: usize,
    pub(crate) max_items: usize,
}

/// Backend completion routed back into the session.
pub(crate) enum Completion<In: Send + 'static> {
    Read(Inbound<In>, io::Result<usize>),
    Write(WriteCompletion),
}

/// Configures and creates a [`StreamSession`].
///
/// The type parameters follow the installed encoder (`Out`) and unpacker
/// (`In`): calling [`encoder`](SessionBuilder::encoder) or
/// [`unpacker`](SessionBuilder::unpacker) switches them.
///
/// ```rust,ignore
/// let session = SessionBuilder::new()
///     .send_queue_size(256)
///     .recv_timeout(Duration::from_secs(5))
///     .unpacker(LengthDelimitedUnpacker::new(64 * 1024))
///     .encoder(LengthDelimitedEncoder::new(64 * 1024))
///     .bind(transport);
/// ```
pub struct SessionBuilder<Out = Bytes, In = BytesMut>
where
    Out: Send + 'static,
    In: Send + 'static,
{
    send_queue_size: usize,
    max_batch_bytes: usize,
    max_batch_items: usize,
    recv_timeout: Duration,
    send_timeout: Duration,
    encoder: Option<Box<dyn Encoder<Item = Out>>>,
    unpacker: Box<dyn Unpacker<Item = In>>,
}

impl Default for SessionBuilder<Bytes, BytesMut> {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBuilder<Bytes, BytesMut> {
    /// Builder with a pass-through unpacker and no encoder.
    pub fn new() -> Self {
        Self {
            send_queue_size: DEFAULT_SEND_QUEUE_SIZE,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            max_batch_items: DEFAULT_MAX_BATCH_ITEMS,
            recv_timeout: Duration::ZERO,
            send_timeout: Duration::ZERO,
            encoder: None,
            unpacker: Box::new(Passthrough::default()),
        }
    }
}

impl<Out, In> SessionBuilder<Out, In>
where
    Out: Send + 'static,
    In: Send + 'static,
{
    /// Capacity of the outbound queue.
    pub fn send_queue_size(mut self, size: usize) -> Self {
        self.send_queue_size = size;
        self
    }

    /// Soft ceiling on the bytes coalesced into one write.
    pub fn max_batch_bytes(mut self, bytes: usize) -> Self {
        self.max_batch_bytes = bytes.max(1);
        self
    }

    /// Maximum queue entries drained per batch.
    pub fn max_batch_items(mut self, items: usize) -> Self {
        self.max_batch_items = items.max(1);
        self
    }

    /// Read deadline, zero disables it.
    pub fn recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    /// Write deadline, zero disables it.
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Installs an encoder for typed messages.
    pub fn encoder<E>(self, encoder: E) -> SessionBuilder<E::Item, In>
    where
        E: Encoder,
    {
        SessionBuilder {
            send_queue_size: self.send_queue_size,
            max_batch_bytes: self.max_batch_bytes,
            max_batch_items: self.max_batch_items,
            recv_timeout: self.recv_timeout,
            send_timeout: self.send_timeout,
            encoder: Some(Box::new(encoder)),
            unpacker: self.unpacker,
        }
    }

    /// Installs the inbound unpacker.
    pub fn unpacker<U>(self, unpacker: U) -> SessionBuilder<Out, U::Item>
    where
        U: Unpacker,
    {
        SessionBuilder {
            send_queue_size: self.send_queue_size,
            max_batch_bytes: self.max_batch_bytes,
            max_batch_items: self.max_batch_items,
            recv_timeout: self.recv_timeout,
            send_timeout: self.send_timeout,
            encoder: self.encoder,
            unpacker: Box::new(unpacker),
        }
    }

    /// Creates the session over a connected transport.
    pub fn bind<T: Transport>(self, transport: T) -> StreamSession<T, Out, In> {
        let (drained_tx, drained_rx) = crossbeam_channel::bounded(1);
        let limits = BatchLimits {
            max_bytes: self.max_batch_bytes,
            max_items: self.max_batch_items,
        };
        let shared = Shared {
            transport,
            state: StateCell::new(),
            inflight: AtomicUsize::new(0),
            finalize_armed: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            released: AtomicBool::new(false),
            write_shut: AtomicBool::new(false),
            recv_started: AtomicBool::new(false),
            queue: SendQueue::new(self.send_queue_size),
            writer: Mutex::new(WriterState::new(limits.max_bytes)),
            limits,
            has_encoder: AtomicBool::new(self.encoder.is_some()),
            encoder: Mutex::new(self.encoder),
            unpacker: Mutex::new(Some(self.unpacker)),
            on_message: OnceLock::new(),
            on_error: RwLock::new(None),
            on_close: RwLock::new(None),
            close_reason: OnceLock::new(),
            recv_timeout: AtomicU64::new(nanos(self.recv_timeout)),
            send_timeout: AtomicU64::new(nanos(self.send_timeout)),
            drained_tx: Mutex::new(Some(drained_tx)),
            drained_rx,
            user_data: RwLock::new(None),
        };
        StreamSession {
            shared: Arc::new(shared),
        }
    }
}

pub(crate) struct Shared<T, Out, In>
where
    T: Transport,
    Out: Send + 'static,
    In: Send + 'static,
{
    pub(crate) transport: T,
    pub(crate) state: StateCell,
    /// Outstanding reads plus the armed writer chain.
    inflight: AtomicUsize,
    finalize_armed: AtomicBool,
    finalized: AtomicBool,
    released: AtomicBool,
    write_shut: AtomicBool,
    recv_started: AtomicBool,

    queue: SendQueue<Outgoing<Out>>,
    writer: Mutex<WriterState<Out>>,
    limits: BatchLimits,
    /// Mirrors `encoder.is_some()` so senders never wait on an encoding batch.
    has_encoder: AtomicBool,
    encoder: Mutex<Option<Box<dyn Encoder<Item = Out>>>>,
    unpacker: Mutex<Option<Box<dyn Unpacker<Item = In>>>>,

    on_message: OnceLock<MessageCallback<T, Out, In>>,
    on_error: RwLock<Option<ErrorCallback<T, Out, In>>>,
    on_close: RwLock<Option<CloseCallback<T, Out, In>>>,
    close_reason: OnceLock<Option<SessionError>>,

    recv_timeout: AtomicU64,
    send_timeout: AtomicU64,

    drained_tx: Mutex<Option<Sender<()>>>,
    drained_rx: Receiver<()>,
    user_data: RwLock<Option<Arc<dyn Any + Send + Sync>>>,
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

fn deadline(v: &AtomicU64) -> Option<Duration> {
    match v.load(Ordering::Relaxed) {
        0 => None,
        n => Some(Duration::from_nanos(n)),
    }
}

impl<T, Out, In> Shared<T, Out, In>
where
    T: Transport,
    Out: Send + 'static,
    In: Send + 'static,
{
    pub(crate) fn handle(self: &Arc<Self>) -> StreamSession<T, Out, In> {
        StreamSession {
            shared: Arc::clone(self),
        }
    }

    pub(crate) fn complete(self: &Arc<Self>, completion: Completion<In>) {
        match completion {
            Completion::Read(inbound, result) => self.on_read(inbound, result),
            Completion::Write(done) => self.on_written(done),
        }
    }

    pub(crate) fn recv_deadline(&self) -> Option<Duration> {
        deadline(&self.recv_timeout)
    }

    pub(crate) fn send_deadline(&self) -> Option<Duration> {
        deadline(&self.send_timeout)
    }

    /// Hands `err` to the error callback. Returns false when none is set.
    pub(crate) fn report(self: &Arc<Self>, err: &SessionError) -> bool {
        let cb = self.on_error.read().clone();
        match cb {
            Some(cb) => {
                cb(&self.handle(), err);
                true
            }
            None => false,
        }
    }
}

impl<T, Out, In> Drop for Shared<T, Out, In>
where
    T: Transport,
    Out: Send + 'static,
    In: Send + 'static,
{
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire) {
            log::warn!("stream session dropped without close, releasing connection");
            self.transport.close();
        }
    }
}

/// A managed, callback-driven connection.
///
/// Cloning yields another handle to the same session.
pub struct StreamSession<T, Out = Bytes, In = BytesMut>
where
    T: Transport,
    Out: Send + 'static,
    In: Send + 'static,
{
    shared: Arc<Shared<T, Out, In>>,
}

impl<T, Out, In> Clone for StreamSession<T, Out, In>
where
    T: Transport,
    Out: Send + 'static,
    In: Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, Out, In> fmt::Debug for StreamSession<T, Out, In>
where
    T: Transport,
    Out: Send + 'static,
    In: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("state", &self.state())
            .field("peer", &self.remote_addr().ok())
            .finish_non_exhaustive()
    }
}

impl<T, Out, In> StreamSession<T, Out, In>
where
    T: Transport,
    Out: Send + 'static,
    In: Send + 'static,
{
    /// Replaces the encoder used for typed messages.
    pub fn set_encoder<E>(&self, encoder: E)
    where
        E: Encoder<Item = Out>,
    {
        *self.shared.encoder.lock() = Some(Box::new(encoder));
        self.shared.has_encoder.store(true, Ordering::Release);
    }

    /// Replaces the unpacker. Only effective before [`begin_recv`](Self::begin_recv).
    pub fn set_unpacker<U>(&self, unpacker: U)
    where
        U: Unpacker<Item = In>,
    {
        if self.shared.recv_started.load(Ordering::Acquire) {
            log::warn!("set_unpacker after begin_recv has no effect");
        }
        *self.shared.unpacker.lock() = Some(Box::new(unpacker));
    }

    /// Queues `msg` without blocking.
    ///
    /// Fails with [`SessionError::SendQueueFull`] at capacity and with
    /// [`SessionError::SocketClosed`] once the write side is shut.
    pub fn send(&self, msg: impl Into<Outgoing<Out>>) -> Result<(), SessionError> {
        self.shared.enqueue(msg.into(), None)
    }

    /// Queues `msg`, waiting up to `timeout` for queue space.
    ///
    /// A zero `timeout` waits until space frees up or the session closes.
    pub fn send_timeout(
        &self,
        msg: impl Into<Outgoing<Out>>,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let wait = (!timeout.is_zero()).then_some(timeout);
        self.shared.enqueue(msg.into(), Some(wait))
    }

    /// Starts the inbound pipeline. A second call is a no-op.
    pub fn begin_recv<F>(&self, on_message: F) -> Result<(), SessionError>
    where
        F: Fn(&StreamSession<T, Out, In>, In) + Send + Sync + 'static,
    {
        self.shared.begin_recv(Box::new(on_message))
    }

    /// Sets the callback fired once the session is fully closed.
    pub fn set_close_callback<F>(&self, on_close: F)
    where
        F: Fn(&StreamSession<T, Out, In>, Option<&SessionError>) + Send + Sync + 'static,
    {
        *self.shared.on_close.write() = Some(Arc::new(on_close));
    }

    /// Sets the callback receiving timeouts and errors.
    pub fn set_error_callback<F>(&self, on_error: F)
    where
        F: Fn(&StreamSession<T, Out, In>, &SessionError) + Send + Sync + 'static,
    {
        *self.shared.on_error.write() = Some(Arc::new(on_error));
    }

    /// Read deadline for subsequent reads, zero disables it.
    pub fn set_recv_timeout(&self, timeout: Duration) {
        self.shared
            .recv_timeout
            .store(nanos(timeout), Ordering::Relaxed);
    }

    /// Write deadline for subsequent writes, zero disables it.
    pub fn set_send_timeout(&self, timeout: Duration) {
        self.shared
            .send_timeout
            .store(nanos(timeout), Ordering::Relaxed);
    }

    /// Changes the outbound queue capacity.
    pub fn set_send_queue_size(&self, size: usize) {
        self.shared.queue.set_capacity(size);
    }

    /// Stops reading and half-closes the read direction.
    pub fn shutdown_read(&self) {
        self.shared.shutdown_read();
    }

    /// Stops accepting sends; the write half closes once queued data is out.
    pub fn shutdown_write(&self) {
        self.shared.shutdown_write();
    }

    /// Closes the session.
    ///
    /// With a non-zero `grace` pending outbound data gets up to that long to
    /// drain before the connection is released. Only the first call has an
    /// effect; its `reason` is reported to the close callback.
    pub fn close(&self, reason: Option<SessionError>, grace: Duration) {
        self.shared.close(reason, grace);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.shared.state.load()
    }

    /// True once `close` has been accepted.
    pub fn is_closed(&self) -> bool {
        self.state().is_closing()
    }

    /// Reason recorded by the first `close`.
    pub fn close_reason(&self) -> Option<SessionError> {
        self.shared.close_reason.get().cloned().flatten()
    }

    /// Local endpoint of the connection.
    pub fn local_addr(&self) -> io::Result<Addr> {
        self.shared.transport.local_addr()
    }

    /// Remote endpoint of the connection.
    pub fn remote_addr(&self) -> io::Result<Addr> {
        self.shared.transport.peer_addr()
    }

    /// Attaches application data, replacing any previous value.
    pub fn set_user_data<D>(&self, data: D)
    where
        D: Any + Send + Sync,
    {
        *self.shared.user_data.write() = Some(Arc::new(data));
    }

    /// Returns the attached data if it is a `D`.
    pub fn user_data<D>(&self) -> Option<Arc<D>>
    where
        D: Any + Send + Sync,
    {
        let data = self.shared.user_data.read().clone()?;
        data.downcast::<D>().ok()
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    /// True when both handles refer to the same session.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}
