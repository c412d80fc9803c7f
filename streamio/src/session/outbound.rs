//! Outbound pipeline: queue, batch, encode, write.
//!
//! ```text
//!  send ─► SendQueue ─(first add arms)─► run_writer ─► drain batch
//!                                            ▲            │ encode / coalesce
//!                                            │            ▼
//!                          queue not empty ──┴── on_written ◄── submit_write
//! ```
//!
//! At most one writer is armed per session. The armed writer holds one
//! in-flight count from the add that armed it until it disarms on an empty
//! queue or stops on error.

use bytes::{Buf, BytesMut};
use log::{debug, error, trace};
use std::{collections::VecDeque, sync::atomic::Ordering, sync::Arc, time::Duration};

use super::{Completion, Shared};
use crate::{
    codec::Outgoing,
    error::{is_timeout, SessionError},
    queue::{Admission, Disarm, QueueError},
    transport::{Transport, WriteCompletion},
};

pub(crate) struct WriterState<Out> {
    /// Drained entries that did not fit under the byte ceiling.
    pending: VecDeque<Outgoing<Out>>,
    /// Write buffer kept between batches.
    spare: Option<BytesMut>,
}

impl<Out> WriterState<Out> {
    pub(crate) fn new(max_bytes: usize) -> Self {
        WriterState {
            pending: VecDeque::new(),
            spare: Some(BytesMut::with_capacity(max_bytes)),
        }
    }
}

impl<T, Out, In> Shared<T, Out, In>
where
    T: Transport,
    Out: Send + 'static,
    In: Send + 'static,
{
    /// `wait`: `None` never blocks, `Some(None)` blocks without deadline.
    pub(crate) fn enqueue(
        self: &Arc<Self>,
        item: Outgoing<Out>,
        wait: Option<Option<Duration>>,
    ) -> Result<(), SessionError> {
        if item.is_empty_raw() {
            return Err(SessionError::InvalidObject);
        }
        if matches!(item, Outgoing::Message(_)) && !self.has_encoder.load(Ordering::Acquire) {
            return Err(SessionError::InvalidEncoder);
        }

        let arm = || self.begin_io();
        let admitted = match wait {
            None => self.queue.add(item, arm),
            Some(timeout) => self.queue.add_blocking(item, timeout, arm),
        };
        match admitted {
            Ok(Admission::Armed) => {
                let this = Arc::clone(self);
                self.transport.dispatch(Box::new(move || this.run_writer()));
                Ok(())
            }
            Ok(Admission::Queued) => Ok(()),
            Err(QueueError::Closed) => Err(SessionError::SocketClosed),
            Err(QueueError::Full) => Err(SessionError::SendQueueFull),
            Err(QueueError::Timeout) => Err(SessionError::SendTimeout),
        }
    }

    /// One writer activation. Runs until a write is submitted or the queue
    /// is found empty.
    pub(super) fn run_writer(self: &Arc<Self>) {
        loop {
            if self.released.load(Ordering::Acquire) {
                self.stop_writer();
                return;
            }

            let (buf, encode_errors) = self.fill_batch();
            for err in &encode_errors {
                self.report(err);
            }
            if !buf.is_empty() {
                self.submit_batch(buf);
                return;
            }

            self.writer.lock().spare = Some(buf);
            match self.queue.try_disarm() {
                Disarm::Busy => continue,
                Disarm::Idle { closed } => {
                    if closed {
                        self.close_write_half();
                    }
                    self.end_io();
                    return;
                }
            }
        }
    }

    /// Drains the queue and encodes entries until the byte ceiling.
    fn fill_batch(&self) -> (BytesMut, Vec<SessionError>) {
        let mut writer = self.writer.lock();
        let writer = &mut *writer;
        if writer.pending.len() < self.limits.max_items {
            let room = self.limits.max_items - writer.pending.len();
            self.queue.drain(&mut writer.pending, room);
        }

        let mut buf = writer
            .spare
            .take()
            .unwrap_or_else(|| BytesMut::with_capacity(self.limits.max_bytes));
        let mut errors = Vec::new();
        let mut encoder = self.encoder.lock();
        while buf.len() < self.limits.max_bytes {
            let Some(item) = writer.pending.pop_front() else {
                break;
            };
            let mark = buf.len();
            match item {
                Outgoing::Raw(bytes) => buf.extend_from_slice(&bytes),
                Outgoing::Message(msg) => {
                    let encoded = match encoder.as_mut() {
                        Some(encoder) => encoder.encode(msg, &mut buf),
                        None => Err("no encoder installed".into()),
                    };
                    if let Err(err) = encoded {
                        buf.truncate(mark);
                        error!("encode failed, message dropped: {}", err);
                        errors.push(SessionError::encode(err));
                    }
                }
            }
        }
        (buf, errors)
    }

    fn submit_batch(self: &Arc<Self>, buf: BytesMut) {
        trace!("submitting write of {} bytes", buf.len());
        let this = Arc::clone(self);
        let deadline = self.send_deadline();
        let submitted = self.transport.submit_write(buf, deadline, move |done| {
            this.complete(Completion::Write(done))
        });
        if submitted.is_err() {
            trace!("write refused, write side no longer open");
            self.stop_writer();
        }
    }

    pub(super) fn on_written(self: &Arc<Self>, done: WriteCompletion) {
        let WriteCompletion {
            mut buf,
            written,
            result,
        } = done;
        match result {
            Ok(()) => {
                buf.clear();
                self.writer.lock().spare = Some(buf);
                self.run_writer();
            }
            Err(err) if is_timeout(&err) => {
                if self.state.load().is_closing() {
                    self.stop_writer();
                    return;
                }
                // retried whether or not anyone is listening
                self.report(&SessionError::SendTimeout);
                if self.state.load().is_closing() {
                    self.stop_writer();
                    return;
                }
                buf.advance(written);
                trace!("write timed out, resubmitting {} bytes", buf.len());
                self.submit_batch(buf);
            }
            Err(err) => {
                let err = SessionError::from(err);
                if !self.state.load().is_closing() {
                    self.close(Some(err.clone()), Duration::ZERO);
                    self.report(&err);
                }
                self.stop_writer();
            }
        }
    }

    /// Ends the writer chain for good; anything unsent is discarded.
    fn stop_writer(self: &Arc<Self>) {
        let queued = self.queue.abandon();
        let pending = {
            let mut writer = self.writer.lock();
            let n = writer.pending.len();
            writer.pending.clear();
            n
        };
        if queued + pending > 0 {
            debug!("writer stopped, {} unsent messages dropped", queued + pending);
        }
        self.signal_drained();
        self.end_io();
    }

    pub(super) fn close_write_half(&self) {
        if !self.write_shut.swap(true, Ordering::AcqRel) {
            trace!("outbound drained, shutting write half");
            self.transport.shutdown_write();
        }
        self.signal_drained();
    }

    pub(super) fn signal_drained(&self) {
        if let Some(tx) = self.drained_tx.lock().take() {
            let _ = tx.try_send(());
        }
    }
}
