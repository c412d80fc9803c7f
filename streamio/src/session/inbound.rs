//! Inbound pipeline: read, unpack, dispatch, resubmit.
//!
//! Exactly one read is outstanding at a time. The unpacker travels inside
//! that read as an [`Inbound`] and comes back with the completion, so the
//! receive buffer is never shared and messages are delivered strictly in
//! unpack order.

use log::{trace, warn};
use std::{io, sync::Arc, sync::atomic::Ordering, time::Duration};

use super::{Completion, MessageCallback, Shared};
use crate::{
    codec::Unpacker,
    error::{is_timeout, SessionError},
    state::Event,
    transport::{RecvTarget, Transport},
};

/// The unpacker while it is owned by a read operation.
pub(crate) struct Inbound<In: Send + 'static> {
    unpacker: Box<dyn Unpacker<Item = In>>,
}

impl<In: Send + 'static> RecvTarget for Inbound<In> {
    fn recv_buf(&mut self) -> &mut [u8] {
        self.unpacker.receive_buffer()
    }
}

impl<T, Out, In> Shared<T, Out, In>
where
    T: Transport,
    Out: Send + 'static,
    In: Send + 'static,
{
    pub(crate) fn begin_recv(
        self: &Arc<Self>,
        on_message: MessageCallback<T, Out, In>,
    ) -> Result<(), SessionError> {
        if self.recv_started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.state.load().is_read_closed() {
            return Err(SessionError::SocketClosed);
        }
        let _ = self.on_message.set(on_message);
        let unpacker = self
            .unpacker
            .lock()
            .take()
            .ok_or(SessionError::SocketClosed)?;
        if self.post_read(Inbound { unpacker }) {
            Ok(())
        } else {
            Err(SessionError::SocketClosed)
        }
    }

    /// Submits the next read. Returns false when the pipeline stopped.
    pub(super) fn post_read(self: &Arc<Self>, mut inbound: Inbound<In>) -> bool {
        self.begin_io();
        if self.state.load().is_read_closed() {
            self.end_io();
            return false;
        }
        if inbound.unpacker.receive_buffer().is_empty() {
            let err = SessionError::unpack("unpacker offered an empty receive buffer".into());
            warn!("{}", err);
            self.close(Some(err.clone()), Duration::ZERO);
            self.report(&err);
            self.end_io();
            return false;
        }

        let this = Arc::clone(self);
        let deadline = self.recv_deadline();
        let submitted = self
            .transport
            .submit_read(inbound, deadline, move |inbound, result| {
                this.complete(Completion::Read(inbound, result))
            });
        if submitted.is_err() {
            trace!("read refused, read side no longer open");
            self.end_io();
            return false;
        }
        true
    }

    pub(super) fn on_read(self: &Arc<Self>, mut inbound: Inbound<In>, result: io::Result<usize>) {
        if self.process_read(&mut inbound, result) {
            self.post_read(inbound);
        }
        self.end_io();
    }

    /// Returns true when another read should be submitted.
    fn process_read(self: &Arc<Self>, inbound: &mut Inbound<In>, result: io::Result<usize>) -> bool {
        if self.state.load().is_read_closed() {
            trace!("read completed after read side closed");
            return false;
        }
        match result {
            Ok(0) => {
                self.read_failed(SessionError::Eof);
                false
            }
            Ok(n) => {
                trace!("read {} bytes", n);
                inbound.unpacker.on_data(n);
                self.dispatch_messages(inbound)
            }
            Err(err) if is_timeout(&err) => {
                let timeout = SessionError::RecvTimeout;
                if self.report(&timeout) {
                    !self.state.load().is_read_closed()
                } else {
                    self.close(Some(timeout), Duration::ZERO);
                    false
                }
            }
            Err(err) => {
                self.read_failed(err.into());
                false
            }
        }
    }

    fn dispatch_messages(self: &Arc<Self>, inbound: &mut Inbound<In>) -> bool {
        let session = self.handle();
        loop {
            if self.state.load().is_read_closed() {
                return false;
            }
            match inbound.unpacker.unpack() {
                Ok(Some(msg)) => {
                    if let Some(on_message) = self.on_message.get() {
                        on_message(&session, msg);
                    }
                }
                Ok(None) => return true,
                Err(err) => {
                    let err = SessionError::unpack(err);
                    warn!("closing session: {}", err);
                    self.close(Some(err.clone()), Duration::ZERO);
                    self.report(&err);
                    return false;
                }
            }
        }
    }

    /// EOF or a hard read error: the read half is done.
    fn read_failed(self: &Arc<Self>, err: SessionError) {
        self.state.apply(Event::ShutdownRead);
        trace!("read side ended: {}", err);
        if !self.report(&err) {
            self.close(Some(err), Duration::ZERO);
        }
    }
}
