//! Close coordination.
//!
//! The close callback must fire exactly once and only after every read and
//! write the session started has completed. Two conditions gate it:
//!
//! * `finalize_armed`, set once the winning `close` has closed the queue,
//!   shut the read side and released the connection (after the grace period
//!   when one applies), so no new I/O can start afterwards;
//! * the in-flight count reaching zero.
//!
//! Whoever observes both last (the closer, or the final completion) fires
//! the callback through the `finalized` latch.

use log::trace;
use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use super::Shared;
use crate::{error::SessionError, state::Event, transport::Transport};

impl<T, Out, In> Shared<T, Out, In>
where
    T: Transport,
    Out: Send + 'static,
    In: Send + 'static,
{
    pub(crate) fn begin_io(&self) {
        self.inflight.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn end_io(self: &Arc<Self>) {
        let prev = self.inflight.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "in-flight count underflow");
        if prev == 1 && self.finalize_armed.load(Ordering::SeqCst) {
            self.try_finalize();
        }
    }

    pub(crate) fn shutdown_read(&self) {
        if self.state.apply(Event::ShutdownRead).is_some() {
            trace!("shutdown read");
            self.transport.shutdown_read();
        }
    }

    pub(crate) fn shutdown_write(&self) {
        if self.state.apply(Event::ShutdownWrite).is_none() {
            return;
        }
        let outcome = self.queue.close();
        trace!(
            "shutdown write, {} queued, writer armed: {}",
            outcome.remaining,
            outcome.armed
        );
        if outcome.closed_now && outcome.remaining == 0 && !outcome.armed {
            self.close_write_half();
        }
    }

    pub(crate) fn close(self: &Arc<Self>, reason: Option<SessionError>, grace: Duration) {
        if self.state.apply(Event::Close).is_none() {
            return;
        }
        match &reason {
            Some(reason) => trace!("closing session: {}", reason),
            None => trace!("closing session"),
        }
        let _ = self.close_reason.set(reason);

        let outcome = self.queue.close();
        self.transport.shutdown_read();

        let pending = outcome.remaining > 0 || outcome.armed;
        if pending && !grace.is_zero() && !self.write_shut.load(Ordering::Acquire) {
            trace!("lingering up to {:?} for outbound drain", grace);
            let this = Arc::clone(self);
            self.transport.linger(
                grace,
                self.drained_rx.clone(),
                Box::new(move || this.release_and_finalize()),
            );
        } else {
            self.release_and_finalize();
        }
    }

    fn release_and_finalize(self: &Arc<Self>) {
        self.release();
        self.finalize_armed.store(true, Ordering::SeqCst);
        if self.inflight.load(Ordering::SeqCst) == 0 {
            self.try_finalize();
        }
    }

    /// Hard close of the connection. Idempotent.
    pub(crate) fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            trace!("releasing connection");
            self.transport.close();
        }
    }

    fn try_finalize(self: &Arc<Self>) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.apply(Event::Finalize);
        let on_close = self.on_close.read().clone();
        if let Some(on_close) = on_close {
            let reason = self.close_reason.get().and_then(Option::as_ref);
            on_close(&self.handle(), reason);
        }
    }
}
