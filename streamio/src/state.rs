//! Session lifecycle state machine.
//!
//! ```text
//!            ShutdownRead                ShutdownWrite
//!   Open ───────────────► ReadHalfClosed ─────────────┐
//!    │                                                 ▼
//!    │ ShutdownWrite                           BothHalvesClosed
//!    └──────────────────► WriteHalfClosed ────────────┘
//!                                       ShutdownRead
//!
//!   any of the above ── Close ──► Closing ── Finalize ──► Closed
//! ```
//!
//! Transitions are applied with compare-and-swap; an event that is not legal
//! in the current state is rejected and leaves the state untouched.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    /// Both directions active.
    Open = 0,
    /// Reads stopped, by request or because the peer finished sending.
    ReadHalfClosed = 1,
    /// Writes stopped after the outbound queue drained.
    WriteHalfClosed = 2,
    /// Both halves shut, connection still held.
    BothHalvesClosed = 3,
    /// Close requested; waiting for in-flight I/O.
    Closing = 4,
    /// Close callback fired.
    Closed = 5,
}

/// Events driving [`SessionState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The read half stopped.
    ShutdownRead,
    /// The write half was asked to stop.
    ShutdownWrite,
    /// Full close requested.
    Close,
    /// In-flight I/O reached zero after `Close`.
    Finalize,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Open,
            1 => SessionState::ReadHalfClosed,
            2 => SessionState::WriteHalfClosed,
            3 => SessionState::BothHalvesClosed,
            4 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }

    /// The state reached by applying `event`, or `None` if illegal.
    pub fn next(self, event: Event) -> Option<SessionState> {
        use Event::*;
        use SessionState::*;
        match (self, event) {
            (Open, ShutdownRead) => Some(ReadHalfClosed),
            (Open, ShutdownWrite) => Some(WriteHalfClosed),
            (WriteHalfClosed, ShutdownRead) => Some(BothHalvesClosed),
            (ReadHalfClosed, ShutdownWrite) => Some(BothHalvesClosed),
            (Open | ReadHalfClosed | WriteHalfClosed | BothHalvesClosed, Close) => Some(Closing),
            (Closing, Finalize) => Some(Closed),
            _ => None,
        }
    }

    /// Reads must not be issued in this state.
    pub fn is_read_closed(self) -> bool {
        !matches!(self, SessionState::Open | SessionState::WriteHalfClosed)
    }

    /// `Close` has been accepted.
    pub fn is_closing(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

/// Atomic holder of a [`SessionState`].
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        StateCell(AtomicU8::new(SessionState::Open as u8))
    }

    pub(crate) fn load(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Applies `event`, returning the `(from, to)` pair on success.
    pub(crate) fn apply(&self, event: Event) -> Option<(SessionState, SessionState)> {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            let from = SessionState::from_u8(cur);
            let to = from.next(event)?;
            match self
                .0
                .compare_exchange_weak(cur, to as u8, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some((from, to)),
                Err(actual) => cur = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
    };

    #[test]
    fn half_closes_compose() {
        let cell = StateCell::new();
        assert_eq!(
            cell.apply(Event::ShutdownWrite),
            Some((SessionState::Open, SessionState::WriteHalfClosed))
        );
        assert!(!cell.load().is_read_closed());
        assert_eq!(cell.apply(Event::ShutdownWrite), None);
        assert_eq!(
            cell.apply(Event::ShutdownRead),
            Some((SessionState::WriteHalfClosed, SessionState::BothHalvesClosed))
        );
        assert!(cell.load().is_read_closed());
        assert!(!cell.load().is_closing());
    }

    #[test]
    fn close_only_once_and_finalize_only_after_close() {
        let cell = StateCell::new();
        assert_eq!(cell.apply(Event::Finalize), None);
        assert!(cell.apply(Event::Close).is_some());
        assert_eq!(cell.apply(Event::Close), None);
        assert_eq!(cell.apply(Event::ShutdownRead), None);
        assert_eq!(
            cell.apply(Event::Finalize),
            Some((SessionState::Closing, SessionState::Closed))
        );
        assert_eq!(cell.apply(Event::Finalize), None);
        assert_eq!(cell.load(), SessionState::Closed);
    }

    #[test]
    fn concurrent_close_has_one_winner() {
        let cell = Arc::new(StateCell::new());
        let wins = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = Arc::clone(&cell);
                let wins = Arc::clone(&wins);
                thread::spawn(move || {
                    if cell.apply(Event::Close).is_some() {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
    }
}
