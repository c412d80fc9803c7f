//! # streamio - Callback-Driven Byte-Stream Sessions
//!
//! `streamio` turns a connected byte stream (TCP or a Unix stream socket)
//! into a managed [`StreamSession`]: typed messages go out through an
//! [`Encoder`], bytes come in through an [`Unpacker`], and a single close
//! callback reports the end of the connection once all I/O has quiesced.
//!
//! ## Architecture
//!
//! ```text
//!   application
//!   ┌──────────────┐ send()            begin_recv(on_message)
//!   │StreamSession │──────┐                     ▲
//!   └──────────────┘      ▼                     │
//!               ┌─────────────────┐   ┌──────────────────┐
//!               │ SendQueue       │   │ Unpacker         │
//!               │ (bounded, FIFO) │   │ (receive buffer) │
//!               └────────┬────────┘   └────────▲─────────┘
//!                 batch + encode         on_data + unpack
//!               ┌────────▼────────────────────┴─────────┐
//!               │ Transport (blocking or tokio backend)  │
//!               └────────────────────────────────────────┘
//! ```
//!
//! The engine is generic over the [`Transport`] contract, so the same session
//! guarantees hold for every backend:
//!
//! - **Ordering**: bytes hit the wire in send order; messages are delivered
//!   one at a time in unpack order.
//! - **Backpressure**: the outbound queue is bounded; a full queue fails fast
//!   ([`StreamSession::send`]) or waits up to a deadline
//!   ([`StreamSession::send_timeout`]).
//! - **Close once**: the close callback fires exactly once, after every
//!   in-flight read and write completed.
//! - **Graceful drain**: [`StreamSession::close`] with a grace period lets
//!   queued data go out before the connection is released.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use streamio::SessionBuilder;
//!
//! let session = SessionBuilder::new()
//!     .recv_timeout(Duration::from_secs(30))
//!     .bind(transport);
//!
//! session.set_close_callback(|_, reason| log::info!("closed: {:?}", reason));
//! session.begin_recv(|session, bytes| {
//!     let _ = session.send(bytes);
//! })?;
//! ```
//!
//! Backends live in `streamio-rt`, reference codecs in `streamio-codec`.

#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

mod codec;
mod error;
pub mod queue;
mod session;
mod state;
mod transport;

pub use codec::{Encoder, Outgoing, Passthrough, Unpacker, DEFAULT_RECV_BUFFER_SIZE};
pub use error::{is_timeout, BoxError, SessionError};
pub use session::{
    CloseCallback, ErrorCallback, MessageCallback, SessionBuilder, StreamSession,
    DEFAULT_MAX_BATCH_BYTES, DEFAULT_MAX_BATCH_ITEMS,
};
pub use state::{Event, SessionState};
pub use transport::{Addr, Job, RecvTarget, Transport, WriteCompletion};
