//! # streamio-rt - I/O Backends for streamio Sessions
//!
//! `streamio-rt` implements the [`Transport`] contract of `streamio` twice:
//!
//! - [`SyncBackend`] / [`SyncTransport`]: a reader thread and a writer thread
//!   per session doing blocking I/O with socket timeouts as deadlines.
//! - [`AsyncService`] / [`AsyncTransport`]: many sessions sharing one tokio
//!   poller pool, with optional CPU pinning of the worker threads.
//!
//! Both are created from a connected [`Stream`] through the [`Backend`]
//! trait, so servers and clients can switch strategies with one line.
//!
//! ## Blocking Backend
//!
//! ```rust,no_run
//! use std::net::TcpStream;
//! use streamio::SessionBuilder;
//! use streamio_rt::{Backend, SyncBackend};
//!
//! # fn main() -> std::io::Result<()> {
//! let stream = TcpStream::connect("127.0.0.1:9000")?;
//! let transport = SyncBackend::new().bind(stream.into())?;
//! let session = SessionBuilder::new().bind(transport);
//! session.begin_recv(|session, bytes| {
//!     let _ = session.send(bytes);
//! }).ok();
//! # Ok(())
//! # }
//! ```
//!
//! ## Poller Pool With CPU Pinning
//!
//! ```rust,no_run
//! use core_affinity::CoreId;
//! use streamio_rt::AsyncService;
//!
//! # fn main() -> std::io::Result<()> {
//! let service = AsyncService::builder()
//!     .name("io-pool")
//!     .workers(2)
//!     .core_ids(vec![CoreId { id: 0 }, CoreId { id: 1 }])
//!     .build()?;
//! # drop(service);
//! # Ok(())
//! # }
//! ```

#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

use std::io;

use streamio::Transport;

mod aio;
mod stream;
mod sync;

pub use aio::{AsyncService, AsyncServiceBuilder, AsyncTransport};
pub use stream::Stream;
pub use sync::{SyncBackend, SyncTransport};

/// Turns connected streams into transports of one backend strategy.
pub trait Backend: Send + Sync + 'static {
    /// The transport produced by this backend.
    type Transport: Transport;

    /// Takes ownership of `stream` and prepares it for session I/O.
    fn bind(&self, stream: Stream) -> io::Result<Self::Transport>;
}

impl<B: Backend> Backend for std::sync::Arc<B> {
    type Transport = B::Transport;

    fn bind(&self, stream: Stream) -> io::Result<Self::Transport> {
        (**self).bind(stream)
    }
}
