//! The helpful bootstrap APIs which turn listening and dialing sockets into
//! backend transports ready to carry a [`StreamSession`](streamio::StreamSession).
//!
//! ```text
//!   Listener::bind_tcp ──► [accept thread] ── Stream ──► Backend::bind ──► on_accept(transport)
//!   Connector::connect_tcp ───────────────── Stream ──► Backend::bind ──► transport
//! ```
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use streamio::SessionBuilder;
//! use streamio_bootstrap::Listener;
//! use streamio_rt::SyncBackend;
//!
//! # fn main() -> std::io::Result<()> {
//! let mut listener = Listener::new(SyncBackend::new());
//! listener.on_accept(|transport| {
//!     let session = SessionBuilder::new().bind(transport);
//!     let _ = session.begin_recv(|session, bytes| {
//!         let _ = session.send(bytes);
//!     });
//! });
//! let addr = listener.bind_tcp("127.0.0.1:0")?;
//! println!("listening on {}", addr);
//! # std::thread::sleep(Duration::from_millis(10));
//! listener.graceful_stop();
//! # Ok(())
//! # }
//! ```

#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

mod connector;
mod listener;

pub use connector::Connector;
pub use listener::{AcceptFn, Listener};
