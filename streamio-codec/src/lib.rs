//! # streamio-codec - Reference Framing for streamio Sessions
//!
//! `streamio-codec` provides ready-made [`Unpacker`](streamio::Unpacker) and
//! [`Encoder`](streamio::Encoder) implementations:
//!
//! - **Length-delimited frames**: a 4-byte big-endian length header followed
//!   by the payload ([`LengthDelimitedUnpacker`], [`LengthDelimitedEncoder`]).
//! - **Delimited lines**: `\n`, `\r\n` or NUL terminated text
//!   ([`LineBasedUnpacker`], [`StringEncoder`]).
//!
//! ## Building a Framed Session
//!
//! ```rust,ignore
//! use streamio::{Outgoing, SessionBuilder};
//! use streamio_codec::{LengthDelimitedEncoder, LengthDelimitedUnpacker};
//!
//! let session = SessionBuilder::new()
//!     .unpacker(LengthDelimitedUnpacker::new(64 * 1024))
//!     .encoder(LengthDelimitedEncoder::new(64 * 1024))
//!     .bind(transport);
//!
//! session.begin_recv(|session, frame| {
//!     let _ = session.send(Outgoing::message(frame.freeze()));
//! })?;
//! ```

#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

mod length_delimited;
mod line_based;

pub use length_delimited::{LengthDelimitedEncoder, LengthDelimitedUnpacker, LENGTH_HEADER_SIZE};
pub use line_based::{LineBasedUnpacker, StringEncoder, TerminatorType};

/// Framing violations reported by the codecs in this crate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// A frame header announced more than the configured maximum.
    #[error("frame of {len} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        /// Announced or submitted frame length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },
    /// No terminator within the configured maximum line length.
    #[error("line exceeds maximum length of {0}")]
    LineTooLong(usize),
    /// A line was not valid UTF-8.
    #[error("line is not valid utf-8")]
    InvalidUtf8,
}
