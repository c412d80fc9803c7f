//! Framing seams of a session.
//!
//! An [`Encoder`] turns typed outbound messages into bytes; an [`Unpacker`]
//! owns the inbound receive buffer and cuts the byte stream into messages.
//!
//! ```text
//!              send(Outgoing)                         on_message(In)
//!                    │                                      ▲
//!   Raw(Bytes) ──────┤                                      │
//!   Message(Out) ─ Encoder::encode ─► write batch     Unpacker::unpack
//!                                                           ▲
//!                                      read ─► receive_buffer() + on_data(n)
//! ```

use bytes::{Bytes, BytesMut};

use crate::error::BoxError;

/// Default receive buffer size of the [`Passthrough`] unpacker.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 4096;

/// Serializes typed outbound messages.
///
/// Raw byte payloads bypass the encoder entirely.
pub trait Encoder: Send + 'static {
    /// The message type accepted by [`StreamSession::send`](crate::StreamSession::send).
    type Item: Send + 'static;

    /// Appends the wire form of `item` to `dst`.
    ///
    /// On error the session truncates `dst` back to its length before the
    /// call, so a failing encoder never corrupts the batch.
    fn encode(&mut self, item: Self::Item, dst: &mut BytesMut) -> Result<(), BoxError>;
}

/// Cuts the inbound byte stream into messages.
///
/// The unpacker owns the receive buffer. The session reads directly into
/// [`receive_buffer`](Unpacker::receive_buffer), reports the byte count via
/// [`on_data`](Unpacker::on_data), then calls [`unpack`](Unpacker::unpack)
/// until it yields `Ok(None)`.
pub trait Unpacker: Send + 'static {
    /// The message type delivered to the message callback.
    type Item: Send + 'static;

    /// Writable region for the next read. Must not be empty.
    fn receive_buffer(&mut self) -> &mut [u8];

    /// `n` bytes were written at the start of the last receive buffer.
    fn on_data(&mut self, n: usize);

    /// Returns the next complete message, `Ok(None)` when more bytes are
    /// needed, or an error which is fatal to the session.
    fn unpack(&mut self) -> Result<Option<Self::Item>, BoxError>;
}

impl<U: Unpacker + ?Sized> Unpacker for Box<U> {
    type Item = U::Item;

    fn receive_buffer(&mut self) -> &mut [u8] {
        (**self).receive_buffer()
    }

    fn on_data(&mut self, n: usize) {
        (**self).on_data(n)
    }

    fn unpack(&mut self) -> Result<Option<Self::Item>, BoxError> {
        (**self).unpack()
    }
}

impl<E: Encoder + ?Sized> Encoder for Box<E> {
    type Item = E::Item;

    fn encode(&mut self, item: Self::Item, dst: &mut BytesMut) -> Result<(), BoxError> {
        (**self).encode(item, dst)
    }
}

/// Unpacker that hands every read to the application unchanged.
pub struct Passthrough {
    buf: BytesMut,
    size: usize,
    filled: usize,
}

impl Passthrough {
    /// Creates a pass-through unpacker reading at most `size` bytes at once.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let mut buf = BytesMut::with_capacity(size);
        buf.resize(size, 0);
        Self {
            buf,
            size,
            filled: 0,
        }
    }
}

impl Default for Passthrough {
    fn default() -> Self {
        Self::new(DEFAULT_RECV_BUFFER_SIZE)
    }
}

impl Unpacker for Passthrough {
    type Item = BytesMut;

    fn receive_buffer(&mut self) -> &mut [u8] {
        if self.buf.len() < self.size {
            self.buf.resize(self.size, 0);
        }
        &mut self.buf[..]
    }

    fn on_data(&mut self, n: usize) {
        self.filled = n;
    }

    fn unpack(&mut self) -> Result<Option<BytesMut>, BoxError> {
        if self.filled == 0 {
            return Ok(None);
        }
        let msg = self.buf.split_to(self.filled);
        self.filled = 0;
        Ok(Some(msg))
    }
}

/// One entry of the outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing<M> {
    /// Bytes written as-is.
    Raw(Bytes),
    /// A typed message run through the session's encoder.
    Message(M),
}

impl<M> Outgoing<M> {
    /// Wraps a typed message.
    pub fn message(msg: M) -> Self {
        Outgoing::Message(msg)
    }

    pub(crate) fn is_empty_raw(&self) -> bool {
        matches!(self, Outgoing::Raw(b) if b.is_empty())
    }
}

impl<M> From<Bytes> for Outgoing<M> {
    fn from(b: Bytes) -> Self {
        Outgoing::Raw(b)
    }
}

impl<M> From<BytesMut> for Outgoing<M> {
    fn from(b: BytesMut) -> Self {
        Outgoing::Raw(b.freeze())
    }
}

impl<M> From<Vec<u8>> for Outgoing<M> {
    fn from(b: Vec<u8>) -> Self {
        Outgoing::Raw(Bytes::from(b))
    }
}

impl<M> From<&'static [u8]> for Outgoing<M> {
    fn from(b: &'static [u8]) -> Self {
        Outgoing::Raw(Bytes::from_static(b))
    }
}

impl<M> From<&'static str> for Outgoing<M> {
    fn from(s: &'static str) -> Self {
        Outgoing::Raw(Bytes::from_static(s.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_returns_exactly_what_was_read() {
        let mut p = Passthrough::new(8);
        let buf = p.receive_buffer();
        assert_eq!(buf.len(), 8);
        buf[..3].copy_from_slice(b"abc");
        p.on_data(3);
        assert_eq!(p.unpack().unwrap().as_deref(), Some(&b"abc"[..]));
        assert!(p.unpack().unwrap().is_none());

        // buffer is restored to full size for the next read
        assert_eq!(p.receive_buffer().len(), 8);
    }

    #[test]
    fn outgoing_conversions() {
        let o: Outgoing<()> = "hi".into();
        assert_eq!(o, Outgoing::Raw(Bytes::from_static(b"hi")));
        let empty: Outgoing<()> = Vec::new().into();
        assert!(empty.is_empty_raw());
        assert!(!Outgoing::message(1u8).is_empty_raw());
    }
}
