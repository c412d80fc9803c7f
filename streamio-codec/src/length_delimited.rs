use bytes::{BufMut, Bytes, BytesMut};
use log::trace;

use streamio::{BoxError, Encoder, Unpacker};

use crate::CodecError;

/// Size of the big-endian length prefix.
pub const LENGTH_HEADER_SIZE: usize = 4;

const MIN_BUFFER_SIZE: usize = 64;

/// Unpacks `u32` length-prefixed frames.
///
/// The receive buffer holds at least two maximal frames. Unparsed bytes are
/// shifted to the front once the free tail drops below a quarter of a
/// maximal frame, and the buffer rewinds whenever it is fully consumed, so a
/// partially received frame always has room to complete.
pub struct LengthDelimitedUnpacker {
    buf: Vec<u8>,
    start: usize,
    end: usize,
    max_frame: usize,
}

impl LengthDelimitedUnpacker {
    /// Creates an unpacker accepting payloads of up to `max_frame` bytes.
    pub fn new(max_frame: usize) -> Self {
        let total = max_frame + LENGTH_HEADER_SIZE;
        let size = (2 * total).max(MIN_BUFFER_SIZE);
        Self {
            buf: vec![0; size],
            start: 0,
            end: 0,
            max_frame,
        }
    }

    fn max_total(&self) -> usize {
        self.max_frame + LENGTH_HEADER_SIZE
    }

    fn compact(&mut self) {
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        } else if self.buf.len() - self.end < self.max_total() / 4 {
            trace!("compacting {} unparsed bytes", self.end - self.start);
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
    }
}

impl Unpacker for LengthDelimitedUnpacker {
    type Item = BytesMut;

    fn receive_buffer(&mut self) -> &mut [u8] {
        &mut self.buf[self.end..]
    }

    fn on_data(&mut self, n: usize) {
        self.end += n;
    }

    fn unpack(&mut self) -> Result<Option<BytesMut>, BoxError> {
        let avail = self.end - self.start;
        if avail >= LENGTH_HEADER_SIZE {
            let mut header = [0u8; LENGTH_HEADER_SIZE];
            header.copy_from_slice(&self.buf[self.start..self.start + LENGTH_HEADER_SIZE]);
            let len = u32::from_be_bytes(header) as usize;
            if len > self.max_frame {
                return Err(CodecError::FrameTooLarge {
                    len,
                    max: self.max_frame,
                }
                .into());
            }
            if avail >= LENGTH_HEADER_SIZE + len {
                let body = self.start + LENGTH_HEADER_SIZE;
                let frame = BytesMut::from(&self.buf[body..body + len]);
                self.start = body + len;
                if self.start == self.end {
                    self.start = 0;
                    self.end = 0;
                }
                return Ok(Some(frame));
            }
        }
        self.compact();
        Ok(None)
    }
}

/// Prefixes each payload with its `u32` big-endian length.
#[derive(Debug, Clone, Copy)]
pub struct LengthDelimitedEncoder {
    max_frame: usize,
}

impl LengthDelimitedEncoder {
    /// Creates an encoder rejecting payloads above `max_frame` bytes.
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Encoder for LengthDelimitedEncoder {
    type Item = Bytes;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), BoxError> {
        if item.len() > self.max_frame || item.len() > u32::MAX as usize {
            return Err(CodecError::FrameTooLarge {
                len: item.len(),
                max: self.max_frame,
            }
            .into());
        }
        dst.reserve(LENGTH_HEADER_SIZE + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(u: &mut LengthDelimitedUnpacker, data: &[u8]) {
        let buf = u.receive_buffer();
        assert!(buf.len() >= data.len(), "receive buffer too small");
        buf[..data.len()].copy_from_slice(data);
        u.on_data(data.len());
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut enc = LengthDelimitedEncoder::new(1024);
        let mut dst = BytesMut::new();
        enc.encode(Bytes::copy_from_slice(payload), &mut dst).unwrap();
        dst.to_vec()
    }

    #[test]
    fn splits_back_to_back_frames() {
        let mut u = LengthDelimitedUnpacker::new(16);
        let mut wire = frame(b"hello");
        wire.extend(frame(b"world!"));
        push(&mut u, &wire);
        assert_eq!(u.unpack().unwrap().as_deref(), Some(&b"hello"[..]));
        assert_eq!(u.unpack().unwrap().as_deref(), Some(&b"world!"[..]));
        assert!(u.unpack().unwrap().is_none());
        assert_eq!(u.receive_buffer().len(), 64);
    }

    #[test]
    fn waits_for_header_and_body() {
        let mut u = LengthDelimitedUnpacker::new(16);
        let wire = frame(b"abcdef");
        push(&mut u, &wire[..2]);
        assert!(u.unpack().unwrap().is_none());
        push(&mut u, &wire[2..7]);
        assert!(u.unpack().unwrap().is_none());
        push(&mut u, &wire[7..]);
        assert_eq!(u.unpack().unwrap().as_deref(), Some(&b"abcdef"[..]));
    }

    #[test]
    fn empty_frames_are_delivered() {
        let mut u = LengthDelimitedUnpacker::new(16);
        push(&mut u, &frame(b""));
        assert_eq!(u.unpack().unwrap().map(|f| f.len()), Some(0));
    }

    #[test]
    fn oversized_header_is_rejected() {
        let mut u = LengthDelimitedUnpacker::new(8);
        push(&mut u, &[0, 0, 0, 9, 1]);
        let err = u.unpack().unwrap_err();
        assert!(err.to_string().contains("exceeds maximum of 8"));
    }

    #[test]
    fn tail_is_compacted_to_make_room() {
        // max_frame 28 -> total 32, buffer 64, compaction below 8 free bytes
        let mut u = LengthDelimitedUnpacker::new(28);
        let first = frame(&[1u8; 28]);
        let second = frame(&[2u8; 28]);
        let mut wire = first.clone();
        wire.extend_from_slice(&second[..26]);
        push(&mut u, &wire);
        assert_eq!(u.unpack().unwrap().map(|f| f.len()), Some(28));
        assert!(u.unpack().unwrap().is_none());
        // 26 unparsed bytes moved to the front
        assert_eq!(u.receive_buffer().len(), 64 - 26);
        push(&mut u, &second[26..]);
        assert_eq!(u.unpack().unwrap().as_deref(), Some(&[2u8; 28][..]));
    }

    #[test]
    fn encoder_rejects_oversized_payloads() {
        let mut enc = LengthDelimitedEncoder::new(3);
        let mut dst = BytesMut::new();
        assert!(enc.encode(Bytes::from_static(b"four"), &mut dst).is_err());
        enc.encode(Bytes::from_static(b"abc"), &mut dst).unwrap();
        assert_eq!(&dst[..], &[0, 0, 0, 3, b'a', b'b', b'c']);
    }
}
