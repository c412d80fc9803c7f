use bytes::BytesMut;

use streamio::{BoxError, Encoder, Unpacker};

use crate::CodecError;

const READ_CHUNK: usize = 4096;

/// Line terminators recognised by [`LineBasedUnpacker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminatorType {
    /// `\n` or `\r\n`.
    Newline,
    /// A NUL byte.
    Nul,
    /// Either of the above.
    Both,
}

impl TerminatorType {
    fn matches(self, b: u8) -> bool {
        match self {
            TerminatorType::Newline => b == b'\n',
            TerminatorType::Nul => b == 0,
            TerminatorType::Both => b == b'\n' || b == 0,
        }
    }
}

/// Splits the inbound stream into UTF-8 lines.
pub struct LineBasedUnpacker {
    buf: Vec<u8>,
    filled: usize,
    scanned: usize,
    max_length: usize,
    strip_delimiter: bool,
    terminator: TerminatorType,
}

impl LineBasedUnpacker {
    /// `max_length` bounds a line without its terminator. With
    /// `strip_delimiter` the terminator (and a `\r` before `\n`) is removed.
    pub fn new(max_length: usize, strip_delimiter: bool, terminator: TerminatorType) -> Self {
        Self {
            buf: Vec::new(),
            filled: 0,
            scanned: 0,
            max_length,
            strip_delimiter,
            terminator,
        }
    }
}

impl Unpacker for LineBasedUnpacker {
    type Item = String;

    fn receive_buffer(&mut self) -> &mut [u8] {
        let want = self.filled + READ_CHUNK;
        if self.buf.len() < want {
            self.buf.resize(want, 0);
        }
        &mut self.buf[self.filled..]
    }

    fn on_data(&mut self, n: usize) {
        self.filled += n;
    }

    fn unpack(&mut self) -> Result<Option<String>, BoxError> {
        let found = self.buf[self.scanned..self.filled]
            .iter()
            .position(|&b| self.terminator.matches(b))
            .map(|i| self.scanned + i);
        let Some(at) = found else {
            self.scanned = self.filled;
            if self.filled > self.max_length {
                return Err(CodecError::LineTooLong(self.max_length).into());
            }
            return Ok(None);
        };

        let mut line_end = at;
        if self.buf[at] == b'\n' && at > 0 && self.buf[at - 1] == b'\r' {
            line_end -= 1;
        }
        if line_end > self.max_length {
            return Err(CodecError::LineTooLong(self.max_length).into());
        }
        let keep = if self.strip_delimiter { line_end } else { at + 1 };
        let line = String::from_utf8(self.buf[..keep].to_vec()).map_err(|_| CodecError::InvalidUtf8)?;

        self.buf.copy_within(at + 1..self.filled, 0);
        self.filled -= at + 1;
        self.scanned = 0;
        Ok(Some(line))
    }
}

/// Writes strings as UTF-8, optionally appending a line terminator.
#[derive(Debug, Clone, Default)]
pub struct StringEncoder {
    terminator: Option<&'static str>,
}

impl StringEncoder {
    /// Writes strings unchanged.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `\r\n` after every string.
    pub fn with_crlf() -> Self {
        Self {
            terminator: Some("\r\n"),
        }
    }

    /// Appends `\n` after every string.
    pub fn with_newline() -> Self {
        Self {
            terminator: Some("\n"),
        }
    }
}

impl Encoder for StringEncoder {
    type Item = String;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), BoxError> {
        dst.extend_from_slice(item.as_bytes());
        if let Some(terminator) = self.terminator {
            dst.extend_from_slice(terminator.as_bytes());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(u: &mut LineBasedUnpacker, data: &[u8]) {
        u.receive_buffer()[..data.len()].copy_from_slice(data);
        u.on_data(data.len());
    }

    #[test]
    fn strips_crlf_and_nul() {
        let mut u = LineBasedUnpacker::new(64, true, TerminatorType::Both);
        push(&mut u, b"first\r\nsecond\0thi");
        assert_eq!(u.unpack().unwrap().as_deref(), Some("first"));
        assert_eq!(u.unpack().unwrap().as_deref(), Some("second"));
        assert_eq!(u.unpack().unwrap(), None);
        push(&mut u, b"rd\n");
        assert_eq!(u.unpack().unwrap().as_deref(), Some("third"));
        assert_eq!(u.unpack().unwrap(), None);
    }

    #[test]
    fn keeps_delimiter_when_asked() {
        let mut u = LineBasedUnpacker::new(64, false, TerminatorType::Newline);
        push(&mut u, b"a\0b\n");
        assert_eq!(u.unpack().unwrap().as_deref(), Some("a\0b\n"));
    }

    #[test]
    fn overlong_line_is_an_error() {
        let mut u = LineBasedUnpacker::new(4, true, TerminatorType::Newline);
        push(&mut u, b"toolong");
        assert!(u.unpack().is_err());

        let mut u = LineBasedUnpacker::new(4, true, TerminatorType::Newline);
        push(&mut u, b"abcd\r\n");
        assert_eq!(u.unpack().unwrap().as_deref(), Some("abcd"));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut u = LineBasedUnpacker::new(16, true, TerminatorType::Newline);
        push(&mut u, &[0xff, 0xfe, b'\n']);
        let err = u.unpack().unwrap_err();
        assert_eq!(err.to_string(), "line is not valid utf-8");
    }

    #[test]
    fn string_encoder_terminators() {
        let mut dst = BytesMut::new();
        StringEncoder::with_newline().encode("hi".into(), &mut dst).unwrap();
        StringEncoder::with_crlf().encode("yo".into(), &mut dst).unwrap();
        StringEncoder::new().encode("!".into(), &mut dst).unwrap();
        assert_eq!(&dst[..], b"hi\nyo\r\n!");
    }
}
