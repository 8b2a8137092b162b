//! Outbound segments and the resizable byte buffer they drain from.
//!
//! A task queues [`Out`] segments in FIFO order and the event loop writes
//! them out whenever the descriptor turns writable. Each segment owns (or
//! statically borrows) its backing bytes and releases them when dropped, so
//! the queue never needs to know how a segment's memory came to be.

use std::fmt;

use crate::error::{Error, Result};

/// One queued byte range awaiting transmission.
pub struct Out {
    kind: OutKind,
    ofs: usize,
}

enum OutKind {
    /// Borrowed bytes; dropping releases nothing.
    Static(&'static [u8]),
    /// Owned heap bytes, freed with the segment.
    Heap(Box<[u8]>),
    /// Any owned value exposing bytes, dropped with the segment.
    Owned(Box<dyn AsRef<[u8]>>),
    /// An owned resizable buffer whose backing store goes with the segment.
    Buffer(Buffer),
}

impl Out {
    pub fn from_static(bytes: &'static [u8]) -> Out {
        Out {
            kind: OutKind::Static(bytes),
            ofs: 0,
        }
    }

    pub fn from_str(s: &'static str) -> Out {
        Out::from_static(s.as_bytes())
    }

    pub fn from_vec(bytes: Vec<u8>) -> Out {
        Out {
            kind: OutKind::Heap(bytes.into_boxed_slice()),
            ofs: 0,
        }
    }

    pub fn from_owned<T: AsRef<[u8]> + 'static>(value: T) -> Out {
        Out {
            kind: OutKind::Owned(Box::new(value)),
            ofs: 0,
        }
    }

    pub fn from_buffer(buffer: Buffer) -> Out {
        Out {
            kind: OutKind::Buffer(buffer),
            ofs: 0,
        }
    }

    fn bytes(&self) -> &[u8] {
        match self.kind {
            OutKind::Static(bytes) => bytes,
            OutKind::Heap(ref bytes) => bytes,
            OutKind::Owned(ref value) => (**value).as_ref(),
            OutKind::Buffer(ref buffer) => buffer.as_ref(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }

    /// The unsent tail.
    pub(crate) fn pending(&self) -> &[u8] {
        &self.bytes()[self.ofs..]
    }

    pub(crate) fn advance(&mut self, sent: usize) {
        self.ofs += sent;
        debug_assert!(self.ofs <= self.len());
    }

    pub(crate) fn is_done(&self) -> bool {
        self.ofs == self.len()
    }
}

impl fmt::Debug for Out {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        const MAX_DUMP: usize = 45;
        let bytes = self.bytes();
        write!(f, "{} bytes ", bytes.len())?;
        for &byte in bytes.iter().take(MAX_DUMP) {
            match byte {
                b'\n' => write!(f, "\\n")?,
                b'\r' => write!(f, "\\r")?,
                0x20..=0x7e => write!(f, "{}", byte as char)?,
                _ => write!(f, "\\{:o}", byte)?,
            }
        }
        if bytes.len() > MAX_DUMP {
            write!(f, " ...")?;
        }
        Ok(())
    }
}

/// A growable byte buffer with single-shot exact growth.
///
/// Capacity grows to exactly what is needed; callers that know better can
/// pre-size with [`Buffer::ensure_capacity`].
#[derive(Default, Debug)]
pub struct Buffer {
    bytes: Vec<u8>,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer { bytes: Vec::new() }
    }

    pub fn with_capacity(initial_capacity: usize) -> Buffer {
        Buffer {
            bytes: Vec::with_capacity(initial_capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.bytes.capacity()
    }

    /// The contents as text, empty when they are not valid UTF-8.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes).unwrap_or("")
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Make room for `needed` more bytes, growing to the exact size.
    pub fn ensure_capacity(&mut self, needed: usize) {
        if self.bytes.len() + needed > self.bytes.capacity() {
            self.bytes.reserve_exact(needed);
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<&mut Buffer> {
        if bytes.is_empty() {
            return Err(Error::internal("invalid length"));
        }
        self.ensure_capacity(bytes.len());
        self.bytes.extend_from_slice(bytes);
        Ok(self)
    }

    pub fn write_str(&mut self, s: &str) -> Result<&mut Buffer> {
        self.write_bytes(s.as_bytes())
    }

    /// Append the low `len` bytes of `value`, most significant first.
    pub fn write_be(&mut self, value: u64, len: usize) -> &mut Buffer {
        debug_assert!(len <= 8);
        for i in (0..len).rev() {
            self.bytes.push((value >> (8 * i)) as u8);
        }
        self
    }

    /// Append the low `len` bytes of `value`, least significant first.
    pub fn write_le(&mut self, value: u64, len: usize) -> &mut Buffer {
        debug_assert!(len <= 8);
        for i in 0..len {
            self.bytes.push((value >> (8 * i)) as u8);
        }
        self
    }

    /// Append formatted text bounded by `max_len`. Reaching the bound is an
    /// exact-overflow error and nothing is appended.
    pub fn nprintf(&mut self, max_len: usize, args: fmt::Arguments) -> Result<&mut Buffer> {
        self.ensure_capacity(max_len);
        let start = self.bytes.len();
        if fmt::Write::write_fmt(self, args).is_err() {
            self.bytes.truncate(start);
            return Err(Error::internal("format failed"));
        }
        if self.bytes.len() - start >= max_len {
            self.bytes.truncate(start);
            return Err(Error::internal("buffer overflow"));
        }
        Ok(self)
    }

    /// First occurrence of `needle` at or after `start`.
    pub fn find(&self, needle: &[u8], start: usize) -> Option<usize> {
        if needle.is_empty() || start >= self.bytes.len() {
            return None;
        }
        self.bytes[start..]
            .windows(needle.len())
            .position(|window| window == needle)
            .map(|pos| pos + start)
    }

    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.bytes.starts_with(prefix)
    }

    pub fn ends_with(&self, suffix: &[u8]) -> bool {
        self.bytes.ends_with(suffix)
    }

    /// Force the length; extending zero-fills.
    pub fn set_length(&mut self, explicit_len: usize) {
        if explicit_len > self.bytes.len() {
            self.bytes.resize(explicit_len, 0);
        } else {
            self.bytes.truncate(explicit_len);
        }
    }

    /// Empty the buffer and give back memory beyond `max_capacity`.
    pub fn reset(&mut self, max_capacity: usize) {
        self.bytes.clear();
        if self.bytes.capacity() > max_capacity {
            self.bytes.shrink_to(max_capacity);
        }
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Write for Buffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.bytes.extend_from_slice(s.as_bytes());
        Ok(())
    }
}

/// Walks a [`Buffer`] token by token.
///
/// `next_until` advances past the next occurrence of a terminator and the
/// consumed span (terminator included) is available through [`bytes`].
///
/// [`bytes`]: BufferReader::bytes
pub struct BufferReader<'a> {
    buffer: &'a Buffer,
    start: usize,
    stop: usize,
}

impl<'a> BufferReader<'a> {
    pub fn new(buffer: &'a Buffer) -> BufferReader<'a> {
        BufferReader {
            buffer,
            start: 0,
            stop: 0,
        }
    }

    /// The current token.
    pub fn bytes(&self) -> &'a [u8] {
        &self.buffer.as_ref()[self.start..self.stop]
    }

    /// Begin a fresh token where the last one stopped.
    pub fn next(&mut self) {
        self.start = self.stop;
        debug_assert!(self.start <= self.buffer.len());
    }

    /// Skip anything up to and including ASCII space.
    pub fn skip_whitespace(&mut self) {
        let bytes = self.buffer.as_ref();
        while self.stop < bytes.len() && bytes[self.stop] <= b' ' {
            self.stop += 1;
        }
        self.next();
    }

    /// Advance past the next `terminator`; the consumed length including the
    /// terminator, or zero when it is not present.
    pub fn next_until(&mut self, terminator: &[u8]) -> usize {
        self.next();
        if self.start >= self.buffer.len() {
            return 0;
        }
        match self.buffer.find(terminator, self.start) {
            Some(found) => {
                self.stop = found + terminator.len();
                self.stop - self.start
            }
            None => 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.stop
    }
}

/// Big-endian integer from up to eight bytes.
pub fn extract_be(bytes: &[u8]) -> u64 {
    debug_assert!(bytes.len() <= 8);
    let mut value = 0u64;
    for &byte in bytes {
        value = (value << 8) | u64::from(byte);
    }
    value
}

/// Little-endian integer from up to eight bytes.
pub fn extract_le(bytes: &[u8]) -> u64 {
    debug_assert!(bytes.len() <= 8);
    let mut value = 0u64;
    for (i, &byte) in bytes.iter().enumerate() {
        value |= u64::from(byte) << (8 * i);
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_bookkeeping() {
        let mut seg = Out::from_static(b"hello");
        assert_eq!(5, seg.len());
        assert_eq!(b"hello", seg.pending());
        assert!(!seg.is_done());
        seg.advance(3);
        assert_eq!(b"lo", seg.pending());
        seg.advance(2);
        assert!(seg.is_done());
        assert_eq!(b"", seg.pending());
    }

    #[test]
    fn segment_variants_expose_bytes() {
        assert_eq!(b"abc", Out::from_vec(b"abc".to_vec()).pending());
        assert_eq!(b"abc", Out::from_owned(String::from("abc")).pending());
        let mut buffer = Buffer::new();
        buffer.write_str("abc").unwrap();
        assert_eq!(b"abc", Out::from_buffer(buffer).pending());
        assert!(Out::from_static(b"").is_done());
    }

    #[test]
    fn segment_debug_escapes() {
        let seg = Out::from_static(b"GET /\r\n");
        assert_eq!("7 bytes GET /\\r\\n", format!("{:?}", seg));
    }

    #[test]
    fn buffer_write_and_search() {
        let mut buffer = Buffer::new();
        buffer
            .write_str("GET / HTTP/1.1\r\n")
            .unwrap()
            .write_bytes(b"Host: x\r\n")
            .unwrap();
        assert!(buffer.starts_with(b"GET "));
        assert!(buffer.ends_with(b"\r\n"));
        assert_eq!(Some(4), buffer.find(b"/", 0));
        assert_eq!(Some(14), buffer.find(b"\r\n", 5));
        assert_eq!(None, buffer.find(b"POST", 0));
        assert!(buffer.write_bytes(b"").is_err());
    }

    #[test]
    fn buffer_length_and_reset() {
        let mut buffer = Buffer::with_capacity(64);
        buffer.write_str("abcdef").unwrap();
        buffer.set_length(3);
        assert_eq!(b"abc", buffer.as_ref());
        buffer.set_length(5);
        assert_eq!(b"abc\0\0", buffer.as_ref());
        buffer.reset(4);
        assert!(buffer.is_empty());
        assert!(buffer.capacity() < 64);
    }

    #[test]
    fn nprintf_detects_exact_overflow() {
        let mut buffer = Buffer::new();
        buffer.nprintf(16, format_args!("answer={}", 42)).unwrap();
        assert_eq!("answer=42", buffer.as_str());
        // 7 formatted bytes do not fit a 7-byte bound
        let err = buffer.nprintf(7, format_args!("abcdefg")).unwrap_err();
        assert!(err.to_string().contains("buffer overflow"));
        assert_eq!("answer=42", buffer.as_str());
    }

    #[test]
    fn byte_order_round_trip() {
        let mut buffer = Buffer::new();
        buffer.write_be(0x0102_0304, 4).write_le(0x0a0b, 2);
        assert_eq!(&[1, 2, 3, 4, 0x0b, 0x0a], buffer.as_ref());
        assert_eq!(0x0102_0304, extract_be(&buffer.as_ref()[..4]));
        assert_eq!(0x0a0b, extract_le(&buffer.as_ref()[4..]));
    }

    #[test]
    fn reader_tokenizes() {
        let mut buffer = Buffer::new();
        buffer.write_str("  GET /index HTTP/1.1\r\nrest").unwrap();
        let mut reader = BufferReader::new(&buffer);
        reader.skip_whitespace();
        assert_eq!(4, reader.next_until(b" "));
        assert_eq!(b"GET ", reader.bytes());
        assert_eq!(7, reader.next_until(b" "));
        assert_eq!(b"/index ", reader.bytes());
        assert!(reader.next_until(b"\r\n") > 0);
        assert_eq!(b"HTTP/1.1\r\n", reader.bytes());
        assert_eq!(4, reader.remaining());
        assert_eq!(0, reader.next_until(b"\r\n"));
    }
}
