//! Big-endian frame buffers.
//!
//! `WriteBuffer` builds outgoing messages: `begin` writes the type tag and a
//! length placeholder, `finish` patches the length once the body is complete.
//! `ReadBuffer` is a shrinking cursor over one message body.

#![allow(clippy::cast_possible_truncation)]

use kbwire_core::Error;

/// Growable output buffer for frontend messages.
#[derive(Debug, Clone, Default)]
pub struct WriteBuffer {
    buf: Vec<u8>,
}

impl WriteBuffer {
    /// Create a buffer with the given capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Start a tagged message. Returns the position of its length field.
    pub fn begin(&mut self, tag: u8) -> usize {
        self.buf.push(tag);
        self.begin_untagged()
    }

    /// Start a message without a type tag (startup, SSL and cancel requests).
    pub fn begin_untagged(&mut self) -> usize {
        let pos = self.buf.len();
        self.buf.extend_from_slice(&[0, 0, 0, 0]);
        pos
    }

    /// Patch the length field written by `begin`. The length counts itself.
    pub fn finish(&mut self, pos: usize) {
        let len = (self.buf.len() - pos) as i32;
        self.buf[pos..pos + 4].copy_from_slice(&len.to_be_bytes());
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Write a NUL-terminated string.
    pub fn put_cstr(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    pub fn put_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Take ownership of the bytes, leaving an empty buffer in place.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Read cursor over a single message body.
#[derive(Debug, Clone, Copy)]
pub struct ReadBuffer<'a> {
    data: &'a [u8],
}

impl<'a> ReadBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The unconsumed tail.
    pub fn rest(&self) -> &'a [u8] {
        self.data
    }

    /// Consume `n` bytes.
    pub fn next(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if n > self.data.len() {
            return Err(Error::protocol(format!(
                "message truncated: wanted {} bytes, {} left",
                n,
                self.data.len()
            )));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.next(1)?[0])
    }

    pub fn read_i16(&mut self) -> Result<i16, Error> {
        let b = self.next(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u16(&mut self) -> Result<u16, Error> {
        let b = self.next(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, Error> {
        let b = self.next(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        let b = self.next(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a NUL-terminated string.
    pub fn read_cstr(&mut self) -> Result<String, Error> {
        let end = self
            .data
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::protocol("missing NUL terminator in string"))?;
        let s = String::from_utf8_lossy(&self.data[..end]).into_owned();
        self.data = &self.data[end + 1..];
        Ok(s)
    }
}
