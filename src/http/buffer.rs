//! Fixed-capacity connection buffers.
//!
//! `ReadBuffer` accumulates request bytes and carries the three parser
//! cursors. They always satisfy
//! `line_start <= checked_index <= read_index <= capacity`.
//!
//! `WriteBuffer` holds the composed response head (and error bodies). It never
//! grows past the capacity it was created with; composition that would exceed
//! it fails with [`BufferOverflow`].

use bytes::{BufMut, BytesMut};
use std::io::{self, Read};
use std::ops::Range;
use thiserror::Error;

/// Outcome of scanning for the next request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineStatus {
    /// A full line is buffered. The range covers the line content without
    /// its CRLF terminator.
    Complete(Range<usize>),
    /// A stray CR or LF; the request cannot be framed.
    Malformed,
    /// No terminator in the buffered bytes yet.
    Incomplete,
}

/// Errors from draining a socket into the read buffer.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("request exceeds the {0} byte read buffer")]
    BufferFull(usize),
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}

pub struct ReadBuffer {
    buf: Box<[u8]>,
    read_index: usize,
    checked_index: usize,
    line_start: usize,
}

impl ReadBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            read_index: 0,
            checked_index: 0,
            line_start: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// End of the received bytes.
    pub fn read_index(&self) -> usize {
        self.read_index
    }

    /// Parser cursor.
    pub fn checked_index(&self) -> usize {
        self.checked_index
    }

    pub fn line_start(&self) -> usize {
        self.line_start
    }

    pub fn is_full(&self) -> bool {
        self.read_index == self.buf.len()
    }

    /// Bytes received so far.
    pub fn filled(&self) -> &[u8] {
        &self.buf[..self.read_index]
    }

    pub fn slice(&self, range: Range<usize>) -> &[u8] {
        &self.filled()[range]
    }

    /// Resets every cursor for a new request. Old bytes are left in place
    /// but are no longer reachable through `filled`.
    pub fn reset(&mut self) {
        self.read_index = 0;
        self.checked_index = 0;
        self.line_start = 0;
    }

    /// Copies as much of `data` as fits and returns the number of bytes taken.
    pub fn push(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.buf.len() - self.read_index);
        self.buf[self.read_index..self.read_index + n].copy_from_slice(&data[..n]);
        self.read_index += n;
        n
    }

    /// Drains `src` until it would block.
    ///
    /// Returns the number of bytes appended. A zero-length read means the
    /// peer closed its side; a buffer that is already full before reading
    /// means the request is too large. Filling the buffer mid-drain stops the
    /// loop so the parser still gets to look at what arrived.
    pub fn fill_from<R: Read>(&mut self, src: &mut R) -> Result<usize, ReadError> {
        if self.is_full() {
            return Err(ReadError::BufferFull(self.buf.len()));
        }

        let mut total = 0;
        while !self.is_full() {
            match src.read(&mut self.buf[self.read_index..]) {
                Ok(0) => return Err(ReadError::PeerClosed),
                Ok(n) => {
                    self.read_index += n;
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ReadError::Io(e)),
            }
        }
        Ok(total)
    }

    /// Scans from the parser cursor for the next CRLF-terminated line.
    ///
    /// A CR that is the last buffered byte leaves the cursor on the CR so the
    /// next pass re-examines it once more bytes arrive; the outcome is the
    /// same however the stream was chunked. An LF only terminates a line when
    /// the byte before it is a CR.
    pub fn scan_line(&mut self) -> LineStatus {
        while self.checked_index < self.read_index {
            let idx = self.checked_index;
            match self.buf[idx] {
                b'\r' => {
                    if idx + 1 == self.read_index {
                        return LineStatus::Incomplete;
                    }
                    if self.buf[idx + 1] != b'\n' {
                        return LineStatus::Malformed;
                    }
                    self.checked_index = idx + 2;
                    return LineStatus::Complete(self.line_start..idx);
                }
                b'\n' => {
                    if idx > self.line_start && self.buf[idx - 1] == b'\r' {
                        self.checked_index = idx + 1;
                        return LineStatus::Complete(self.line_start..idx - 1);
                    }
                    return LineStatus::Malformed;
                }
                _ => self.checked_index += 1,
            }
        }
        LineStatus::Incomplete
    }

    /// Marks the parser cursor as the start of the next line.
    pub fn start_next_line(&mut self) {
        self.line_start = self.checked_index;
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("response does not fit in the {capacity} byte write buffer")]
pub struct BufferOverflow {
    pub capacity: usize,
}

pub struct WriteBuffer {
    buf: BytesMut,
    capacity: usize,
}

impl WriteBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Bytes composed so far.
    pub fn write_index(&self) -> usize {
        self.buf.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Appends `data` whole, or nothing at all.
    pub fn push(&mut self, data: &[u8]) -> Result<(), BufferOverflow> {
        if self.buf.len() + data.len() > self.capacity {
            return Err(BufferOverflow {
                capacity: self.capacity,
            });
        }
        self.buf.put_slice(data);
        Ok(())
    }

    pub fn push_str(&mut self, s: &str) -> Result<(), BufferOverflow> {
        self.push(s.as_bytes())
    }
}
