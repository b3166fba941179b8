use std::io::{self, IoSlice, Write};

use crate::http::buffer::WriteBuffer;
use crate::http::resolver::FileBody;

/// Result of draining the pending response into a socket.
#[derive(Debug)]
pub enum Flush {
    /// Every byte of the response has been written.
    Done,
    /// The socket stopped accepting bytes; progress is kept for the next try.
    WouldBlock,
    Failed(io::Error),
}

/// A response in flight: the composed head (segment 0) and an optional file
/// body (segment 1), with running counters across partial writes.
pub struct ResponseWriter {
    head: WriteBuffer,
    body: Option<FileBody>,
    bytes_to_send: u64,
    bytes_sent: u64,
}

impl ResponseWriter {
    pub fn new(capacity: usize) -> Self {
        Self {
            head: WriteBuffer::new(capacity),
            body: None,
            bytes_to_send: 0,
            bytes_sent: 0,
        }
    }

    pub fn head(&self) -> &WriteBuffer {
        &self.head
    }

    pub fn head_mut(&mut self) -> &mut WriteBuffer {
        &mut self.head
    }

    /// Freezes the composed head and attaches the body; nothing may be
    /// composed afterwards until `reset`.
    pub fn prepare(&mut self, body: Option<FileBody>) {
        let body_len = body.as_ref().map_or(0, FileBody::len);
        self.bytes_to_send = self.head.write_index() as u64 + body_len;
        self.bytes_sent = 0;
        self.body = body;
    }

    pub fn is_pending(&self) -> bool {
        self.bytes_to_send > 0
    }

    pub fn bytes_to_send(&self) -> u64 {
        self.bytes_to_send
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn body(&self) -> Option<&FileBody> {
        self.body.as_ref()
    }

    /// Drops the body, unmapping or closing the file. Returns whether there
    /// was one to release.
    pub fn release_body(&mut self) -> bool {
        self.body.take().is_some()
    }

    pub fn reset(&mut self) {
        self.head.clear();
        self.body = None;
        self.bytes_to_send = 0;
        self.bytes_sent = 0;
    }

    /// Scatter-writes the unsent remainder of both segments until the
    /// response is complete or `dst` would block.
    pub fn write_to<W: Write>(&mut self, dst: &mut W) -> Flush {
        while self.bytes_to_send > 0 {
            let head = self.head.as_bytes();
            let head_sent = (self.bytes_sent as usize).min(head.len());
            let body_offset = self.bytes_sent.saturating_sub(head.len() as u64);

            let body = match self.body.as_mut() {
                Some(body) => match body.remaining_from(body_offset) {
                    Ok(rest) => rest,
                    Err(e) => return Flush::Failed(e),
                },
                None => &[],
            };

            let segments = [IoSlice::new(&head[head_sent..]), IoSlice::new(body)];
            match dst.write_vectored(&segments) {
                Ok(0) => return Flush::Failed(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.bytes_sent += n as u64;
                    self.bytes_to_send -= n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Flush::WouldBlock,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Flush::Failed(e),
            }
        }
        Flush::Done
    }
}
