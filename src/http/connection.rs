use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::Config;
use crate::http::buffer::{ReadBuffer, ReadError};
use crate::http::parser::{ParseOutcome, RequestParser};
use crate::http::request::Request;
use crate::http::resolver::{Resolution, StaticFiles};
use crate::http::response::{self, StatusCode};
use crate::http::writer::{Flush, ResponseWriter};
use crate::server::reactor::{Interest, Reactor, Token};

/// Process-wide count of open connections.
#[derive(Debug, Default)]
pub struct LiveConnections(AtomicUsize);

impl LiveConnections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    fn increment(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Everything connections share: the reactor they re-arm through, the live
/// counter, and read-only serving configuration.
pub struct ConnectionContext {
    pub reactor: Arc<dyn Reactor>,
    pub live: LiveConnections,
    pub files: StaticFiles,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
}

impl ConnectionContext {
    pub fn new(config: &Config, reactor: Arc<dyn Reactor>) -> Self {
        Self {
            reactor,
            live: LiveConnections::new(),
            files: StaticFiles::new(&config.static_files),
            read_buffer_size: config.server.read_buffer_size,
            write_buffer_size: config.server.write_buffer_size,
        }
    }
}

/// What the event loop should do after a processing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Rearm(Interest),
    Close,
}

/// Outcome of a write-readiness callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Response finished (or nothing was pending); armed for the next request.
    Complete,
    /// Socket buffer full; armed for write readiness.
    Pending,
    /// Close the connection: write error, or a non-persistent response ended.
    Close,
}

/// One accepted socket and the state of the request it is serving.
pub struct Connection<S: Read + Write + AsRawFd> {
    stream: Option<S>,
    fd: RawFd,
    token: Token,
    peer: SocketAddr,
    ctx: Arc<ConnectionContext>,
    read_buf: ReadBuffer,
    parser: RequestParser,
    response: ResponseWriter,
    keep_alive: bool,
    status: Option<StatusCode>,
}

impl<S: Read + Write + AsRawFd> Connection<S> {
    /// Registers `stream` for one-shot read readiness and counts it as live.
    pub fn open(
        stream: S,
        peer: SocketAddr,
        token: Token,
        ctx: Arc<ConnectionContext>,
    ) -> io::Result<Self> {
        let fd = stream.as_raw_fd();
        ctx.reactor.register(fd, token, Interest::Readable)?;
        ctx.live.increment();
        tracing::debug!(peer = %peer, token = token.0, live = ctx.live.get(), "connection opened");

        Ok(Self {
            stream: Some(stream),
            fd,
            token,
            peer,
            read_buf: ReadBuffer::new(ctx.read_buffer_size),
            parser: RequestParser::new(),
            response: ResponseWriter::new(ctx.write_buffer_size),
            keep_alive: false,
            status: None,
            ctx,
        })
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    pub fn read_buffer(&self) -> &ReadBuffer {
        &self.read_buf
    }

    pub fn request(&self) -> &Request {
        self.parser.request()
    }

    pub fn response(&self) -> &ResponseWriter {
        &self.response
    }

    /// Whether the response being written keeps the connection open.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn stream(&self) -> Option<&S> {
        self.stream.as_ref()
    }

    /// Drains the socket into the read buffer. Parsing happens later, on a
    /// worker, in `process`.
    pub fn read(&mut self) -> Result<usize, ReadError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(ReadError::Io(io::ErrorKind::NotConnected.into()));
        };
        self.read_buf.fill_from(stream)
    }

    /// Parses what has been read and, once a request is complete, resolves
    /// it and composes the response.
    pub fn process(&mut self) -> Next {
        let resolution = match self.parser.parse(&mut self.read_buf) {
            ParseOutcome::NeedMoreData => return Next::Rearm(Interest::Readable),
            ParseOutcome::BadRequest => {
                // Headers may be half-parsed; the connection is not reused.
                self.keep_alive = false;
                Resolution::BadRequest
            }
            ParseOutcome::RequestComplete => {
                self.keep_alive = self.parser.request().keep_alive;
                let target = self.parser.request().target(self.read_buf.filled());
                self.ctx.files.resolve(target)
            }
        };

        if self.compose(resolution) {
            Next::Rearm(Interest::Writable)
        } else {
            Next::Close
        }
    }

    /// Fills the response writer. A head that does not fit turns into a 500;
    /// returns false only if even that does not fit.
    fn compose(&mut self, resolution: Resolution) -> bool {
        self.response.reset();
        let status = resolution.status();
        let head = self.response.head_mut();

        let composed = match resolution {
            Resolution::File(body) => {
                match response::write_head(head, status, body.len(), self.keep_alive) {
                    Ok(()) => {
                        self.response.prepare(Some(body));
                        self.status = Some(status);
                        return true;
                    }
                    Err(e) => Err(e),
                }
            }
            _ => response::write_error(head, status, self.keep_alive),
        };

        if let Err(e) = composed {
            tracing::warn!(peer = %self.peer, status = status.as_u16(), error = %e, "response head overflow");
            let head = self.response.head_mut();
            head.clear();
            if let Err(e) = response::write_error(head, StatusCode::InternalServerError, self.keep_alive) {
                tracing::error!(peer = %self.peer, error = %e, "cannot compose error response");
                self.response.reset();
                return false;
            }
            self.status = Some(StatusCode::InternalServerError);
        } else {
            self.status = Some(status);
        }

        self.response.prepare(None);
        true
    }

    /// Continues sending the prepared response.
    pub fn write(&mut self) -> WriteStatus {
        let Some(stream) = self.stream.as_mut() else {
            return WriteStatus::Close;
        };

        if !self.response.is_pending() {
            if !self.arm(Interest::Readable) {
                return WriteStatus::Close;
            }
            self.reset();
            return WriteStatus::Complete;
        }

        match self.response.write_to(stream) {
            Flush::WouldBlock => {
                if self.arm(Interest::Writable) {
                    WriteStatus::Pending
                } else {
                    self.response.release_body();
                    WriteStatus::Close
                }
            }
            Flush::Failed(e) => {
                tracing::debug!(peer = %self.peer, error = %e, "write failed");
                self.response.release_body();
                WriteStatus::Close
            }
            Flush::Done => {
                self.response.release_body();
                let target = self.parser.request().target(self.read_buf.filled());
                tracing::info!(
                    peer = %self.peer,
                    status = self.status.map(|s| s.as_u16()),
                    target = %String::from_utf8_lossy(target),
                    bytes = self.response.bytes_sent(),
                    keep_alive = self.keep_alive,
                    "response sent"
                );

                if !self.keep_alive {
                    return WriteStatus::Close;
                }
                if !self.arm(Interest::Readable) {
                    return WriteStatus::Close;
                }
                self.reset();
                WriteStatus::Complete
            }
        }
    }

    /// Deregisters and releases the socket and any file body. Only the first
    /// call has an effect.
    pub fn close(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };

        if let Err(e) = self.ctx.reactor.deregister(self.fd) {
            tracing::warn!(peer = %self.peer, error = %e, "deregister failed");
        }
        drop(stream);
        self.response.reset();
        self.ctx.live.decrement();
        tracing::debug!(peer = %self.peer, token = self.token.0, live = self.ctx.live.get(), "connection closed");
    }

    /// Clears per-request state so the next request starts from scratch.
    fn reset(&mut self) {
        self.read_buf.reset();
        self.parser.reset();
        self.response.reset();
        self.keep_alive = false;
        self.status = None;
    }

    /// Re-enables one-shot readiness. The event loop calls this once a
    /// connection returned by a worker is back in its slot.
    pub fn rearm(&self, interest: Interest) -> io::Result<()> {
        self.ctx.reactor.rearm(self.fd, self.token, interest)
    }

    fn arm(&self, interest: Interest) -> bool {
        match self.rearm(interest) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(peer = %self.peer, error = %e, ?interest, "rearm failed");
                false
            }
        }
    }
}

impl<S: Read + Write + AsRawFd> Drop for Connection<S> {
    fn drop(&mut self) {
        self.close();
    }
}
