use std::fs;
use std::io::{self, IoSlice, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::sync::{Arc, Mutex};

use lantern::config::Config;
use lantern::http::buffer::ReadError;
use lantern::http::connection::{Connection, ConnectionContext, Next, WriteStatus};
use lantern::server::reactor::{Interest, Reactor, Token};
use tempfile::TempDir;

const FAKE_FD: RawFd = 1000;
const TOKEN: Token = Token(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Call {
    Register(RawFd, Token, Interest),
    Rearm(RawFd, Token, Interest),
    Deregister(RawFd),
}

#[derive(Default)]
struct RecordingReactor {
    calls: Mutex<Vec<Call>>,
}

impl RecordingReactor {
    fn last(&self) -> Option<Call> {
        self.calls.lock().unwrap().last().copied()
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }
}

impl Reactor for RecordingReactor {
    fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.calls.lock().unwrap().push(Call::Register(fd, token, interest));
        Ok(())
    }

    fn rearm(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.calls.lock().unwrap().push(Call::Rearm(fd, token, interest));
        Ok(())
    }

    fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.calls.lock().unwrap().push(Call::Deregister(fd));
        Ok(())
    }
}

#[derive(Default)]
struct Wire {
    input: Vec<u8>,
    read_pos: usize,
    /// Reads past the input return end-of-stream instead of would-block.
    eof: bool,
    output: Vec<u8>,
    /// Bytes accepted before writes would block; `None` means unlimited.
    write_budget: Option<usize>,
    fail_writes: bool,
}

/// In-memory socket; the test keeps a second handle to the same wire.
#[derive(Clone, Default)]
struct MockStream {
    wire: Arc<Mutex<Wire>>,
}

impl MockStream {
    fn feed(&self, data: &[u8]) {
        self.wire.lock().unwrap().input.extend_from_slice(data);
    }

    fn set_eof(&self) {
        self.wire.lock().unwrap().eof = true;
    }

    fn set_write_budget(&self, budget: Option<usize>) {
        self.wire.lock().unwrap().write_budget = budget;
    }

    fn fail_writes(&self) {
        self.wire.lock().unwrap().fail_writes = true;
    }

    fn output(&self) -> Vec<u8> {
        self.wire.lock().unwrap().output.clone()
    }
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut wire = self.wire.lock().unwrap();
        let available = wire.input.len() - wire.read_pos;
        if available == 0 {
            if wire.eof {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = available.min(buf.len());
        let start = wire.read_pos;
        buf[..n].copy_from_slice(&wire.input[start..start + n]);
        wire.read_pos += n;
        Ok(n)
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_vectored(&[IoSlice::new(buf)])
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut wire = self.wire.lock().unwrap();
        if wire.fail_writes {
            return Err(io::ErrorKind::BrokenPipe.into());
        }

        let mut budget = wire.write_budget.unwrap_or(usize::MAX);
        if budget == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let mut written = 0;
        for buf in bufs {
            let n = buf.len().min(budget);
            wire.output.extend_from_slice(&buf[..n]);
            written += n;
            budget -= n;
            if budget == 0 {
                break;
            }
        }
        if let Some(limit) = wire.write_budget.as_mut() {
            *limit -= written;
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for MockStream {
    fn as_raw_fd(&self) -> RawFd {
        FAKE_FD
    }
}

struct Harness {
    root: TempDir,
    reactor: Arc<RecordingReactor>,
    ctx: Arc<ConnectionContext>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(|_| {})
    }

    fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        let root = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.static_files.root = root.path().to_path_buf();
        adjust(&mut cfg);

        let reactor = Arc::new(RecordingReactor::default());
        let ctx = Arc::new(ConnectionContext::new(&cfg, reactor.clone()));
        Self { root, reactor, ctx }
    }

    fn write_file(&self, name: &str, contents: &[u8]) {
        fs::write(self.root.path().join(name), contents).unwrap();
    }

    fn open(&self) -> (Connection<MockStream>, MockStream) {
        let stream = MockStream::default();
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let conn = Connection::open(stream.clone(), peer, TOKEN, Arc::clone(&self.ctx)).unwrap();
        (conn, stream)
    }
}

/// Reads, processes and writes one request with an unlimited write budget.
fn serve_one(conn: &mut Connection<MockStream>, stream: &MockStream, request: &[u8]) -> WriteStatus {
    stream.feed(request);
    conn.read().unwrap();
    assert_eq!(conn.process(), Next::Rearm(Interest::Writable));
    conn.write()
}

fn split_response(raw: &[u8]) -> (String, Vec<u8>) {
    let end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response has no blank line");
    let head = String::from_utf8(raw[..end + 4].to_vec()).unwrap();
    (head, raw[end + 4..].to_vec())
}

#[test]
fn test_open_registers_readable_and_counts() {
    let h = Harness::new();
    let (conn, _stream) = h.open();

    assert_eq!(
        h.reactor.last(),
        Some(Call::Register(FAKE_FD, TOKEN, Interest::Readable))
    );
    assert_eq!(h.ctx.live.get(), 1);
    assert!(!conn.is_closed());
    assert_eq!(conn.token(), TOKEN);
}

#[test]
fn test_get_existing_file_keep_alive() {
    let h = Harness::new();
    let contents = b"<html><body>hello lantern</body></html>\n";
    h.write_file("index.html", contents);
    let (mut conn, stream) = h.open();

    let status = serve_one(
        &mut conn,
        &stream,
        b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n",
    );

    assert_eq!(status, WriteStatus::Complete);
    let (head, body) = split_response(&stream.output());
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains(&format!("Content-Length: {}\r\n", contents.len())));
    assert!(head.contains("Content-Type: text/html\r\n"));
    assert!(head.contains("Connection: keep-alive\r\n"));
    assert_eq!(body, contents);

    // Ready for the next request on the same socket.
    assert_eq!(
        h.reactor.last(),
        Some(Call::Rearm(FAKE_FD, TOKEN, Interest::Readable))
    );
    assert!(!conn.is_closed());
    assert!(conn.response().body().is_none());
    assert_eq!(conn.read_buffer().read_index(), 0);
    assert_eq!(conn.read_buffer().checked_index(), 0);
}

#[test]
fn test_keep_alive_serves_second_request() {
    let h = Harness::new();
    h.write_file("a.html", b"first");
    h.write_file("b.html", b"second");
    let (mut conn, stream) = h.open();

    let status = serve_one(&mut conn, &stream, b"GET /a.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
    assert_eq!(status, WriteStatus::Complete);
    let first_len = stream.output().len();

    let status = serve_one(&mut conn, &stream, b"GET /b.html HTTP/1.1\r\n\r\n");
    assert_eq!(status, WriteStatus::Close);

    let (head, body) = split_response(&stream.output()[first_len..]);
    assert!(head.contains("Connection: close\r\n"));
    assert_eq!(body, b"second");
}

#[test]
fn test_missing_file_is_not_found() {
    let h = Harness::new();
    let (mut conn, stream) = h.open();

    let status = serve_one(&mut conn, &stream, b"GET /missing HTTP/1.1\r\n\r\n");

    assert_eq!(status, WriteStatus::Close);
    let (head, body) = split_response(&stream.output());
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert_eq!(body, b"The requested file was not found on this server.\n");
}

#[test]
fn test_not_found_keeps_persistent_connection() {
    let h = Harness::new();
    let (mut conn, stream) = h.open();

    let status = serve_one(&mut conn, &stream, b"GET /missing HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");

    assert_eq!(status, WriteStatus::Complete);
    assert!(!conn.is_closed());
}

#[test]
fn test_post_is_bad_request_and_closes() {
    let h = Harness::new();
    let (mut conn, stream) = h.open();

    let status = serve_one(&mut conn, &stream, b"POST /x HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");

    assert_eq!(status, WriteStatus::Close);
    let (head, body) = split_response(&stream.output());
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(head.contains("Connection: close\r\n"));
    assert_eq!(
        body,
        b"Your request has bad syntax or is inherently impossible to satisfy.\n"
    );
}

#[test]
fn test_http_1_0_is_bad_request() {
    let h = Harness::new();
    let (mut conn, stream) = h.open();

    serve_one(&mut conn, &stream, b"GET /x HTTP/1.0\r\n\r\n");

    assert!(stream.output().starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
}

#[test]
fn test_directory_is_bad_request() {
    let h = Harness::new();
    fs::create_dir(h.root.path().join("docs")).unwrap();
    let (mut conn, stream) = h.open();

    serve_one(&mut conn, &stream, b"GET /docs HTTP/1.1\r\n\r\n");

    let (head, body) = split_response(&stream.output());
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(!body.is_empty());
}

#[test]
fn test_unreadable_file_is_forbidden() {
    let h = Harness::new();
    h.write_file("secret.html", b"top secret");
    let path = h.root.path().join("secret.html");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
    let (mut conn, stream) = h.open();

    serve_one(&mut conn, &stream, b"GET /secret.html HTTP/1.1\r\n\r\n");

    let (head, body) = split_response(&stream.output());
    assert!(head.starts_with("HTTP/1.1 403 Forbidden\r\n"));
    assert_eq!(body, b"You do not have permission to get file from this server.\n");
}

#[test]
fn test_parent_segment_is_forbidden() {
    let h = Harness::new();
    let (mut conn, stream) = h.open();

    serve_one(&mut conn, &stream, b"GET /../etc/passwd HTTP/1.1\r\n\r\n");

    assert!(stream.output().starts_with(b"HTTP/1.1 403 Forbidden\r\n"));
}

#[test]
fn test_overlong_path_is_internal_error() {
    let h = Harness::with_config(|cfg| cfg.static_files.max_path_len = 16);
    let (mut conn, stream) = h.open();

    serve_one(&mut conn, &stream, b"GET /index.html HTTP/1.1\r\n\r\n");

    let (head, body) = split_response(&stream.output());
    assert!(head.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    assert_eq!(body, b"There was an unusual problem serving the requested file.\n");
}

#[test]
fn test_empty_file_sends_head_only() {
    let h = Harness::new();
    h.write_file("empty.html", b"");
    let (mut conn, stream) = h.open();

    serve_one(&mut conn, &stream, b"GET /empty.html HTTP/1.1\r\n\r\n");

    let (head, body) = split_response(&stream.output());
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Content-Length: 0\r\n"));
    assert!(body.is_empty());
}

#[test]
fn test_large_file_is_streamed() {
    let h = Harness::with_config(|cfg| {
        cfg.static_files.mmap_threshold = 1024;
        cfg.static_files.stream_chunk_size = 700;
    });
    let contents: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    h.write_file("big.bin", &contents);
    let (mut conn, stream) = h.open();

    stream.feed(b"GET /big.bin HTTP/1.1\r\n\r\n");
    conn.read().unwrap();
    assert_eq!(conn.process(), Next::Rearm(Interest::Writable));
    let body = conn.response().body().unwrap();
    assert!(!body.is_mapped());
    assert_eq!(body.len(), 5000);

    assert_eq!(conn.write(), WriteStatus::Close);
    let (_, sent) = split_response(&stream.output());
    assert_eq!(sent, contents);
}

#[test]
fn test_partial_request_needs_more_data() {
    let h = Harness::new();
    h.write_file("index.html", b"ok");
    let (mut conn, stream) = h.open();

    stream.feed(b"GET /index.html HT");
    conn.read().unwrap();
    assert_eq!(conn.process(), Next::Rearm(Interest::Readable));
    assert!(stream.output().is_empty());

    stream.feed(b"TP/1.1\r\n\r");
    conn.read().unwrap();
    assert_eq!(conn.process(), Next::Rearm(Interest::Readable));

    stream.feed(b"\n");
    conn.read().unwrap();
    assert_eq!(conn.process(), Next::Rearm(Interest::Writable));
}

#[test]
fn test_write_resumes_after_would_block() {
    let h = Harness::new();
    let contents: Vec<u8> = (0..3000u32).map(|i| (i % 97) as u8).collect();
    h.write_file("page.html", &contents);
    let (mut conn, stream) = h.open();

    stream.feed(b"GET /page.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
    conn.read().unwrap();
    assert_eq!(conn.process(), Next::Rearm(Interest::Writable));

    let head_len = conn.response().head().write_index();
    let total = conn.response().bytes_to_send();
    assert_eq!(total, (head_len + contents.len()) as u64);
    assert!(conn.response().body().unwrap().is_mapped());

    // Stop inside the head.
    stream.set_write_budget(Some(head_len / 2));
    assert_eq!(conn.write(), WriteStatus::Pending);
    assert_eq!(
        h.reactor.last(),
        Some(Call::Rearm(FAKE_FD, TOKEN, Interest::Writable))
    );
    assert_eq!(conn.response().bytes_sent(), (head_len / 2) as u64);

    // Finish the head and stop inside the file.
    stream.set_write_budget(Some(head_len + 1000));
    assert_eq!(conn.write(), WriteStatus::Pending);
    assert_eq!(
        conn.response().bytes_sent(),
        (head_len / 2 + head_len + 1000) as u64
    );

    // Nothing accepted at all.
    stream.set_write_budget(Some(0));
    assert_eq!(conn.write(), WriteStatus::Pending);

    stream.set_write_budget(None);
    assert_eq!(conn.write(), WriteStatus::Complete);

    let output = stream.output();
    assert_eq!(output.len() as u64, total);
    let (head, body) = split_response(&output);
    assert_eq!(head.len(), head_len);
    assert_eq!(body, contents);
}

#[test]
fn test_write_failure_releases_mapping() {
    let h = Harness::new();
    h.write_file("index.html", b"some content");
    let (mut conn, stream) = h.open();

    stream.feed(b"GET /index.html HTTP/1.1\r\n\r\n");
    conn.read().unwrap();
    conn.process();
    assert!(conn.response().body().is_some());

    stream.fail_writes();
    assert_eq!(conn.write(), WriteStatus::Close);
    assert!(conn.response().body().is_none());
}

#[test]
fn test_close_releases_mapping_once() {
    let h = Harness::new();
    h.write_file("index.html", b"some content");
    let (mut conn, stream) = h.open();

    stream.feed(b"GET /index.html HTTP/1.1\r\n\r\n");
    conn.read().unwrap();
    conn.process();
    assert!(conn.response().body().unwrap().is_mapped());

    conn.close();
    assert!(conn.is_closed());
    assert!(conn.response().body().is_none());
    assert_eq!(h.ctx.live.get(), 0);

    conn.close();
    drop(conn);
    assert_eq!(h.ctx.live.get(), 0);
    assert_eq!(h.reactor.count(|c| matches!(c, Call::Deregister(_))), 1);
}

#[test]
fn test_drop_closes_connection() {
    let h = Harness::new();
    let (conn, _stream) = h.open();
    assert_eq!(h.ctx.live.get(), 1);

    drop(conn);
    assert_eq!(h.ctx.live.get(), 0);
    assert_eq!(h.reactor.last(), Some(Call::Deregister(FAKE_FD)));
}

#[test]
fn test_peer_close_is_read_failure() {
    let h = Harness::new();
    let (mut conn, stream) = h.open();

    stream.set_eof();
    assert!(matches!(conn.read(), Err(ReadError::PeerClosed)));
}

#[test]
fn test_full_buffer_is_read_failure() {
    let h = Harness::with_config(|cfg| cfg.server.read_buffer_size = 16);
    let (mut conn, stream) = h.open();

    stream.feed(b"GET /a-very-long-target HTTP/1.1\r\n\r\n");
    assert_eq!(conn.read().unwrap(), 16);
    assert_eq!(conn.process(), Next::Rearm(Interest::Readable));
    assert!(matches!(conn.read(), Err(ReadError::BufferFull(16))));
}

#[test]
fn test_response_that_cannot_fit_closes() {
    let h = Harness::with_config(|cfg| cfg.server.write_buffer_size = 64);
    let (mut conn, stream) = h.open();

    stream.feed(b"GET /missing HTTP/1.1\r\n\r\n");
    conn.read().unwrap();
    assert_eq!(conn.process(), Next::Close);
    assert!(!conn.response().is_pending());
}

#[test]
fn test_write_with_nothing_pending_rearms_readable() {
    let h = Harness::new();
    let (mut conn, _stream) = h.open();

    assert_eq!(conn.write(), WriteStatus::Complete);
    assert_eq!(
        h.reactor.last(),
        Some(Call::Rearm(FAKE_FD, TOKEN, Interest::Readable))
    );
}
