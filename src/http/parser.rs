use crate::http::buffer::{LineStatus, ReadBuffer};
use crate::http::request::{Method, ParseState, Request};

/// Result of one parsing pass over the buffered bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// The request line or headers are invalid. Terminal for this request.
    BadRequest,
    /// Ran out of buffered bytes; re-arm for reading and try again later.
    NeedMoreData,
    /// Request line, headers and body are all buffered.
    RequestComplete,
}

enum Step {
    Continue,
    HeadersDone,
    Bad,
}

const CONNECTION: &[u8] = b"Connection:";
const CONTENT_LENGTH: &[u8] = b"Content-Length:";
const HOST: &[u8] = b"Host:";
const ABSOLUTE_PREFIX: &[u8] = b"http://";

/// Incremental request parser.
///
/// State survives between calls, so a request may be fed through any number
/// of partial reads; each call resumes at the buffer's parser cursor.
#[derive(Debug, Default)]
pub struct RequestParser {
    state: ParseState,
    request: Request,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn reset(&mut self) {
        self.state = ParseState::RequestLine;
        self.request = Request::default();
    }

    pub fn parse(&mut self, buf: &mut ReadBuffer) -> ParseOutcome {
        loop {
            let line = match self.state {
                ParseState::Body { start } => return self.body_status(buf, start),
                ParseState::RequestLine | ParseState::Headers => match buf.scan_line() {
                    LineStatus::Complete(line) => line,
                    LineStatus::Malformed => return ParseOutcome::BadRequest,
                    LineStatus::Incomplete => return ParseOutcome::NeedMoreData,
                },
            };
            buf.start_next_line();

            let text = buf.slice(line.clone());
            tracing::trace!(line = %String::from_utf8_lossy(text), "request line");

            let step = match self.state {
                ParseState::RequestLine => self.parse_request_line(text, line.start),
                ParseState::Headers => self.parse_header(text, line.start),
                ParseState::Body { .. } => Step::Continue,
            };

            match step {
                Step::Continue => {}
                Step::Bad => return ParseOutcome::BadRequest,
                Step::HeadersDone if self.request.content_length == 0 => {
                    return ParseOutcome::RequestComplete;
                }
                Step::HeadersDone => {
                    self.state = ParseState::Body {
                        start: buf.checked_index(),
                    };
                }
            }
        }
    }

    fn body_status(&self, buf: &ReadBuffer, start: usize) -> ParseOutcome {
        let buffered = (buf.read_index() - start) as u64;
        if buffered >= self.request.content_length {
            ParseOutcome::RequestComplete
        } else {
            ParseOutcome::NeedMoreData
        }
    }

    /// `<method> <target> <version>`; `base` is the line's buffer offset.
    fn parse_request_line(&mut self, text: &[u8], base: usize) -> Step {
        let Some(split) = find_whitespace(text) else {
            return Step::Bad;
        };
        let Some(method) = Method::from_bytes(&text[..split]) else {
            return Step::Bad;
        };

        let rest_start = split + 1;
        let Some(split) = find_whitespace(&text[rest_start..]) else {
            return Step::Bad;
        };
        let target_end = rest_start + split;
        let version_start = target_end + 1;

        if !text[version_start..].eq_ignore_ascii_case(b"HTTP/1.1") {
            return Step::Bad;
        }

        let mut target_start = rest_start;
        if starts_with_ignore_case(&text[target_start..target_end], ABSOLUTE_PREFIX) {
            let authority = target_start + ABSOLUTE_PREFIX.len();
            match text[authority..target_end].iter().position(|&b| b == b'/') {
                Some(slash) => target_start = authority + slash,
                None => return Step::Bad,
            }
        }
        if target_start >= target_end || text[target_start] != b'/' {
            return Step::Bad;
        }

        self.request.method = Some(method);
        self.request.target = base + target_start..base + target_end;
        self.request.version = base + version_start..base + text.len();
        self.state = ParseState::Headers;
        Step::Continue
    }

    fn parse_header(&mut self, text: &[u8], base: usize) -> Step {
        if text.is_empty() {
            return Step::HeadersDone;
        }

        if starts_with_ignore_case(text, CONNECTION) {
            let value = skip_blanks(&text[CONNECTION.len()..]);
            self.request.keep_alive = value.eq_ignore_ascii_case(b"keep-alive");
        } else if starts_with_ignore_case(text, CONTENT_LENGTH) {
            let value = skip_blanks(&text[CONTENT_LENGTH.len()..]);
            match parse_content_length(value) {
                Some(len) => self.request.content_length = len,
                None => return Step::Bad,
            }
        } else if starts_with_ignore_case(text, HOST) {
            let value = skip_blanks(&text[HOST.len()..]);
            let start = base + (text.len() - value.len());
            self.request.host = Some(start..base + text.len());
        } else {
            tracing::debug!(header = %String::from_utf8_lossy(text), "ignoring unknown header");
        }
        Step::Continue
    }
}

fn find_whitespace(text: &[u8]) -> Option<usize> {
    text.iter().position(|&b| b == b' ' || b == b'\t')
}

fn skip_blanks(text: &[u8]) -> &[u8] {
    let skip = text
        .iter()
        .take_while(|&&b| b == b' ' || b == b'\t')
        .count();
    &text[skip..]
}

fn starts_with_ignore_case(text: &[u8], prefix: &[u8]) -> bool {
    text.len() >= prefix.len() && text[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn parse_content_length(value: &[u8]) -> Option<u64> {
    let digits = value.trim_ascii_end();
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &[u8]) -> (RequestParser, ReadBuffer, ParseOutcome) {
        let mut buf = ReadBuffer::new(1024);
        buf.push(raw);
        let mut parser = RequestParser::new();
        let outcome = parser.parse(&mut buf);
        (parser, buf, outcome)
    }

    #[test]
    fn parse_simple_get() {
        let (parser, buf, outcome) = parse(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");

        assert_eq!(outcome, ParseOutcome::RequestComplete);
        let req = parser.request();
        assert_eq!(req.target(buf.filled()), b"/");
        assert_eq!(req.host(buf.filled()), Some(&b"example.com"[..]));
    }

    #[test]
    fn absolute_form_target_is_reduced_to_path() {
        let (parser, buf, outcome) = parse(b"GET http://10.0.0.1:8080/a/b.html HTTP/1.1\r\n\r\n");

        assert_eq!(outcome, ParseOutcome::RequestComplete);
        assert_eq!(parser.request().target(buf.filled()), b"/a/b.html");
    }

    #[test]
    fn content_length_must_be_numeric() {
        let (_, _, outcome) = parse(b"GET / HTTP/1.1\r\nContent-Length: ten\r\n\r\n");
        assert_eq!(outcome, ParseOutcome::BadRequest);
    }
}
