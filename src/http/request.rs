use std::ops::Range;

/// HTTP request methods.
///
/// Only GET is served; every other method is rejected while parsing the
/// request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    GET,
}

impl Method {
    /// Parses a method token, ignoring ASCII case.
    ///
    /// # Example
    ///
    /// ```
    /// # use lantern::http::request::Method;
    /// assert_eq!(Method::from_bytes(b"get"), Some(Method::GET));
    /// assert_eq!(Method::from_bytes(b"POST"), None);
    /// ```
    pub fn from_bytes(token: &[u8]) -> Option<Self> {
        if token.eq_ignore_ascii_case(b"GET") {
            Some(Method::GET)
        } else {
            None
        }
    }
}

/// Where the parser is within the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseState {
    #[default]
    RequestLine,
    Headers,
    /// Waiting for the body; `start` is the buffer offset the body begins at.
    Body { start: usize },
}

/// Fields extracted from the request line and headers.
///
/// Text fields are ranges into the connection's read buffer, which stays
/// untouched until the connection is reset for the next request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub method: Option<Method>,
    /// Origin-form target (`/path`), with any `http://authority` prefix removed.
    pub target: Range<usize>,
    pub version: Range<usize>,
    pub host: Option<Range<usize>>,
    pub content_length: u64,
    /// Set by `Connection: keep-alive`.
    pub keep_alive: bool,
}

impl Request {
    pub fn target<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.target.clone()]
    }

    pub fn version<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.version.clone()]
    }

    pub fn host<'a>(&self, buf: &'a [u8]) -> Option<&'a [u8]> {
        self.host.clone().map(|r| &buf[r])
    }
}
