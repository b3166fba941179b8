use crate::http::buffer::{BufferOverflow, WriteBuffer};

/// The only media type the server announces.
pub const CONTENT_TYPE: &str = "text/html";

/// HTTP status codes the server produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// 200 OK
    Ok,
    /// 400 Bad Request
    BadRequest,
    /// 403 Forbidden
    Forbidden,
    /// 404 Not Found
    NotFound,
    /// 500 Internal Server Error
    InternalServerError,
}

impl StatusCode {
    /// Returns the numeric HTTP status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use lantern::http::response::StatusCode;
    /// assert_eq!(StatusCode::Ok.as_u16(), 200);
    /// assert_eq!(StatusCode::Forbidden.as_u16(), 403);
    /// ```
    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::InternalServerError => 500,
        }
    }

    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
            StatusCode::InternalServerError => "Internal Server Error",
        }
    }

    /// Fixed body sent with each error status. Empty for 200.
    pub fn error_body(&self) -> &'static str {
        match self {
            StatusCode::Ok => "",
            StatusCode::BadRequest => {
                "Your request has bad syntax or is inherently impossible to satisfy.\n"
            }
            StatusCode::Forbidden => "You do not have permission to get file from this server.\n",
            StatusCode::NotFound => "The requested file was not found on this server.\n",
            StatusCode::InternalServerError => {
                "There was an unusual problem serving the requested file.\n"
            }
        }
    }
}

/// Writes the status line, the fixed header set and the blank line.
pub fn write_head(
    buf: &mut WriteBuffer,
    status: StatusCode,
    content_length: u64,
    keep_alive: bool,
) -> Result<(), BufferOverflow> {
    buf.push_str(&format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.reason_phrase()
    ))?;
    buf.push_str(&format!("Content-Length: {content_length}\r\n"))?;
    buf.push_str(&format!("Content-Type: {CONTENT_TYPE}\r\n"))?;
    buf.push_str(if keep_alive {
        "Connection: keep-alive\r\n"
    } else {
        "Connection: close\r\n"
    })?;
    buf.push_str("\r\n")
}

/// Writes a complete error response: head plus the status's fixed body.
pub fn write_error(
    buf: &mut WriteBuffer,
    status: StatusCode,
    keep_alive: bool,
) -> Result<(), BufferOverflow> {
    let body = status.error_body();
    write_head(buf, status, body.len() as u64, keep_alive)?;
    buf.push_str(body)
}
