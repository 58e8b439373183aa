//! HTTP/1 wire collaborators: the request parser and the response writer.
//!
//! These are deliberately small. The worker treats them as a lazy sequence
//! of requests on one socket and a sink that knows how to frame a response;
//! everything interesting about scheduling lives above them.

pub(crate) mod date;
pub(crate) mod parse;
mod request;
mod response;

pub use self::parse::BodyReader;
pub use self::request::Request;
pub use self::response::Response;

pub(crate) use self::parse::RequestParser;

use std::io::Write;

use http::StatusCode;
use tracing::trace;

/// Write a minimal error response directly to the socket.
///
/// Used when a request turn fails before any response head hit the wire: a
/// parse failure, a TLS problem, or an application error. Write failures
/// are swallowed; the connection is being torn down either way.
pub(crate) fn write_error_response<W: Write>(out: &mut W, status: StatusCode) {
    let reason = status.canonical_reason().unwrap_or("Error");
    let mut buf = Vec::with_capacity(160);
    buf.extend_from_slice(b"HTTP/1.1 ");
    let mut code = itoa::Buffer::new();
    buf.extend_from_slice(code.format(status.as_u16()).as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(reason.as_bytes());
    buf.extend_from_slice(b"\r\nDate: ");
    date::extend(&mut buf);
    buf.extend_from_slice(b"\r\nContent-Type: text/plain\r\nContent-Length: ");
    let mut len = itoa::Buffer::new();
    buf.extend_from_slice(len.format(reason.len()).as_bytes());
    buf.extend_from_slice(b"\r\nConnection: close\r\n\r\n");
    buf.extend_from_slice(reason.as_bytes());

    if let Err(err) = out.write_all(&buf).and_then(|()| out.flush()) {
        trace!("error response could not be written: {}", err);
    }
}

/// Map a request-turn failure to the status of the synthesized response.
pub(crate) fn error_status(err: &crate::Error) -> StatusCode {
    if err.is_parse_too_large() {
        StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
    } else if err.is_parse() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}
