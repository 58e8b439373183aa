use std::fs::File;
use std::io::{self, Read, Seek, Write};

use http::header::{CONNECTION, CONTENT_LENGTH, DATE, SERVER, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode, Version};
use tracing::debug;

use super::date;
use super::request::Request;

const SERVER_NAME: &str = concat!("stoker/", env!("CARGO_PKG_VERSION"));
const FILE_CHUNK: usize = 64 * 1024;

/// HTTP/1 response writer for one request turn.
///
/// The writer buffers nothing but the head: status and headers are held
/// until the first body write (or [`close`]) flushes them, so an error
/// response can still be synthesized as long as [`headers_sent`] is false.
///
/// [`close`]: Response::close
/// [`headers_sent`]: Response::headers_sent
#[derive(Debug)]
pub struct Response {
    version: Version,
    status: StatusCode,
    headers: HeaderMap,
    started: bool,
    headers_sent: bool,
    force_close: bool,
    keepalive: bool,
    head: bool,
    framing: Framing,
    sent: u64,
}

#[derive(Debug, Clone, Copy)]
enum Framing {
    Unset,
    Length { remaining: u64 },
    Chunked,
    CloseDelimited,
}

impl Response {
    pub(crate) fn new(req: &Request) -> Response {
        Response {
            version: req.version,
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            started: false,
            headers_sent: false,
            force_close: false,
            keepalive: req.keepalive,
            head: req.method == Method::HEAD,
            framing: Framing::Unset,
            sent: 0,
        }
    }

    /// Set the response status and headers.
    ///
    /// May be called again to replace an earlier head, up until the head has
    /// hit the wire. The worker owns connection-level headers: `Connection`
    /// and `Transfer-Encoding` provided here are ignored.
    pub fn start_response(&mut self, status: StatusCode, headers: HeaderMap) {
        if self.headers_sent {
            debug!("start_response after headers were sent; ignored");
            return;
        }
        self.status = status;
        self.headers = headers;
        self.started = true;
    }

    /// Force the connection to close after this response.
    pub fn force_close(&mut self) {
        self.force_close = true;
    }

    /// Whether the response head has already been written to the socket.
    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    /// Whether the connection must be closed after this response.
    pub fn should_close(&self) -> bool {
        self.force_close || !self.keepalive || matches!(self.framing, Framing::CloseDelimited)
    }

    /// The response status, meaningful once `start_response` has been called.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Body bytes accepted so far (counted even for HEAD responses).
    pub fn bytes_sent(&self) -> u64 {
        self.sent
    }

    pub(crate) fn write<W: Write>(&mut self, out: &mut W, data: &[u8]) -> io::Result<()> {
        if !self.started {
            return Err(not_started());
        }
        if !self.headers_sent {
            self.send_headers(out)?;
        }
        if data.is_empty() {
            return Ok(());
        }
        if self.head {
            self.sent += data.len() as u64;
            return Ok(());
        }
        match &mut self.framing {
            Framing::Length { remaining } => {
                let n = (data.len() as u64).min(*remaining) as usize;
                if n < data.len() {
                    debug!("response body exceeds declared content-length, truncating");
                }
                if n > 0 {
                    out.write_all(&data[..n])?;
                    *remaining -= n as u64;
                    self.sent += n as u64;
                }
            }
            Framing::Chunked => {
                let head = format!("{:X}\r\n", data.len());
                out.write_all(head.as_bytes())?;
                out.write_all(data)?;
                out.write_all(b"\r\n")?;
                self.sent += data.len() as u64;
            }
            Framing::CloseDelimited => {
                out.write_all(data)?;
                self.sent += data.len() as u64;
            }
            Framing::Unset => {
                debug_assert!(false, "body write before response head");
            }
        }
        Ok(())
    }

    /// Stream a file as the response body.
    ///
    /// When the application did not declare a `Content-Length`, the file's
    /// remaining length is used so the connection stays reusable.
    pub(crate) fn write_file<W: Write>(&mut self, out: &mut W, file: &mut File) -> io::Result<()> {
        if !self.started {
            return Err(not_started());
        }
        if !self.headers_sent && !self.headers.contains_key(CONTENT_LENGTH) {
            let remaining = file
                .metadata()?
                .len()
                .saturating_sub(file.stream_position()?);
            self.headers
                .insert(CONTENT_LENGTH, http::HeaderValue::from(remaining));
        }
        if !self.headers_sent {
            self.send_headers(out)?;
        }
        let mut chunk = vec![0u8; FILE_CHUNK];
        loop {
            let n = file.read(&mut chunk)?;
            if n == 0 {
                return Ok(());
            }
            self.write(out, &chunk[..n])?;
        }
    }

    /// Finish the response: flush the head if needed and terminate framing.
    pub(crate) fn close<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        if !self.started {
            return Err(not_started());
        }
        if !self.headers_sent {
            self.send_headers(out)?;
        }
        match self.framing {
            Framing::Chunked => {
                if !self.head {
                    out.write_all(b"0\r\n\r\n")?;
                }
            }
            Framing::Length { remaining } if remaining > 0 && !self.head => {
                debug!("response shorter than declared content-length, closing connection");
                self.force_close = true;
            }
            _ => {}
        }
        out.flush()
    }

    fn send_headers<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        self.framing = if let Some(value) = self.headers.get(CONTENT_LENGTH) {
            let n = value
                .to_str()
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        "invalid content-length in response headers",
                    )
                })?;
            Framing::Length { remaining: n }
        } else if bodyless(self.status) {
            Framing::Length { remaining: 0 }
        } else if self.version == Version::HTTP_10 {
            self.force_close = true;
            Framing::CloseDelimited
        } else {
            Framing::Chunked
        };

        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(if self.version == Version::HTTP_10 {
            b"HTTP/1.0 "
        } else {
            b"HTTP/1.1 "
        });
        let mut code = itoa::Buffer::new();
        buf.extend_from_slice(code.format(self.status.as_u16()).as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(
            self.status
                .canonical_reason()
                .unwrap_or("Unknown")
                .as_bytes(),
        );
        buf.extend_from_slice(b"\r\nDate: ");
        date::extend(&mut buf);
        buf.extend_from_slice(b"\r\n");

        if !self.headers.contains_key(SERVER) {
            buf.extend_from_slice(b"Server: ");
            buf.extend_from_slice(SERVER_NAME.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }

        for (name, value) in self.headers.iter() {
            if name == &CONNECTION || name == &TRANSFER_ENCODING || name == &DATE {
                continue;
            }
            buf.extend_from_slice(name.as_str().as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }

        if matches!(self.framing, Framing::Chunked) {
            buf.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }

        let keep = self.keepalive
            && !self.force_close
            && !matches!(self.framing, Framing::CloseDelimited);
        let connection: &[u8] = if keep {
            b"Connection: keep-alive\r\n\r\n"
        } else {
            b"Connection: close\r\n\r\n"
        };
        buf.extend_from_slice(connection);

        out.write_all(&buf)?;
        self.headers_sent = true;
        Ok(())
    }
}

fn bodyless(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

fn not_started() -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        "start_response was not called",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderValue;
    use std::io::Cursor;

    fn request(raw: &[u8]) -> Request {
        let cfg = crate::Config::builder().build().unwrap();
        let mut parser = super::super::parse::RequestParser::new(&cfg);
        let mut io = Cursor::new(raw.to_vec());
        parser.next(&mut io).unwrap().unwrap()
    }

    fn get11() -> Request {
        request(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n")
    }

    fn text(out: &[u8]) -> String {
        String::from_utf8_lossy(out).into_owned()
    }

    #[test]
    fn content_length_response() {
        let mut resp = Response::new(&get11());
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("5"));
        resp.start_response(StatusCode::OK, headers);

        let mut out = Vec::new();
        resp.write(&mut out, b"hello").unwrap();
        resp.close(&mut out).unwrap();

        let s = text(&out);
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"), "{s}");
        assert!(s.contains("content-length: 5\r\n"), "{s}");
        assert!(s.contains("Connection: keep-alive\r\n"), "{s}");
        assert!(s.ends_with("\r\n\r\nhello"), "{s}");
        assert!(!resp.should_close());
        assert_eq!(resp.bytes_sent(), 5);
    }

    #[test]
    fn chunked_when_no_length_declared() {
        let mut resp = Response::new(&get11());
        resp.start_response(StatusCode::OK, HeaderMap::new());

        let mut out = Vec::new();
        resp.write(&mut out, b"hello").unwrap();
        resp.close(&mut out).unwrap();

        let s = text(&out);
        assert!(s.contains("Transfer-Encoding: chunked\r\n"), "{s}");
        assert!(s.ends_with("\r\n\r\n5\r\nhello\r\n0\r\n\r\n"), "{s}");
        assert!(!resp.should_close());
    }

    #[test]
    fn http10_without_length_closes() {
        let req = request(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
        let mut resp = Response::new(&req);
        resp.start_response(StatusCode::OK, HeaderMap::new());

        let mut out = Vec::new();
        resp.write(&mut out, b"hello").unwrap();
        resp.close(&mut out).unwrap();

        let s = text(&out);
        assert!(s.starts_with("HTTP/1.0 200 OK\r\n"), "{s}");
        assert!(s.contains("Connection: close\r\n"), "{s}");
        assert!(resp.should_close());
    }

    #[test]
    fn force_close_reflected_in_headers() {
        let mut resp = Response::new(&get11());
        resp.force_close();
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        resp.start_response(StatusCode::OK, headers);

        let mut out = Vec::new();
        resp.close(&mut out).unwrap();

        assert!(text(&out).contains("Connection: close\r\n"));
        assert!(resp.should_close());
    }

    #[test]
    fn head_suppresses_body() {
        let req = request(b"HEAD / HTTP/1.1\r\nHost: a\r\n\r\n");
        let mut resp = Response::new(&req);
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("5"));
        resp.start_response(StatusCode::OK, headers);

        let mut out = Vec::new();
        resp.write(&mut out, b"hello").unwrap();
        resp.close(&mut out).unwrap();

        let s = text(&out);
        assert!(s.contains("content-length: 5\r\n"), "{s}");
        assert!(s.ends_with("\r\n\r\n"), "{s}");
        assert_eq!(resp.bytes_sent(), 5);
        assert!(!resp.should_close());
    }

    #[test]
    fn short_body_forces_close() {
        let mut resp = Response::new(&get11());
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("10"));
        resp.start_response(StatusCode::OK, headers);

        let mut out = Vec::new();
        resp.write(&mut out, b"hi").unwrap();
        resp.close(&mut out).unwrap();

        assert!(resp.should_close());
    }

    #[test]
    fn overlong_body_truncated() {
        let mut resp = Response::new(&get11());
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("2"));
        resp.start_response(StatusCode::OK, headers);

        let mut out = Vec::new();
        resp.write(&mut out, b"hello").unwrap();
        resp.close(&mut out).unwrap();

        assert!(text(&out).ends_with("\r\n\r\nhe"));
        assert_eq!(resp.bytes_sent(), 2);
    }

    #[test]
    fn write_without_start_response_fails() {
        let mut resp = Response::new(&get11());
        let mut out = Vec::new();
        let err = resp.write(&mut out, b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn no_content_has_no_framing_headers() {
        let mut resp = Response::new(&get11());
        resp.start_response(StatusCode::NO_CONTENT, HeaderMap::new());

        let mut out = Vec::new();
        resp.close(&mut out).unwrap();

        let s = text(&out);
        assert!(s.starts_with("HTTP/1.1 204 No Content\r\n"), "{s}");
        assert!(!s.contains("Transfer-Encoding"), "{s}");
        assert!(!resp.should_close());
    }

    #[test]
    fn connection_and_te_from_app_are_ignored() {
        let mut resp = Response::new(&get11());
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        resp.start_response(StatusCode::OK, headers);

        let mut out = Vec::new();
        resp.close(&mut out).unwrap();

        let s = text(&out);
        assert!(!s.contains("upgrade"), "{s}");
        assert!(!s.contains("gzip"), "{s}");
    }

    #[test]
    fn write_file_sets_length() {
        let mut file = tempfile::tempfile().unwrap();
        std::io::Write::write_all(&mut file, b"file body").unwrap();
        file.rewind().unwrap();

        let mut resp = Response::new(&get11());
        resp.start_response(StatusCode::OK, HeaderMap::new());

        let mut out = Vec::new();
        resp.write_file(&mut out, &mut file).unwrap();
        resp.close(&mut out).unwrap();

        let s = text(&out);
        assert!(s.contains("content-length: 9\r\n"), "{s}");
        assert!(s.ends_with("\r\n\r\nfile body"), "{s}");
        assert!(!resp.should_close());
    }
}
