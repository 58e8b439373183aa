use std::io::{self, Read};

use bytes::{Buf, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri, Version};

use super::request::{BodyKind, Request};
use crate::config::Config;
use crate::error::Parse;

const READ_CHUNK: usize = 8 * 1024;
const MAX_CHUNK_LINE: usize = 128;

/// Incremental HTTP/1 request parser bound to one connection.
///
/// The parser is a restartable lazy sequence: each call to [`next`] yields
/// the following request on the socket, `Ok(None)` once the client shuts
/// down cleanly between requests, or an error. A close in the middle of a
/// request head is reported distinctly (`is_incomplete_message`) so callers
/// can log a premature disconnect instead of a parse failure.
///
/// [`next`]: RequestParser::next
#[derive(Debug)]
pub(crate) struct RequestParser {
    buf: BytesMut,
    body: BodyState,
    max_header_count: usize,
    max_head_size: usize,
}

#[derive(Debug)]
enum BodyState {
    None,
    Length { remaining: u64 },
    Chunked(Chunk),
}

#[derive(Debug)]
enum Chunk {
    Size,
    Data { remaining: u64 },
    DataEnd,
    Trailer,
    Done,
}

impl RequestParser {
    pub(crate) fn new(cfg: &Config) -> RequestParser {
        RequestParser {
            buf: BytesMut::with_capacity(READ_CHUNK),
            body: BodyState::None,
            max_header_count: cfg.max_header_count,
            max_head_size: cfg.max_head_size,
        }
    }

    /// Parse the next request head off the stream.
    pub(crate) fn next<R: Read>(&mut self, io: &mut R) -> crate::Result<Option<Request>> {
        debug_assert!(self.body_consumed(), "previous request body left unread");
        self.body = BodyState::None;
        loop {
            if !self.buf.is_empty() {
                if let Some(req) = self.try_parse()? {
                    return Ok(Some(req));
                }
                if self.buf.len() > self.max_head_size {
                    return Err(crate::Error::new_too_large());
                }
            }
            let n = read_some(io, &mut self.buf)?;
            if n == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(crate::Error::new_incomplete())
                };
            }
        }
    }

    fn try_parse(&mut self) -> crate::Result<Option<Request>> {
        let mut headers = vec![httparse::EMPTY_HEADER; self.max_header_count];
        let mut parsed = httparse::Request::new(&mut headers);

        let len = match parsed.parse(&self.buf).map_err(|err| match err {
            httparse::Error::TooManyHeaders => crate::Error::new_too_large(),
            httparse::Error::Version => crate::Error::new_parse(Parse::Version),
            _ => crate::Error::new_parse(Parse::Header),
        })? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Ok(None),
        };

        if len > self.max_head_size {
            return Err(crate::Error::new_too_large());
        }

        // complete heads always carry these
        let method = Method::from_bytes(parsed.method.unwrap().as_bytes())
            .map_err(|_| crate::Error::new_parse(Parse::Method))?;
        let uri = parsed
            .path
            .unwrap()
            .parse::<Uri>()
            .map_err(|_| crate::Error::new_parse(Parse::Uri))?;
        let version = match parsed.version.unwrap() {
            0 => Version::HTTP_10,
            _ => Version::HTTP_11,
        };

        let mut map = HeaderMap::with_capacity(parsed.headers.len());
        for header in parsed.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|_| crate::Error::new_parse(Parse::Header))?;
            let value = HeaderValue::from_bytes(header.value)
                .map_err(|_| crate::Error::new_parse(Parse::Header))?;
            map.append(name, value);
        }

        self.buf.advance(len);

        let body = body_kind(&map)?;
        let keepalive = wants_keepalive(version, &map);
        self.body = match body {
            BodyKind::Empty => BodyState::None,
            BodyKind::Length(n) => BodyState::Length { remaining: n },
            BodyKind::Chunked => BodyState::Chunked(Chunk::Size),
        };

        Ok(Some(Request {
            method,
            uri,
            version,
            headers: map,
            keepalive,
            body,
        }))
    }

    /// Whether bytes beyond the current request are already buffered.
    pub(crate) fn has_buffered(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Whether the current request's body has been read to its end.
    ///
    /// A connection with leftover body bytes cannot be reused: the next
    /// parse would see body data where a request line belongs.
    pub(crate) fn body_consumed(&self) -> bool {
        match &self.body {
            BodyState::None => true,
            BodyState::Length { remaining } => *remaining == 0,
            BodyState::Chunked(Chunk::Done) => true,
            BodyState::Chunked(_) => false,
        }
    }

    pub(crate) fn read_body<R: Read>(&mut self, io: &mut R, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            match &mut self.body {
                BodyState::None => return Ok(0),
                BodyState::Length { remaining } => {
                    if *remaining == 0 {
                        return Ok(0);
                    }
                    let n = read_capped(&mut self.buf, io, out, *remaining)?;
                    if n == 0 {
                        return Err(eof_err());
                    }
                    *remaining -= n as u64;
                    return Ok(n);
                }
                BodyState::Chunked(phase) => match phase {
                    Chunk::Size => {
                        let line = read_line(&mut self.buf, io, MAX_CHUNK_LINE)?;
                        let size = parse_chunk_size(&line)?;
                        *phase = if size == 0 {
                            Chunk::Trailer
                        } else {
                            Chunk::Data { remaining: size }
                        };
                    }
                    Chunk::Data { remaining } => {
                        let n = read_capped(&mut self.buf, io, out, *remaining)?;
                        if n == 0 {
                            return Err(eof_err());
                        }
                        *remaining -= n as u64;
                        if *remaining == 0 {
                            *phase = Chunk::DataEnd;
                        }
                        return Ok(n);
                    }
                    Chunk::DataEnd => {
                        consume_crlf(&mut self.buf, io)?;
                        *phase = Chunk::Size;
                    }
                    Chunk::Trailer => {
                        let line = read_line(&mut self.buf, io, self.max_head_size)?;
                        if line_is_empty(&line) {
                            *phase = Chunk::Done;
                        }
                    }
                    Chunk::Done => return Ok(0),
                },
            }
        }
    }
}

/// Reader over the current request's body, borrowed from the parser for the
/// duration of one request turn.
pub struct BodyReader<'a, R: Read> {
    parser: &'a mut RequestParser,
    io: &'a mut R,
}

impl<'a, R: Read> BodyReader<'a, R> {
    pub(crate) fn new(parser: &'a mut RequestParser, io: &'a mut R) -> BodyReader<'a, R> {
        BodyReader { parser, io }
    }
}

impl<R: Read> Read for BodyReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.parser.read_body(self.io, buf)
    }
}

impl<R: Read> std::fmt::Debug for BodyReader<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyReader").finish()
    }
}

fn read_some<R: Read>(io: &mut R, buf: &mut BytesMut) -> crate::Result<usize> {
    fill_some(buf, io).map_err(crate::Error::new_io)
}

fn fill_some<R: Read>(buf: &mut BytesMut, io: &mut R) -> io::Result<usize> {
    let mut tmp = [0u8; READ_CHUNK];
    loop {
        match io.read(&mut tmp) {
            Ok(n) => {
                buf.extend_from_slice(&tmp[..n]);
                return Ok(n);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Copy up to `cap` body bytes into `out`, draining buffered bytes first.
fn read_capped<R: Read>(
    buf: &mut BytesMut,
    io: &mut R,
    out: &mut [u8],
    cap: u64,
) -> io::Result<usize> {
    let want = out.len().min(usize::try_from(cap).unwrap_or(usize::MAX));
    if !buf.is_empty() {
        let n = want.min(buf.len());
        buf.copy_to_slice(&mut out[..n]);
        return Ok(n);
    }
    io.read(&mut out[..want])
}

fn read_line<R: Read>(buf: &mut BytesMut, io: &mut R, cap: usize) -> io::Result<BytesMut> {
    loop {
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            return Ok(buf.split_to(pos + 1));
        }
        if buf.len() > cap {
            return Err(chunk_err("chunk line too long"));
        }
        if fill_some(buf, io)? == 0 {
            return Err(eof_err());
        }
    }
}

fn line_is_empty(line: &[u8]) -> bool {
    matches!(line, b"\n" | b"\r\n")
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let line = match line {
        [head @ .., b'\r', b'\n'] => head,
        [head @ .., b'\n'] => head,
        _ => line,
    };
    let size = line.split(|&b| b == b';').next().unwrap_or(b"");
    let size = std::str::from_utf8(size)
        .map_err(|_| chunk_err("invalid chunk size"))?
        .trim();
    u64::from_str_radix(size, 16).map_err(|_| chunk_err("invalid chunk size"))
}

fn consume_crlf<R: Read>(buf: &mut BytesMut, io: &mut R) -> io::Result<()> {
    loop {
        match buf.first() {
            Some(b'\n') => {
                buf.advance(1);
                return Ok(());
            }
            Some(b'\r') => {
                if buf.len() >= 2 {
                    return if buf[1] == b'\n' {
                        buf.advance(2);
                        Ok(())
                    } else {
                        Err(chunk_err("missing chunk terminator"))
                    };
                }
            }
            Some(_) => return Err(chunk_err("missing chunk terminator")),
            None => {}
        }
        if fill_some(buf, io)? == 0 {
            return Err(eof_err());
        }
    }
}

fn body_kind(headers: &HeaderMap) -> crate::Result<BodyKind> {
    let mut te_values = headers.get_all(TRANSFER_ENCODING).iter();
    if te_values.next().is_some() {
        let chunked = headers.get_all(TRANSFER_ENCODING).iter().any(|v| {
            v.to_str()
                .map(|s| {
                    s.split(',')
                        .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
                })
                .unwrap_or(false)
        });
        return if chunked {
            Ok(BodyKind::Chunked)
        } else {
            Err(crate::Error::new_parse(Parse::Chunk))
        };
    }

    let mut length: Option<u64> = None;
    for value in headers.get_all(CONTENT_LENGTH).iter() {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(|| crate::Error::new_parse(Parse::ContentLength))?;
        match length {
            Some(prev) if prev != parsed => {
                return Err(crate::Error::new_parse(Parse::ContentLength));
            }
            _ => length = Some(parsed),
        }
    }

    Ok(match length {
        None => BodyKind::Empty,
        Some(n) => BodyKind::Length(n),
    })
}

fn wants_keepalive(version: Version, headers: &HeaderMap) -> bool {
    let mut keepalive = version != Version::HTTP_10;
    for value in headers.get_all(CONNECTION).iter() {
        if let Ok(s) = value.to_str() {
            for token in s.split(',') {
                let token = token.trim();
                if token.eq_ignore_ascii_case("close") {
                    return false;
                }
                if token.eq_ignore_ascii_case("keep-alive") {
                    keepalive = true;
                }
            }
        }
    }
    keepalive
}

fn eof_err() -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "connection closed before request body completed",
    )
}

fn chunk_err(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}
