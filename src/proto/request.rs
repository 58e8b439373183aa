use http::{HeaderMap, Method, Uri, Version};

/// A parsed HTTP/1 request head.
#[derive(Debug)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) keepalive: bool,
    pub(crate) body: BodyKind,
}

/// Framing of a request body on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyKind {
    Empty,
    Length(u64),
    Chunked,
}

impl Request {
    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request target.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The HTTP version of the request.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Whether the client asked to keep the connection open, per the
    /// version-specific default and any `Connection` header.
    pub fn keepalive(&self) -> bool {
        self.keepalive
    }

    /// The declared `Content-Length`, if the body uses identity framing.
    pub fn content_length(&self) -> Option<u64> {
        match self.body {
            BodyKind::Length(n) => Some(n),
            _ => None,
        }
    }

    /// Whether the request body uses chunked transfer coding.
    pub fn is_chunked(&self) -> bool {
        matches!(self.body, BodyKind::Chunked)
    }

    /// Whether a body accompanies this request.
    pub fn has_body(&self) -> bool {
        !matches!(self.body, BodyKind::Empty)
    }
}
