//! The application contract.
//!
//! An [`Application`] is called once per request on an executor thread. It
//! receives the request environment and the response handle, sets the
//! response head via [`Response::start_response`], and returns a body for
//! the worker to write. Handlers may block; each executor thread owns one
//! connection at a time.

use std::error::Error as StdError;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::net::SocketAddr;

use bytes::Bytes;

use crate::proto::{Request, Response};

/// Errors returned by application code.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// A user-supplied request handler hosted by the worker.
///
/// Returning `Err` before the response head is sent produces a synthesized
/// `500`; after the head is sent the connection is shut down abruptly, since
/// the response framing can no longer be trusted.
pub trait Application: Send + Sync + 'static {
    /// Handle one request, returning the response body.
    fn call(&self, env: &mut Environ<'_>, resp: &mut Response) -> Result<AppBody, BoxError>;
}

impl<F> Application for F
where
    F: Fn(&mut Environ<'_>, &mut Response) -> Result<AppBody, BoxError> + Send + Sync + 'static,
{
    fn call(&self, env: &mut Environ<'_>, resp: &mut Response) -> Result<AppBody, BoxError> {
        self(env, resp)
    }
}

/// The per-request environment handed to the application.
pub struct Environ<'a> {
    request: &'a Request,
    peer: SocketAddr,
    server: SocketAddr,
    multithread: bool,
    body: &'a mut (dyn Read + Send),
}

impl<'a> Environ<'a> {
    pub(crate) fn new(
        request: &'a Request,
        peer: SocketAddr,
        server: SocketAddr,
        body: &'a mut (dyn Read + Send),
    ) -> Environ<'a> {
        Environ {
            request,
            peer,
            server,
            // requests from one worker are handled by a pool of threads
            multithread: true,
            body,
        }
    }

    /// The parsed request head.
    pub fn request(&self) -> &Request {
        self.request
    }

    /// Address of the connected client.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Local address of the listener that accepted this connection.
    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// True: handlers run concurrently on the executor pool.
    pub fn multithread(&self) -> bool {
        self.multithread
    }

    /// Reader over the request body.
    ///
    /// A body left unread forces the connection to close after the
    /// response, so read it when the request declares one.
    pub fn body(&mut self) -> &mut (dyn Read + Send) {
        self.body
    }
}

impl fmt::Debug for Environ<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environ")
            .field("method", self.request.method())
            .field("uri", self.request.uri())
            .field("peer", &self.peer)
            .field("server", &self.server)
            .finish()
    }
}

/// A response body produced by the application.
pub enum AppBody {
    /// A sequence of chunks, written (and framed) in order.
    Iter(Box<dyn Iterator<Item = io::Result<Bytes>> + Send>),
    /// The file-wrapper fast path: the worker streams the file itself.
    File(File),
}

impl AppBody {
    /// An empty body.
    pub fn empty() -> AppBody {
        AppBody::Iter(Box::new(std::iter::empty()))
    }

    /// A body of one chunk.
    pub fn once(chunk: impl Into<Bytes>) -> AppBody {
        let chunk = chunk.into();
        AppBody::Iter(Box::new(std::iter::once(Ok(chunk))))
    }

    /// Stream a file via the worker's file fast path.
    pub fn file(file: File) -> AppBody {
        AppBody::File(file)
    }
}

impl From<Bytes> for AppBody {
    fn from(chunk: Bytes) -> AppBody {
        AppBody::once(chunk)
    }
}

impl From<Vec<u8>> for AppBody {
    fn from(chunk: Vec<u8>) -> AppBody {
        AppBody::once(chunk)
    }
}

impl From<&'static str> for AppBody {
    fn from(chunk: &'static str) -> AppBody {
        AppBody::once(chunk)
    }
}

impl From<String> for AppBody {
    fn from(chunk: String) -> AppBody {
        AppBody::once(chunk)
    }
}

impl fmt::Debug for AppBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppBody::Iter(_) => f.write_str("AppBody::Iter"),
            AppBody::File(file) => f.debug_tuple("AppBody::File").field(file).finish(),
        }
    }
}
