//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Result type often returned from methods that can have stoker `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur inside a worker.
///
/// Expected, per-operation OS conditions (`EAGAIN` on accept, a peer reset
/// while writing a response, an already-closed socket on unregister) never
/// surface as an `Error`; they are swallowed where they happen. An `Error`
/// that escapes [`Worker::run`][crate::Worker::run] means the worker is done
/// and the supervising process should respawn it.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(super) enum Kind {
    Parse(Parse),
    /// A connection closed in the middle of a request head.
    IncompleteMessage,
    /// Invalid worker configuration.
    Config,
    /// Error preparing an inherited listener.
    Listen,
    /// Error accepting a connection on a listener.
    Accept,
    /// The readiness poller failed.
    Poll,
    /// The executor pool could not be built.
    Executor,
    /// Signal handlers could not be installed.
    Signal,
    /// Error creating or touching the liveness beacon file.
    Beacon,
    /// An `io::Error` that occurred while reading or writing a socket.
    Io,
    /// Error building the TLS acceptor or wrapping a client socket.
    #[cfg(feature = "tls")]
    Tls,
}

#[derive(Debug)]
pub(super) enum Parse {
    Method,
    Version,
    Uri,
    Header,
    TooLarge,
    ContentLength,
    Chunk,
}

impl Error {
    /// Returns true if this was an HTTP parse error.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if this was an HTTP parse error caused by a request head
    /// that exceeded the configured limits.
    pub fn is_parse_too_large(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(Parse::TooLarge))
    }

    /// Returns true if the connection closed before a request head completed.
    pub fn is_incomplete_message(&self) -> bool {
        matches!(self.inner.kind, Kind::IncompleteMessage)
    }

    /// Returns true if this error came from socket I/O.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Returns true if this error was caused by invalid configuration.
    pub fn is_config(&self) -> bool {
        matches!(self.inner.kind, Kind::Config)
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    pub(super) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(super) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn new_parse(parse: Parse) -> Error {
        Error::new(Kind::Parse(parse))
    }

    pub(crate) fn new_incomplete() -> Error {
        Error::new(Kind::IncompleteMessage)
    }

    pub(crate) fn new_too_large() -> Error {
        Error::new(Kind::Parse(Parse::TooLarge))
    }

    pub(crate) fn new_config(msg: &'static str) -> Error {
        Error::new(Kind::Config).with(msg)
    }

    pub(crate) fn new_listen<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    pub(crate) fn new_accept<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Accept).with(cause)
    }

    pub(crate) fn new_poll<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Poll).with(cause)
    }

    pub(crate) fn new_beacon<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Beacon).with(cause)
    }

    pub(crate) fn new_executor<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Executor).with(cause)
    }

    pub(crate) fn new_signal<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Signal).with(cause)
    }

    pub(crate) fn new_io(cause: io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    #[cfg(feature = "tls")]
    pub(crate) fn new_tls<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Tls).with(cause)
    }

    /// The `io::ErrorKind` of the underlying I/O cause, if there is one.
    pub(crate) fn io_kind(&self) -> Option<io::ErrorKind> {
        if let Some(cause) = &self.inner.cause {
            if let Some(io) = cause.downcast_ref::<io::Error>() {
                return Some(io.kind());
            }
        }
        None
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Method) => "invalid HTTP method parsed",
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::Uri) => "invalid URI",
            Kind::Parse(Parse::Header) => "invalid HTTP header parsed",
            Kind::Parse(Parse::TooLarge) => "request head is too large",
            Kind::Parse(Parse::ContentLength) => "invalid content-length parsed",
            Kind::Parse(Parse::Chunk) => "invalid chunked body",
            Kind::IncompleteMessage => "connection closed before request completed",
            Kind::Config => "invalid worker configuration",
            Kind::Listen => "error preparing listener",
            Kind::Accept => "error accepting connection",
            Kind::Poll => "readiness poller failed",
            Kind::Executor => "executor pool failed",
            Kind::Signal => "error installing signal handlers",
            Kind::Beacon => "liveness beacon failed",
            Kind::Io => "connection error",
            #[cfg(feature = "tls")]
            Kind::Tls => "TLS error",
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::new_io(err)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("stoker::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn error_size_of() {
        assert_eq!(mem::size_of::<Error>(), mem::size_of::<usize>());
    }

    #[test]
    fn predicates() {
        assert!(Error::new_too_large().is_parse());
        assert!(Error::new_too_large().is_parse_too_large());
        assert!(Error::new_incomplete().is_incomplete_message());
        assert!(!Error::new_incomplete().is_parse());
        assert!(Error::new_config("bad").is_config());
    }

    #[test]
    fn io_kind_roundtrip() {
        let err = Error::new_io(io::Error::new(io::ErrorKind::BrokenPipe, "epipe"));
        assert!(err.is_io());
        assert_eq!(err.io_kind(), Some(io::ErrorKind::BrokenPipe));
    }
}
