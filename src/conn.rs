//! Per-connection state.
//!
//! A [`Conn`] is created at accept time and owned by exactly one place for
//! its whole life: the poller registration while waiting for readability,
//! an executor task while a request turn runs, or the closing path. The
//! socket is non-blocking while the poller owns it and blocking while an
//! executor thread does.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use tracing::trace;

use crate::config::Config;
use crate::proto::RequestParser;

/// TLS context handed to `Conn::init`, built once per worker.
#[cfg(feature = "tls")]
pub(crate) type TlsContext = Option<Arc<rustls::ServerConfig>>;

#[cfg(not(feature = "tls"))]
pub(crate) type TlsContext = ();

/// A client socket, possibly wrapped in TLS once initialized.
pub(crate) enum Stream {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<rustls::StreamOwned<rustls::ServerConnection, TcpStream>>),
}

impl Stream {
    fn tcp(&self) -> &TcpStream {
        match self {
            Stream::Plain(sock) => sock,
            #[cfg(feature = "tls")]
            Stream::Tls(tls) => tls.get_ref(),
        }
    }

    pub(crate) fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.tcp().set_nonblocking(nonblocking)
    }

    pub(crate) fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.tcp().shutdown(how)
    }

    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.tcp().as_raw_fd()
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(sock) => sock.read(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(tls) => tls.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(sock) => sock.write(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Plain(sock) => sock.flush(),
            #[cfg(feature = "tls")]
            Stream::Tls(tls) => tls.flush(),
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Plain(sock) => f.debug_tuple("Plain").field(sock).finish(),
            #[cfg(feature = "tls")]
            Stream::Tls(tls) => f.debug_tuple("Tls").field(tls.get_ref()).finish(),
        }
    }
}

/// One accepted client connection.
#[derive(Debug)]
pub(crate) struct Conn {
    pub(crate) cfg: Arc<Config>,
    pub(crate) stream: Stream,
    pub(crate) peer: SocketAddr,
    /// Listener name captured at accept time; looking it up later may race
    /// with shutdown.
    pub(crate) server: SocketAddr,
    pub(crate) parser: Option<RequestParser>,
    pub(crate) initialized: bool,
}

impl Conn {
    /// Wrap a freshly accepted socket. The socket is made non-blocking: the
    /// poller owns it until its first readable event.
    pub(crate) fn new(
        cfg: Arc<Config>,
        sock: TcpStream,
        peer: SocketAddr,
        server: SocketAddr,
    ) -> io::Result<Conn> {
        sock.set_nonblocking(true)?;
        Ok(Conn {
            cfg,
            stream: Stream::Plain(sock),
            peer,
            server,
            parser: None,
            initialized: false,
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// First-use initialization: switch to blocking I/O, wrap the socket in
    /// TLS when configured, and build the request parser. Idempotent.
    #[allow(unused_variables)]
    pub(crate) fn init(mut self, tls: &TlsContext) -> crate::Result<Conn> {
        if self.initialized {
            return Ok(self);
        }
        self.stream.set_nonblocking(false).map_err(crate::Error::new_io)?;

        #[cfg(feature = "tls")]
        if let Some(tls_config) = tls.as_ref() {
            self.stream = match self.stream {
                Stream::Plain(sock) => {
                    let session = match rustls::ServerConnection::new(Arc::clone(tls_config)) {
                        Ok(session) => session,
                        Err(err) => return Err(crate::Error::new_tls(err)),
                    };
                    Stream::Tls(Box::new(rustls::StreamOwned::new(session, sock)))
                }
                wrapped => wrapped,
            };
        }

        self.parser = Some(RequestParser::new(&self.cfg));
        self.initialized = true;
        Ok(self)
    }

    /// Whether the parser holds unparsed (pipelined) request bytes.
    pub(crate) fn has_buffered_input(&self) -> bool {
        self.parser.as_ref().is_some_and(|p| p.has_buffered())
    }

    /// Close the socket, swallowing already-closed errors.
    pub(crate) fn close(self) {
        if let Err(err) = self.stream.shutdown(Shutdown::Both) {
            trace!("shutdown on close: {}", err);
        }
        // dropping the stream releases the descriptor
    }
}
