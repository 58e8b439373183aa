//! The request turn: parse, invoke the application, write the response,
//! decide whether the connection can be reused.
//!
//! Runs on an executor thread with exclusive ownership of one connection.
//! Every failure is resolved here to a reuse decision; nothing but a panic
//! escapes to the completion callback.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use http::StatusCode;
use tracing::{debug, error, info};

use super::Shared;
use crate::app::{AppBody, BoxError, Environ};
use crate::conn::{Conn, Stream};
use crate::proto::{self, BodyReader, Request, RequestParser, Response};

enum TurnError {
    /// Socket-level failure; the peer may simply be gone.
    Io(io::Error),
    /// Application failure, from the handler itself or its body iterator.
    App { err: BoxError, headers_sent: bool },
}

/// Run one request turn. Returns whether the connection may be kept alive.
pub(crate) fn handle(shared: &Shared, conn: &mut Conn) -> bool {
    let peer = conn.peer;
    let server = conn.server;
    let Conn { stream, parser, .. } = conn;
    let Some(parser) = parser.as_mut() else {
        return false;
    };

    let req = match parser.next(stream) {
        Ok(Some(req)) => req,
        Ok(None) => {
            debug!("closing connection");
            return false;
        }
        Err(err) if err.is_incomplete_message() => {
            debug!("ignored premature client disconnection: {}", err);
            return false;
        }
        Err(err) if err.is_io() => {
            // a TLS protocol failure surfaces as InvalidData; try to say
            // something to the peer before giving up on the socket
            if err.io_kind() == Some(io::ErrorKind::InvalidData) {
                debug!("error processing TLS request: {}", err);
                proto::write_error_response(stream, StatusCode::INTERNAL_SERVER_ERROR);
            } else {
                log_socket_error(err.io_kind(), &err);
            }
            return false;
        }
        Err(err) => {
            debug!("invalid request from {}: {}", peer, err);
            proto::write_error_response(stream, proto::error_status(&err));
            return false;
        }
    };

    match turn(shared, &req, parser, stream, peer, server) {
        Ok(keepalive) => keepalive,
        Err(TurnError::Io(err)) => {
            log_socket_error(Some(err.kind()), &err);
            false
        }
        Err(TurnError::App { err, headers_sent }) => {
            error!("error handling request from {}: {}", peer, err);
            if headers_sent {
                // The response framing can no longer be trusted; cut the
                // connection so the client sees the failure.
                let _ = stream.shutdown(Shutdown::Both);
            } else {
                proto::write_error_response(stream, StatusCode::INTERNAL_SERVER_ERROR);
            }
            false
        }
    }
}

fn turn(
    shared: &Shared,
    req: &Request,
    parser: &mut RequestParser,
    stream: &mut Stream,
    peer: SocketAddr,
    server: SocketAddr,
) -> Result<bool, TurnError> {
    let cfg = &shared.cfg;

    {
        let hook = cfg.pre_request.as_ref();
        if catch_unwind(AssertUnwindSafe(|| hook(req))).is_err() {
            error!("exception in pre_request hook");
        }
    }

    let start = Instant::now();
    let mut resp = Response::new(req);

    let nr = shared.nr.fetch_add(1, Ordering::SeqCst) + 1;
    if cfg.max_requests > 0 && nr >= cfg.max_requests {
        if shared.alive.swap(false, Ordering::SeqCst) {
            info!("autorestarting worker after current request");
        }
        resp.force_close();
    }

    if !shared.is_alive() || !cfg.keepalive_enabled() {
        resp.force_close();
    } else if shared.state.lock().keep.len() >= cfg.max_keepalived() {
        resp.force_close();
    }

    let produced = {
        let mut body = BodyReader::new(parser, stream);
        let mut env = Environ::new(req, peer, server, &mut body);
        shared.app.call(&mut env, &mut resp)
    };

    match produced {
        Ok(app_body) => {
            let wrote = write_body(&mut resp, stream, app_body)
                .and_then(|()| resp.close(stream).map_err(TurnError::Io));

            // a request body left unread poisons the framing for reuse
            if !parser.body_consumed() {
                resp.force_close();
            }

            access_log(req, &resp, peer, start.elapsed());
            run_post_request(shared, req);

            wrote?;

            if resp.should_close() {
                debug!("closing connection");
                Ok(false)
            } else {
                Ok(true)
            }
        }
        Err(err) => {
            run_post_request(shared, req);
            Err(TurnError::App {
                err,
                headers_sent: resp.headers_sent(),
            })
        }
    }
}

fn write_body(
    resp: &mut Response,
    stream: &mut Stream,
    body: AppBody,
) -> Result<(), TurnError> {
    match body {
        AppBody::File(mut file) => resp.write_file(stream, &mut file).map_err(TurnError::Io),
        AppBody::Iter(iter) => {
            for item in iter {
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        return Err(TurnError::App {
                            err: Box::new(err),
                            headers_sent: resp.headers_sent(),
                        });
                    }
                };
                resp.write(stream, &chunk).map_err(TurnError::Io)?;
            }
            Ok(())
        }
    }
}

fn run_post_request(shared: &Shared, req: &Request) {
    let hook = shared.cfg.post_request.as_ref();
    if catch_unwind(AssertUnwindSafe(|| hook(req))).is_err() {
        error!("exception in post_request hook");
    }
}

fn access_log(req: &Request, resp: &Response, peer: SocketAddr, elapsed: Duration) {
    info!(
        target: "stoker::access",
        remote = %peer,
        method = %req.method(),
        uri = %req.uri(),
        status = resp.status().as_u16(),
        bytes = resp.bytes_sent(),
        elapsed_ms = elapsed.as_millis() as u64,
        "request"
    );
}

fn log_socket_error(kind: Option<io::ErrorKind>, err: &dyn std::fmt::Display) {
    match kind {
        Some(io::ErrorKind::BrokenPipe) => debug!("ignoring connection epipe"),
        Some(io::ErrorKind::ConnectionReset) => debug!("ignoring connection reset"),
        Some(io::ErrorKind::NotConnected) => debug!("ignoring socket not connected"),
        Some(io::ErrorKind::UnexpectedEof) => debug!("connection closed mid stream"),
        _ => error!("socket error processing request: {}", err),
    }
}
