#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # stoker
//!
//! stoker is the core of a pre-forked, threaded HTTP worker: the piece of a
//! long-lived application server that owns one process, a pool of request
//! threads, and the connections between them.
//!
//! A [`Worker`] inherits one or more bound listeners from its supervising
//! process, accepts connections on its main thread, and hands each request
//! to a bounded executor pool. Idle keepalive connections go back to a
//! central readiness poller with a deadline; a reaper closes the ones whose
//! next request never comes. A liveness beacon file lets the supervisor
//! spot a hung worker by its mtime.
//!
//! ## Example
//!
//! ```no_run
//! use std::net::TcpListener;
//!
//! use http::{HeaderMap, StatusCode};
//! use stoker::{AppBody, Config, Worker};
//!
//! fn app(
//!     _env: &mut stoker::Environ<'_>,
//!     resp: &mut stoker::Response,
//! ) -> Result<AppBody, stoker::BoxError> {
//!     let mut headers = HeaderMap::new();
//!     headers.insert(http::header::CONTENT_LENGTH, "2".parse()?);
//!     resp.start_response(StatusCode::OK, headers);
//!     Ok(AppBody::from("hi"))
//! }
//!
//! let cfg = Config::builder()
//!     .threads(4)
//!     .worker_connections(256)
//!     .build()?;
//!
//! let listener = TcpListener::bind("127.0.0.1:8000")?;
//! Worker::new(cfg, app, vec![listener])?.run()?;
//! # Ok::<_, Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Scope
//!
//! stoker is the worker only. Forking and supervising workers, daemonizing,
//! and command-line handling belong to the process that spawns it; HTTP
//! semantics beyond request framing belong to the application.

#[doc(no_inline)]
pub use http::{HeaderMap, Method, StatusCode, Uri, Version};

pub use crate::app::{AppBody, Application, BoxError, Environ};
pub use crate::beacon::Beacon;
pub use crate::config::{Config, ConfigBuilder, PostRequestHook, PreRequestHook, WorkerIntHook};
pub use crate::error::{Error, Result};
pub use crate::proto::{BodyReader, Request, Response};
pub use crate::worker::{install_signal_handlers, SignalFlags, Worker, WorkerHandle};

#[cfg(feature = "tls")]
#[cfg_attr(docsrs, doc(cfg(feature = "tls")))]
pub use crate::tls::ServerTlsConfig;

mod app;
mod beacon;
mod config;
mod conn;
mod error;
mod executor;
mod keepalive;
mod poller;
mod proto;
#[cfg(feature = "tls")]
mod tls;
mod worker;
