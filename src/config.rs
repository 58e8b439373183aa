//! Per-worker configuration.
//!
//! A [`Config`] is an immutable snapshot consumed once at worker
//! construction. It is built with a [`ConfigBuilder`], which applies the
//! defaults a supervising process would normally pass down and validates the
//! handful of hard requirements (at least one executor thread, a positive
//! connection cap).

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::proto::Request;

#[cfg(feature = "tls")]
use crate::tls::ServerTlsConfig;

/// Hook invoked just before a request is handed to the application.
pub type PreRequestHook = Arc<dyn Fn(&Request) + Send + Sync>;

/// Hook invoked after a request has been handled and logged.
pub type PostRequestHook = Arc<dyn Fn(&Request) + Send + Sync>;

/// Hook invoked when the worker is told to quit.
pub type WorkerIntHook = Arc<dyn Fn() + Send + Sync>;

/// Read-only worker configuration snapshot.
pub struct Config {
    pub(crate) threads: usize,
    pub(crate) worker_connections: usize,
    pub(crate) keepalive: Duration,
    pub(crate) max_requests: usize,
    pub(crate) graceful_timeout: Duration,
    pub(crate) umask: u32,
    pub(crate) uid: Option<u32>,
    pub(crate) gid: Option<u32>,
    pub(crate) worker_tmp_dir: Option<PathBuf>,
    pub(crate) proc_name: String,
    pub(crate) max_header_count: usize,
    pub(crate) max_head_size: usize,
    pub(crate) pre_request: PreRequestHook,
    pub(crate) post_request: PostRequestHook,
    pub(crate) worker_int: WorkerIntHook,
    #[cfg(feature = "tls")]
    pub(crate) tls: Option<ServerTlsConfig>,
}

impl Config {
    /// Start building a configuration.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Number of executor threads.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Hard cap on connections owned by the worker.
    pub fn worker_connections(&self) -> usize {
        self.worker_connections
    }

    /// How long an idle connection may wait for its next request. Zero
    /// disables keepalive.
    pub fn keepalive(&self) -> Duration {
        self.keepalive
    }

    /// Request budget after which the worker retires itself. Zero disables.
    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// How long shutdown waits for in-flight requests.
    pub fn graceful_timeout(&self) -> Duration {
        self.graceful_timeout
    }

    /// Whether client sockets are wrapped in TLS.
    #[cfg(feature = "tls")]
    pub fn is_ssl(&self) -> bool {
        self.tls.is_some()
    }

    pub(crate) fn keepalive_enabled(&self) -> bool {
        !self.keepalive.is_zero()
    }

    /// Maximum size of the keepalive set: `worker_connections - threads`.
    pub(crate) fn max_keepalived(&self) -> usize {
        self.worker_connections.saturating_sub(self.threads)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("threads", &self.threads)
            .field("worker_connections", &self.worker_connections)
            .field("keepalive", &self.keepalive)
            .field("max_requests", &self.max_requests)
            .field("graceful_timeout", &self.graceful_timeout)
            .field("proc_name", &self.proc_name)
            .finish()
    }
}

/// Builder for [`Config`].
pub struct ConfigBuilder {
    threads: usize,
    worker_connections: usize,
    keepalive: Duration,
    max_requests: usize,
    graceful_timeout: Duration,
    umask: u32,
    uid: Option<u32>,
    gid: Option<u32>,
    worker_tmp_dir: Option<PathBuf>,
    proc_name: String,
    max_header_count: usize,
    max_head_size: usize,
    pre_request: PreRequestHook,
    post_request: PostRequestHook,
    worker_int: WorkerIntHook,
    #[cfg(feature = "tls")]
    tls: Option<ServerTlsConfig>,
}

impl ConfigBuilder {
    fn new() -> ConfigBuilder {
        ConfigBuilder {
            threads: 1,
            worker_connections: 1000,
            keepalive: Duration::from_secs(2),
            max_requests: 0,
            graceful_timeout: Duration::from_secs(30),
            umask: 0,
            uid: None,
            gid: None,
            worker_tmp_dir: None,
            proc_name: "stoker".to_owned(),
            max_header_count: 100,
            max_head_size: 8190 * 4,
            pre_request: Arc::new(|_| ()),
            post_request: Arc::new(|_| ()),
            worker_int: Arc::new(|| ()),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// Set the executor pool size. Must be at least 1.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Set the cap on connections owned by the worker. Must be positive.
    pub fn worker_connections(mut self, n: usize) -> Self {
        self.worker_connections = n;
        self
    }

    /// Set the keepalive interval. `Duration::ZERO` disables keepalive.
    pub fn keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = interval;
        self
    }

    /// Set the request budget after which the worker retires. Zero disables.
    pub fn max_requests(mut self, n: usize) -> Self {
        self.max_requests = n;
        self
    }

    /// Set how long shutdown waits for in-flight requests.
    pub fn graceful_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_timeout = timeout;
        self
    }

    /// File-creation mask applied while the beacon file is created.
    pub fn umask(mut self, umask: u32) -> Self {
        self.umask = umask;
        self
    }

    /// Owner for the beacon file, when the worker runs as another user.
    pub fn uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }

    /// Group for the beacon file, when the worker runs as another group.
    pub fn gid(mut self, gid: u32) -> Self {
        self.gid = Some(gid);
        self
    }

    /// Directory for the beacon file. Defaults to the platform temp dir.
    pub fn worker_tmp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.worker_tmp_dir = Some(dir.into());
        self
    }

    /// Process name used for executor thread names and the access log.
    pub fn proc_name(mut self, name: impl Into<String>) -> Self {
        self.proc_name = name.into();
        self
    }

    /// Maximum number of request headers accepted.
    pub fn max_header_count(mut self, n: usize) -> Self {
        self.max_header_count = n;
        self
    }

    /// Maximum size in bytes of a request head.
    pub fn max_head_size(mut self, n: usize) -> Self {
        self.max_head_size = n;
        self
    }

    /// Hook invoked before each request is handed to the application.
    pub fn pre_request<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Request) + Send + Sync + 'static,
    {
        self.pre_request = Arc::new(hook);
        self
    }

    /// Hook invoked after each request, including failed ones.
    pub fn post_request<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Request) + Send + Sync + 'static,
    {
        self.post_request = Arc::new(hook);
        self
    }

    /// Hook invoked when the worker is told to quit.
    pub fn worker_int<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.worker_int = Arc::new(hook);
        self
    }

    /// Wrap client sockets in TLS with the given certificate and key.
    #[cfg(feature = "tls")]
    pub fn tls(mut self, tls: ServerTlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Validate and freeze the configuration.
    pub fn build(self) -> crate::Result<Config> {
        if self.threads == 0 {
            return Err(crate::Error::new_config("threads must be at least 1"));
        }
        if self.worker_connections == 0 {
            return Err(crate::Error::new_config(
                "worker_connections must be positive",
            ));
        }
        if self.max_header_count == 0 || self.max_head_size == 0 {
            return Err(crate::Error::new_config("header limits must be positive"));
        }
        Ok(Config {
            threads: self.threads,
            worker_connections: self.worker_connections,
            keepalive: self.keepalive,
            max_requests: self.max_requests,
            graceful_timeout: self.graceful_timeout,
            umask: self.umask,
            uid: self.uid,
            gid: self.gid,
            worker_tmp_dir: self.worker_tmp_dir,
            proc_name: self.proc_name,
            max_header_count: self.max_header_count,
            max_head_size: self.max_head_size,
            pre_request: self.pre_request,
            post_request: self.post_request,
            worker_int: self.worker_int,
            #[cfg(feature = "tls")]
            tls: self.tls,
        })
    }
}

impl fmt::Debug for ConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigBuilder")
            .field("threads", &self.threads)
            .field("worker_connections", &self.worker_connections)
            .finish()
    }
}
