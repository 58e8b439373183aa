//! The worker: acceptor, dispatch loop, completion handling, shutdown.
//!
//! One dispatcher thread owns the poller, the keepalive set and the
//! connection count; a bounded executor pool owns request turns. The two
//! meet in the completion callback, which runs on the finishing pool thread
//! under the worker mutex.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, RawFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel as chan;
use nix::unistd::{getppid, Pid};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::app::Application;
use crate::beacon::Beacon;
use crate::config::Config;
use crate::conn::{Conn, TlsContext};
use crate::executor::{Executor, Task};
use crate::keepalive::Keepalive;
use crate::poller::{self, Poller, Watch};

mod handler;
mod signal;

pub use self::signal::{install_signal_handlers, SignalFlags};

/// How long one dispatch-loop iteration may wait for I/O or completions.
const LOOP_TIMEOUT: Duration = Duration::from_secs(1);
/// Pause before a quick quit returns, letting log writers drain.
const QUIT_LINGER: Duration = Duration::from_millis(100);

/// Everything guarded by the worker mutex: poller registrations, keepalive
/// order, and the connection count. The three move together; splitting the
/// lock would let a reaped connection be handed to the executor.
pub(crate) struct State {
    pub(crate) poller: Poller,
    pub(crate) keep: Keepalive,
    pub(crate) nr_conns: usize,
    /// Parked connections that already hold buffered (pipelined) request
    /// bytes. `poll` cannot see those, so the dispatcher drains this list.
    ready_backlog: Vec<RawFd>,
}

pub(crate) struct Shared {
    pub(crate) cfg: Arc<Config>,
    pub(crate) app: Arc<dyn Application>,
    pub(crate) alive: AtomicBool,
    quit: AtomicBool,
    /// Requests handled so far, for `max_requests` retirement.
    pub(crate) nr: AtomicUsize,
    pub(crate) state: Mutex<State>,
    beacon: Beacon,
    pub(crate) tls: TlsContext,
}

enum Outcome {
    Complete { keepalive: bool, conn: Conn },
    Failed(Conn),
    Cancelled(Conn),
}

impl Shared {
    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Completion callback, run on the pool thread that finished the turn.
    fn finish_request(&self, outcome: Outcome) {
        match outcome {
            Outcome::Cancelled(conn) | Outcome::Failed(conn) => {
                self.state.lock().nr_conns -= 1;
                conn.close();
            }
            Outcome::Complete { keepalive, conn } => {
                if keepalive && self.is_alive() {
                    self.keep_alive(conn);
                } else {
                    self.state.lock().nr_conns -= 1;
                    conn.close();
                }
            }
        }
    }

    /// Return a connection to the poller for its next request.
    fn keep_alive(&self, conn: Conn) {
        if let Err(err) = conn.stream.set_nonblocking(true) {
            debug!("could not return connection to the poller: {}", err);
            self.state.lock().nr_conns -= 1;
            conn.close();
            return;
        }

        let deadline = Instant::now() + self.cfg.keepalive;
        let fd = conn.fd();
        let buffered = conn.has_buffered_input();
        let mut state = self.state.lock();
        if state.poller.is_closed() {
            state.nr_conns -= 1;
            drop(state);
            conn.close();
        } else if state.keep.len() < self.cfg.max_keepalived() {
            state.keep.push(fd, deadline);
            state.poller.register(fd, Watch::Client(conn));
            if buffered {
                // pipelined bytes already sit in the parser; poll would
                // never report them
                state.ready_backlog.push(fd);
            }
        } else {
            // the set filled up while this turn was finishing
            state.nr_conns -= 1;
            drop(state);
            conn.close();
        }
    }
}

/// A single pre-forked worker: accepts connections from inherited
/// listeners, dispatches request turns to a bounded thread pool, reuses
/// idle connections, and pings a liveness beacon for its supervisor.
///
/// Construct with [`Worker::new`], then call [`Worker::run`] on a dedicated
/// thread (or as the process main). `run` returns when the worker was told
/// to stop, retired itself after `max_requests`, or hit a fatal error.
pub struct Worker {
    shared: Arc<Shared>,
    executor: Executor,
    listeners: Vec<TcpListener>,
    servers: Vec<SocketAddr>,
    futures: VecDeque<u64>,
    done_tx: chan::Sender<u64>,
    done_rx: chan::Receiver<u64>,
    next_task: u64,
    ppid: Pid,
}

/// Cloneable remote control for a running [`Worker`].
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<Shared>,
}

enum Exit {
    Graceful,
    Quick,
}

impl Worker {
    /// Build a worker from its configuration, application, and the bound
    /// listeners inherited from the supervising process.
    pub fn new<A: Application>(
        cfg: Config,
        app: A,
        listeners: Vec<TcpListener>,
    ) -> crate::Result<Worker> {
        if listeners.is_empty() {
            return Err(crate::Error::new_config("at least one listener is required"));
        }
        if cfg.max_keepalived() == 0 && cfg.keepalive_enabled() {
            warn!(
                "no keepalived connections can be handled, \
                 check the number of worker connections and threads"
            );
        }

        let cfg = Arc::new(cfg);
        let beacon = Beacon::new(&cfg)?;
        let executor = Executor::new(cfg.threads, &cfg.proc_name)?;

        #[cfg(feature = "tls")]
        let tls = match &cfg.tls {
            Some(tls) => Some(tls.build()?),
            None => None,
        };
        #[cfg(not(feature = "tls"))]
        let tls = ();

        let (done_tx, done_rx) = chan::unbounded();
        let shared = Arc::new(Shared {
            cfg: Arc::clone(&cfg),
            app: Arc::new(app),
            alive: AtomicBool::new(true),
            quit: AtomicBool::new(false),
            nr: AtomicUsize::new(0),
            state: Mutex::new(State {
                poller: Poller::new(),
                keep: Keepalive::new(),
                nr_conns: 0,
                ready_backlog: Vec::new(),
            }),
            beacon,
            tls,
        });

        Ok(Worker {
            shared,
            executor,
            listeners,
            servers: Vec::new(),
            futures: VecDeque::new(),
            done_tx,
            done_rx,
            next_task: 0,
            ppid: getppid(),
        })
    }

    /// A handle for observing and stopping the worker from another thread.
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// The worker's liveness beacon.
    pub fn beacon(&self) -> &Beacon {
        &self.shared.beacon
    }

    /// Handles to the stop flags the dispatch loop watches.
    ///
    /// [`run`](Worker::run) installs handlers for SIGTERM/SIGQUIT/SIGINT
    /// that flip these flags. A host binary that owns signal disposition
    /// itself can deliver the same stops by flipping them here instead.
    pub fn signal_flags(&self) -> SignalFlags {
        SignalFlags::new()
    }

    /// Run the dispatch loop until the worker stops.
    ///
    /// Installs the worker's signal handlers, registers the listeners with
    /// the poller, then loops: ping the beacon, poll for accepts and
    /// keepalive readability (or, when at the connection cap, wait only for
    /// a turn to finish), reap completed turns, check the parent, reap
    /// expired keepalive connections. On the way out the executor stops
    /// accepting work, listeners close, and in-flight turns get
    /// `graceful_timeout` to finish.
    pub fn run(mut self) -> crate::Result<()> {
        install_signal_handlers()?;

        info!(
            "booting worker: {} threads, {} worker_connections",
            self.shared.cfg.threads, self.shared.cfg.worker_connections
        );

        self.servers = Vec::with_capacity(self.listeners.len());
        for (idx, listener) in self.listeners.iter().enumerate() {
            listener
                .set_nonblocking(true)
                .map_err(crate::Error::new_listen)?;
            // capture the name once; a graceful shutdown can make it
            // unavailable while requests are still being handled
            let server = listener.local_addr().map_err(crate::Error::new_listen)?;
            self.servers.push(server);
            self.shared
                .state
                .lock()
                .poller
                .register(listener.as_raw_fd(), Watch::Accept(idx));
        }

        let exit = self.dispatch_loop();

        // late completions must not re-enter the keepalive set
        self.shared.alive.store(false, Ordering::SeqCst);
        self.executor.shutdown();
        self.shared.state.lock().poller.close();
        self.listeners.clear();

        match exit {
            Ok(Exit::Quick) => Ok(()),
            Ok(Exit::Graceful) => {
                self.wait_graceful();
                Ok(())
            }
            Err(err) => {
                error!("worker loop failed: {}", err);
                self.wait_graceful();
                Err(err)
            }
        }
    }

    fn dispatch_loop(&mut self) -> crate::Result<Exit> {
        while self.shared.is_alive() {
            self.shared.beacon.notify()?;

            if signal::take_quit() || self.shared.quit.swap(false, Ordering::SeqCst) {
                self.quick_quit();
                return Ok(Exit::Quick);
            }
            if signal::take_term() {
                info!("worker received term, stopping gracefully");
                self.shared.alive.store(false, Ordering::SeqCst);
                continue;
            }

            let nr_conns = self.shared.state.lock().nr_conns;
            if nr_conns < self.shared.cfg.worker_connections {
                let (watched, backlog) = {
                    let mut state = self.shared.state.lock();
                    let watched = state.poller.watched();
                    let backlog = std::mem::take(&mut state.ready_backlog);
                    (watched, backlog)
                };
                // buffered pipelined requests trump the poll; don't sleep
                // while they wait
                let timeout = if backlog.is_empty() {
                    LOOP_TIMEOUT
                } else {
                    Duration::ZERO
                };
                for fd in backlog {
                    self.dispatch(fd)?;
                }
                for fd in poller::wait(&watched, timeout)? {
                    self.dispatch(fd)?;
                }
                self.reap_completions(None);
            } else {
                // saturated: let the listen backlog absorb demand and wait
                // for a turn to finish
                self.reap_completions(Some(LOOP_TIMEOUT));
            }

            if !self.is_parent_alive() {
                break;
            }

            self.reap_keepalived(Instant::now());
        }
        Ok(Exit::Graceful)
    }

    /// Resolve one readable descriptor to its action.
    fn dispatch(&mut self, fd: RawFd) -> crate::Result<()> {
        enum Action {
            Accept(usize),
            Submit(Conn),
            Stale,
        }

        let action = {
            let mut state = self.shared.state.lock();
            match state.poller.get(fd) {
                Some(Watch::Accept(idx)) => Action::Accept(*idx),
                Some(Watch::Client(_)) => match state.poller.unregister(fd) {
                    Some(Watch::Client(conn)) => {
                        if conn.initialized {
                            // the unregister and this removal must be one
                            // unit, or a reaper could close the socket we
                            // are about to hand to the executor
                            state.keep.remove(fd);
                        }
                        Action::Submit(conn)
                    }
                    _ => Action::Stale,
                },
                None => Action::Stale,
            }
        };

        match action {
            Action::Accept(idx) => self.accept(idx),
            Action::Submit(conn) => {
                self.enqueue(conn);
                Ok(())
            }
            Action::Stale => {
                trace!("event for unknown fd {}", fd);
                Ok(())
            }
        }
    }

    /// Accept once from a ready listener and register the connection.
    fn accept(&mut self, idx: usize) -> crate::Result<()> {
        let server = self.servers[idx];
        match self.listeners[idx].accept() {
            Ok((sock, peer)) => {
                let conn = Conn::new(Arc::clone(&self.shared.cfg), sock, peer, server)
                    .map_err(crate::Error::new_accept)?;
                let fd = conn.fd();
                let mut state = self.shared.state.lock();
                state.nr_conns += 1;
                state.poller.register(fd, Watch::Client(conn));
                Ok(())
            }
            Err(err) if ignorable_accept(&err) => {
                trace!("accept skipped: {}", err);
                Ok(())
            }
            Err(err) => Err(crate::Error::new_accept(err)),
        }
    }

    /// Initialize a readable connection and submit its request turn.
    fn enqueue(&mut self, conn: Conn) {
        let conn = match conn.init(&self.shared.tls) {
            Ok(conn) => conn,
            Err(err) => {
                error!("failed to initialize connection: {}", err);
                self.shared.state.lock().nr_conns -= 1;
                return;
            }
        };

        let id = self.next_task;
        self.next_task += 1;
        let shared = Arc::clone(&self.shared);
        let done = self.done_tx.clone();

        let task = Task::new(move |cancelled| {
            if cancelled {
                shared.finish_request(Outcome::Cancelled(conn));
            } else {
                let mut conn = conn;
                let outcome =
                    match catch_unwind(AssertUnwindSafe(|| handler::handle(&shared, &mut conn)))
                    {
                        Ok(keepalive) => Outcome::Complete { keepalive, conn },
                        Err(_) => {
                            error!("panic while handling request");
                            Outcome::Failed(conn)
                        }
                    };
                shared.finish_request(outcome);
            }
            let _ = done.send(id);
        });

        self.futures.push_back(id);
        if let Err(task) = self.executor.submit(task) {
            debug!("executor is shut down, cancelling request turn");
            task.cancel();
        }
    }

    /// Remove finished turns from the tracking deque. With a timeout, block
    /// up to that long for the first completion.
    fn reap_completions(&mut self, timeout: Option<Duration>) {
        let mut finished = Vec::new();
        if let Some(timeout) = timeout {
            if let Ok(id) = self.done_rx.recv_timeout(timeout) {
                finished.push(id);
            }
        }
        while let Ok(id) = self.done_rx.try_recv() {
            finished.push(id);
        }
        for id in finished {
            if let Some(pos) = self.futures.iter().position(|&f| f == id) {
                self.futures.remove(pos);
            }
        }
    }

    /// Close idle connections whose keepalive deadline has passed, in
    /// deadline order.
    fn reap_keepalived(&mut self, now: Instant) {
        let mut doomed = Vec::new();
        {
            let mut state = self.shared.state.lock();
            while let Some(fd) = state.keep.pop_expired(now) {
                match state.poller.unregister(fd) {
                    Some(Watch::Client(conn)) => {
                        state.nr_conns -= 1;
                        doomed.push(conn);
                    }
                    Some(other) => {
                        // not a client entry; put it back untouched
                        state.poller.register(fd, other);
                    }
                    None => {}
                }
            }
        }
        for conn in doomed {
            trace!("keepalive timeout, closing connection from {}", conn.peer);
            conn.close();
        }
    }

    fn is_parent_alive(&self) -> bool {
        let ppid = getppid();
        if ppid != self.ppid {
            info!("parent changed ({} -> {}), shutting down", self.ppid, ppid);
            return false;
        }
        true
    }

    /// Quick quit: run the interrupt hook, stop the executor without
    /// waiting, and give the log writers a moment.
    fn quick_quit(&mut self) {
        info!("worker received quit");
        self.shared.alive.store(false, Ordering::SeqCst);
        let hook = self.shared.cfg.worker_int.as_ref();
        if catch_unwind(AssertUnwindSafe(|| hook())).is_err() {
            error!("exception in worker_int hook");
        }
        self.executor.shutdown();
        thread::sleep(QUIT_LINGER);
    }

    /// Wait up to `graceful_timeout` for in-flight turns to finish.
    fn wait_graceful(&mut self) {
        if self.futures.is_empty() {
            return;
        }
        debug!(
            "waiting up to {:?} for {} in-flight requests",
            self.shared.cfg.graceful_timeout,
            self.futures.len()
        );
        let deadline = Instant::now() + self.shared.cfg.graceful_timeout;
        while !self.futures.is_empty() {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            match self.done_rx.recv_timeout(remaining) {
                Ok(id) => {
                    if let Some(pos) = self.futures.iter().position(|&f| f == id) {
                        self.futures.remove(pos);
                    }
                }
                Err(_) => break,
            }
        }
        if !self.futures.is_empty() {
            warn!(
                "{} requests still in flight after graceful timeout",
                self.futures.len()
            );
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("cfg", &self.shared.cfg)
            .field("listeners", &self.listeners)
            .field("in_flight", &self.futures.len())
            .finish()
    }
}

impl WorkerHandle {
    /// Ask the worker to stop after the current loop iteration; in-flight
    /// requests get the graceful timeout.
    pub fn graceful_stop(&self) {
        self.shared.alive.store(false, Ordering::SeqCst);
    }

    /// Ask the worker to quit quickly, as a quit signal would: pending
    /// turns are cancelled and nothing waits for the in-flight ones.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::SeqCst);
    }

    /// Whether the worker still intends to serve requests.
    pub fn is_alive(&self) -> bool {
        self.shared.is_alive()
    }

    /// Connections currently owned by the worker.
    pub fn active_connections(&self) -> usize {
        self.shared.state.lock().nr_conns
    }

    /// Idle connections parked in the keepalive set.
    pub fn idle_connections(&self) -> usize {
        self.shared.state.lock().keep.len()
    }

    /// When the worker last pinged its liveness beacon, as monotonic-clock
    /// seconds. This is what a supervising process would stat.
    pub fn last_heartbeat(&self) -> crate::Result<Duration> {
        self.shared.beacon.last_update()
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("alive", &self.is_alive())
            .finish()
    }
}

fn ignorable_accept(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::ConnectionAborted
    ) || err.raw_os_error() == Some(libc::ECONNABORTED)
}
