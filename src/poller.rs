//! Readiness poller.
//!
//! A thin wrapper over level-triggered `poll(2)`. The registration table
//! maps a file descriptor to a [`Watch`]: what to do when it turns
//! readable. Listener entries carry an index into the worker's listeners;
//! client entries own the [`Conn`] itself, so the table doubles as the home
//! of every connection that is waiting for I/O. A descriptor appears at
//! most once.
//!
//! Waiting is split from the table: the dispatcher snapshots the watched
//! descriptors under the worker mutex, blocks in [`wait`] without it, and
//! resolves the ready set back through the table under the mutex again.
//! Registrations racing with a wait are picked up on the next loop tick.

use std::collections::HashMap;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::conn::Conn;

/// What a readable descriptor means.
#[derive(Debug)]
pub(crate) enum Watch {
    /// A listening socket: accept once. The index selects the listener.
    Accept(usize),
    /// A client socket waiting for (the next) request data.
    Client(Conn),
}

#[derive(Debug, Default)]
pub(crate) struct Poller {
    table: HashMap<RawFd, Watch>,
    closed: bool,
}

impl Poller {
    pub(crate) fn new() -> Poller {
        Poller {
            table: HashMap::new(),
            closed: false,
        }
    }

    /// True once [`close`](Poller::close) ran; late completion callbacks
    /// check this before re-registering a connection.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn register(&mut self, fd: RawFd, watch: Watch) {
        debug_assert!(
            !self.table.contains_key(&fd),
            "fd {fd} registered twice with the poller"
        );
        self.table.insert(fd, watch);
    }

    /// Remove a registration. Unknown descriptors are tolerated: a racing
    /// reaper or readable-path may already have taken the entry.
    pub(crate) fn unregister(&mut self, fd: RawFd) -> Option<Watch> {
        self.table.remove(&fd)
    }

    pub(crate) fn get(&self, fd: RawFd) -> Option<&Watch> {
        self.table.get(&fd)
    }

    /// Snapshot of all watched descriptors, for a [`wait`] call.
    pub(crate) fn watched(&self) -> Vec<RawFd> {
        self.table.keys().copied().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.table.len()
    }

    /// Drop every registration, closing any owned connections.
    pub(crate) fn close(&mut self) {
        self.closed = true;
        for (_, watch) in self.table.drain() {
            if let Watch::Client(conn) = watch {
                conn.close();
            }
        }
    }
}

/// Block until one of `fds` is readable or the timeout elapses.
///
/// Returns the ready descriptors. An interrupting signal yields an empty
/// set; the dispatch loop observes its flags on the way around.
pub(crate) fn wait(fds: &[RawFd], timeout: Duration) -> crate::Result<Vec<RawFd>> {
    let mut pollfds: Vec<PollFd<'_>> = fds
        .iter()
        .map(|&fd| {
            // Table entries hold the owning socket, so the descriptor is
            // open for the duration of the call.
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            PollFd::new(borrowed, PollFlags::POLLIN)
        })
        .collect();

    let ms = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
    match poll(&mut pollfds, PollTimeout::from(ms)) {
        Ok(0) => Ok(Vec::new()),
        Ok(_) => Ok(fds
            .iter()
            .zip(&pollfds)
            .filter(|(_, pfd)| pfd.revents().is_some_and(|r| !r.is_empty()))
            .map(|(&fd, _)| fd)
            .collect()),
        Err(Errno::EINTR) => Ok(Vec::new()),
        Err(err) => Err(crate::Error::new_poll(err)),
    }
}
