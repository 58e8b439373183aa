//! Signal handling.
//!
//! Handlers are async-signal-safe flag flips, nothing more. The dispatch
//! loop observes the flags once per iteration and runs the actual quit or
//! stop sequence on its own thread. A host that owns signal disposition
//! for the whole process can skip [`install_signal_handlers`] and flip the
//! flags itself through [`SignalFlags`].

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

/// Graceful stop requested (SIGTERM).
static TERM: AtomicBool = AtomicBool::new(false);
/// Quick quit requested (SIGQUIT, SIGINT).
static QUIT: AtomicBool = AtomicBool::new(false);

extern "C" fn on_term(_: libc::c_int) {
    TERM.store(true, Ordering::SeqCst);
}

extern "C" fn on_quit(_: libc::c_int) {
    QUIT.store(true, Ordering::SeqCst);
}

/// Install the worker's signal handlers, clearing any stale flags first.
///
/// SIGTERM requests a graceful stop; SIGQUIT and SIGINT request a quick
/// quit. [`Worker::run`][crate::Worker::run] calls this on entry; a host
/// binary that manages signals itself can instead deliver stops through
/// the [`SignalFlags`] it gets from
/// [`Worker::signal_flags`][crate::Worker::signal_flags].
pub fn install_signal_handlers() -> crate::Result<()> {
    TERM.store(false, Ordering::SeqCst);
    QUIT.store(false, Ordering::SeqCst);

    let term = SigAction::new(SigHandler::Handler(on_term), SaFlags::empty(), SigSet::empty());
    let quit = SigAction::new(SigHandler::Handler(on_quit), SaFlags::empty(), SigSet::empty());

    unsafe {
        sigaction(Signal::SIGTERM, &term).map_err(crate::Error::new_signal)?;
        sigaction(Signal::SIGQUIT, &quit).map_err(crate::Error::new_signal)?;
        sigaction(Signal::SIGINT, &quit).map_err(crate::Error::new_signal)?;
    }
    Ok(())
}

/// Handles to the stop flags a worker's dispatch loop watches.
///
/// The flags are what the built-in signal handlers flip; a host with its
/// own signal handling sets them from wherever it dispatches signals.
/// They are process-wide, like signal disposition itself: every worker
/// running in the process observes them.
#[derive(Debug, Clone, Copy)]
pub struct SignalFlags {
    _priv: (),
}

impl SignalFlags {
    pub(crate) fn new() -> SignalFlags {
        SignalFlags { _priv: () }
    }

    /// Request a graceful stop, as SIGTERM would.
    pub fn request_term(&self) {
        TERM.store(true, Ordering::SeqCst);
    }

    /// Request a quick quit, as SIGQUIT would.
    pub fn request_quit(&self) {
        QUIT.store(true, Ordering::SeqCst);
    }

    /// Whether a graceful stop is pending and not yet observed.
    pub fn term_pending(&self) -> bool {
        TERM.load(Ordering::SeqCst)
    }

    /// Whether a quick quit is pending and not yet observed.
    pub fn quit_pending(&self) -> bool {
        QUIT.load(Ordering::SeqCst)
    }
}

pub(crate) fn take_term() -> bool {
    TERM.swap(false, Ordering::SeqCst)
}

pub(crate) fn take_quit() -> bool {
    QUIT.swap(false, Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::raise;

    // one test: the flags are process-global, so splitting this up would
    // let the parallel test runner race on them
    #[test]
    fn raised_signals_and_flag_handles_set_flags_once() {
        install_signal_handlers().unwrap();
        assert!(!take_term());
        assert!(!take_quit());

        raise(Signal::SIGTERM).unwrap();
        assert!(take_term());
        assert!(!take_term());

        raise(Signal::SIGQUIT).unwrap();
        assert!(take_quit());
        assert!(!take_quit());

        let flags = SignalFlags::new();

        assert!(!flags.term_pending());
        flags.request_term();
        assert!(flags.term_pending());
        assert!(take_term());
        assert!(!flags.term_pending());

        assert!(!flags.quit_pending());
        flags.request_quit();
        assert!(flags.quit_pending());
        assert!(take_quit());
    }
}
