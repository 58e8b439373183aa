//! Executor pool.
//!
//! A fixed set of OS threads draining a job channel: concurrency is bounded
//! by the thread count and queued tasks simply wait. Shutdown never blocks
//! the dispatcher. Tasks already running are left to finish (the worker
//! waits separately, with a deadline); tasks still queued are drained by
//! the pool threads in cancelled mode so their completion path can close
//! the connection they carry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel as chan;
use tracing::trace;

/// One unit of work: a closure told whether it was cancelled before it ran.
pub(crate) struct Task {
    f: Box<dyn FnOnce(bool) + Send>,
}

impl Task {
    pub(crate) fn new(f: impl FnOnce(bool) + Send + 'static) -> Task {
        Task { f: Box::new(f) }
    }

    /// Run the task's cancellation path inline.
    pub(crate) fn cancel(self) {
        (self.f)(true);
    }
}

#[derive(Debug)]
pub(crate) struct Executor {
    tx: Option<chan::Sender<Task>>,
    open: Arc<AtomicBool>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl Executor {
    /// Spawn `count` pool threads named after the worker.
    pub(crate) fn new(count: usize, name: &str) -> crate::Result<Executor> {
        let (tx, rx) = chan::unbounded::<Task>();
        let open = Arc::new(AtomicBool::new(true));
        let mut threads = Vec::with_capacity(count);

        for i in 0..count {
            let rx = rx.clone();
            let open = Arc::clone(&open);
            let builder = thread::Builder::new().name(format!("{name}-exec-{i}"));
            let handle = builder
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        let cancelled = !open.load(Ordering::SeqCst);
                        (task.f)(cancelled);
                    }
                    trace!("executor thread exiting");
                })
                .map_err(crate::Error::new_executor)?;
            threads.push(handle);
        }

        Ok(Executor {
            tx: Some(tx),
            open,
            threads,
        })
    }

    /// Queue a task. Once the pool has been shut down the task is handed
    /// back so the caller can run its cancellation path.
    pub(crate) fn submit(&self, task: Task) -> Result<(), Task> {
        match &self.tx {
            Some(tx) => tx.send(task).map_err(|chan::SendError(task)| task),
            None => Err(task),
        }
    }

    /// Stop accepting work and cancel everything still queued.
    ///
    /// Does not wait: running tasks keep their thread until they finish,
    /// and the queue drains through the cancelled path.
    pub(crate) fn shutdown(&mut self) {
        self.open.store(false, Ordering::SeqCst);
        self.tx = None;
    }

    #[cfg(test)]
    fn join(mut self) {
        self.tx = None;
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}
