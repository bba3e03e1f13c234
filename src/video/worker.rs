//! Session-owned worker threads.
//!
//! Every thread the pipeline needs is spawned through a [`WorkerPool`] so the
//! session can cancel pending timers and join everything on teardown.

use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

pub struct WorkerPool {
    prefix: String,
    handles: Mutex<Vec<JoinHandle<()>>>,
    /// Never sent on; dropping it wakes and cancels every scheduled task.
    cancel_tx: Mutex<Option<Sender<()>>>,
    cancel_rx: Receiver<()>,
}

impl WorkerPool {
    pub fn new(prefix: impl Into<String>) -> Self {
        let (cancel_tx, cancel_rx) = flume::bounded(0);
        Self {
            prefix: prefix.into(),
            handles: Mutex::new(Vec::new()),
            cancel_tx: Mutex::new(Some(cancel_tx)),
            cancel_rx,
        }
    }

    /// Run `f` on a new thread named `<prefix>-<role>`.
    pub fn spawn<F>(&self, role: &str, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(format!("{}-{}", self.prefix, role))
            .spawn(f)?;

        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        Ok(())
    }

    /// Run `f` once after `delay` unless [`cancel_scheduled`](Self::cancel_scheduled)
    /// is called first.
    pub fn schedule_once<F>(&self, role: &str, delay: Duration, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.cancel_tx.lock().is_none() {
            return Err(io::Error::other("worker pool is shutting down"));
        }

        let cancel = self.cancel_rx.clone();
        let role_name = role.to_string();
        self.spawn(role, move || match cancel.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => f(),
            _ => debug!("Scheduled task {} cancelled", role_name),
        })
    }

    pub fn cancel_scheduled(&self) {
        self.cancel_tx.lock().take();
    }

    /// Join every spawned thread, including ones spawned while joining.
    pub fn join(&self) {
        let me = thread::current().id();
        loop {
            let handles = std::mem::take(&mut *self.handles.lock());
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if handle.thread().id() == me {
                    continue;
                }
                let name = handle.thread().name().unwrap_or("worker").to_string();
                if handle.join().is_err() {
                    error!("Worker thread {} panicked", name);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn spawned_threads_are_named_and_joined() {
        let pool = WorkerPool::new("test");
        let (tx, rx) = flume::unbounded();
        pool.spawn("namecheck", move || {
            let _ = tx.send(thread::current().name().map(str::to_string));
        })
        .unwrap();

        pool.join();
        assert_eq!(rx.recv().unwrap().as_deref(), Some("test-namecheck"));
    }

    #[test]
    fn scheduled_task_runs_after_delay() {
        let pool = WorkerPool::new("test");
        let hits = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        let counter = hits.clone();
        pool.schedule_once("later", Duration::from_millis(30), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        pool.join();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn cancelled_task_never_runs() {
        let pool = WorkerPool::new("test");
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        pool.schedule_once("never", Duration::from_secs(30), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        pool.cancel_scheduled();
        pool.join();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(pool.schedule_once("late", Duration::ZERO, || {}).is_err());
    }
}
