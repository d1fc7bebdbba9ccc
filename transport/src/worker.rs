//! Named background threads with a bounded stop.

use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::Settings;

/// A background thread plus the signal it fires when it stops.
pub(crate) struct Worker {
    name: &'static str,
    handle: JoinHandle<()>,
    done: oneshot::Receiver<()>,
}

impl Worker {
    /// Spawns `f` on a named thread with the settings' logger installed.
    pub(crate) fn spawn<F>(name: &'static str, settings: &Settings, f: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (done_tx, done) = oneshot::channel();
        let dispatch = settings.dispatch().clone();
        let handle = thread::Builder::new()
            .name(format!("pcp-{name}"))
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, f);
                let _ = done_tx.send(());
            })?;
        Ok(Self { name, handle, done })
    }

    /// Waits up to `timeout` for the worker to stop.
    ///
    /// Returns a fault description if it panicked or had to be abandoned.
    /// A thread cannot be killed safely, so an overdue worker is detached.
    pub(crate) fn stop(self, timeout: Duration) -> Option<String> {
        match self.done.recv_timeout(timeout) {
            // a dropped sender means the thread is unwinding
            Ok(()) | Err(oneshot::RecvTimeoutError::Disconnected) => match self.handle.join() {
                Ok(()) => None,
                Err(_) => {
                    tracing::warn!(worker = self.name, "worker panicked");
                    Some(format!("{} worker panicked", self.name))
                }
            },
            Err(oneshot::RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    worker = self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "worker did not stop in time, detaching it"
                );
                Some(format!("{} worker did not stop within {timeout:?}", self.name))
            }
        }
    }

    /// True when called from this worker's own thread.
    pub(crate) fn is_current(&self) -> bool {
        self.handle.thread().id() == thread::current().id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_worker_stops_cleanly() {
        let worker = Worker::spawn("quick", &Settings::default(), || {}).unwrap();
        assert!(!worker.is_current());
        assert!(worker.stop(Duration::from_secs(5)).is_none());
    }

    #[test]
    fn overdue_worker_is_reported() {
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
        let worker = Worker::spawn("stuck", &Settings::default(), move || {
            let _ = release_rx.recv();
        })
        .unwrap();

        let fault = worker.stop(Duration::from_millis(50));
        assert!(fault.unwrap().contains("stuck worker did not stop"));
        let _ = release_tx.send(());
    }

    #[test]
    fn panicking_worker_is_reported() {
        let worker = Worker::spawn("doomed", &Settings::default(), || panic!("boom")).unwrap();
        let fault = worker.stop(Duration::from_secs(5));
        assert_eq!(fault.as_deref(), Some("doomed worker panicked"));
    }
}
