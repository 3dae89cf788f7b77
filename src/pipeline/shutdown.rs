//! Cooperative cancellation and bounded thread joins

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{error, warn};

use crate::error::PipelineError;
use crate::telemetry::LogContext;

/// Stop flag that also wakes threads sleeping in [`StopSignal::wait`].
pub struct StopSignal {
    stopped: AtomicBool,
    wake_tx: Mutex<Option<Sender<()>>>,
    wake_rx: Receiver<()>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, rx) = flume::bounded(1);
        Self {
            stopped: AtomicBool::new(false),
            wake_tx: Mutex::new(Some(tx)),
            wake_rx: rx,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Raise the flag and wake every waiter.
    pub fn trigger(&self) {
        self.stopped.store(true, Ordering::Release);
        // Dropping the only sender disconnects all waiters at once
        self.wake_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Sleep up to `timeout`; returns true if stop was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        match self.wake_rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) => true,
            _ => self.is_stopped(),
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// A pipeline thread that can be joined with a deadline.
pub struct Worker {
    name: &'static str,
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

impl Worker {
    /// Spawn `body` on a named thread inside `log`'s span.
    pub fn spawn<F>(name: &'static str, log: LogContext, body: F) -> Result<Self, PipelineError>
    where
        F: FnOnce() + Send + 'static,
    {
        let (done_tx, done) = flume::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name(format!("petcam-{}", name))
            .spawn(move || {
                // Disconnects `done` however the thread ends, panics included
                let _done = done_tx;
                log.in_scope(body);
            })
            .map_err(|source| PipelineError::Spawn {
                component: name,
                source,
            })?;

        Ok(Self { name, handle, done })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Join if the thread finishes before `deadline`. A thread that misses
    /// the deadline is detached and reported as a join timeout.
    pub fn join_until(self, deadline: Instant, budget: Duration) -> Result<(), PipelineError> {
        match self.done.recv_deadline(deadline) {
            Err(flume::RecvTimeoutError::Timeout) => {
                error!(
                    component = self.name,
                    "thread failed to exit before the shutdown deadline; abandoning it"
                );
                Err(PipelineError::ThreadJoinTimeout {
                    component: self.name,
                    timeout: budget,
                })
            }
            _ => {
                if self.handle.join().is_err() {
                    error!(component = self.name, "thread panicked");
                }
                Ok(())
            }
        }
    }
}

/// Run `f` on a helper thread and wait at most `timeout` for its result.
/// On timeout the helper keeps running and its result is discarded.
pub fn call_with_timeout<T, F>(label: &'static str, timeout: Duration, f: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = flume::bounded(1);
    let spawned = thread::Builder::new()
        .name(format!("petcam-{}", label))
        .spawn(move || {
            let _ = tx.send(f());
        });
    if let Err(e) = spawned {
        warn!(label, "could not spawn helper thread: {}", e);
        return None;
    }
    rx.recv_timeout(timeout).ok()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn trigger_wakes_a_long_wait() {
        let stop = Arc::new(StopSignal::new());
        let waiter = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let started = Instant::now();
                assert!(stop.wait(Duration::from_secs(30)));
                started.elapsed()
            })
        };
        thread::sleep(Duration::from_millis(20));
        stop.trigger();
        assert!(waiter.join().unwrap() < Duration::from_secs(5));
        assert!(stop.wait(Duration::from_secs(30)));
    }

    #[test]
    fn wait_times_out_without_trigger() {
        let stop = StopSignal::new();
        assert!(!stop.wait(Duration::from_millis(5)));
    }

    #[test]
    fn stuck_worker_is_reported_not_awaited() {
        let (release_tx, release_rx) = flume::bounded::<()>(0);
        let worker = Worker::spawn("stuck", LogContext::root("test"), move || {
            let _ = release_rx.recv();
        })
        .unwrap();

        let budget = Duration::from_millis(30);
        let started = Instant::now();
        let result = worker.join_until(Instant::now() + budget, budget);
        assert!(matches!(
            result,
            Err(PipelineError::ThreadJoinTimeout { component: "stuck", .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
        drop(release_tx);
    }

    #[test]
    fn finished_worker_joins() {
        let worker = Worker::spawn("quick", LogContext::root("test"), || {}).unwrap();
        let budget = Duration::from_secs(1);
        assert!(worker.join_until(Instant::now() + budget, budget).is_ok());
    }

    #[test]
    fn slow_call_times_out() {
        let result = call_with_timeout("slow", Duration::from_millis(10), || {
            thread::sleep(Duration::from_millis(200));
            1
        });
        assert_eq!(result, None);
        assert_eq!(call_with_timeout("fast", Duration::from_secs(1), || 2), Some(2));
    }
}
