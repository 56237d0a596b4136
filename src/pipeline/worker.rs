//! Worker thread lifecycle shared by the playback, detection and motion loops

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Sender, TrySendError};
use tracing::{info, trace, warn};

/// Cooperative stop flag checked by a worker loop once per iteration.
#[derive(Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Anything a worker may be blocked on that can be forced awake.
pub trait Unblock: Send + Sync {
    fn unblock(&self);
}

impl<T: Send> Unblock for super::BoundedQueue<T> {
    fn unblock(&self) {
        self.close();
    }
}

/// How a bounded join ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    Panicked,
    /// Still running after the deadline; the thread was detached
    Detached,
}

/// Owns a worker thread plus what is needed to stop it.
pub struct WorkerHandle {
    name: &'static str,
    stop: StopFlag,
    wake: Vec<Arc<dyn Unblock>>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn spawn<F>(name: &'static str, stop: StopFlag, wake: Vec<Arc<dyn Unblock>>, body: F) -> std::io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let thread = thread::Builder::new().name(name.to_string()).spawn(body)?;
        info!("Worker {} started", name);
        Ok(Self {
            name,
            stop,
            wake,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Set the stop flag, close every queue the worker may block on, then
    /// join with a bounded wait.
    pub fn shutdown(&mut self, timeout: Duration) -> JoinOutcome {
        self.stop.stop();
        for target in &self.wake {
            target.unblock();
        }

        let Some(thread) = self.thread.take() else {
            return JoinOutcome::Joined;
        };

        let deadline = Instant::now() + timeout;
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                warn!("Worker {} did not stop within {:?}, detaching", self.name, timeout);
                return JoinOutcome::Detached;
            }
            thread::sleep(Duration::from_millis(5));
        }

        match thread.join() {
            Ok(()) => {
                info!("Worker {} stopped", self.name);
                JoinOutcome::Joined
            }
            Err(_) => {
                warn!("Worker {} panicked", self.name);
                JoinOutcome::Panicked
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.shutdown(Duration::from_secs(1));
        }
    }
}

/// Deliver a notification without ever blocking the worker. Returns false
/// if the consumer is gone or lagging.
pub fn notify<E>(tx: &Sender<E>, event: E) -> bool {
    match tx.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            metrics::counter!("events_dropped_total").increment(1);
            trace!("Notification channel full, event dropped");
            false
        }
        Err(TrySendError::Disconnected(_)) => false,
    }
}
