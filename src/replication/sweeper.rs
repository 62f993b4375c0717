// ABOUTME: Watchdog running a task on a worker thread and stopping to wait when it stalls
// ABOUTME: Cancellation is cooperative: the worker checks its handle at loop boundaries

use anyhow::{anyhow, Context, Result};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::ReconcileError;

struct SweeperState {
    last_ping: Mutex<Instant>,
    terminated: AtomicBool,
}

/// Token handed to the supervised worker.
#[derive(Clone)]
pub struct SweeperHandle {
    state: Arc<SweeperState>,
}

impl SweeperHandle {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SweeperState {
                last_ping: Mutex::new(Instant::now()),
                terminated: AtomicBool::new(false),
            }),
        }
    }

    /// Signal that the worker is still making progress.
    pub fn ping(&self) {
        if let Ok(mut last) = self.state.last_ping.lock() {
            *last = Instant::now();
        }
    }

    /// Set once the watchdog gave up on the worker.
    pub fn is_terminated(&self) -> bool {
        self.state.terminated.load(Ordering::SeqCst)
    }

    fn terminate(&self) {
        self.state.terminated.store(true, Ordering::SeqCst);
    }

    fn since_last_ping(&self) -> Duration {
        self.state
            .last_ping
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }
}

impl Default for SweeperHandle {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs work under a liveness timeout.
pub struct TaskSweeper;

impl TaskSweeper {
    /// Run `work` on a new thread and wait for its result.
    ///
    /// If the worker does not ping for longer than `timeout`, its handle is
    /// marked terminated and `ReconcileError::Terminated` is returned while
    /// the worker keeps running until it notices. Worker errors are returned
    /// as they are; a worker panic becomes `ReconcileError::WorkerPanicked`.
    pub fn timeout<T, F>(timeout: Duration, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(SweeperHandle) -> Result<T> + Send + 'static,
    {
        let handle = SweeperHandle::new();
        let worker_handle = handle.clone();
        let (tx, rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("replication-worker".to_string())
            .spawn(move || {
                let result = work(worker_handle);
                // The supervisor may have stopped listening after a timeout.
                let _ = tx.send(result);
            })
            .context("Failed to spawn worker thread")?;

        let poll = (timeout / 4).clamp(Duration::from_millis(1), Duration::from_millis(250));
        loop {
            match rx.recv_timeout(poll) {
                Ok(result) => {
                    let _ = worker.join();
                    return result;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if handle.since_last_ping() > timeout {
                        handle.terminate();
                        tracing::warn!(
                            "Worker did not report progress for {:?}; terminating",
                            timeout
                        );
                        return Err(ReconcileError::Terminated(timeout).into());
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return match worker.join() {
                        Err(payload) => {
                            Err(ReconcileError::WorkerPanicked(panic_message(payload)).into())
                        }
                        Ok(()) => Err(anyhow!("Worker thread exited without a result")),
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returns_worker_result() {
        let value = TaskSweeper::timeout(Duration::from_secs(1), |_| Ok(42)).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_propagates_worker_error() {
        let err = TaskSweeper::timeout(Duration::from_secs(1), |_| -> Result<()> {
            Err(anyhow!("boom"))
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_pinging_worker_is_not_terminated() {
        let result = TaskSweeper::timeout(Duration::from_millis(200), |sweeper| {
            for _ in 0..10 {
                thread::sleep(Duration::from_millis(50));
                sweeper.ping();
            }
            Ok(sweeper.is_terminated())
        })
        .unwrap();
        assert!(!result);
    }

    #[test]
    fn test_stalled_worker_is_terminated() {
        let (tx, rx) = mpsc::channel();
        let err = TaskSweeper::timeout(Duration::from_millis(50), move |sweeper| {
            while !sweeper.is_terminated() {
                thread::sleep(Duration::from_millis(10));
            }
            let _ = tx.send(());
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReconcileError>(),
            Some(ReconcileError::Terminated(_))
        ));
        // the worker observed the flag and exited on its own
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_panic_is_reported() {
        let err = TaskSweeper::timeout(Duration::from_secs(1), |_| -> Result<()> {
            panic!("worker exploded")
        })
        .unwrap_err();
        match err.downcast_ref::<ReconcileError>() {
            Some(ReconcileError::WorkerPanicked(msg)) => assert!(msg.contains("exploded")),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
