// ABOUTME: Continuous replication loop running a pass every replication_interval
// ABOUTME: Rebuilds the session after a pass was terminated by the watchdog

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::run::{ReplicationRun, RunStats};
use crate::config::Config;
use crate::db::ConnectorRegistry;
use crate::error::ReconcileError;
use crate::session::Session;

/// Drives replication passes until shut down.
pub struct ReplicationRunner {
    config: Config,
    registry: ConnectorRegistry,
    session: Option<Arc<Session>>,
}

impl ReplicationRunner {
    pub fn new(config: Config, registry: ConnectorRegistry) -> Self {
        Self {
            config,
            registry,
            session: None,
        }
    }

    fn session(&mut self) -> Result<Arc<Session>> {
        if let Some(session) = &self.session {
            return Ok(Arc::clone(session));
        }
        let session = Arc::new(Session::connect(self.config.clone(), &self.registry)?);
        self.session = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Whether the next pass will open fresh connections.
    pub fn needs_reconnect(&self) -> bool {
        self.session.is_none()
    }

    /// Run a single pass.
    ///
    /// After a failed pass the session is dropped and the next pass
    /// reconnects: a stalled or panicked worker may still hold the
    /// connections, and other failures may come from a lost connection.
    /// Configuration errors keep the session.
    pub fn run_once(&mut self) -> Result<RunStats> {
        let session = self.session()?;
        let result = ReplicationRun::new(session).run();
        let stale = match &result {
            Ok(stats) => stats.terminated,
            Err(e) => !e
                .downcast_ref::<ReconcileError>()
                .is_some_and(ReconcileError::is_config),
        };
        if stale {
            tracing::warn!("Replication pass did not finish; reconnecting for the next pass");
            self.session = None;
        }
        result
    }

    /// Run passes every `replication_interval` until `shutdown` is set.
    ///
    /// Pass failures are logged and retried on the next cycle. Configuration
    /// errors stop the loop since retrying cannot fix them.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        let interval = self.config.options.replication_interval;
        let mut cycles = 0u64;
        tracing::info!("Starting replication with interval={:?}", interval);

        while !shutdown.load(Ordering::SeqCst) {
            cycles += 1;
            let started = Instant::now();
            match self.run_once() {
                Ok(stats) => {
                    if stats.differences > 0 {
                        tracing::info!(
                            "Replication cycle {} completed: {} differences, {} failed in {}ms",
                            cycles,
                            stats.differences,
                            stats.failed,
                            started.elapsed().as_millis()
                        );
                    } else {
                        tracing::debug!("Replication cycle {}: no pending changes", cycles);
                    }
                }
                Err(e) => {
                    if e
                        .downcast_ref::<ReconcileError>()
                        .is_some_and(ReconcileError::is_config)
                    {
                        return Err(e);
                    }
                    tracing::error!("Replication cycle {} failed: {:#}", cycles, e);
                }
            }
            sleep_unless_shutdown(interval, shutdown);
        }

        tracing::info!("Shutdown requested, stopping replication");
        Ok(())
    }
}

fn sleep_unless_shutdown(duration: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + duration;
    while !shutdown.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(100)));
    }
}
