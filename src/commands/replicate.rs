// ABOUTME: Replicate command running one or continuous replication passes
// ABOUTME: Ctrl-C stops the continuous loop after the current pass

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::config::Config;
use crate::db::ConnectorRegistry;
use crate::replication::ReplicationRunner;

pub fn replicate(config_path: &Path, once: bool) -> Result<()> {
    let config = Config::from_file(config_path)?;
    let mut runner = ReplicationRunner::new(config, ConnectorRegistry::with_defaults());

    if once {
        let stats = runner.run_once()?;
        println!(
            "Replicated {} differences ({} failed){}",
            stats.differences,
            stats.failed,
            if stats.terminated { ", terminated" } else { "" }
        );
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    spawn_signal_listener(Arc::clone(&shutdown))?;
    runner.run(&shutdown)
}

/// Set `shutdown` on Ctrl-C.
fn spawn_signal_listener(shutdown: Arc<AtomicBool>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create signal runtime")?;
    thread::Builder::new()
        .name("signal-listener".to_string())
        .spawn(move || {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Shutdown signal received, finishing current pass");
                    shutdown.store(true, Ordering::SeqCst);
                }
            })
        })
        .context("Failed to spawn signal listener")?;
    Ok(())
}
