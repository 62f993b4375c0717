// ABOUTME: Command implementations behind the CLI subcommands
// ABOUTME: Exports scan, sync, replicate and install commands

pub mod install;
pub mod replicate;
pub mod scan;
pub mod sync;

pub use install::install;
pub use replicate::replicate;
pub use scan::scan;
pub use sync::sync;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;

use crate::config::Config;
use crate::db::ConnectorRegistry;
use crate::session::Session;

/// Load the configuration and open both databases.
pub(crate) fn open_session(config_path: &Path) -> Result<Session> {
    let config = Config::from_file(config_path)?;
    Session::connect(config, &ConnectorRegistry::with_defaults())
}

/// Spinner counting rows processed for one table.
pub(crate) fn row_spinner(label: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner} {msg}: {pos} rows ({elapsed})") {
        bar.set_style(style);
    }
    bar.set_message(label.to_string());
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}
