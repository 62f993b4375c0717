// ABOUTME: Install command creating the change log and event log tables
// ABOUTME: Trigger bodies filling the change log are installed separately

use anyhow::Result;
use std::path::Path;

use super::open_session;

pub fn install(config_path: &Path) -> Result<()> {
    let session = open_session(config_path)?;
    session.install()?;
    let options = session.options();
    println!(
        "Installed {} and {} on both databases",
        options.change_log_table(),
        options.event_log_table()
    );
    Ok(())
}
