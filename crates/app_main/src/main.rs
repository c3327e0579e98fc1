//! picsort - sort large image folders into categories from the terminal
//!
//! Usage: `picsort [CONFIG]`

mod app;

use anyhow::{Context, Result};
use app_core::{Sorter, SorterConfig};
use std::path::PathBuf;

fn main() -> Result<()> {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = SorterConfig::load(config_path.as_deref())?;

    // Initialize logging and panic hook first
    let log_config = config.log_config();
    let _guard = app_log::init(&log_config)?;

    // Clean up old logs (7 days)
    if let Err(e) = app_log::cleanup_old_logs(&log_config.dir, 7) {
        tracing::warn!("Failed to cleanup old logs: {}", e);
    }

    tracing::info!("picsort starting...");

    let resolved = config.resolve().context("invalid configuration")?;
    let sorter = Sorter::new(resolved)?;

    let result = app::run(&sorter);

    sorter.join();
    tracing::info!("picsort stopped");
    result
}
