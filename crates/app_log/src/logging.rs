//! Structured logging setup with tracing

use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Where and how verbosely to log
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory for the daily rolling log files
    pub dir: PathBuf,
    /// Default filter directive when RUST_LOG is unset (e.g. "info")
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: super::default_log_dir(),
            level: "info".to_string(),
        }
    }
}

/// Initialize the logging system.
///
/// RUST_LOG takes precedence over `config.level`.
pub fn init_logging(config: &LogConfig) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(&config.dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &config.dir, "picsort.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(debug_assertions)]
    {
        // Development: pretty console output + file
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .with(fmt::layer().json().with_writer(non_blocking))
            .try_init()?;
    }

    #[cfg(not(debug_assertions))]
    {
        // Release: JSON file only
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(non_blocking))
            .try_init()?;
    }

    tracing::info!("Logging initialized in {}", config.dir.display());
    Ok(guard)
}

/// Delete log files in `dir` older than `days`. Returns how many were removed.
pub fn cleanup_old_logs(dir: &Path, days: u32) -> anyhow::Result<usize> {
    use std::time::{Duration, SystemTime};

    if !dir.exists() {
        return Ok(0);
    }

    let threshold = SystemTime::now()
        .checked_sub(Duration::from_secs(days as u64 * 24 * 60 * 60))
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut deleted = 0;

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        // Daily rotation appends the date: picsort.log.2024-01-01
        let is_log = path
            .file_name()
            .map(|n| n.to_string_lossy().contains(".log"))
            .unwrap_or(false);
        if !is_log {
            continue;
        }

        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => continue,
        };

        if modified < threshold && std::fs::remove_file(&path).is_ok() {
            deleted += 1;
            tracing::debug!("Deleted old log: {:?}", path);
        }
    }

    tracing::info!("Cleaned up {} old log files", deleted);
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cleanup_missing_dir() {
        let temp = TempDir::new().unwrap();
        assert_eq!(cleanup_old_logs(&temp.path().join("none"), 7).unwrap(), 0);
    }

    #[test]
    fn test_cleanup_keeps_fresh_logs() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("picsort.log.2024-01-01"), b"{}").unwrap();
        std::fs::write(temp.path().join("notes.txt"), b"x").unwrap();

        assert_eq!(cleanup_old_logs(temp.path(), 7).unwrap(), 0);
        assert!(temp.path().join("picsort.log.2024-01-01").exists());
    }

    #[test]
    fn test_cleanup_zero_days_removes_logs_only() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("picsort.log.2024-01-01"), b"{}").unwrap();
        std::fs::write(temp.path().join("notes.txt"), b"x").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        assert_eq!(cleanup_old_logs(temp.path(), 0).unwrap(), 1);
        assert!(temp.path().join("notes.txt").exists());
    }
}
