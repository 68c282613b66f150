use anyhow::Result;
use std::fs;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_FILE_PREFIX: &str = "server_drawcast";

/// # Setup Logging
///
/// Installs the global `tracing` subscriber:
/// - `RUST_LOG` wins over `log_level` when set.
/// - Human-readable, ANSI-colored console output.
/// - A daily rolling file in `log_dir` behind a non-blocking writer,
///   JSON-formatted when `json` is set.
///
/// Old log files beyond `keep` are removed first, newest kept.
///
/// The returned guard flushes the file writer when dropped; keep it alive
/// for the lifetime of the process.
pub fn setup_logging(log_dir: &Path, log_level: &str, json: bool, keep: usize) -> Result<WorkerGuard> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }
    let removed = cleanup_old_logs(log_dir, keep)?;

    let file_appender = rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = non_blocking(file_appender);

    let console_layer = fmt::layer().with_target(true).with_ansi(true);
    let file_layer = if json {
        fmt::layer().with_ansi(false).with_writer(writer).json().boxed()
    } else {
        fmt::layer().with_ansi(false).with_writer(writer).boxed()
    };

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(level = log_level, json, removed, "Logging initialized");
    Ok(guard)
}

/// Deletes this server's log files except the `keep` most recent ones.
/// Returns how many were removed.
pub fn cleanup_old_logs(log_dir: &Path, keep: usize) -> Result<usize> {
    let mut entries: Vec<_> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(LOG_FILE_PREFIX))
        .filter_map(|e| {
            let modified = e.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, e.path()))
        })
        .collect();

    // Newest first
    entries.sort_by(|a, b| b.0.cmp(&a.0));

    let mut removed = 0;
    for (_, path) in entries.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to delete old log file {:?}: {}", path, e),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    #[test]
    fn keeps_newest_and_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = SystemTime::now() - Duration::from_secs(3_600);
        for (i, day) in ["2026-01-01", "2026-01-02", "2026-01-03"].iter().enumerate() {
            let path = dir.path().join(format!("{}.{}", LOG_FILE_PREFIX, day));
            fs::write(&path, "x").unwrap();
            let file = fs::File::options().write(true).open(&path).unwrap();
            file.set_modified(base + Duration::from_secs(60 * i as u64)).unwrap();
        }
        fs::write(dir.path().join("other.log"), "y").unwrap();

        assert_eq!(cleanup_old_logs(dir.path(), 1).unwrap(), 2);
        let mut left: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        left.sort();
        assert_eq!(left, vec!["other.log".to_string(), format!("{}.2026-01-03", LOG_FILE_PREFIX)]);
    }
}
