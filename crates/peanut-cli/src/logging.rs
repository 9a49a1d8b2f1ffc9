//! Logging with daily files and cleanup
//!
//! Logs go to stderr and to `<data_dir>/logs/peanut.YYYY-MM-DD.log`; files older
//! than 7 days are removed at startup

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_RETENTION_DAYS: u64 = 7;
const LOG_PREFIX: &str = "peanut";

pub struct LogManager {
    log_dir: PathBuf,
}

impl LogManager {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn current_log_path(&self) -> PathBuf {
        let today = chrono::Local::now().format("%Y-%m-%d");
        self.log_dir.join(format!("{}.{}.log", LOG_PREFIX, today))
    }

    fn is_log_file(path: &Path) -> bool {
        path.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with(LOG_PREFIX) && name.ends_with(".log"))
    }

    /// Returns the number of files deleted.
    pub fn cleanup_old_logs(&self) -> Result<usize> {
        self.cleanup_older_than(Duration::from_secs(LOG_RETENTION_DAYS * 24 * 60 * 60))
    }

    fn cleanup_older_than(&self, age: Duration) -> Result<usize> {
        let cutoff = SystemTime::now() - age;
        let mut deleted_count = 0;
        for path in self.log_files()? {
            let modified = fs::metadata(&path)?.modified()?;
            if modified < cutoff {
                if let Err(e) = fs::remove_file(&path) {
                    eprintln!("Failed to delete old log {}: {}", path.display(), e);
                } else {
                    deleted_count += 1;
                }
            }
        }
        if deleted_count > 0 {
            tracing::info!("Cleaned up {} old log file(s)", deleted_count);
        }
        Ok(deleted_count)
    }

    /// Newest first. A missing log directory yields an empty list.
    pub fn log_files(&self) -> Result<Vec<PathBuf>> {
        if !self.log_dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.log_dir)? {
            let path = entry?.path();
            if Self::is_log_file(&path) {
                files.push(path);
            }
        }
        files.sort();
        files.reverse();
        Ok(files)
    }

    pub fn total_size(&self) -> Result<u64> {
        Ok(self
            .log_files()?
            .iter()
            .filter_map(|file| fs::metadata(file).ok())
            .map(|metadata| metadata.len())
            .sum())
    }

    pub fn format_size(bytes: u64) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        const GB: u64 = MB * 1024;
        if bytes >= GB {
            format!("{:.2} GB", bytes as f64 / GB as f64)
        } else if bytes >= MB {
            format!("{:.2} MB", bytes as f64 / MB as f64)
        } else if bytes >= KB {
            format!("{:.2} KB", bytes as f64 / KB as f64)
        } else {
            format!("{} B", bytes)
        }
    }
}

pub struct LoggingGuard {
    _guard: WorkerGuard,
}

fn env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

pub fn init_logging(log_dir: &Path, log_level: &str) -> Result<LoggingGuard> {
    fs::create_dir_all(log_dir)?;
    let manager = LogManager::new(log_dir.to_path_buf());
    manager.cleanup_old_logs()?;
    let log_path = manager.current_log_path();

    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true)
        .with_filter(env_filter(log_level));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true)
        .with_filter(env_filter(log_level));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()?;

    Ok(LoggingGuard { _guard: guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_log_dir(tag: &str) -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let dir = std::env::temp_dir().join(format!("peanut-logs-{}-{}", tag, ts));
        fs::create_dir_all(&dir).expect("create log dir");
        dir
    }

    #[test]
    fn only_prefixed_log_files_are_listed_newest_first() {
        let dir = temp_log_dir("list");
        fs::write(dir.join("peanut.2026-01-01.log"), "a").expect("write");
        fs::write(dir.join("peanut.2026-01-02.log"), "bb").expect("write");
        fs::write(dir.join("other.log"), "x").expect("write");
        fs::write(dir.join("peanut.pid"), "1").expect("write");

        let manager = LogManager::new(dir.clone());
        let names: Vec<String> = manager
            .log_files()
            .expect("list")
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect();
        assert_eq!(names, vec!["peanut.2026-01-02.log", "peanut.2026-01-01.log"]);
        assert_eq!(manager.total_size().expect("size"), 3);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn cleanup_removes_files_past_the_cutoff() {
        let dir = temp_log_dir("clean");
        fs::write(dir.join("peanut.2026-01-01.log"), "a").expect("write");
        let manager = LogManager::new(dir.clone());

        assert_eq!(manager.cleanup_old_logs().expect("cleanup"), 0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(
            manager
                .cleanup_older_than(Duration::from_millis(10))
                .expect("cleanup"),
            1
        );
        assert!(manager.log_files().expect("list").is_empty());

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_directory_lists_nothing() {
        let manager = LogManager::new(std::env::temp_dir().join("peanut-logs-does-not-exist"));
        assert!(manager.log_files().expect("list").is_empty());
    }

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(LogManager::format_size(512), "512 B");
        assert_eq!(LogManager::format_size(2048), "2.00 KB");
        assert_eq!(LogManager::format_size(5 * 1024 * 1024), "5.00 MB");
    }
}
