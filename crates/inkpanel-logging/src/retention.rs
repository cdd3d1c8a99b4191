//! Keeps `<root>/logs` inside its age and size budget.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};

use crate::config::LoggingConfig;

/// Total size the log directory may grow to.
pub const MAX_LOG_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone)]
struct LogFile {
    path: PathBuf,
    modified: SystemTime,
    size: u64,
}

pub fn run_retention(root: &Path, cfg: &LoggingConfig) -> Result<()> {
    let files = list_logs(&root.join("logs"))?;
    let max_age = Duration::from_secs(cfg.keep_days.saturating_mul(24 * 60 * 60));
    for path in removals(files, SystemTime::now(), max_age, MAX_LOG_BYTES) {
        match fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed log"),
            Err(err) => tracing::warn!("Failed to remove log {}: {}", path.display(), err),
        }
    }
    Ok(())
}

/// Oldest first: everything past `max_age`, then whatever still pushes the
/// total over `budget`.
fn removals(mut files: Vec<LogFile>, now: SystemTime, max_age: Duration, budget: u64) -> Vec<PathBuf> {
    files.sort_by_key(|file| file.modified);
    let cutoff = now.checked_sub(max_age).unwrap_or(SystemTime::UNIX_EPOCH);
    let mut total: u64 = files.iter().map(|file| file.size).sum();
    files
        .into_iter()
        .filter(|file| {
            let remove = file.modified < cutoff || total > budget;
            if remove {
                total = total.saturating_sub(file.size);
            }
            remove
        })
        .map(|file| file.path)
        .collect()
}

fn list_logs(dir: &Path) -> Result<Vec<LogFile>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry.with_context(|| format!("iterating {}", dir.display()))?;
        // Daily appenders name files `<name>.log.<date>`.
        if !entry.file_name().to_string_lossy().contains(".log") {
            continue;
        }
        let meta = entry
            .metadata()
            .with_context(|| format!("stat {}", entry.path().display()))?;
        if !meta.is_file() {
            continue;
        }
        files.push(LogFile {
            path: entry.path(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            size: meta.len(),
        });
    }
    Ok(files)
}
