//! `config/logging.json` under the data root.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::LoggingConfig;

pub fn config_path(root: &Path) -> PathBuf {
    root.join("config").join("logging.json")
}

/// Never fails: a missing file is seeded with defaults, a broken one is
/// ignored in favour of them.
pub fn read_config(root: &Path) -> LoggingConfig {
    let path = config_path(root);
    match fs::read_to_string(&path) {
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|err| {
            tracing::warn!("Ignoring {}: {}", path.display(), err);
            LoggingConfig::default()
        }),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            let cfg = LoggingConfig::default();
            if let Err(err) = write_config(root, &cfg) {
                tracing::debug!("Could not seed logging config: {:#}", err);
            }
            cfg
        }
        Err(_) => LoggingConfig::default(),
    }
}

/// Replaces the file through a rename so the watcher never sees half a write.
pub fn write_config(root: &Path, cfg: &LoggingConfig) -> Result<()> {
    let path = config_path(root);
    let dir = path.parent().context("logging config path has no parent")?;
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let staged = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(cfg).context("serializing logging config")?;
    fs::write(&staged, data).with_context(|| format!("writing {}", staged.display()))?;
    fs::rename(&staged, &path).with_context(|| format!("replacing {}", path.display()))
}
