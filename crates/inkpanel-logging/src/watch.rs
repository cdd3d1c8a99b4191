use std::path::Path;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecursiveMode, Watcher};

use crate::fs::{config_path, read_config};
use crate::init::apply;

/// Reloads the log filter whenever `config/logging.json` changes.
pub fn spawn_watcher(root: &Path, component: &str) -> Result<JoinHandle<()>> {
    let root = root.to_path_buf();
    let path = config_path(&root);
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .context("logging config path has no parent")?;
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

    thread::Builder::new()
        .name(format!("{component}-logwatch"))
        .spawn(move || {
            if let Err(err) = watch(&root, &dir, &path) {
                tracing::warn!("Logging watcher stopped: {:#}", err);
            }
        })
        .context("spawning logging watcher thread")
}

fn watch(root: &Path, dir: &Path, path: &Path) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    let mut watcher = notify::recommended_watcher(tx).context("creating watcher")?;
    // The editor may replace the file, so watch its directory.
    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("watching {}", dir.display()))?;

    for event in rx {
        match event {
            Ok(event) if touches(&event, path) => reload(root),
            Ok(_) => {}
            Err(err) => tracing::warn!("Logging watcher error: {}", err),
        }
    }
    Ok(())
}

fn touches(event: &Event, path: &Path) -> bool {
    matches!(
        event.kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
    ) && event.paths.iter().any(|p| p == path)
}

fn reload(root: &Path) {
    let cfg = read_config(root);
    match apply(&cfg) {
        Ok(()) => tracing::info!(level = %cfg.level, enabled = cfg.enabled, "Logging config reloaded"),
        Err(err) => tracing::warn!("Failed to apply logging config: {}", err),
    }
}
