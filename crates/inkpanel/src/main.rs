#![deny(unsafe_op_in_unsafe_fn)]
// The daemon drives SPI and GPIO character devices; only Linux has them.
#[cfg(not(target_os = "linux"))]
compile_error!("inkpaneld talks to /dev/spidev and /dev/gpiochip and only builds for Linux targets.");

use std::panic;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use inkpanel::catalog::{self, Catalog};
use inkpanel::config::{resolve_root, PanelConfig};
use inkpanel::display::epd7in5::Epd7in5;
use inkpanel::display::{placeholder_png, DisplayAdapter};
use inkpanel::fetch::{HttpImageSource, RetryPolicy, Retrying};
use inkpanel::input::{spawn_button_thread, ButtonPad};
use inkpanel::{ControllerSettings, ImageCache, PanelController};

const CATALOG_FILENAME: &str = "catalog.json";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let root = resolve_root(std::env::args_os().nth(1).map(PathBuf::from));
    std::fs::create_dir_all(&root)
        .with_context(|| format!("creating data root {}", root.display()))?;
    let log_cfg = inkpanel_logging::fs::read_config(&root);
    let _logging_guards = inkpanel_logging::init("inkpaneld", &root, &log_cfg)?;
    install_panic_hook();

    let _log_watcher = match inkpanel_logging::spawn_watcher(&root, "inkpaneld") {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!("Logging watcher disabled: {}", err);
            None
        }
    };

    let span = tracing::info_span!("inkpaneld", component = "inkpaneld");
    let _span_guard = span.enter();

    let mut config = PanelConfig::load(&root)?;
    config.apply_env();
    info!(root = %root.display(), server = %config.server.url, "Configuration loaded");

    let source = HttpImageSource::new(&config.server)?;
    let cache_dir = config.cache_dir(&root);
    let catalog = resolve_catalog(&config, &source, &cache_dir).await;
    info!(
        apps = catalog.apps().len(),
        screens = ?catalog.screen_counts(),
        "Catalog ready"
    );

    let cache = match ImageCache::open(&cache_dir) {
        Ok(cache) => cache,
        Err(err) => {
            // Run without persistence rather than not at all.
            warn!("Image cache unavailable, using a temporary one: {}", err);
            ImageCache::open(&std::env::temp_dir().join("inkpanel-cache"))?
        }
    };

    let panel = Epd7in5::open(&config.pins, &config.timing).context("opening e-paper panel")?;
    let adapter = DisplayAdapter::new(panel, config.timing.full_refresh_every);
    let placeholder = load_placeholder(&config, &root, adapter.width(), adapter.height())?;

    let cancel = CancellationToken::new();
    let queue_depth = config.timing.input_queue_depth.max(1);
    let (input_tx, input_rx) = mpsc::channel(queue_depth);
    let pad = ButtonPad::new(&config.pins, &config.timing).context("opening buttons")?;
    let button_thread = spawn_button_thread(pad, input_tx, queue_depth, cancel.clone())?;

    spawn_signal_handler(cancel.clone());
    spawn_retention_task(root.clone(), cancel.clone());

    let source = Retrying::new(source, RetryPolicy::from_config(&config.server));
    let controller = PanelController::new(
        catalog,
        cache,
        source,
        adapter,
        placeholder,
        input_rx,
        ControllerSettings::from_config(&config.timing),
    );
    let display = controller.display();

    info!("inkpaneld ready");
    controller.run(cancel.clone()).await;

    info!("Starting graceful shutdown...");
    cancel.cancel();
    let slept = tokio::task::spawn_blocking(move || {
        display
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sleep()
    })
    .await;
    match slept {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("Failed to put panel to sleep: {}", err),
        Err(err) => warn!("Panel sleep task failed: {}", err),
    }
    if button_thread.join().is_err() {
        warn!("Button thread panicked");
    }

    info!("inkpaneld stopped");
    Ok(())
}

/// Static config first, then the server, then the last catalog the server gave us.
async fn resolve_catalog(config: &PanelConfig, source: &HttpImageSource, cache_dir: &Path) -> Catalog {
    if !config.apps.is_empty() {
        match Catalog::from_config(&config.apps) {
            Ok(catalog) => return catalog,
            Err(err) => warn!("Ignoring static app list: {}", err),
        }
    }

    let saved = cache_dir.join(CATALOG_FILENAME);
    match source.fetch_catalog().await {
        Ok(info) => match Catalog::from_info(&info) {
            Ok(catalog) => {
                if let Err(err) = catalog::save_info(&saved, &info) {
                    warn!("Failed to persist catalog: {:#}", err);
                }
                return catalog;
            }
            Err(err) => warn!("Server catalog unusable: {}", err),
        },
        Err(err) => warn!("Catalog fetch failed: {}", err),
    }

    if let Some(info) = catalog::load_saved_info(&saved) {
        match Catalog::from_info(&info) {
            Ok(catalog) => {
                info!("Using saved catalog from {}", saved.display());
                return catalog;
            }
            Err(err) => warn!("Saved catalog unusable: {}", err),
        }
    }

    warn!("No catalog available, assuming a single screen");
    Catalog::single()
}

fn load_placeholder(config: &PanelConfig, root: &Path, width: u32, height: u32) -> Result<Arc<[u8]>> {
    if let Some(path) = config.placeholder_path(root) {
        match std::fs::read(&path) {
            Ok(bytes) if image::guess_format(&bytes).is_ok() => return Ok(bytes.into()),
            Ok(_) => warn!("Placeholder {} is not an image, using built-in", path.display()),
            Err(err) => warn!("Placeholder {} unreadable, using built-in: {}", path.display(), err),
        }
    }
    Ok(placeholder_png(width, height)?.into())
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("Failed to register SIGTERM handler: {}", err);
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("Failed to register SIGINT handler: {}", err);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
        }
        cancel.cancel();
    });
}

fn spawn_retention_task(root: PathBuf, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let cfg = inkpanel_logging::fs::read_config(&root);
                    // Retention walks the log dir; keep it off the event loop.
                    let root = root.clone();
                    match tokio::task::spawn_blocking(move || inkpanel_logging::run_retention(&root, &cfg)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => warn!("Log retention failed: {}", err),
                        Err(err) => warn!("Log retention task failed: {}", err),
                    }
                }
            }
        }
    });
}

fn install_panic_hook() {
    let default_hook = panic::take_hook();

    panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "unknown location".to_string());
        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };

        let backtrace = std::backtrace::Backtrace::capture();
        error!(
            target: "inkpaneld::panic",
            location = %location,
            message = %message,
            "PANIC: inkpaneld panicked"
        );
        if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
            error!(target: "inkpaneld::panic", backtrace = %backtrace, "Panic backtrace");
        }

        default_hook(panic_info);
    }));
}
