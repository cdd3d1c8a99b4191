use std::path::Path;

use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_error::ErrorLayer;
use tracing_log::LogTracer;
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;
use crate::targets::{T_DISPLAY, T_NET};

/// Targets split out of the component log into a file of their own.
const SUBSYSTEM_FILES: [(&str, &str); 2] = [(T_NET, "net.log"), (T_DISPLAY, "display.log")];

static RELOAD: OnceCell<reload::Handle<EnvFilter, Registry>> = OnceCell::new();

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

/// Flushes the file writers when dropped; hold it for the life of the process.
pub struct LoggingGuards(Vec<WorkerGuard>);

/// Installs stdout logging plus daily files under `<root>/logs`: one for
/// `component` and one per subsystem target.
pub fn init(component: &str, root: &Path, cfg: &LoggingConfig) -> Result<LoggingGuards> {
    let (filter, handle) = reload::Layer::new(build_filter(cfg));
    let _ = RELOAD.set(handle);

    let log_dir = root.join("logs");
    let mut guards = Vec::new();
    // A read-only rootfs must not keep the panel from starting.
    let dir_error = std::fs::create_dir_all(&log_dir).err();
    let files = dir_error.is_none().then(|| {
        let mut layers = Vec::with_capacity(SUBSYSTEM_FILES.len() + 1);
        for (target, file) in SUBSYSTEM_FILES {
            let only = Targets::new().with_target(target, LevelFilter::TRACE);
            let (layer, guard) = file_layer(&log_dir, file, only);
            layers.push(layer);
            guards.push(guard);
        }
        let (layer, guard) = file_layer(&log_dir, &format!("{component}.log"), component_filter());
        layers.push(layer);
        guards.push(guard);
        layers
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(ErrorLayer::default())
        .with(
            fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .compact(),
        )
        .with(files)
        .try_init()
        .ok();
    let _ = LogTracer::init();

    if let Some(err) = dir_error {
        tracing::warn!("File logging disabled ({}): {}", log_dir.display(), err);
    }
    Ok(LoggingGuards(guards))
}

/// Swaps the global filter for one built from `cfg`.
pub fn apply(cfg: &LoggingConfig) -> Result<()> {
    let handle = RELOAD
        .get()
        .ok_or_else(|| anyhow::anyhow!("logging not initialized"))?;
    handle.reload(build_filter(cfg))?;
    Ok(())
}

fn build_filter(cfg: &LoggingConfig) -> EnvFilter {
    if !cfg.enabled {
        return EnvFilter::new("off");
    }
    EnvFilter::try_new(&cfg.level).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn component_filter() -> Targets {
    SUBSYSTEM_FILES
        .iter()
        .fold(Targets::new().with_default(LevelFilter::TRACE), |targets, (target, _)| {
            targets.with_target(*target, LevelFilter::OFF)
        })
}

fn file_layer<S>(log_dir: &Path, file: &str, targets: Targets) -> (BoxedLayer<S>, WorkerGuard)
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, file));
    let layer = fmt::layer()
        .with_thread_ids(true)
        .with_line_number(true)
        .with_ansi(false)
        .compact()
        .with_writer(writer)
        .with_filter(targets)
        .boxed();
    (layer, guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::Level;

    #[test]
    fn disabled_config_turns_filter_off() {
        let cfg = LoggingConfig {
            enabled: false,
            ..LoggingConfig::default()
        };
        assert_eq!(build_filter(&cfg).to_string(), "off");
    }

    #[test]
    fn invalid_level_falls_back_to_info() {
        let cfg = LoggingConfig {
            level: "net=[[".to_string(),
            ..LoggingConfig::default()
        };
        assert_eq!(build_filter(&cfg).to_string(), "info");
    }

    #[test]
    fn component_log_leaves_subsystems_to_their_files() {
        let targets = component_filter();
        assert!(targets.would_enable("inkpanel::controller", &Level::DEBUG));
        assert!(!targets.would_enable(T_NET, &Level::ERROR));
        assert!(!targets.would_enable(T_DISPLAY, &Level::INFO));
    }
}
