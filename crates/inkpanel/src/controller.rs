//! The serial event loop tying input, cache, fetches and the panel together.
//!
//! Everything that mutates navigation or the cache runs on this loop. Fetches
//! run as spawned tasks and report back through a channel; panel refreshes run
//! on the blocking pool. While either is awaited, button presses keep being
//! collected into a bounded queue and are applied together on the next cycle.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use inkpanel_logging::targets::{T_DISPLAY, T_NET};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::ImageCache;
use crate::catalog::{Catalog, ContentKey, Target};
use crate::config::TimingConfig;
use crate::display::{DisplayAdapter, Panel, RefreshMode, RefreshOutcome};
use crate::error::{DisplayError, FetchError};
use crate::fetch::{ensure_decodable, ImageSource};
use crate::input::{InputQueue, LogicalEvent};
use crate::navigation::Navigator;

type FetchDone = (ContentKey, Result<Vec<u8>, FetchError>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    pub queue_depth: usize,
    pub poll_interval: Option<Duration>,
    pub auto_advance: Option<Duration>,
}

impl ControllerSettings {
    pub fn from_config(timing: &TimingConfig) -> Self {
        Self {
            queue_depth: timing.input_queue_depth.max(1),
            poll_interval: timing.poll_interval(),
            auto_advance: timing.auto_advance(),
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from_config(&TimingConfig::default())
    }
}

/// What the last successful refresh put on the panel.
struct Shown {
    key: ContentKey,
    app: usize,
    bytes: Arc<[u8]>,
}

pub struct PanelController<S: ImageSource, P: Panel> {
    catalog: Catalog,
    navigator: Navigator,
    cache: ImageCache,
    source: Arc<S>,
    display: Arc<Mutex<DisplayAdapter<P>>>,
    placeholder: Arc<[u8]>,
    settings: ControllerSettings,
    queue: InputQueue,
    in_flight: HashSet<ContentKey>,
    shown: Option<Shown>,
    inputs: mpsc::Receiver<LogicalEvent>,
    inputs_open: bool,
    done_tx: mpsc::UnboundedSender<FetchDone>,
    done_rx: mpsc::UnboundedReceiver<FetchDone>,
    last_app_switch: Instant,
}

impl<S: ImageSource, P: Panel> PanelController<S, P> {
    pub fn new(
        catalog: Catalog,
        cache: ImageCache,
        source: S,
        display: DisplayAdapter<P>,
        placeholder: Arc<[u8]>,
        inputs: mpsc::Receiver<LogicalEvent>,
        settings: ControllerSettings,
    ) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            navigator: Navigator::new(catalog.screen_counts()),
            catalog,
            cache,
            source: Arc::new(source),
            display: Arc::new(Mutex::new(display)),
            placeholder,
            queue: InputQueue::new(settings.queue_depth),
            settings,
            in_flight: HashSet::new(),
            shown: None,
            inputs,
            inputs_open: true,
            done_tx,
            done_rx,
            last_app_switch: Instant::now(),
        }
    }

    /// Shared handle so the owner can put the panel to sleep after `run`.
    pub fn display(&self) -> Arc<Mutex<DisplayAdapter<P>>> {
        Arc::clone(&self.display)
    }

    pub fn current_target(&self) -> Target {
        self.catalog.target(self.navigator.state())
    }

    /// Shows the initial screen, then serves events until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        let boot = self.current_target();
        info!(app = %boot.key.app, screen = %boot.key.screen, "Panel controller starting");
        self.show(boot, RefreshMode::Full, &cancel).await;
        self.process_queue(&cancel).await;

        let mut poll = self.settings.poll_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        self.last_app_switch = Instant::now();

        loop {
            let advance_at = self
                .settings
                .auto_advance
                .map(|period| self.last_app_switch + period);

            tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.inputs.recv(), if self.inputs_open => match event {
                    Some(event) => {
                        self.enqueue(event);
                        self.process_queue(&cancel).await;
                    }
                    None => {
                        warn!("Input channel closed, continuing without buttons");
                        self.inputs_open = false;
                    }
                },
                Some((key, result)) = self.done_rx.recv() => {
                    self.on_background_fetch(key, result).await;
                    self.process_queue(&cancel).await;
                }
                _ = tick(&mut poll) => {
                    let target = self.current_target();
                    debug!(target: T_NET, key = %target.key, "Periodic refresh-ahead");
                    self.spawn_fetch(&target);
                }
                _ = sleep_until(advance_at) => {
                    info!("No app switch for a while, advancing");
                    self.enqueue(LogicalEvent::AppNext);
                    self.process_queue(&cancel).await;
                }
            }
        }
        info!("Panel controller stopped");
    }

    fn enqueue(&mut self, event: LogicalEvent) {
        if let Some(dropped) = self.queue.push(event) {
            warn!(?dropped, "Input queue full, dropping oldest press");
        }
    }

    fn drain_inputs(&mut self) {
        while let Ok(event) = self.inputs.try_recv() {
            self.enqueue(event);
        }
    }

    /// Runs cycles until no presses are left.
    async fn process_queue(&mut self, cancel: &CancellationToken) {
        loop {
            self.drain_inputs();
            if self.queue.is_empty() || cancel.is_cancelled() {
                return;
            }
            if self.queue.contains(LogicalEvent::AppNext) {
                self.last_app_switch = Instant::now();
            }
            let pending = self.queue.len();
            let state = self.navigator.apply_all(self.queue.drain());
            let target = self.catalog.target(state);
            let mode = self.mode_for(state.app);
            info!(
                app = %target.key.app,
                screen = %target.key.screen,
                mode = mode.as_str(),
                events = pending,
                "Navigated"
            );
            self.show(target, mode, cancel).await;
        }
    }

    fn mode_for(&self, app: usize) -> RefreshMode {
        match &self.shown {
            Some(shown) if shown.app == app => RefreshMode::Partial,
            _ => RefreshMode::Full,
        }
    }

    /// One cycle: cached bytes if we have them, otherwise wait for the fetch
    /// and fall back to the placeholder.
    async fn show(&mut self, target: Target, mode: RefreshMode, cancel: &CancellationToken) {
        self.spawn_fetch(&target);
        let bytes = match self.cache.get(&target.key) {
            Some(hit) => {
                debug!(key = %target.key, fetched_at = %hit.fetched_at, "Cache hit");
                hit.bytes
            }
            None => {
                debug!(key = %target.key, "Cache miss, waiting for fetch");
                let Some(result) = self.wait_for_fetch(&target.key, cancel).await else {
                    return;
                };
                match result {
                    Ok(bytes) => {
                        let bytes: Arc<[u8]> = bytes.into();
                        self.store(&target.key, Arc::clone(&bytes));
                        bytes
                    }
                    Err(err) => {
                        warn!(key = %target.key, "No image available, showing placeholder: {}", err);
                        Arc::clone(&self.placeholder)
                    }
                }
            }
        };
        if !self.queue.is_empty() {
            debug!(key = %target.key, "Presses arrived while fetching, skipping refresh");
            return;
        }
        self.refresh(target, bytes, mode).await;
    }

    fn spawn_fetch(&mut self, target: &Target) -> bool {
        if !self.in_flight.insert(target.key.clone()) {
            debug!(target: T_NET, key = %target.key, "Fetch already in flight");
            return false;
        }
        let source = Arc::clone(&self.source);
        let done = self.done_tx.clone();
        let target = target.clone();
        tokio::spawn(async move {
            let result = match source.fetch(&target).await {
                Ok(bytes) => verify(bytes).await,
                Err(err) => Err(err),
            };
            let _ = done.send((target.key, result));
        });
        true
    }

    /// Returns `None` if cancelled first or once a press moves the user on;
    /// the fetch stays in flight and its result arrives as a background one.
    /// Other completions that arrive meanwhile are handled without touching
    /// the panel.
    async fn wait_for_fetch(
        &mut self,
        key: &ContentKey,
        cancel: &CancellationToken,
    ) -> Option<Result<Vec<u8>, FetchError>> {
        loop {
            self.drain_inputs();
            if !self.queue.is_empty() {
                debug!(key = %key, "Navigated away while fetching, abandoning wait");
                return None;
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                event = self.inputs.recv(), if self.inputs_open => match event {
                    Some(event) => self.enqueue(event),
                    None => self.inputs_open = false,
                },
                Some((done_key, result)) = self.done_rx.recv() => {
                    self.in_flight.remove(&done_key);
                    if done_key == *key {
                        return Some(result);
                    }
                    debug!(target: T_NET, key = %done_key, "Discarding result for a screen no longer shown");
                }
            }
        }
    }

    /// A refresh-ahead result. Only the screen currently selected may change
    /// the cache or the panel.
    async fn on_background_fetch(&mut self, key: ContentKey, result: Result<Vec<u8>, FetchError>) {
        self.in_flight.remove(&key);
        let target = self.current_target();
        if key != target.key {
            debug!(target: T_NET, key = %key, "Discarding result for a screen no longer shown");
            return;
        }
        let bytes: Arc<[u8]> = match result {
            Ok(bytes) => bytes.into(),
            Err(err) => {
                debug!(target: T_NET, key = %key, "Refresh-ahead failed, keeping current image: {}", err);
                return;
            }
        };
        self.store(&key, Arc::clone(&bytes));

        let already_shown = self
            .shown
            .as_ref()
            .is_some_and(|shown| shown.key == key && *shown.bytes == *bytes);
        self.drain_inputs();
        if already_shown || !self.queue.is_empty() {
            return;
        }
        info!(key = %key, "Newer image for current screen");
        let mode = self.mode_for(target.state.app);
        self.refresh(target, bytes, mode).await;
    }

    /// Skips the write when the stored bytes are identical.
    fn store(&mut self, key: &ContentKey, bytes: Arc<[u8]>) {
        if self
            .cache
            .get(key)
            .is_some_and(|cached| *cached.bytes == *bytes)
        {
            return;
        }
        if let Err(err) = self.cache.put(key, bytes) {
            warn!(key = %key, "Cache write failed: {}", err);
        }
    }

    /// Pushes `bytes` to the panel. Bytes the panel cannot decode are dropped
    /// from the cache and replaced by the placeholder.
    async fn refresh(&mut self, target: Target, mut bytes: Arc<[u8]>, mode: RefreshMode) {
        loop {
            match self.draw(Arc::clone(&bytes), mode).await {
                Ok(Ok(outcome)) => {
                    if let RefreshOutcome::Refreshed(mode) = outcome {
                        debug!(target: T_DISPLAY, key = %target.key, mode = mode.as_str(), "Displayed");
                    }
                    self.shown = Some(Shown {
                        key: target.key,
                        app: target.state.app,
                        bytes,
                    });
                    return;
                }
                Ok(Err(DisplayError::InvalidImage(reason))) if !Arc::ptr_eq(&bytes, &self.placeholder) => {
                    warn!(target: T_DISPLAY, key = %target.key, "Undisplayable image, showing placeholder: {}", reason);
                    if self
                        .cache
                        .get(&target.key)
                        .is_some_and(|cached| *cached.bytes == *bytes)
                    {
                        if let Err(err) = self.cache.remove(&target.key) {
                            warn!(key = %target.key, "Cache removal failed: {}", err);
                        }
                    }
                    bytes = Arc::clone(&self.placeholder);
                }
                Ok(Err(err)) => {
                    error!(target: T_DISPLAY, key = %target.key, "Display refresh failed: {}", err);
                    self.shown = None;
                    return;
                }
                Err(err) => {
                    error!(target: T_DISPLAY, "Display task failed: {}", err);
                    self.shown = None;
                    return;
                }
            }
        }
    }

    /// Runs one adapter refresh on the blocking pool, still collecting presses.
    async fn draw(
        &mut self,
        image: Arc<[u8]>,
        mode: RefreshMode,
    ) -> Result<Result<RefreshOutcome, DisplayError>, tokio::task::JoinError> {
        let display = Arc::clone(&self.display);
        let mut job = tokio::task::spawn_blocking(move || {
            let mut adapter = display.lock().unwrap_or_else(PoisonError::into_inner);
            adapter.refresh(&image, mode)
        });

        loop {
            tokio::select! {
                joined = &mut job => return joined,
                event = self.inputs.recv(), if self.inputs_open => match event {
                    Some(event) => self.enqueue(event),
                    None => self.inputs_open = false,
                },
            }
        }
    }
}

/// Decodes on the blocking pool so a corrupt body never reaches the cache.
async fn verify(bytes: Vec<u8>) -> Result<Vec<u8>, FetchError> {
    tokio::task::spawn_blocking(move || ensure_decodable(&bytes).map(|()| bytes))
        .await
        .unwrap_or_else(|err| Err(FetchError::InvalidPayload(err.to_string())))
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
