use std::collections::HashMap;
use std::future::Future;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use inkpanel::catalog::{App, Catalog, ContentKey, Screen, Target};
use inkpanel::display::{placeholder_png, Frame};
use inkpanel::{
    ControllerSettings, DisplayAdapter, DisplayError, FetchError, ImageCache, ImageSource,
    LogicalEvent, Panel, PanelController, RefreshMode, RetryPolicy, Retrying,
};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const W: u32 = 16;
const H: u32 = 8;

/// A distinct test image: the first `stripes` columns are black.
fn png(stripes: u32) -> Vec<u8> {
    let img = image::GrayImage::from_fn(W, H, |x, _| image::Luma([if x < stripes { 0 } else { 255 }]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}

/// Keeps the PNG signature and header but loses the pixel data.
fn truncated(bytes: &[u8]) -> Vec<u8> {
    bytes[..bytes.len() / 2].to_vec()
}

fn frame(bytes: &[u8]) -> Vec<u8> {
    Frame::from_image(bytes, W, H).expect("frame").into_data()
}

fn key(app: &str, screen: &str) -> ContentKey {
    ContentKey::new(app, screen)
}

fn catalog(apps: &[(&str, usize)]) -> Catalog {
    Catalog::new(
        apps.iter()
            .map(|(id, screens)| App {
                id: id.to_string(),
                screens: (0..*screens)
                    .map(|n| Screen {
                        id: n.to_string(),
                        reference: n.to_string(),
                    })
                    .collect(),
            })
            .collect(),
    )
    .expect("catalog")
}

#[derive(Default)]
struct Script {
    replies: HashMap<ContentKey, Vec<Result<Vec<u8>, FetchError>>>,
    delays: HashMap<ContentKey, Duration>,
    calls: HashMap<ContentKey, usize>,
}

/// Replies are consumed in order; the last one repeats.
#[derive(Clone, Default)]
struct FakeSource(Arc<Mutex<Script>>);

impl FakeSource {
    fn script(&self, key: ContentKey, replies: Vec<Result<Vec<u8>, FetchError>>) {
        self.0.lock().unwrap().replies.insert(key, replies);
    }

    fn delay(&self, key: ContentKey, delay: Duration) {
        self.0.lock().unwrap().delays.insert(key, delay);
    }

    fn calls(&self, key: &ContentKey) -> usize {
        self.0.lock().unwrap().calls.get(key).copied().unwrap_or(0)
    }

    fn next(&self, key: &ContentKey) -> (Duration, Result<Vec<u8>, FetchError>) {
        let mut script = self.0.lock().unwrap();
        *script.calls.entry(key.clone()).or_default() += 1;
        let delay = script.delays.get(key).copied().unwrap_or_default();
        let reply = match script.replies.get_mut(key) {
            Some(replies) if replies.len() > 1 => replies.remove(0),
            Some(replies) if !replies.is_empty() => replies[0].clone(),
            _ => Err(FetchError::ServerError(404)),
        };
        (delay, reply)
    }
}

impl ImageSource for FakeSource {
    fn fetch(&self, target: &Target) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send {
        let (delay, reply) = self.next(&target.key);
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            reply
        }
    }
}

#[derive(Clone, Default)]
struct PanelLog(Arc<Mutex<Vec<(RefreshMode, Vec<u8>)>>>);

impl PanelLog {
    fn snapshot(&self) -> Vec<(RefreshMode, Vec<u8>)> {
        self.0.lock().unwrap().clone()
    }
}

/// Holds the first refresh until released.
#[derive(Default)]
struct Gate {
    state: Mutex<(bool, bool)>,
    cv: Condvar,
}

impl Gate {
    fn entered(&self) -> bool {
        self.state.lock().unwrap().0
    }

    fn release(&self) {
        self.state.lock().unwrap().1 = true;
        self.cv.notify_all();
    }

    fn hold(&self) {
        let mut state = self.state.lock().unwrap();
        state.0 = true;
        while !state.1 {
            state = self.cv.wait(state).unwrap();
        }
    }
}

/// Fails draws while `failures` is above zero, then records them.
struct FakePanel {
    log: PanelLog,
    gate: Option<Arc<Gate>>,
    failures: Arc<AtomicUsize>,
}

impl FakePanel {
    fn record(&mut self, mode: RefreshMode, frame: &[u8]) -> Result<(), DisplayError> {
        if let Some(gate) = self.gate.take() {
            gate.hold();
        }
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DisplayError::Bus("spi write failed".into()));
        }
        self.log.0.lock().unwrap().push((mode, frame.to_vec()));
        Ok(())
    }
}

impl Panel for FakePanel {
    fn width(&self) -> u32 {
        W
    }
    fn height(&self) -> u32 {
        H
    }
    fn wake(&mut self) -> Result<(), DisplayError> {
        Ok(())
    }
    fn full_refresh(&mut self, frame: &[u8]) -> Result<(), DisplayError> {
        self.record(RefreshMode::Full, frame)
    }
    fn partial_refresh(&mut self, frame: &[u8]) -> Result<(), DisplayError> {
        self.record(RefreshMode::Partial, frame)
    }
    fn sleep(&mut self) -> Result<(), DisplayError> {
        Ok(())
    }
}

struct Harness {
    tx: mpsc::Sender<LogicalEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    log: PanelLog,
    failures: Arc<AtomicUsize>,
    placeholder: Vec<u8>,
    cache_dir: TempDir,
}

impl Harness {
    fn start(
        catalog: Catalog,
        source: FakeSource,
        cache_dir: TempDir,
        gate: Option<Arc<Gate>>,
        settings: ControllerSettings,
    ) -> Self {
        let cache = ImageCache::open(cache_dir.path()).expect("open cache");
        let log = PanelLog::default();
        let failures = Arc::new(AtomicUsize::new(0));
        let panel = FakePanel {
            log: log.clone(),
            gate,
            failures: Arc::clone(&failures),
        };
        let placeholder = placeholder_png(W, H).expect("placeholder");
        let (tx, rx) = mpsc::channel(8);
        let source = Retrying::new(
            source,
            RetryPolicy {
                attempts: 3,
                backoff_base: Duration::ZERO,
            },
        );
        let controller = PanelController::new(
            catalog,
            cache,
            source,
            DisplayAdapter::new(panel, 10),
            placeholder.clone().into(),
            rx,
            settings,
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(controller.run(cancel.clone()));
        Self {
            tx,
            cancel,
            task,
            log,
            failures,
            placeholder,
            cache_dir,
        }
    }

    async fn press(&self, event: LogicalEvent) {
        self.tx.send(event).await.expect("controller alive");
    }

    async fn refreshes(&self, count: usize) -> Vec<(RefreshMode, Vec<u8>)> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let entries = self.log.snapshot();
                if entries.len() >= count {
                    return entries;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("expected {count} refreshes, got {:?}", self.log.snapshot().len()))
    }

    async fn stop(self) -> TempDir {
        self.cancel.cancel();
        self.task.await.expect("controller task");
        self.cache_dir
    }
}

fn quiet() -> ControllerSettings {
    ControllerSettings {
        queue_depth: 4,
        poll_interval: None,
        auto_advance: None,
    }
}

fn seeded_cache(entries: &[(ContentKey, Vec<u8>)]) -> TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cache = ImageCache::open(dir.path()).expect("open");
    for (key, bytes) in entries {
        cache.put(key, bytes.clone().into()).expect("seed");
    }
    dir
}

#[tokio::test]
async fn browsing_with_misses_and_failures() {
    let (x, y) = (png(2), png(5));
    let source = FakeSource::default();
    source.script(key("A", "0"), vec![Err(FetchError::ServerError(503)), Ok(y.clone())]);
    source.script(key("A", "1"), vec![Ok(x.clone())]);
    source.script(key("B", "0"), vec![Err(FetchError::Timeout)]);

    let harness = Harness::start(
        catalog(&[("A", 2), ("B", 1)]),
        source.clone(),
        tempfile::tempdir().expect("tempdir"),
        None,
        quiet(),
    );
    let placeholder = frame(&harness.placeholder);

    let shown = harness.refreshes(1).await;
    assert_eq!(shown[0], (RefreshMode::Full, placeholder.clone()));
    assert_eq!(source.calls(&key("A", "0")), 1, "server errors are not retried");

    harness.press(LogicalEvent::ScreenNext).await;
    let shown = harness.refreshes(2).await;
    assert_eq!(shown[1], (RefreshMode::Partial, frame(&x)));

    harness.press(LogicalEvent::AppNext).await;
    let shown = harness.refreshes(3).await;
    assert_eq!(shown[2], (RefreshMode::Full, placeholder));
    assert_eq!(source.calls(&key("B", "0")), 3);

    harness.press(LogicalEvent::AppNext).await;
    let shown = harness.refreshes(4).await;
    assert_eq!(shown[3], (RefreshMode::Full, frame(&y)));

    let dir = harness.stop().await;
    let cache = ImageCache::open(dir.path()).expect("reopen");
    assert!(cache.get(&key("B", "0")).is_none());
    assert_eq!(&*cache.get(&key("A", "1")).expect("A1 cached").bytes, &x[..]);
    assert_eq!(&*cache.get(&key("A", "0")).expect("A0 cached").bytes, &y[..]);
}

#[tokio::test]
async fn presses_during_refresh_coalesce_into_one() {
    let (p0, p1) = (png(1), png(3));
    let source = FakeSource::default();
    source.script(key("A", "0"), vec![Ok(p0.clone())]);
    source.script(key("A", "1"), vec![Ok(p1.clone())]);
    let gate = Arc::new(Gate::default());

    let harness = Harness::start(
        catalog(&[("A", 2)]),
        source.clone(),
        seeded_cache(&[(key("A", "0"), p0.clone())]),
        Some(Arc::clone(&gate)),
        quiet(),
    );

    tokio::time::timeout(Duration::from_secs(5), async {
        while !gate.entered() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("boot refresh started");
    for _ in 0..3 {
        harness.press(LogicalEvent::ScreenNext).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    gate.release();

    let shown = harness.refreshes(2).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let shown_later = harness.log.snapshot();
    assert_eq!(shown_later.len(), 2, "exactly one refresh after the burst");
    assert_eq!(shown[0], (RefreshMode::Full, frame(&p0)));
    assert_eq!(shown[1], (RefreshMode::Partial, frame(&p1)));
    assert_eq!(source.calls(&key("A", "1")), 1);

    harness.stop().await;
}

#[tokio::test]
async fn refresh_ahead_only_redraws_changed_images() {
    let (p0, p1) = (png(1), png(4));
    let source = FakeSource::default();
    source.script(key("A", "0"), vec![Ok(p0.clone()), Ok(p0.clone()), Ok(p1.clone())]);

    let harness = Harness::start(
        catalog(&[("A", 1)]),
        source.clone(),
        seeded_cache(&[(key("A", "0"), p0.clone())]),
        None,
        ControllerSettings {
            poll_interval: Some(Duration::from_millis(100)),
            ..quiet()
        },
    );

    let shown = harness.refreshes(2).await;
    assert_eq!(shown[0], (RefreshMode::Full, frame(&p0)));
    assert_eq!(shown[1], (RefreshMode::Partial, frame(&p1)));
    assert!(source.calls(&key("A", "0")) >= 3);

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(harness.log.snapshot().len(), 2, "unchanged images are not redrawn");

    let dir = harness.stop().await;
    let cache = ImageCache::open(dir.path()).expect("reopen");
    assert_eq!(&*cache.get(&key("A", "0")).expect("cached").bytes, &p1[..]);
}

#[tokio::test]
async fn late_result_for_a_left_screen_is_discarded() {
    let (p0, p1, stale) = (png(1), png(2), png(6));
    let source = FakeSource::default();
    source.script(key("A", "0"), vec![Ok(p0.clone())]);
    source.script(key("A", "1"), vec![Ok(stale)]);
    source.delay(key("A", "1"), Duration::from_millis(300));

    let harness = Harness::start(
        catalog(&[("A", 2)]),
        source.clone(),
        seeded_cache(&[(key("A", "0"), p0.clone()), (key("A", "1"), p1.clone())]),
        None,
        quiet(),
    );
    harness.refreshes(1).await;

    harness.press(LogicalEvent::ScreenNext).await;
    let shown = harness.refreshes(2).await;
    assert_eq!(shown[1], (RefreshMode::Partial, frame(&p1)));

    harness.press(LogicalEvent::ScreenNext).await;
    let shown = harness.refreshes(3).await;
    assert_eq!(shown[2], (RefreshMode::Partial, frame(&p0)));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(harness.log.snapshot().len(), 3);
    assert_eq!(source.calls(&key("A", "1")), 1);

    let dir = harness.stop().await;
    let cache = ImageCache::open(dir.path()).expect("reopen");
    assert_eq!(&*cache.get(&key("A", "1")).expect("cached").bytes, &p1[..]);
}

#[tokio::test]
async fn idle_panel_rotates_to_next_app() {
    let (p0, p1) = (png(1), png(7));
    let source = FakeSource::default();
    source.script(key("A", "0"), vec![Ok(p0.clone())]);
    source.script(key("B", "0"), vec![Ok(p1.clone())]);

    let harness = Harness::start(
        catalog(&[("A", 1), ("B", 1)]),
        source,
        tempfile::tempdir().expect("tempdir"),
        None,
        ControllerSettings {
            auto_advance: Some(Duration::from_millis(150)),
            ..quiet()
        },
    );

    let shown = harness.refreshes(2).await;
    assert_eq!(shown[0], (RefreshMode::Full, frame(&p0)));
    assert_eq!(shown[1], (RefreshMode::Full, frame(&p1)));

    harness.stop().await;
}

#[tokio::test]
async fn corrupt_refresh_ahead_keeps_last_good_image() {
    let (p0, p1) = (png(1), png(4));
    let source = FakeSource::default();
    source.script(key("A", "0"), vec![Ok(truncated(&p1))]);

    let harness = Harness::start(
        catalog(&[("A", 1)]),
        source.clone(),
        seeded_cache(&[(key("A", "0"), p0.clone())]),
        None,
        ControllerSettings {
            poll_interval: Some(Duration::from_millis(100)),
            ..quiet()
        },
    );

    let shown = harness.refreshes(1).await;
    assert_eq!(shown[0], (RefreshMode::Full, frame(&p0)));
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(source.calls(&key("A", "0")) >= 3);
    assert_eq!(harness.log.snapshot().len(), 1);

    let dir = harness.stop().await;
    let cache = ImageCache::open(dir.path()).expect("reopen");
    assert_eq!(&*cache.get(&key("A", "0")).expect("cached").bytes, &p0[..]);
}

#[tokio::test]
async fn undecodable_cached_image_falls_back_to_placeholder() {
    let p0 = png(3);
    let source = FakeSource::default();
    source.script(key("A", "0"), vec![Ok(p0.clone())]);

    let harness = Harness::start(
        catalog(&[("A", 1)]),
        source,
        seeded_cache(&[(key("A", "0"), truncated(&p0))]),
        None,
        quiet(),
    );
    let placeholder = frame(&harness.placeholder);

    let shown = harness.refreshes(2).await;
    assert_eq!(shown[0], (RefreshMode::Full, placeholder));
    assert_eq!(shown[1], (RefreshMode::Partial, frame(&p0)));

    let dir = harness.stop().await;
    let cache = ImageCache::open(dir.path()).expect("reopen");
    assert_eq!(&*cache.get(&key("A", "0")).expect("refetched").bytes, &p0[..]);
}

#[tokio::test]
async fn press_during_slow_miss_moves_on_to_cached_screen() {
    let (p0, p1, pb) = (png(1), png(2), png(6));
    let source = FakeSource::default();
    source.script(key("A", "0"), vec![Ok(p0.clone())]);
    source.script(key("A", "1"), vec![Ok(p1)]);
    source.script(key("B", "0"), vec![Ok(pb.clone())]);
    source.delay(key("A", "1"), Duration::from_secs(1));

    let harness = Harness::start(
        catalog(&[("A", 2), ("B", 1)]),
        source.clone(),
        seeded_cache(&[(key("A", "0"), p0.clone()), (key("B", "0"), pb.clone())]),
        None,
        quiet(),
    );
    harness.refreshes(1).await;

    harness.press(LogicalEvent::ScreenNext).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.press(LogicalEvent::AppNext).await;

    let shown = tokio::time::timeout(Duration::from_millis(500), harness.refreshes(2))
        .await
        .expect("cached screen shown without waiting for the slow fetch");
    assert_eq!(shown[1], (RefreshMode::Full, frame(&pb)));

    // The abandoned fetch finishes later and must not repaint.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(source.calls(&key("A", "1")), 1);
    assert_eq!(harness.log.snapshot().len(), 2);

    harness.stop().await;
}

#[tokio::test]
async fn panel_errors_do_not_stop_the_loop() {
    let (p0, p1) = (png(1), png(5));
    let source = FakeSource::default();
    source.script(key("A", "0"), vec![Err(FetchError::ServerError(500))]);

    let harness = Harness::start(
        catalog(&[("A", 2)]),
        source,
        seeded_cache(&[(key("A", "0"), p0), (key("A", "1"), p1.clone())]),
        None,
        quiet(),
    );
    // The boot refresh and its single retry both fail.
    harness.failures.store(2, Ordering::SeqCst);

    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.failures.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("boot refresh attempted");

    harness.press(LogicalEvent::ScreenNext).await;
    let shown = harness.refreshes(1).await;
    assert_eq!(shown, vec![(RefreshMode::Full, frame(&p1))]);

    harness.stop().await;
}
