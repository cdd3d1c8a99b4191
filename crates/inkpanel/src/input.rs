use std::{
    collections::VecDeque,
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::config::{PinConfig, TimingConfig};
use crate::error::InputError;

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    Left,
    Right,
}

impl Button {
    pub fn event(self) -> LogicalEvent {
        match self {
            Self::Left => LogicalEvent::AppNext,
            Self::Right => LogicalEvent::ScreenNext,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalEvent {
    AppNext,
    ScreenNext,
}

/// Presses waiting to be delivered. When full, the oldest press goes.
#[derive(Debug)]
pub struct InputQueue {
    depth: usize,
    events: VecDeque<LogicalEvent>,
}

impl InputQueue {
    pub fn new(depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            depth,
            events: VecDeque::with_capacity(depth),
        }
    }

    /// Returns the event that had to be dropped to make room, if any.
    pub fn push(&mut self, event: LogicalEvent) -> Option<LogicalEvent> {
        let dropped = if self.events.len() >= self.depth {
            self.events.pop_front()
        } else {
            None
        };
        self.events.push_back(event);
        dropped
    }

    pub fn front(&self) -> Option<LogicalEvent> {
        self.events.front().copied()
    }

    pub fn pop(&mut self) -> Option<LogicalEvent> {
        self.events.pop_front()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = LogicalEvent> + '_ {
        self.events.drain(..)
    }

    pub fn contains(&self, event: LogicalEvent) -> bool {
        self.events.contains(&event)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// A line level is accepted only after it stayed unchanged for `window`.
/// Bounces inside the window restart the clock instead of producing events.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    raw: bool,
    raw_since: Instant,
    settled: bool,
}

impl Debouncer {
    pub fn new(window: Duration, now: Instant) -> Self {
        Self {
            window,
            raw: false,
            raw_since: now,
            settled: false,
        }
    }

    /// Feeds one sample. Returns true exactly once per settled press.
    pub fn update(&mut self, pressed: bool, now: Instant) -> bool {
        if pressed != self.raw {
            self.raw = pressed;
            self.raw_since = now;
            return false;
        }
        if self.raw != self.settled && now.duration_since(self.raw_since) >= self.window {
            self.settled = self.raw;
            return self.settled;
        }
        false
    }
}

#[derive(Debug, Clone)]
struct ButtonState {
    button: Button,
    debouncer: Debouncer,
}

/// Samples every button once; read glitches skip that button for this round.
fn scan<F>(states: &mut [ButtonState], mut read: F, now: Instant, out: &mut VecDeque<LogicalEvent>)
where
    F: FnMut(Button) -> std::result::Result<bool, InputError>,
{
    for state in states.iter_mut() {
        match read(state.button) {
            Ok(pressed) => {
                if state.debouncer.update(pressed, now) {
                    tracing::debug!(button = ?state.button, "Button press");
                    out.push_back(state.button.event());
                }
            }
            Err(err) => tracing::debug!("Ignoring input glitch: {}", err),
        }
    }
}

#[cfg(target_os = "linux")]
mod platform {
    use super::*;
    use linux_embedded_hal::gpio_cdev::{Chip, LineHandle, LineRequestFlags};

    struct ButtonLine {
        pin: u32,
        handle: LineHandle,
    }

    pub struct ButtonPad {
        lines: Vec<(Button, ButtonLine)>,
        states: Vec<ButtonState>,
        poll_interval: Duration,
        pending: VecDeque<LogicalEvent>,
    }

    impl ButtonPad {
        pub fn new(pins: &PinConfig, timing: &TimingConfig) -> Result<Self> {
            let mut chip = Chip::new(&pins.gpio_chip)
                .with_context(|| format!("opening GPIO chip {}", pins.gpio_chip))?;
            let now = Instant::now();
            let mut lines = Vec::new();
            let mut states = Vec::new();
            for (button, pin) in [
                (Button::Left, pins.key_left_pin),
                (Button::Right, pins.key_right_pin),
            ] {
                let line = chip
                    .get_line(pin)
                    .with_context(|| format!("requesting GPIO line {}", pin))?;
                // Buttons pull the line to ground; pull-ups come from the
                // device tree overlay, so idle reads 1.
                let handle = line
                    .request(LineRequestFlags::INPUT, 1, "inkpanel-buttons")
                    .with_context(|| format!("configuring GPIO line {}", pin))?;
                lines.push((button, ButtonLine { pin, handle }));
                states.push(ButtonState {
                    button,
                    debouncer: Debouncer::new(timing.debounce(), now),
                });
            }
            Ok(Self {
                lines,
                states,
                poll_interval: timing.input_poll(),
                pending: VecDeque::new(),
            })
        }

        /// Blocks until a settled press. Returns `None` once `cancel` fires or
        /// `timeout` passes without one.
        pub fn next_event(
            &mut self,
            cancel: &CancellationToken,
            timeout: Option<Duration>,
        ) -> Option<LogicalEvent> {
            let deadline = timeout.map(|timeout| Instant::now() + timeout);
            loop {
                if let Some(event) = self.pending.pop_front() {
                    return Some(event);
                }
                if cancel.is_cancelled() {
                    return None;
                }
                let lines = &self.lines;
                scan(
                    &mut self.states,
                    |button| {
                        let (_, line) = lines
                            .iter()
                            .find(|(b, _)| *b == button)
                            .ok_or_else(|| InputError {
                                line: 0,
                                message: format!("button {button:?} missing"),
                            })?;
                        line.handle
                            .get_value()
                            .map(|value| value == 0)
                            .map_err(|err| InputError {
                                line: line.pin,
                                message: err.to_string(),
                            })
                    },
                    Instant::now(),
                    &mut self.pending,
                );
                if self.pending.is_empty() {
                    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        return None;
                    }
                    thread::sleep(self.poll_interval);
                }
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod platform {
    use super::*;

    pub struct ButtonPad {
        poll_interval: Duration,
    }

    impl ButtonPad {
        pub fn new(_: &PinConfig, timing: &TimingConfig) -> Result<Self> {
            Ok(Self {
                poll_interval: timing.input_poll().max(Duration::from_millis(50)),
            })
        }

        pub fn next_event(
            &mut self,
            cancel: &CancellationToken,
            timeout: Option<Duration>,
        ) -> Option<LogicalEvent> {
            let deadline = timeout.map(|timeout| Instant::now() + timeout);
            while !cancel.is_cancelled() {
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    break;
                }
                thread::sleep(self.poll_interval);
            }
            None
        }
    }
}

pub use platform::ButtonPad;

/// How long the thread waits for a new press before retrying a held-back one.
const BACKLOG_RETRY: Duration = Duration::from_millis(20);

/// Runs the pad on its own thread and forwards presses into `tx`.
/// Presses that do not fit wait in a backlog of `depth`, which drops its
/// oldest entry when full so the newest press always survives.
pub fn spawn_button_thread(
    mut pad: ButtonPad,
    tx: mpsc::Sender<LogicalEvent>,
    depth: usize,
    cancel: CancellationToken,
) -> Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("inkpanel-buttons".to_string())
        .spawn(move || {
            tracing::info!("Button monitor started");
            let mut backlog = InputQueue::new(depth);
            loop {
                let wait = (!backlog.is_empty()).then_some(BACKLOG_RETRY);
                match pad.next_event(&cancel, wait) {
                    Some(event) => {
                        if let Some(dropped) = backlog.push(event) {
                            tracing::warn!(?dropped, "Input channel full, dropping oldest press");
                        }
                    }
                    None if cancel.is_cancelled() => break,
                    None => {}
                }
                if !forward(&mut backlog, &tx) {
                    break;
                }
            }
            tracing::info!("Button monitor stopped");
        })
        .context("spawning button thread")
}

/// Sends backlog entries in order until `tx` is full. Returns false once the
/// receiver is gone.
fn forward(backlog: &mut InputQueue, tx: &mpsc::Sender<LogicalEvent>) -> bool {
    while let Some(event) = backlog.front() {
        match tx.try_send(event) {
            Ok(()) => {
                backlog.pop();
            }
            Err(TrySendError::Full(_)) => return true,
            Err(TrySendError::Closed(_)) => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(50);

    fn ms(base: Instant, millis: u64) -> Instant {
        base + Duration::from_millis(millis)
    }

    use LogicalEvent::{AppNext, ScreenNext};

    #[test]
    fn queue_keeps_order() {
        let mut queue = InputQueue::new(4);
        assert_eq!(queue.push(AppNext), None);
        assert_eq!(queue.push(ScreenNext), None);
        assert_eq!(queue.drain().collect::<Vec<_>>(), vec![AppNext, ScreenNext]);
        assert!(queue.is_empty());
    }

    #[test]
    fn full_queue_drops_oldest() {
        let mut queue = InputQueue::new(2);
        queue.push(AppNext);
        queue.push(ScreenNext);
        assert_eq!(queue.push(ScreenNext), Some(AppNext));
        assert_eq!(queue.len(), 2);
        assert!(!queue.contains(AppNext));
    }

    #[test]
    fn zero_depth_still_holds_newest() {
        let mut queue = InputQueue::new(0);
        queue.push(AppNext);
        assert_eq!(queue.push(ScreenNext), Some(AppNext));
        assert_eq!(queue.drain().collect::<Vec<_>>(), vec![ScreenNext]);
    }

    #[test]
    fn full_channel_keeps_newest_press_in_backlog() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut backlog = InputQueue::new(2);

        backlog.push(AppNext);
        assert!(forward(&mut backlog, &tx));
        assert!(backlog.is_empty());

        // Channel is full: later presses wait, and the oldest waiting one goes.
        backlog.push(ScreenNext);
        backlog.push(AppNext);
        assert_eq!(backlog.push(ScreenNext), Some(ScreenNext));
        assert!(forward(&mut backlog, &tx));
        assert_eq!(backlog.len(), 2);

        assert_eq!(rx.try_recv().ok(), Some(AppNext));
        assert!(forward(&mut backlog, &tx));
        assert_eq!(rx.try_recv().ok(), Some(AppNext));
        assert!(forward(&mut backlog, &tx));
        assert_eq!(rx.try_recv().ok(), Some(ScreenNext));
        assert!(backlog.is_empty());

        drop(rx);
        backlog.push(AppNext);
        assert!(!forward(&mut backlog, &tx));
    }

    #[test]
    fn stable_press_fires_once() {
        let t0 = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW, t0);
        assert!(!debouncer.update(true, ms(t0, 0)));
        assert!(!debouncer.update(true, ms(t0, 30)));
        assert!(debouncer.update(true, ms(t0, 50)));
        assert!(!debouncer.update(true, ms(t0, 500)));
    }

    #[test]
    fn bounces_inside_window_are_coalesced() {
        let t0 = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW, t0);
        let mut fired = 0;
        for (i, level) in [true, false, true, false, true].into_iter().enumerate() {
            if debouncer.update(level, ms(t0, i as u64 * 5)) {
                fired += 1;
            }
        }
        assert_eq!(fired, 0);
        assert!(debouncer.update(true, ms(t0, 20 + 50)));
    }

    #[test]
    fn release_must_settle_before_next_press() {
        let t0 = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW, t0);
        debouncer.update(true, ms(t0, 0));
        assert!(debouncer.update(true, ms(t0, 60)));
        // A short release glitch does not re-arm the button.
        debouncer.update(false, ms(t0, 70));
        debouncer.update(true, ms(t0, 80));
        assert!(!debouncer.update(true, ms(t0, 200)));
        // A settled release does.
        debouncer.update(false, ms(t0, 300));
        assert!(!debouncer.update(false, ms(t0, 400)));
        debouncer.update(true, ms(t0, 410));
        assert!(debouncer.update(true, ms(t0, 470)));
    }

    #[test]
    fn scan_maps_buttons_and_skips_glitches() {
        let t0 = Instant::now();
        let mut states = vec![
            ButtonState {
                button: Button::Left,
                debouncer: Debouncer::new(WINDOW, t0),
            },
            ButtonState {
                button: Button::Right,
                debouncer: Debouncer::new(WINDOW, t0),
            },
        ];
        let mut out = VecDeque::new();
        let read = |button| match button {
            Button::Left => Ok(true),
            Button::Right => Err(InputError {
                line: 16,
                message: "EIO".into(),
            }),
        };
        scan(&mut states, read, ms(t0, 0), &mut out);
        scan(&mut states, read, ms(t0, 60), &mut out);
        assert_eq!(out, VecDeque::from([LogicalEvent::AppNext]));
        assert_eq!(Button::Right.event(), LogicalEvent::ScreenNext);
    }
}
