//! Panel refresh sequencing.
//!
//! [`Panel`] is the raw hardware: it draws whatever it is told. The
//! [`DisplayAdapter`] sits on top and decides whether a refresh is needed
//! at all and whether it has to be a full one.

#[cfg(target_os = "linux")]
pub mod epd7in5;
pub mod frame;

use inkpanel_logging::targets::T_DISPLAY;

use crate::error::DisplayError;
pub use frame::{placeholder_png, Frame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// Clears and redraws the whole panel. Slow, removes ghosting.
    Full,
    /// Updates in place. Faster, leaves artifacts that add up.
    Partial,
}

impl RefreshMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Partial => "partial",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The frame was already on the panel; no hardware access happened.
    Unchanged,
    Refreshed(RefreshMode),
}

/// Hardware primitives of an e-paper panel. All calls block until the
/// panel is idle again.
pub trait Panel: Send + 'static {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    /// Powers the panel up and resets the controller.
    fn wake(&mut self) -> Result<(), DisplayError>;
    fn full_refresh(&mut self, frame: &[u8]) -> Result<(), DisplayError>;
    fn partial_refresh(&mut self, frame: &[u8]) -> Result<(), DisplayError>;
    /// Deep sleep; `wake` is required before the next refresh.
    fn sleep(&mut self) -> Result<(), DisplayError>;
}

/// Forces a full refresh at boot and after `full_every` partial ones.
#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    full_every: u32,
    partials_since_full: u32,
    had_full: bool,
}

impl RefreshPolicy {
    pub fn new(full_every: u32) -> Self {
        Self {
            full_every,
            partials_since_full: 0,
            had_full: false,
        }
    }

    pub fn resolve(&self, requested: RefreshMode) -> RefreshMode {
        if requested == RefreshMode::Full
            || !self.had_full
            || self.partials_since_full >= self.full_every
        {
            RefreshMode::Full
        } else {
            RefreshMode::Partial
        }
    }

    pub fn record(&mut self, mode: RefreshMode) {
        match mode {
            RefreshMode::Full => {
                self.had_full = true;
                self.partials_since_full = 0;
            }
            RefreshMode::Partial => self.partials_since_full += 1,
        }
    }
}

pub struct DisplayAdapter<P: Panel> {
    panel: P,
    /// What is physically on the panel; `None` at boot and after a failed refresh.
    frame: Option<Vec<u8>>,
    policy: RefreshPolicy,
    awake: bool,
}

impl<P: Panel> DisplayAdapter<P> {
    pub fn new(panel: P, full_every: u32) -> Self {
        Self {
            panel,
            frame: None,
            policy: RefreshPolicy::new(full_every),
            awake: false,
        }
    }

    pub fn width(&self) -> u32 {
        self.panel.width()
    }

    pub fn height(&self) -> u32 {
        self.panel.height()
    }

    pub fn current_frame(&self) -> Option<&[u8]> {
        self.frame.as_deref()
    }

    pub fn panel(&self) -> &P {
        &self.panel
    }

    /// Shows `image` (any decodable format). A failed hardware refresh is
    /// retried once before giving up; the panel is put to sleep either way.
    pub fn refresh(
        &mut self,
        image: &[u8],
        requested: RefreshMode,
    ) -> Result<RefreshOutcome, DisplayError> {
        let frame = Frame::from_image(image, self.panel.width(), self.panel.height())?;
        if self.frame.as_deref() == Some(frame.data()) {
            tracing::debug!(target: T_DISPLAY, "Frame already displayed, skipping refresh");
            return Ok(RefreshOutcome::Unchanged);
        }

        let mode = self.policy.resolve(requested);
        let started = std::time::Instant::now();
        let result = match self.draw(&frame, mode) {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(target: T_DISPLAY, mode = mode.as_str(), "Refresh failed, retrying: {}", err);
                self.draw(&frame, mode)
            }
        };
        if let Err(err) = self.sleep() {
            tracing::warn!(target: T_DISPLAY, "Failed to put panel to sleep: {}", err);
        }

        match result {
            Ok(()) => {
                tracing::info!(
                    target: T_DISPLAY,
                    mode = mode.as_str(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Panel refreshed"
                );
                self.policy.record(mode);
                self.frame = Some(frame.into_data());
                Ok(RefreshOutcome::Refreshed(mode))
            }
            Err(err) => {
                self.frame = None;
                Err(err)
            }
        }
    }

    fn draw(&mut self, frame: &Frame, mode: RefreshMode) -> Result<(), DisplayError> {
        self.wake()?;
        let result = match mode {
            RefreshMode::Full => self.panel.full_refresh(frame.data()),
            RefreshMode::Partial => self.panel.partial_refresh(frame.data()),
        };
        if result.is_err() {
            // Force a reset on the next attempt.
            self.awake = false;
        }
        result
    }

    pub fn wake(&mut self) -> Result<(), DisplayError> {
        if !self.awake {
            self.panel.wake()?;
            self.awake = true;
        }
        Ok(())
    }

    pub fn sleep(&mut self) -> Result<(), DisplayError> {
        if self.awake {
            self.awake = false;
            self.panel.sleep()?;
        }
        Ok(())
    }
}
