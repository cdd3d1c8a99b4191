//! Waveshare 7.5" V2 black/white panel (800x480) over spidev and gpio-cdev.

use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::spi::SpiDevice;
use linux_embedded_hal::{
    gpio_cdev::{Chip, LineRequestFlags},
    spidev::{SpiModeFlags, SpidevOptions},
    CdevPin, SpidevDevice,
};

use super::{Frame, Panel, RefreshMode};
use crate::config::{PinConfig, TimingConfig};
use crate::error::DisplayError;

pub const WIDTH: u32 = 800;
pub const HEIGHT: u32 = 480;

const SPI_CHUNK: usize = 4096;
const BUSY_POLL: Duration = Duration::from_millis(20);

mod cmd {
    pub const PANEL_SETTING: u8 = 0x00;
    pub const POWER_SETTING: u8 = 0x01;
    pub const POWER_OFF: u8 = 0x02;
    pub const POWER_ON: u8 = 0x04;
    pub const BOOSTER_SOFT_START: u8 = 0x06;
    pub const DEEP_SLEEP: u8 = 0x07;
    pub const DATA_START_OLD: u8 = 0x10;
    pub const DISPLAY_REFRESH: u8 = 0x12;
    pub const DATA_START_NEW: u8 = 0x13;
    pub const DUAL_SPI: u8 = 0x15;
    pub const VCOM_DATA_INTERVAL: u8 = 0x50;
    pub const TCON: u8 = 0x60;
    pub const RESOLUTION: u8 = 0x61;
    pub const GET_STATUS: u8 = 0x71;
    pub const PARTIAL_WINDOW: u8 = 0x90;
    pub const PARTIAL_IN: u8 = 0x91;
    pub const CASCADE: u8 = 0xE0;
    pub const FORCE_TEMPERATURE: u8 = 0xE5;
}

pub struct Epd7in5 {
    spi: SpidevDevice,
    dc: CdevPin,
    rst: CdevPin,
    busy: CdevPin,
    pwr: Option<CdevPin>,
    busy_timeout: Duration,
    /// Which LUT set the controller is loaded with since the last reset.
    loaded: Option<RefreshMode>,
}

fn output_pin(chip: &mut Chip, pin: u32, initial: u8, label: &str) -> Result<CdevPin> {
    let handle = chip
        .get_line(pin)
        .with_context(|| format!("getting {label} line {pin}"))?
        .request(LineRequestFlags::OUTPUT, initial, label)
        .with_context(|| format!("requesting {label} line {pin}"))?;
    CdevPin::new(handle).with_context(|| format!("creating {label} pin"))
}

fn bus(what: &str, err: impl std::fmt::Debug) -> DisplayError {
    DisplayError::Bus(format!("{what}: {err:?}"))
}

impl Epd7in5 {
    pub fn open(pins: &PinConfig, timing: &TimingConfig) -> Result<Self> {
        let mut spi = SpidevDevice::open(&pins.spi_device)
            .with_context(|| format!("opening SPI device {}", pins.spi_device))?;
        let options = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(pins.spi_speed_hz)
            .mode(SpiModeFlags::SPI_MODE_0)
            .build();
        spi.configure(&options).context("configuring SPI")?;

        let mut chip = Chip::new(&pins.gpio_chip)
            .with_context(|| format!("opening GPIO chip {}", pins.gpio_chip))?;
        let dc = output_pin(&mut chip, pins.epd_dc_pin, 0, "inkpanel-dc")?;
        let rst = output_pin(&mut chip, pins.epd_rst_pin, 1, "inkpanel-rst")?;
        let busy_handle = chip
            .get_line(pins.epd_busy_pin)
            .with_context(|| format!("getting busy line {}", pins.epd_busy_pin))?
            .request(LineRequestFlags::INPUT, 0, "inkpanel-busy")
            .context("requesting busy line")?;
        let busy = CdevPin::new(busy_handle).context("creating busy pin")?;
        let pwr = pins
            .epd_pwr_pin
            .map(|pin| output_pin(&mut chip, pin, 0, "inkpanel-pwr"))
            .transpose()?;

        tracing::info!(
            spi = %pins.spi_device,
            dc = pins.epd_dc_pin,
            rst = pins.epd_rst_pin,
            busy = pins.epd_busy_pin,
            "EPD 7.5\" V2 attached"
        );
        Ok(Self {
            spi,
            dc,
            rst,
            busy,
            pwr,
            busy_timeout: timing.busy_timeout(),
            loaded: None,
        })
    }

    fn command(&mut self, command: u8) -> Result<(), DisplayError> {
        self.dc.set_low().map_err(|e| bus("dc low", e))?;
        self.spi.write(&[command]).map_err(|e| bus("spi command", e))
    }

    fn data(&mut self, data: &[u8]) -> Result<(), DisplayError> {
        self.dc.set_high().map_err(|e| bus("dc high", e))?;
        for chunk in data.chunks(SPI_CHUNK) {
            self.spi.write(chunk).map_err(|e| bus("spi data", e))?;
        }
        Ok(())
    }

    fn send(&mut self, command: u8, data: &[u8]) -> Result<(), DisplayError> {
        self.command(command)?;
        if !data.is_empty() {
            self.data(data)?;
        }
        Ok(())
    }

    /// The controller holds BUSY low while working.
    fn wait_idle(&mut self) -> Result<(), DisplayError> {
        let started = Instant::now();
        loop {
            self.command(cmd::GET_STATUS)?;
            if self.busy.is_high().map_err(|e| bus("busy read", e))? {
                return Ok(());
            }
            if started.elapsed() >= self.busy_timeout {
                return Err(DisplayError::BusyTimeout(self.busy_timeout));
            }
            sleep(BUSY_POLL);
        }
    }

    fn reset(&mut self) -> Result<(), DisplayError> {
        self.rst.set_high().map_err(|e| bus("rst", e))?;
        sleep(Duration::from_millis(20));
        self.rst.set_low().map_err(|e| bus("rst", e))?;
        sleep(Duration::from_millis(2));
        self.rst.set_high().map_err(|e| bus("rst", e))?;
        sleep(Duration::from_millis(20));
        Ok(())
    }

    fn init_full(&mut self) -> Result<(), DisplayError> {
        self.send(cmd::BOOSTER_SOFT_START, &[0x17, 0x17, 0x28, 0x17])?;
        self.send(cmd::POWER_SETTING, &[0x07, 0x07, 0x28, 0x17])?;
        self.send(cmd::POWER_ON, &[])?;
        sleep(Duration::from_millis(100));
        self.wait_idle()?;
        self.send(cmd::PANEL_SETTING, &[0x1F])?;
        self.send(cmd::RESOLUTION, &[0x03, 0x20, 0x01, 0xE0])?;
        self.send(cmd::DUAL_SPI, &[0x00])?;
        self.send(cmd::VCOM_DATA_INTERVAL, &[0x10, 0x07])?;
        self.send(cmd::TCON, &[0x22])?;
        self.loaded = Some(RefreshMode::Full);
        Ok(())
    }

    fn init_partial(&mut self) -> Result<(), DisplayError> {
        self.send(cmd::PANEL_SETTING, &[0x1F])?;
        self.send(cmd::POWER_ON, &[])?;
        sleep(Duration::from_millis(100));
        self.wait_idle()?;
        self.send(cmd::CASCADE, &[0x02])?;
        self.send(cmd::FORCE_TEMPERATURE, &[0x6E])?;
        self.loaded = Some(RefreshMode::Partial);
        Ok(())
    }

    fn check_len(frame: &[u8]) -> Result<(), DisplayError> {
        let expected = Frame::stride(WIDTH) * HEIGHT as usize;
        if frame.len() != expected {
            return Err(DisplayError::FrameSize {
                expected,
                actual: frame.len(),
            });
        }
        Ok(())
    }
}

impl Panel for Epd7in5 {
    fn width(&self) -> u32 {
        WIDTH
    }

    fn height(&self) -> u32 {
        HEIGHT
    }

    fn wake(&mut self) -> Result<(), DisplayError> {
        if let Some(pwr) = self.pwr.as_mut() {
            pwr.set_high().map_err(|e| bus("pwr", e))?;
            sleep(Duration::from_millis(10));
        }
        self.loaded = None;
        self.reset()
    }

    fn full_refresh(&mut self, frame: &[u8]) -> Result<(), DisplayError> {
        Self::check_len(frame)?;
        if self.loaded != Some(RefreshMode::Full) {
            self.init_full()?;
        }
        // Old-data plane takes the inverse so the whole panel is driven.
        let inverted: Vec<u8> = frame.iter().map(|b| !b).collect();
        self.send(cmd::DATA_START_OLD, &inverted)?;
        self.send(cmd::DATA_START_NEW, frame)?;
        self.send(cmd::DISPLAY_REFRESH, &[])?;
        sleep(Duration::from_millis(100));
        self.wait_idle()
    }

    fn partial_refresh(&mut self, frame: &[u8]) -> Result<(), DisplayError> {
        Self::check_len(frame)?;
        if self.loaded != Some(RefreshMode::Partial) {
            self.init_partial()?;
        }
        self.send(cmd::VCOM_DATA_INTERVAL, &[0xA9, 0x07])?;
        self.send(cmd::PARTIAL_IN, &[])?;
        let x_end = (WIDTH - 1) as u16;
        let y_end = (HEIGHT - 1) as u16;
        self.send(
            cmd::PARTIAL_WINDOW,
            &[
                0x00,
                0x00,
                (x_end >> 8) as u8,
                (x_end & 0xFF) as u8,
                0x00,
                0x00,
                (y_end >> 8) as u8,
                (y_end & 0xFF) as u8,
                0x01,
            ],
        )?;
        self.send(cmd::DATA_START_NEW, frame)?;
        self.send(cmd::DISPLAY_REFRESH, &[])?;
        sleep(Duration::from_millis(100));
        self.wait_idle()
    }

    fn sleep(&mut self) -> Result<(), DisplayError> {
        self.send(cmd::VCOM_DATA_INTERVAL, &[0xF7])?;
        self.send(cmd::POWER_OFF, &[])?;
        self.wait_idle()?;
        self.send(cmd::DEEP_SLEEP, &[0xA5])?;
        self.loaded = None;
        if let Some(pwr) = self.pwr.as_mut() {
            sleep(Duration::from_millis(2));
            pwr.set_low().map_err(|e| bus("pwr", e))?;
        }
        tracing::debug!(target: inkpanel_logging::targets::T_DISPLAY, "Panel asleep");
        Ok(())
    }
}
