use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::util::write_atomic;

pub const DEFAULT_ROOT_PATH: &str = "/opt/inkpanel";
pub const CONFIG_FILENAME: &str = "panel_conf.json";

/// Resolves the data root: explicit argument, then `INKPANEL_ROOT`, then the default.
pub fn resolve_root(root: Option<PathBuf>) -> PathBuf {
    root.or_else(|| env::var("INKPANEL_ROOT").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT_PATH))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PanelConfig {
    #[serde(default)]
    pub pins: PinConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub paths: PathConfig,
    /// Static catalog. Empty means "ask the server".
    #[serde(default)]
    pub apps: Vec<AppConfig>,
}

impl PanelConfig {
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILENAME);
        if !path.exists() {
            let default = PanelConfig::default();
            default.save(&path)?;
            return Ok(default);
        }

        let contents =
            fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let mut config: PanelConfig = serde_json::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        if config.normalize() {
            tracing::warn!("Repaired out-of-range values in {}", path.display());
            config.save(&path)?;
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut json = serde_json::to_vec_pretty(self)?;
        json.push(b'\n');
        write_atomic(path, &json).with_context(|| format!("saving {}", path.display()))
    }

    /// Environment overrides that should not be persisted.
    pub fn apply_env(&mut self) {
        if let Ok(url) = env::var("INKPANEL_SERVER_URL") {
            let url = url.trim();
            if !url.is_empty() {
                self.server.url = url.to_string();
            }
        }
    }

    /// Clamps values that would break the controller. Returns true if anything changed.
    pub fn normalize(&mut self) -> bool {
        let mut changed = false;
        if self.server.fetch_attempts == 0 {
            self.server.fetch_attempts = 1;
            changed = true;
        }
        if self.server.request_timeout_ms == 0 {
            self.server.request_timeout_ms = ServerConfig::default_request_timeout();
            changed = true;
        }
        if self.timing.input_queue_depth == 0 {
            self.timing.input_queue_depth = 1;
            changed = true;
        }
        if self.timing.input_poll_ms == 0 {
            self.timing.input_poll_ms = TimingConfig::default_input_poll();
            changed = true;
        }
        let before = self.apps.len();
        self.apps.retain(|app| !app.id.trim().is_empty());
        for app in &mut self.apps {
            if app.screens.is_empty() {
                app.screens.push(ScreenConfig {
                    id: "0".to_string(),
                    path: None,
                });
                changed = true;
            }
        }
        changed || before != self.apps.len()
    }

    pub fn cache_dir(&self, root: &Path) -> PathBuf {
        absolutize(root, &self.paths.cache_dir)
    }

    pub fn placeholder_path(&self, root: &Path) -> Option<PathBuf> {
        self.paths
            .placeholder_image
            .as_ref()
            .map(|path| absolutize(root, path))
    }
}

fn absolutize(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinConfig {
    #[serde(default = "PinConfig::default_gpio_chip")]
    pub gpio_chip: String,
    #[serde(default = "PinConfig::default_key_left")]
    pub key_left_pin: u32,
    #[serde(default = "PinConfig::default_key_right")]
    pub key_right_pin: u32,
    #[serde(default = "PinConfig::default_spi_device")]
    pub spi_device: String,
    #[serde(default = "PinConfig::default_spi_speed")]
    pub spi_speed_hz: u32,
    #[serde(default = "PinConfig::default_epd_dc")]
    pub epd_dc_pin: u32,
    #[serde(default = "PinConfig::default_epd_rst")]
    pub epd_rst_pin: u32,
    #[serde(default = "PinConfig::default_epd_busy")]
    pub epd_busy_pin: u32,
    #[serde(default = "PinConfig::default_epd_pwr")]
    pub epd_pwr_pin: Option<u32>,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            gpio_chip: Self::default_gpio_chip(),
            key_left_pin: Self::default_key_left(),
            key_right_pin: Self::default_key_right(),
            spi_device: Self::default_spi_device(),
            spi_speed_hz: Self::default_spi_speed(),
            epd_dc_pin: Self::default_epd_dc(),
            epd_rst_pin: Self::default_epd_rst(),
            epd_busy_pin: Self::default_epd_busy(),
            epd_pwr_pin: Self::default_epd_pwr(),
        }
    }
}

impl PinConfig {
    fn default_gpio_chip() -> String {
        "/dev/gpiochip0".to_string()
    }
    const fn default_key_left() -> u32 {
        20
    }
    const fn default_key_right() -> u32 {
        16
    }
    fn default_spi_device() -> String {
        "/dev/spidev0.0".to_string()
    }
    const fn default_spi_speed() -> u32 {
        4_000_000
    }
    const fn default_epd_dc() -> u32 {
        25
    }
    const fn default_epd_rst() -> u32 {
        17
    }
    const fn default_epd_busy() -> u32 {
        24
    }
    // Rev 2.2+ driver HATs gate panel power on GPIO 18.
    const fn default_epd_pwr() -> Option<u32> {
        Some(18)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "ServerConfig::default_url")]
    pub url: String,
    /// `{server}`, `{app}` and `{screen}` are substituted.
    #[serde(default = "ServerConfig::default_image_template")]
    pub image_url_template: String,
    #[serde(default = "ServerConfig::default_catalog_template")]
    pub catalog_url_template: String,
    #[serde(default = "ServerConfig::default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default = "ServerConfig::default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "ServerConfig::default_fetch_attempts")]
    pub fetch_attempts: u32,
    #[serde(default = "ServerConfig::default_backoff_base")]
    pub backoff_base_ms: u64,
    #[serde(default = "ServerConfig::default_max_payload")]
    pub max_payload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: Self::default_url(),
            image_url_template: Self::default_image_template(),
            catalog_url_template: Self::default_catalog_template(),
            request_timeout_ms: Self::default_request_timeout(),
            connect_timeout_ms: Self::default_connect_timeout(),
            fetch_attempts: Self::default_fetch_attempts(),
            backoff_base_ms: Self::default_backoff_base(),
            max_payload_bytes: Self::default_max_payload(),
        }
    }
}

impl ServerConfig {
    fn default_url() -> String {
        "http://localhost:8000".to_string()
    }
    fn default_image_template() -> String {
        "{server}/app/{app}/{screen}.png".to_string()
    }
    fn default_catalog_template() -> String {
        "{server}/info.json".to_string()
    }
    const fn default_request_timeout() -> u64 {
        10_000
    }
    const fn default_connect_timeout() -> u64 {
        5_000
    }
    const fn default_fetch_attempts() -> u32 {
        3
    }
    const fn default_backoff_base() -> u64 {
        500
    }
    const fn default_max_payload() -> usize {
        4 * 1024 * 1024
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "TimingConfig::default_debounce")]
    pub debounce_ms: u64,
    #[serde(default = "TimingConfig::default_input_poll")]
    pub input_poll_ms: u64,
    /// Refresh-ahead period for the shown screen; 0 disables.
    #[serde(default = "TimingConfig::default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Partial refreshes allowed before a full refresh is forced; 0 means always full.
    #[serde(default = "TimingConfig::default_full_refresh_every")]
    pub full_refresh_every: u32,
    /// Switch to the next app after this long without an app change; 0 disables.
    #[serde(default = "TimingConfig::default_auto_advance")]
    pub auto_advance_mins: u64,
    #[serde(default = "TimingConfig::default_queue_depth")]
    pub input_queue_depth: usize,
    #[serde(default = "TimingConfig::default_busy_timeout")]
    pub busy_timeout_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            debounce_ms: Self::default_debounce(),
            input_poll_ms: Self::default_input_poll(),
            poll_interval_secs: Self::default_poll_interval(),
            full_refresh_every: Self::default_full_refresh_every(),
            auto_advance_mins: Self::default_auto_advance(),
            input_queue_depth: Self::default_queue_depth(),
            busy_timeout_secs: Self::default_busy_timeout(),
        }
    }
}

impl TimingConfig {
    const fn default_debounce() -> u64 {
        100
    }
    const fn default_input_poll() -> u64 {
        5
    }
    const fn default_poll_interval() -> u64 {
        60
    }
    const fn default_full_refresh_every() -> u32 {
        10
    }
    const fn default_auto_advance() -> u64 {
        60
    }
    const fn default_queue_depth() -> usize {
        4
    }
    const fn default_busy_timeout() -> u64 {
        30
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn input_poll(&self) -> Duration {
        Duration::from_millis(self.input_poll_ms)
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_secs > 0).then(|| Duration::from_secs(self.poll_interval_secs))
    }

    pub fn auto_advance(&self) -> Option<Duration> {
        (self.auto_advance_mins > 0).then(|| Duration::from_secs(self.auto_advance_mins * 60))
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    #[serde(default = "PathConfig::default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Shown when nothing is cached and the fetch failed. A built-in frame is used when unset.
    #[serde(default)]
    pub placeholder_image: Option<PathBuf>,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            cache_dir: Self::default_cache_dir(),
            placeholder_image: None,
        }
    }
}

impl PathConfig {
    fn default_cache_dir() -> PathBuf {
        PathBuf::from("cache")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub id: String,
    #[serde(default)]
    pub screens: Vec<ScreenConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScreenConfig {
    pub id: String,
    /// Substituted for `{screen}` in the image URL; defaults to `id`.
    #[serde(default)]
    pub path: Option<String>,
}
