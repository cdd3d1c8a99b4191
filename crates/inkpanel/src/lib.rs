//! Two-button e-paper panel controller.
//!
//! Buttons cycle through apps and their screens; each screen is an image
//! rendered by a remote server, cached locally and pushed to the panel.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod controller;
pub mod display;
pub mod error;
pub mod fetch;
pub mod input;
pub mod navigation;
pub mod util;

pub use cache::{CachedImage, ImageCache};
pub use catalog::{Catalog, ContentKey, Target};
pub use config::PanelConfig;
pub use controller::{ControllerSettings, PanelController};
pub use display::{DisplayAdapter, Panel, RefreshMode, RefreshOutcome};
pub use error::{CacheError, DisplayError, FetchError, InputError};
pub use fetch::{HttpImageSource, ImageSource, RetryPolicy, Retrying};
pub use input::LogicalEvent;
pub use navigation::{NavigationState, Navigator};
