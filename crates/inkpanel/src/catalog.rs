//! The app/screen hierarchy shown on the panel.
//!
//! A catalog is fixed for the lifetime of the process. It comes from the
//! static `apps` list in the config, or from the server's `info.json`, or
//! from the copy of that file saved on the last successful boot.

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::navigation::NavigationState;
use crate::util::write_atomic;

/// Cache key of one screen's image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentKey {
    pub app: String,
    pub screen: String,
}

impl ContentKey {
    pub fn new(app: impl Into<String>, screen: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            screen: screen.into(),
        }
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app, self.screen)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Screen {
    pub id: String,
    /// Substituted into the image URL.
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct App {
    pub id: String,
    pub screens: Vec<Screen>,
}

/// Everything the fetch client and the cache need to know about one screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub state: NavigationState,
    pub key: ContentKey,
    pub reference: String,
}

/// `info.json` as served by the rendering server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerInfo {
    pub apps: Vec<ServerApp>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerApp {
    #[serde(default)]
    pub name: Option<String>,
    pub nb_screens: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    apps: Vec<App>,
}

impl Catalog {
    /// Every app must have at least one screen.
    pub fn new(apps: Vec<App>) -> Result<Self> {
        if apps.is_empty() {
            bail!("catalog has no apps");
        }
        if let Some(app) = apps.iter().find(|app| app.screens.is_empty()) {
            bail!("app {} has no screens", app.id);
        }
        Ok(Self { apps })
    }

    pub fn from_config(apps: &[AppConfig]) -> Result<Self> {
        Self::new(
            apps.iter()
                .map(|app| App {
                    id: app.id.clone(),
                    screens: app
                        .screens
                        .iter()
                        .map(|screen| Screen {
                            id: screen.id.clone(),
                            reference: screen.path.clone().unwrap_or_else(|| screen.id.clone()),
                        })
                        .collect(),
                })
                .collect(),
        )
    }

    /// The server addresses apps and screens by ordinal.
    pub fn from_info(info: &ServerInfo) -> Result<Self> {
        Self::new(
            info.apps
                .iter()
                .enumerate()
                .filter(|(_, app)| app.nb_screens > 0)
                .map(|(idx, app)| App {
                    id: idx.to_string(),
                    screens: (0..app.nb_screens)
                        .map(|screen| Screen {
                            id: screen.to_string(),
                            reference: screen.to_string(),
                        })
                        .collect(),
                })
                .collect(),
        )
    }

    /// One app with one screen, used when no catalog is known at all.
    pub fn single() -> Self {
        Self {
            apps: vec![App {
                id: "0".to_string(),
                screens: vec![Screen {
                    id: "0".to_string(),
                    reference: "0".to_string(),
                }],
            }],
        }
    }

    pub fn apps(&self) -> &[App] {
        &self.apps
    }

    pub fn screen_counts(&self) -> Vec<usize> {
        self.apps.iter().map(|app| app.screens.len()).collect()
    }

    /// `state` must come from a navigator built over this catalog.
    pub fn target(&self, state: NavigationState) -> Target {
        let app = &self.apps[state.app];
        let screen = &app.screens[state.screen];
        Target {
            state,
            key: ContentKey::new(app.id.clone(), screen.id.clone()),
            reference: screen.reference.clone(),
        }
    }
}

pub fn load_saved_info(path: &Path) -> Option<ServerInfo> {
    let contents = fs::read(path).ok()?;
    match serde_json::from_slice(&contents) {
        Ok(info) => Some(info),
        Err(err) => {
            tracing::warn!("Ignoring unreadable saved catalog {}: {}", path.display(), err);
            None
        }
    }
}

pub fn save_info(path: &Path, info: &ServerInfo) -> Result<()> {
    let json = serde_json::to_vec_pretty(info).context("serializing catalog")?;
    write_atomic(path, &json).with_context(|| format!("saving catalog {}", path.display()))
}
