//! Last good image per screen, kept in memory and mirrored to disk.
//!
//! Each entry is one file named after the hex-encoded key:
//!
//! ```text
//! magic "IPC1" | fetched_at unix ms (u64 LE) | sha256(payload) | payload
//! ```
//!
//! Unreadable or corrupt files are dropped on open and count as misses.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};

use crate::catalog::ContentKey;
use crate::error::CacheError;
use crate::util::{is_temp_file, write_atomic};

const MAGIC: &[u8; 4] = b"IPC1";
const HEADER_LEN: usize = 4 + 8 + 32;
const EXTENSION: &str = "img";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedImage {
    pub key: ContentKey,
    pub bytes: Arc<[u8]>,
    pub fetched_at: DateTime<Utc>,
}

pub struct ImageCache {
    dir: PathBuf,
    entries: HashMap<ContentKey, CachedImage>,
}

impl ImageCache {
    /// Loads every valid entry under `dir`, creating the directory if needed.
    pub fn open(dir: &Path) -> Result<Self, CacheError> {
        fs::create_dir_all(dir).map_err(|source| CacheError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let read_dir = fs::read_dir(dir).map_err(|source| CacheError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut entries = HashMap::new();
        for entry in read_dir.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_temp_file(&name) {
                let _ = fs::remove_file(&path);
                continue;
            }
            let Some(key) = key_from_file_name(&name) else {
                continue;
            };
            match read_entry(&path, &key) {
                Ok(image) => {
                    entries.insert(key, image);
                }
                Err(err) => {
                    tracing::warn!("Dropping cache entry: {}", err);
                    let _ = fs::remove_file(&path);
                }
            }
        }

        tracing::info!(dir = %dir.display(), entries = entries.len(), "Image cache opened");
        Ok(Self {
            dir: dir.to_path_buf(),
            entries,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &ContentKey) -> Option<CachedImage> {
        self.entries.get(key).cloned()
    }

    /// Persists before updating memory, so a failed write keeps the old entry.
    pub fn put(&mut self, key: &ContentKey, bytes: Arc<[u8]>) -> Result<(), CacheError> {
        let fetched_at = Utc::now();
        let path = self.path_for(key);

        let mut data = Vec::with_capacity(HEADER_LEN + bytes.len());
        data.extend_from_slice(MAGIC);
        data.extend_from_slice(&(fetched_at.timestamp_millis() as u64).to_le_bytes());
        data.extend_from_slice(&Sha256::digest(&bytes));
        data.extend_from_slice(&bytes);
        write_atomic(&path, &data).map_err(|source| CacheError::Io {
            path: path.clone(),
            source,
        })?;

        self.entries.insert(
            key.clone(),
            CachedImage {
                key: key.clone(),
                bytes,
                fetched_at,
            },
        );
        Ok(())
    }

    /// Forgets `key` in memory and on disk. A missing file is not an error.
    pub fn remove(&mut self, key: &ContentKey) -> Result<(), CacheError> {
        self.entries.remove(key);
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CacheError::Io { path, source }),
        }
    }

    fn path_for(&self, key: &ContentKey) -> PathBuf {
        self.dir.join(file_name_for(key))
    }
}

// Ids come from config or the server; hex keeps them out of path syntax.
fn file_name_for(key: &ContentKey) -> String {
    format!(
        "{}_{}.{EXTENSION}",
        hex::encode(key.app.as_bytes()),
        hex::encode(key.screen.as_bytes())
    )
}

fn key_from_file_name(name: &str) -> Option<ContentKey> {
    let stem = name.strip_suffix(&format!(".{EXTENSION}"))?;
    let (app, screen) = stem.split_once('_')?;
    let app = String::from_utf8(hex::decode(app).ok()?).ok()?;
    let screen = String::from_utf8(hex::decode(screen).ok()?).ok()?;
    Some(ContentKey { app, screen })
}

fn read_entry(path: &Path, key: &ContentKey) -> Result<CachedImage, CacheError> {
    let data = fs::read(path).map_err(|source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let corrupt = |reason| CacheError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };
    if data.len() < HEADER_LEN {
        return Err(corrupt("truncated header"));
    }
    if &data[..4] != MAGIC {
        return Err(corrupt("bad magic"));
    }
    let mut stamp = [0u8; 8];
    stamp.copy_from_slice(&data[4..12]);
    let payload = &data[HEADER_LEN..];
    if payload.is_empty() {
        return Err(corrupt("empty payload"));
    }
    if Sha256::digest(payload).as_slice() != &data[12..HEADER_LEN] {
        return Err(corrupt("checksum mismatch"));
    }
    let fetched_at = Utc
        .timestamp_millis_opt(u64::from_le_bytes(stamp) as i64)
        .single()
        .ok_or_else(|| corrupt("bad timestamp"))?;
    Ok(CachedImage {
        key: key.clone(),
        bytes: Arc::from(payload),
        fetched_at,
    })
}
