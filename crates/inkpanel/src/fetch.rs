//! Remote image retrieval.
//!
//! [`HttpImageSource`] performs single attempts against the rendering server;
//! [`Retrying`] wraps any source with bounded exponential backoff for the
//! transient failure kinds.

use std::future::Future;
use std::io::Cursor;
use std::time::Duration;

use anyhow::{Context, Result};
use inkpanel_logging::targets::T_NET;

use crate::catalog::{ServerInfo, Target};
use crate::config::ServerConfig;
use crate::error::FetchError;

pub trait ImageSource: Send + Sync + 'static {
    fn fetch(&self, target: &Target) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send;
}

/// Rejects bodies the panel could never show.
pub fn validate_payload(bytes: &[u8], max_len: usize) -> Result<(), FetchError> {
    if bytes.len() > max_len {
        return Err(FetchError::InvalidPayload(format!(
            "{} bytes exceeds limit of {}",
            bytes.len(),
            max_len
        )));
    }
    ensure_decodable(bytes)
}

/// Fully decodes `bytes`; a truncated body with an intact header fails here.
pub fn ensure_decodable(bytes: &[u8]) -> Result<(), FetchError> {
    if bytes.is_empty() {
        return Err(FetchError::InvalidPayload("empty body".into()));
    }
    let reader = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|err| FetchError::InvalidPayload(err.to_string()))?;
    if reader.format().is_none() {
        return Err(FetchError::InvalidPayload("unrecognized image format".into()));
    }
    let decoded = reader
        .decode()
        .map_err(|err| FetchError::InvalidPayload(err.to_string()))?;
    if decoded.width() == 0 || decoded.height() == 0 {
        return Err(FetchError::InvalidPayload("zero-sized image".into()));
    }
    Ok(())
}

pub struct HttpImageSource {
    client: reqwest::Client,
    server: String,
    image_template: String,
    catalog_template: String,
    max_payload: usize,
}

impl HttpImageSource {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .user_agent(concat!("inkpanel/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            server: config.url.trim_end_matches('/').to_string(),
            image_template: config.image_url_template.clone(),
            catalog_template: config.catalog_url_template.clone(),
            max_payload: config.max_payload_bytes,
        })
    }

    pub fn image_url(&self, target: &Target) -> String {
        self.image_template
            .replace("{server}", &self.server)
            .replace("{app}", &target.key.app)
            .replace("{screen}", &target.reference)
    }

    pub fn catalog_url(&self) -> String {
        self.catalog_template.replace("{server}", &self.server)
    }

    /// Reads the body chunk by chunk so an oversized reply is cut off early.
    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut response = self.client.get(url).send().await.map_err(classify)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::ServerError(status.as_u16()));
        }
        if let Some(len) = response.content_length() {
            if usize::try_from(len).map_or(true, |len| len > self.max_payload) {
                return Err(FetchError::InvalidPayload(format!(
                    "content length {} exceeds limit of {}",
                    len, self.max_payload
                )));
            }
        }
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(classify)? {
            if body.len() + chunk.len() > self.max_payload {
                return Err(FetchError::InvalidPayload(format!(
                    "body exceeds limit of {}",
                    self.max_payload
                )));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    pub async fn fetch_catalog(&self) -> Result<ServerInfo, FetchError> {
        let url = self.catalog_url();
        let body = self.get_bytes(&url).await?;
        let info: ServerInfo = serde_json::from_slice(&body)
            .map_err(|err| FetchError::InvalidPayload(format!("catalog: {err}")))?;
        tracing::info!(target: T_NET, url = %url, apps = info.apps.len(), "Catalog fetched");
        Ok(info)
    }
}

impl ImageSource for HttpImageSource {
    fn fetch(&self, target: &Target) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send {
        async move {
            let url = self.image_url(target);
            tracing::debug!(target: T_NET, url = %url, "Fetching image");
            let body = self.get_bytes(&url).await?;
            validate_payload(&body, self.max_payload)?;
            tracing::debug!(target: T_NET, url = %url, bytes = body.len(), "Image fetched");
            Ok(body)
        }
    }
}

fn classify(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else if let Some(status) = err.status() {
        FetchError::ServerError(status.as_u16())
    } else if err.is_decode() {
        FetchError::InvalidPayload(err.to_string())
    } else {
        FetchError::NetworkUnreachable(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub attempts: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            attempts: config.fetch_attempts.max(1),
            backoff_base: config.backoff_base(),
        }
    }

    /// Delay after the `failed`-th failed attempt (1-based): base, 2*base, 4*base, ...
    pub fn delay_after(&self, failed: u32) -> Duration {
        let exp = failed.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(1u32 << exp)
    }
}

pub struct Retrying<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> Retrying<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: ImageSource> ImageSource for Retrying<S> {
    fn fetch(&self, target: &Target) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send {
        async move {
            let mut attempt = 1;
            loop {
                match self.inner.fetch(target).await {
                    Ok(bytes) => return Ok(bytes),
                    Err(err) if err.is_transient() && attempt < self.policy.attempts => {
                        let delay = self.policy.delay_after(attempt);
                        tracing::warn!(
                            target: T_NET,
                            key = %target.key,
                            attempt,
                            attempts = self.policy.attempts,
                            ?delay,
                            "Fetch failed, retrying: {}",
                            err
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(err) => {
                        tracing::warn!(target: T_NET, key = %target.key, attempt, "Fetch failed: {}", err);
                        return Err(err);
                    }
                }
            }
        }
    }
}
