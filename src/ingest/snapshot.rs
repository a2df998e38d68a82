//! HTTP snapshot source.
//!
//! Retrieves one still of the camera's current view from its image endpoint
//! and decodes it in memory. The source is responsible for:
//! - Bounded connect/read timeouts per request
//! - Capping the payload size
//! - Retrying transient failures a fixed number of times
//! - Classifying failures as `FetchTimeout` or `FetchFailed`

use std::io::{self, Read};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use url::Url;

use crate::frame::CapturedFrame;
use crate::{CancelToken, ErrorKind, HeadcountError, Preset};

const MAX_SNAPSHOT_BYTES: u64 = 5 * 1024 * 1024;

/// Configuration for a snapshot source.
#[derive(Clone, Debug)]
pub struct SnapshotConfig {
    /// Image endpoint, e.g. `http://192.168.0.100/snapshot.jpg`.
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            url: "http://192.168.0.100/snapshot.jpg".to_string(),
            username: None,
            password: None,
            timeout: Duration::from_secs(10),
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

pub struct SnapshotFetcher {
    agent: ureq::Agent,
    url: Url,
    config: SnapshotConfig,
}

impl SnapshotFetcher {
    pub fn new(config: SnapshotConfig) -> Result<Self> {
        let mut url = Url::parse(&config.url).context("parse snapshot url")?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported snapshot scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        if let Some(user) = config.username.as_deref() {
            url.set_username(user)
                .map_err(|_| anyhow!("snapshot url cannot carry credentials"))?;
            url.set_password(config.password.as_deref())
                .map_err(|_| anyhow!("snapshot url cannot carry credentials"))?;
        }
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(config.timeout)
            .timeout(config.timeout)
            .build();
        Ok(Self { agent, url, config })
    }

    /// Endpoint without credentials, for logs.
    pub fn endpoint(&self) -> String {
        let mut shown = self.url.clone();
        let _ = shown.set_username("");
        let _ = shown.set_password(None);
        shown.to_string()
    }

    /// Fetches the current view and tags it with `preset`.
    pub fn fetch(&self, preset: &Preset, cancel: &CancelToken) -> Result<CapturedFrame, HeadcountError> {
        let attempts = self.config.attempts.max(1);
        let mut last_err = HeadcountError::new(ErrorKind::FetchFailed, "no attempt made");
        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(HeadcountError::cancelled());
            }
            match self.fetch_once() {
                Ok(image) => {
                    log::info!(
                        "captured {}x{} still for preset {} ({})",
                        image.width(),
                        image.height(),
                        preset.number,
                        preset.name
                    );
                    return Ok(CapturedFrame::new(preset.clone(), image));
                }
                Err(err) => {
                    log::warn!(
                        "snapshot for preset {} failed (attempt {}/{}): {}",
                        preset.number,
                        attempt,
                        attempts,
                        err
                    );
                    last_err = err;
                }
            }
            if attempt < attempts && !cancel.sleep(self.config.backoff) {
                return Err(HeadcountError::cancelled());
            }
        }
        Err(last_err)
    }

    fn fetch_once(&self) -> Result<RgbImage, HeadcountError> {
        let response = self
            .agent
            .request_url("GET", &self.url)
            .call()
            .map_err(|e| self.classify(e))?;
        if let Some(content_type) = response.header("Content-Type") {
            if !content_type.to_ascii_lowercase().starts_with("image/") {
                log::debug!("snapshot content type is {}", content_type);
            }
        }

        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_SNAPSHOT_BYTES + 1)
            .read_to_end(&mut bytes)
            .map_err(|e| {
                let kind = if is_timeout(&e) {
                    ErrorKind::FetchTimeout
                } else {
                    ErrorKind::FetchFailed
                };
                HeadcountError::new(kind, format!("read snapshot body: {}", e))
            })?;
        if bytes.is_empty() {
            return Err(HeadcountError::new(ErrorKind::FetchFailed, "empty snapshot"));
        }
        if bytes.len() as u64 > MAX_SNAPSHOT_BYTES {
            return Err(HeadcountError::new(
                ErrorKind::FetchFailed,
                format!("snapshot exceeds {} bytes", MAX_SNAPSHOT_BYTES),
            ));
        }
        decode_image(&bytes)
            .map_err(|e| HeadcountError::new(ErrorKind::FetchFailed, format!("{:#}", e)))
    }

    fn classify(&self, err: ureq::Error) -> HeadcountError {
        match err {
            ureq::Error::Status(code, _) => HeadcountError::new(
                ErrorKind::FetchFailed,
                format!("{} returned HTTP {}", self.endpoint(), code),
            ),
            ureq::Error::Transport(transport) => {
                let timed_out = std::error::Error::source(&transport)
                    .and_then(|source| source.downcast_ref::<io::Error>())
                    .map(is_timeout)
                    .unwrap_or_else(|| transport.to_string().contains("timed out"));
                let kind = if timed_out {
                    ErrorKind::FetchTimeout
                } else {
                    ErrorKind::FetchFailed
                };
                HeadcountError::new(kind, format!("{}: {}", self.endpoint(), transport))
            }
        }
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

fn decode_image(bytes: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory(bytes).context("decode snapshot")?;
    Ok(image.into_rgb8())
}
