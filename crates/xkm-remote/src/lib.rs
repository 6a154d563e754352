//! HTTP client for the remote comic archive.
//!
//! A fetch is a single request/response: no retries happen here. Callers that
//! want retries consult [`FetchError::retry_disposition`].

use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use xkm_core::Entry;

pub const CRATE_NAME: &str = "xkm-remote";

pub const DEFAULT_BASE_URL: &str = "https://xkcd.com";

/// Which archive document to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchTarget {
    /// Whatever the remote currently considers the most recent entry.
    Latest,
    Num(u32),
}

impl From<u32> for FetchTarget {
    /// `0` is not a valid entry number and maps to the latest sentinel.
    fn from(num: u32) -> Self {
        if num == 0 {
            Self::Latest
        } else {
            Self::Num(num)
        }
    }
}

impl fmt::Display for FetchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::Num(num) => write!(f, "#{num}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetching {target}: request failed: {source}")]
    Request {
        target: FetchTarget,
        #[source]
        source: reqwest::Error,
    },
    #[error("fetching {target}: http status {status} for {url}")]
    HttpStatus {
        target: FetchTarget,
        status: u16,
        url: String,
    },
    #[error("fetching {target}: malformed body: {source}")]
    Decode {
        target: FetchTarget,
        #[source]
        source: serde_json::Error,
    },
    #[error("fetching {target}: {reason}")]
    Invalid { target: FetchTarget, reason: String },
}

impl FetchError {
    pub fn target(&self) -> FetchTarget {
        match self {
            Self::Request { target, .. }
            | Self::HttpStatus { target, .. }
            | Self::Decode { target, .. }
            | Self::Invalid { target, .. } => *target,
        }
    }

    /// True for malformed or inconsistent bodies, false for transport/HTTP failures.
    pub fn is_decode_failure(&self) -> bool {
        matches!(self, Self::Decode { .. } | Self::Invalid { .. })
    }

    pub fn retry_disposition(&self) -> RetryDisposition {
        match self {
            Self::Request { source, .. } => classify_reqwest_error(source),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            Self::Decode { .. } | Self::Invalid { .. } => RetryDisposition::NonRetryable,
        }
    }
}

/// Anything that can hand out archive entries.
#[async_trait]
pub trait EntrySource: Send + Sync {
    async fn fetch(&self, target: FetchTarget) -> Result<Entry, FetchError>;

    async fn fetch_latest(&self) -> Result<Entry, FetchError> {
        self.fetch(FetchTarget::Latest).await
    }

    async fn fetch_num(&self, num: u32) -> Result<Entry, FetchError> {
        self.fetch(FetchTarget::from(num)).await
    }
}

/// Wire shape of `info.0.json`. Every field except `transcript` is required.
#[derive(Debug, Deserialize)]
struct WireEntry {
    num: i64,
    title: String,
    img: String,
    alt: String,
    #[serde(default)]
    transcript: String,
}

/// Strictly decode an archive document fetched for `target`.
pub fn decode_entry(target: FetchTarget, body: &[u8]) -> Result<Entry, FetchError> {
    let wire: WireEntry =
        serde_json::from_slice(body).map_err(|source| FetchError::Decode { target, source })?;

    let num = u32::try_from(wire.num)
        .ok()
        .filter(|num| *num > 0)
        .ok_or_else(|| FetchError::Invalid {
            target,
            reason: format!("entry number {} is not a positive integer", wire.num),
        })?;

    if let FetchTarget::Num(requested) = target {
        if requested != num {
            return Err(FetchError::Invalid {
                target,
                reason: format!("remote answered with entry #{num}"),
            });
        }
    }

    Ok(Entry {
        num,
        title: wire.title,
        image: wire.img,
        alt: wire.alt,
        transcript: wire.transcript,
    })
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub use_system_proxy: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            use_system_proxy: true,
        }
    }
}

/// [`EntrySource`] backed by the archive's JSON endpoints.
#[derive(Debug, Clone)]
pub struct HttpEntrySource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEntrySource {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        if !config.use_system_proxy {
            builder = builder.no_proxy();
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url_for(&self, target: FetchTarget) -> String {
        match target {
            FetchTarget::Latest => format!("{}/info.0.json", self.base_url),
            FetchTarget::Num(num) => format!("{}/{num}/info.0.json", self.base_url),
        }
    }
}

#[async_trait]
impl EntrySource for HttpEntrySource {
    async fn fetch(&self, target: FetchTarget) -> Result<Entry, FetchError> {
        let url = self.url_for(target);
        let span = info_span!("http_fetch", %target, url = %url);

        async move {
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|source| FetchError::Request { target, source })?;

            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    target,
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }

            let body = resp
                .bytes()
                .await
                .map_err(|source| FetchError::Request { target, source })?;
            debug!(bytes = body.len(), "fetched archive document");
            decode_entry(target, &body)
        }
        .instrument(span)
        .await
    }
}
