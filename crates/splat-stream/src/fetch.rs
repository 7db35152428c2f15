//! Byte transport for splat files.
//!
//! A [`Fetch`] turns a URL into bytes. Implementations:
//!
//! - [`HttpFetch`]: `reqwest`-backed, works on desktop and WASM
//! - [`FsFetch`]: reads local paths (native only)

use std::{future::Future, pin::Pin};

use crate::error::{Error, Result};

/// Future type for fetch operations.
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send + 'a>>;

/// A source of raw file bytes, keyed by URL.
pub trait Fetch: Send + Sync {
    /// Fetch the full contents of `url`.
    fn fetch(&self, url: &str) -> FetchFuture<'_>;
}

/// Fetches files over HTTP(S).
#[derive(Debug, Clone, Default)]
pub struct HttpFetch {
    http: reqwest::Client,
}

impl HttpFetch {
    /// Create a fetcher with a default HTTP client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fetcher using an existing HTTP client.
    #[must_use]
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl Fetch for HttpFetch {
    fn fetch(&self, url: &str) -> FetchFuture<'_> {
        let url = url.to_string();
        Box::pin(async move {
            tracing::debug!(url, "fetching");

            let response = self
                .http
                .get(&url)
                .send()
                .await
                .map_err(|e| Error::Http {
                    url: url.clone(),
                    message: e.to_string(),
                })?;

            let status = response.status();
            if !status.is_success() {
                return Err(Error::HttpStatus {
                    url,
                    status: status.as_u16(),
                });
            }

            let data = response.bytes().await.map_err(|e| Error::Http {
                url: url.clone(),
                message: e.to_string(),
            })?;
            Ok(data.to_vec())
        })
    }
}

/// Reads files from the local filesystem. Accepts plain paths and `file://` URLs.
#[cfg(not(target_family = "wasm"))]
#[derive(Debug, Clone, Copy, Default)]
pub struct FsFetch;

#[cfg(not(target_family = "wasm"))]
impl Fetch for FsFetch {
    fn fetch(&self, url: &str) -> FetchFuture<'_> {
        let path = url.strip_prefix("file://").unwrap_or(url).to_string();
        Box::pin(async move {
            tracing::debug!(path, "reading");
            tokio::fs::read(&path)
                .await
                .map_err(|source| Error::Io { path, source })
        })
    }
}

/// Whether `url` should be fetched over HTTP rather than from disk.
#[must_use]
pub fn is_remote(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}
