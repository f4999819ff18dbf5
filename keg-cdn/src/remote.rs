//! The remote CDN store.
//!
//! Streams objects over HTTP from one mirror. Never writes anything; the
//! delegating store owns persistence. Transport errors retry with
//! exponential backoff and jitter, everything else fails fast.

use std::time::Duration;

use bytes::Bytes;
use reqwest::{Client, Response, StatusCode, header};
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use keg_formats::Key;

use crate::error::{Error, Result};
use crate::store::ObjectKind;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;
const DEFAULT_MAX_BACKOFF_MS: u64 = 10_000;
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_JITTER_FACTOR: f64 = 0.1;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

/// HTTP client for one CDN mirror.
#[derive(Debug, Clone)]
pub struct RemoteStore {
    client: Client,
    /// Mirror base, scheme included: `http://cdn.example.net`.
    server: String,
    /// Data path on the mirror: `tpr/product`.
    path: String,
    /// Product-config path on the mirror.
    config_path: String,
    max_retries: u32,
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
    backoff_multiplier: f64,
    jitter_factor: f64,
}

impl RemoteStore {
    pub fn new(
        server: impl Into<String>,
        path: impl Into<String>,
        config_path: impl Into<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|source| Error::Network {
                url: "<client builder>".to_string(),
                source,
            })?;

        Ok(Self::with_client(client, server, path, config_path))
    }

    pub fn with_client(
        client: Client,
        server: impl Into<String>,
        path: impl Into<String>,
        config_path: impl Into<String>,
    ) -> Self {
        Self {
            client,
            server: server.into(),
            path: path.into(),
            config_path: config_path.into(),
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_backoff_ms(mut self, ms: u64) -> Self {
        self.initial_backoff_ms = ms;
        self
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// URL an object is served from.
    pub fn url_for(&self, kind: ObjectKind, key: &Key) -> String {
        match kind {
            ObjectKind::ProductConfig => {
                format!("{}/{}/{}", self.server, self.config_path, key.partition())
            }
            _ => format!("{}/{}/{}", self.server, self.path, kind.object_path(key)),
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff_ms as f64);
        let jitter_range = capped * self.jitter_factor;
        let jitter = rand::random::<f64>() * 2.0 * jitter_range - jitter_range;
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    async fn execute_with_retry(
        &self,
        kind: ObjectKind,
        key: &Key,
        url: &str,
        range: Option<(u64, u64)>,
    ) -> Result<Response> {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self.backoff(attempt - 1);
                debug!("CDN retry {attempt} for {url} after {backoff:?}");
                sleep(backoff).await;
            }

            let mut request = self.client.get(url);
            if let Some((offset, size)) = range {
                request = request.header(
                    header::RANGE,
                    format!("bytes={}-{}", offset, offset + size - 1),
                );
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    trace!("CDN response {status} for {url}");

                    if status.is_success() {
                        return Ok(response);
                    }
                    if status == StatusCode::NOT_FOUND {
                        return Err(Error::Missing {
                            kind,
                            key: key.to_hex(),
                        });
                    }
                    if status.is_server_error() && attempt < self.max_retries {
                        warn!("CDN returned {status} for {url}, will retry");
                        last_error = Some(Error::Status {
                            url: url.to_string(),
                            status: status.as_u16(),
                        });
                        continue;
                    }
                    return Err(Error::Status {
                        url: url.to_string(),
                        status: status.as_u16(),
                    });
                }
                Err(e) => {
                    let retryable = e.is_connect() || e.is_timeout() || e.is_request();
                    if retryable && attempt < self.max_retries {
                        warn!("CDN request failed for {url} ({e}), will retry");
                        last_error = Some(Error::Network {
                            url: url.to_string(),
                            source: e,
                        });
                    } else {
                        return Err(Error::Network {
                            url: url.to_string(),
                            source: e,
                        });
                    }
                }
            }
        }

        Err(last_error.expect("retry loop exited without an error"))
    }

    /// Open a streaming response for an object.
    pub async fn stream(&self, kind: ObjectKind, key: &Key) -> Result<Response> {
        if kind == ObjectKind::Fragment {
            return Err(Error::Missing {
                kind,
                key: key.to_hex(),
            });
        }
        let url = self.url_for(kind, key);
        self.execute_with_retry(kind, key, &url, None).await
    }

    /// Fetch a whole object into memory.
    pub async fn fetch(&self, kind: ObjectKind, key: &Key) -> Result<Bytes> {
        let url = self.url_for(kind, key);
        let response = self.stream(kind, key).await?;
        response.bytes().await.map_err(|source| Error::Network {
            url,
            source,
        })
    }

    /// Fetch a byte range of an object with a `Range` request.
    pub async fn fetch_range(
        &self,
        kind: ObjectKind,
        key: &Key,
        offset: u64,
        size: u64,
    ) -> Result<Bytes> {
        let url = self.url_for(kind, key);
        let response = self
            .execute_with_retry(kind, key, &url, Some((offset, size)))
            .await?;
        response.bytes().await.map_err(|source| Error::Network {
            url,
            source,
        })
    }
}
