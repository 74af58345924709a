//! Where snapshots come from.
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::{header, StatusCode, Url};

use crate::{wire::WireSnapshot, Error, Result};

/// Remote service that exports the full flag definition graph.
///
/// [`HttpSnapshotSource`] talks to the Flagent server. Custom implementations can serve exports
/// from elsewhere (a sidecar, a test fixture).
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetch the current export.
    async fn fetch_snapshot(&self) -> Result<WireSnapshot>;
}

const SNAPSHOT_ENDPOINT: &str = "/export/eval_cache/json";

/// Configuration for [`HttpSnapshotSource`].
///
/// # Examples
/// ```
/// # use std::time::Duration;
/// # use flagent::HttpSourceConfig;
/// let source = HttpSourceConfig::new("http://localhost:18000/api/v1")
///     .api_key("secret")
///     .max_retries(5)
///     .retry_delay(Duration::from_millis(200))
///     .to_source()
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub(crate) base_url: String,
    pub(crate) api_key: Option<String>,
    pub(crate) timeout: Duration,
    pub(crate) max_retries: u32,
    pub(crate) retry_delay: Duration,
}

impl HttpSourceConfig {
    /// Default timeout of a single request.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
    /// Default number of retries after the first attempt.
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    /// Default base delay between retries. The n-th retry waits `n * retry_delay`.
    pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

    /// Create a configuration for the server at `base_url` (for example
    /// `http://localhost:18000/api/v1`).
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpSourceConfig {
            base_url: base_url.into(),
            api_key: None,
            timeout: Self::DEFAULT_TIMEOUT,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            retry_delay: Self::DEFAULT_RETRY_DELAY,
        }
    }

    /// Send `api_key` as a bearer token.
    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Override the per-request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the number of retries on network errors and 5xx responses.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Override the base retry delay.
    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Create a new [`HttpSnapshotSource`] using this configuration.
    pub fn to_source(self) -> Result<HttpSnapshotSource> {
        HttpSnapshotSource::new(self)
    }
}

/// Fetches the flag export from the Flagent server over HTTP.
pub struct HttpSnapshotSource {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    url: Url,
    api_key: Option<String>,
    max_retries: u32,
    retry_delay: Duration,
    /// If we receive a 401 Unauthorized error during a request, it means the API key is not
    /// valid. We cache this error so we don't issue additional requests to the server.
    unauthorized: AtomicBool,
}

impl HttpSnapshotSource {
    /// Create a source from `config`. Fails if the base URL is invalid.
    pub fn new(config: HttpSourceConfig) -> Result<HttpSnapshotSource> {
        let url = Url::parse(&format!(
            "{}{}",
            config.base_url.trim_end_matches('/'),
            SNAPSHOT_ENDPOINT
        ))
        .map_err(Error::InvalidBaseUrl)?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("flagent-rust/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(HttpSnapshotSource {
            client,
            url,
            api_key: config.api_key,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
            unauthorized: AtomicBool::new(false),
        })
    }

    async fn send_with_retries(&self) -> Result<reqwest::Response> {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay * attempt).await;
                log::debug!(target: "flagent", attempt = attempt; "retrying snapshot request");
            }

            let mut request = self
                .client
                .get(self.url.clone())
                .header(header::ACCEPT, "application/json")
                .header(header::CONTENT_TYPE, "application/json");
            if let Some(api_key) = &self.api_key {
                request = request.bearer_auth(api_key);
            }

            match request.send().await {
                Ok(response) if response.status().is_server_error() => {
                    log::warn!(target: "flagent",
                               status = response.status().as_u16();
                               "server error while fetching snapshot");
                    last_error = Some(Error::UnexpectedStatus(response.status().as_u16()));
                }
                Ok(response) => return Ok(response),
                Err(err) => {
                    log::warn!(target: "flagent", "error while fetching snapshot: {:?}", err);
                    last_error = Some(Error::from(err));
                }
            }
        }

        Err(last_error.unwrap_or(Error::UnexpectedStatus(0)))
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch_snapshot(&self) -> Result<WireSnapshot> {
        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(Error::Unauthorized);
        }

        log::debug!(target: "flagent", "fetching snapshot");
        let response = self.send_with_retries().await?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED => {
                log::warn!(target: "flagent", "client is not authorized. Check your API key");
                self.unauthorized.store(true, Ordering::Relaxed);
                return Err(Error::Unauthorized);
            }
            status => {
                log::warn!(target: "flagent",
                           status = status.as_u16();
                           "received non-200 response while fetching snapshot");
                return Err(Error::UnexpectedStatus(status.as_u16()));
            }
        }

        let snapshot: WireSnapshot = response.json().await?;

        log::debug!(target: "flagent",
                    flags = snapshot.flags.len();
                    "successfully fetched snapshot");

        Ok(snapshot)
    }
}
