//! HTTP range source
//!
//! Serves object bytes with ranged GET requests. Retries with exponential
//! backoff live here, in the capability, so the cache itself never retries.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, info, warn};

use super::errors::HttpError;
use super::{ByteStream, ObjectStore};
use crate::bridge;
use crate::error::CacheError;

/// Connection setup timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of retries for retryable errors
const MAX_RETRIES: usize = 3;

/// Delay before each retry
const BACKOFF_MS: [u64; MAX_RETRIES] = [500, 1000, 2000];

/// Objects reachable over HTTP(S)
///
/// Ids are full URLs, or paths under a base URL when one is configured.
#[derive(Clone)]
pub struct HttpStore {
    client: Client,
    base_url: Option<String>,
}

impl HttpStore {
    /// Store whose ids are complete URLs
    pub fn new() -> Result<Self> {
        Self::build(None)
    }

    /// Store whose ids are paths below `base_url`
    pub fn with_base_url(base_url: &str) -> Result<Self> {
        Self::build(Some(base_url.trim_end_matches('/').to_string()))
    }

    fn build(base_url: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, base_url })
    }

    /// URL for an object id, percent-encoding each path segment
    pub fn url_for(&self, id: &str) -> String {
        match &self.base_url {
            Some(base) => {
                let path: Vec<_> = id
                    .trim_start_matches('/')
                    .split('/')
                    .map(urlencoding::encode)
                    .collect();
                format!("{}/{}", base, path.join("/"))
            }
            None => id.to_string(),
        }
    }
}

/// Execute a request with retry logic and exponential backoff
async fn with_retry<T, F, Fut>(operation: &str, url: &str, f: F) -> Result<T, HttpError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, HttpError>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                let delay = BACKOFF_MS[attempt];
                attempt += 1;
                warn!(
                    operation = operation,
                    url = url,
                    attempt = attempt,
                    max = MAX_RETRIES,
                    delay_ms = delay,
                    error = %e,
                    "Retrying HTTP request"
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn check_status(response: Response) -> Result<Response, HttpError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(HttpError::from_status(status.as_u16(), &body))
}

/// One ranged GET for `[start, end)`
async fn get_range(client: &Client, url: &str, start: u64, end: u64) -> Result<Vec<u8>, HttpError> {
    let response = client
        .get(url)
        .header(RANGE, format!("bytes={}-{}", start, end - 1))
        .send()
        .await?;
    let response = check_status(response).await?;
    let partial = response.status() == StatusCode::PARTIAL_CONTENT;
    let bytes = response.bytes().await?;

    if partial {
        return Ok(bytes.to_vec());
    }
    // Server ignored the Range header and sent the whole object
    if end > bytes.len() as u64 {
        return Err(HttpError::Request(format!(
            "object is {} bytes, range ends at {}",
            bytes.len(),
            end
        )));
    }
    Ok(bytes[start as usize..end as usize].to_vec())
}

async fn fetch_range(client: &Client, url: &str, start: u64, end: u64) -> Result<Vec<u8>, HttpError> {
    if start >= end {
        return Ok(Vec::new());
    }
    debug!(url = url, start = start, end = end, "Fetching range over HTTP");
    with_retry("fetch_range", url, move || get_range(client, url, start, end)).await
}

async fn open_body(client: &Client, url: &str) -> Result<Response, HttpError> {
    let response = client.get(url).send().await?;
    check_status(response).await
}

async fn head_size(client: &Client, url: &str) -> Result<u64, HttpError> {
    let response = check_status(client.head(url).send().await?).await?;
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| HttpError::Request(format!("no Content-Length for {}", url)))
}

/// Response body read chunk by chunk
pub struct HttpBody {
    response: Response,
}

impl ByteStream for HttpBody {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let chunk = self.response.chunk().await.map_err(HttpError::from)?;
        Ok(chunk.map(|bytes| bytes.to_vec()))
    }
}

impl ObjectStore for HttpStore {
    type Stream = HttpBody;

    fn fetch(&self, id: &str, start: u64, end: u64) -> Result<Vec<u8>> {
        let client = self.client.clone();
        let url = self.url_for(id);
        let bytes = bridge::global()?.run(async move {
            fetch_range(&client, &url, start, end)
                .await
                .map_err(|e| CacheError::Fetch(e.into()))
        })?;
        Ok(bytes)
    }

    async fn afetch(&self, id: &str, start: u64, end: u64) -> Result<Vec<u8>> {
        let url = self.url_for(id);
        Ok(fetch_range(&self.client, &url, start, end).await?)
    }

    fn is_local(&self, _id: &str) -> bool {
        false
    }

    async fn open_stream(&self, id: &str) -> Result<HttpBody> {
        let url = self.url_for(id);
        let client = &self.client;
        let url_ref = url.as_str();
        let response = with_retry("open_stream", url_ref, move || open_body(client, url_ref)).await?;
        info!(url = %url, "Opened HTTP stream");
        Ok(HttpBody { response })
    }

    async fn size(&self, id: &str) -> Result<u64> {
        let url = self.url_for(id);
        let client = &self.client;
        let url_ref = url.as_str();
        Ok(with_retry("size", url_ref, move || head_size(client, url_ref)).await?)
    }
}
