//! HTTP producer for single-flight resources
//!
//! Plain GET of a URL; provider-specific search and URL building live in the
//! application.

use crate::error::FetchError;
use crate::flight::{RetryPolicy, SingleFlightResource};
use std::io::Cursor;
use std::time::Duration;
use tokio::runtime::Handle;

/// Configuration for the HTTP client
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Whole-request timeout
    pub timeout: Duration,

    /// Connect timeout
    pub connect_timeout: Duration,

    pub user_agent: String,

    /// Applied to every resource created by this source
    pub retry: RetryPolicy,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: format!("covercache/{}", env!("CARGO_PKG_VERSION")),
            retry: RetryPolicy::Never,
        }
    }
}

/// Shared HTTP client that turns URLs into single-flight resources
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: reqwest::Client,
    retry: RetryPolicy,
    /// Runtime current at construction; downloads run there
    runtime: Option<Handle>,
}

impl HttpSource {
    pub fn new(config: HttpConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent)
            .build()
            .map_err(|e| FetchError::Request {
                url: String::new(),
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            retry: config.retry,
            runtime: Handle::try_current().ok(),
        })
    }

    /// Create with default configuration
    pub fn with_defaults() -> Result<Self, FetchError> {
        Self::new(HttpConfig::default())
    }

    /// Wrap a GET of `url` in a new single-flight resource
    pub fn resource(&self, url: &str) -> SingleFlightResource {
        let client = self.client.clone();
        let target = url.to_string();

        let producer = move || download(client.clone(), target.clone());
        let resource = match &self.runtime {
            Some(runtime) => SingleFlightResource::new_in(runtime.clone(), producer),
            None => SingleFlightResource::new(producer),
        };

        resource
            .with_label(url)
            .with_retry(self.retry)
    }
}

/// GET `url` and buffer the body
pub async fn download(
    client: reqwest::Client,
    url: String,
) -> Result<Cursor<Vec<u8>>, FetchError> {
    tracing::debug!(url = %url, "Downloading");

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| FetchError::Request {
            url: url.clone(),
            message: e.to_string(),
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            url,
            status: status.as_u16(),
        });
    }

    let body = response.bytes().await.map_err(|e| FetchError::Read {
        message: format!("Failed to read body of {}: {}", url, e),
    })?;

    tracing::debug!(url = %url, bytes = body.len(), "Download complete");
    Ok(Cursor::new(body.to_vec()))
}
