//! HTTP transport used to reach the control plane

use std::{error::Error as StdError, fmt, time::Duration};

use async_trait::async_trait;
use lodestar_types::{Error, Result, TransportErrorKind};
use reqwest::Client as HttpClient;
use tracing::debug;

/// Sends one JSON request to the control plane
///
/// Implementations perform a single attempt; retries are driven by the
/// discovery task so that each attempt can go to a different address.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// POST `body` to `url` and return the raw response body
    ///
    /// # Errors
    ///
    /// Returns `Error::Transport` when the request cannot be completed
    async fn post(&self, url: &str, body: String, timeout: Duration) -> Result<String>;
}

/// reqwest-backed [`Transport`]
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http_client: HttpClient,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let http_client = HttpClient::builder().pool_max_idle_per_host(10).build().map_err(|e| {
            Error::transport(TransportErrorKind::Task, format!("Failed to create HTTP client: {}", e))
        })?;

        Ok(Self { http_client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, url: &str, body: String, timeout: Duration) -> Result<String> {
        debug!(url = %url, "Sending control plane request");

        let response = self
            .http_client
            .post(url)
            .header("Content-Type", "application/json")
            .timeout(timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::transport(classify(&e), e.to_string()))?;

        let status = response.status();
        let text =
            response.text().await.map_err(|e| Error::transport(classify(&e), e.to_string()))?;

        // The control plane reports failures through the `code` field, often
        // with a 4xx status. Only a bodiless error status is a transport failure.
        if !status.is_success() && text.trim().is_empty() {
            return Err(Error::transport(
                TransportErrorKind::Task,
                format!("{} returned {} with empty body", url, status),
            ));
        }

        Ok(text)
    }
}

/// Map a reqwest failure onto the transport error kinds
fn classify(error: &reqwest::Error) -> TransportErrorKind {
    if error.is_timeout() {
        return TransportErrorKind::Timeout;
    }

    let mut chain = String::new();
    let mut source: Option<&(dyn StdError + 'static)> = error.source();
    while let Some(cause) = source {
        chain.push_str(&cause.to_string().to_lowercase());
        chain.push(' ');
        source = cause.source();
    }

    if chain.contains("dns error") || chain.contains("failed to lookup address") {
        TransportErrorKind::Dns
    } else if chain.contains("certificate") || chain.contains("tls") {
        TransportErrorKind::Tls
    } else if error.is_connect() {
        TransportErrorKind::Connect
    } else {
        TransportErrorKind::Task
    }
}
