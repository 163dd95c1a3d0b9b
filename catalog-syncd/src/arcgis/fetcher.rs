use reqwest::{header, Client, StatusCode};
use serde::de::DeserializeOwned;
use anyhow::Context;
use crate::config::FetchConfig;
use crate::error::FetchError;

/// GET-only HTTP client with a per-attempt timeout and exponential backoff on
/// transient failures (5xx, 429, timeouts, connection errors).
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    config: FetchConfig,
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Transport errors worth another attempt. Builder and redirect-policy errors
/// will fail the same way every time.
fn is_transient(err: &reqwest::Error) -> bool {
    !(err.is_builder() || err.is_redirect())
}

enum Attempt {
    Done(Vec<u8>),
    Retry { status: Option<StatusCode>, cause: String },
}

impl Fetcher {
    pub fn new(config: FetchConfig) -> anyhow::Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { client, config })
    }

    /// GET `url` and read the whole body, retrying transient failures. Only
    /// 2xx bodies are returned. A connection dropped mid-body counts as
    /// transient, so each attempt covers headers and body.
    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let attempts = self.config.retries + 1;
        let mut last_status = None;
        let mut last_cause = String::new();

        for attempt in 0..attempts {
            match self.attempt(url).await? {
                Attempt::Done(body) => {
                    if attempt > 0 {
                        tracing::debug!(url, attempt, "Fetch succeeded after retry");
                    }
                    return Ok(body);
                }
                Attempt::Retry { status, cause } => {
                    last_status = status;
                    last_cause = cause;
                }
            }

            if attempt + 1 < attempts {
                let delay = self.config.backoff(attempt);
                tracing::warn!(
                    url,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    cause = %last_cause,
                    "Transient fetch failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(FetchError::RetriesExhausted {
            url: url.to_string(),
            attempts,
            status: last_status,
            cause: last_cause,
        })
    }

    /// One request, headers and body, under the per-attempt timeout
    async fn attempt(&self, url: &str) -> Result<Attempt, FetchError> {
        let response = match self
            .client
            .get(url)
            .timeout(self.config.timeout())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if is_transient(&e) => {
                return Ok(Attempt::Retry { status: e.status(), cause: e.to_string() });
            }
            Err(e) => return Err(FetchError::Request { url: url.to_string(), source: e }),
        };

        let status = response.status();
        if !status.is_success() {
            if !is_retryable_status(status) {
                return Err(FetchError::Status { url: url.to_string(), status });
            }
            return Ok(Attempt::Retry { status: Some(status), cause: format!("HTTP {}", status) });
        }

        match response.bytes().await {
            Ok(body) => Ok(Attempt::Done(body.to_vec())),
            Err(e) => Ok(Attempt::Retry {
                status: None,
                cause: format!("failed to read body: {}", e),
            }),
        }
    }

    /// GET `url` and decode the body as JSON. Decoding failures are not retried.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let body = self.fetch_bytes(url).await?;
        serde_json::from_slice(&body).map_err(|e| FetchError::Malformed {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }
}
