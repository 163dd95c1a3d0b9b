use reqwest::StatusCode;
use thiserror::Error;

/// Failure of a single upstream GET, after the fetcher's retry policy ran.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Non-retryable HTTP status (4xx other than 429)
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: StatusCode },

    /// Body was not the JSON we expected, or an ArcGIS error envelope
    #[error("malformed response from {url}: {reason}")]
    Malformed { url: String, reason: String },

    /// Every attempt hit a transient failure
    #[error("giving up on {url} after {attempts} attempts: {cause}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        status: Option<StatusCode>,
        cause: String,
    },

    /// Request could not be built (bad URL, client misconfiguration)
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Catalog store failures surfaced to callers.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("no service with key '{key}'")]
    NotFound { key: String },

    #[error("a live service with key '{key}' already exists in '{region}'")]
    Conflict { key: String, region: String },

    #[error("key '{key}' exists in several regions, specify one")]
    Ambiguous { key: String },

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    #[error("failed to encode column: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("catalog store is not running")]
    Unavailable,
}

/// Failure of a whole region sync. Folder-level fetch errors never end up here.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync of '{region}' was cancelled")]
    Cancelled { region: String },

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}
