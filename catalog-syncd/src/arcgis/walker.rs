use std::time::Duration;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use shared::key::{derive_key, ROOT_FOLDER};
use shared::protocol::ARCGIS_JSON_QUERY;
use shared::types::{ServiceDescriptor, ServiceType};
use crate::arcgis::fetcher::Fetcher;
use crate::error::FetchError;
use crate::sync::progress::{ProgressSink, SyncProgress};

/// JSON listing returned by `{root}{folder}?f=json`
#[derive(Debug, Deserialize)]
struct CatalogListing {
    #[serde(default)]
    folders: Option<Vec<String>>,
    #[serde(default)]
    services: Option<Vec<ListedService>>,
    /// ArcGIS reports failures as `{"error": {...}}` with HTTP 200
    #[serde(default)]
    error: Option<ArcgisError>,
}

#[derive(Debug, Deserialize)]
struct ListedService {
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default)]
    service_type: String,
}

#[derive(Debug, Deserialize)]
struct ArcgisError {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderFailure {
    /// Relative folder path, empty for the root
    pub path: String,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct WalkOutcome {
    pub services: Vec<ServiceDescriptor>,
    pub failed_folders: Vec<FolderFailure>,
    /// Set when the walk stopped early because of cancellation
    pub cancelled: bool,
}

/// Depth-first crawler over an ArcGIS REST folder tree.
#[derive(Clone)]
pub struct Walker {
    fetcher: Fetcher,
    folder_delay: Duration,
}

impl Walker {
    pub fn new(fetcher: Fetcher, folder_delay: Duration) -> Self {
        Self { fetcher, folder_delay }
    }

    /// Collect every supported service below `base_url`.
    ///
    /// Folders are fetched one at a time. A folder whose fetch fails is logged,
    /// recorded in `failed_folders` and skipped along with its subtree.
    /// Cancellation is honoured before each folder request.
    pub async fn walk(
        &self,
        base_url: &str,
        region: &str,
        cancel: &CancellationToken,
        progress: &ProgressSink,
    ) -> WalkOutcome {
        let base = normalize_base(base_url);
        let mut outcome = WalkOutcome::default();
        let mut pending = vec![String::new()];

        while let Some(path) = pending.pop() {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            if !path.is_empty() && !self.folder_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.folder_delay) => {}
                    _ = cancel.cancelled() => {
                        outcome.cancelled = true;
                        break;
                    }
                }
            }

            progress.emit(SyncProgress::FetchingFolder {
                region: region.to_string(),
                path: path.clone(),
            });

            let url = format!("{}{}{}", base, path, ARCGIS_JSON_QUERY);
            let listing = match self.fetch_listing(&url).await {
                Ok(listing) => listing,
                Err(e) => {
                    tracing::warn!(region, url = %url, error = %e, "Skipping folder");
                    progress.emit(SyncProgress::FolderFailed {
                        region: region.to_string(),
                        path: path.clone(),
                        error: e.to_string(),
                    });
                    outcome.failed_folders.push(FolderFailure { path, error: e.to_string() });
                    continue;
                }
            };

            // Reversed so the first listed folder is crawled next
            for folder in listing.folders.unwrap_or_default().iter().rev() {
                pending.push(format!("{}{}/", path, folder));
            }

            for listed in listing.services.unwrap_or_default() {
                if let Some(descriptor) = describe(&base, &path, region, &listed) {
                    outcome.services.push(descriptor);
                } else {
                    tracing::debug!(name = %listed.name, kind = %listed.service_type, "Ignoring service");
                }
            }
        }

        tracing::info!(
            region,
            found = outcome.services.len(),
            failed_folders = outcome.failed_folders.len(),
            cancelled = outcome.cancelled,
            "Walk finished"
        );
        outcome
    }

    async fn fetch_listing(&self, url: &str) -> Result<CatalogListing, FetchError> {
        let listing: CatalogListing = self.fetcher.get_json(url).await?;
        if let Some(err) = listing.error {
            return Err(FetchError::Malformed {
                url: url.to_string(),
                reason: format!(
                    "ArcGIS error {}: {}",
                    err.code.map(|c| c.to_string()).unwrap_or_else(|| "?".to_string()),
                    err.message.unwrap_or_default()
                ),
            });
        }
        Ok(listing)
    }
}

fn normalize_base(base_url: &str) -> String {
    if base_url.ends_with('/') {
        base_url.to_string()
    } else {
        format!("{}/", base_url)
    }
}

/// Build a descriptor for a listed service, or `None` for unsupported types
/// and nameless entries.
fn describe(base: &str, path: &str, region: &str, listed: &ListedService) -> Option<ServiceDescriptor> {
    let service_type: ServiceType = listed.service_type.parse().ok()?;

    // Names are reported with their folder prefix, e.g. "Authoritative/AQ"
    let (prefix, service_name) = match listed.name.rsplit_once('/') {
        Some((prefix, name)) => (prefix, name),
        None => ("", listed.name.as_str()),
    };
    if service_name.is_empty() {
        return None;
    }

    let folder = if !path.is_empty() {
        path.trim_end_matches('/').to_string()
    } else if !prefix.is_empty() {
        prefix.to_string()
    } else {
        ROOT_FOLDER.to_string()
    };

    let url = if path.is_empty() {
        format!("{}{}/{}", base, listed.name, service_type)
    } else {
        format!("{}{}{}/{}", base, path, service_name, service_type)
    };

    Some(ServiceDescriptor {
        key: derive_key(&folder, service_name, service_type),
        label: format!("{} ({})", service_name, service_type),
        url,
        folder,
        service_type,
        region: region.to_string(),
    })
}
