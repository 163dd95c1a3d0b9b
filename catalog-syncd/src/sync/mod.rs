pub mod diff;
pub mod progress;

use std::sync::Arc;
use std::time::Duration;
use futures::Stream;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use crate::arcgis::walker::Walker;
use crate::catalog_manager::CatalogHandle;
use crate::config::RegionConfig;
use crate::error::SyncError;
use self::progress::{ProgressSink, SyncProgress};

/// Counts for one region's sync run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub region: String,
    /// Supported services seen upstream, before de-duplication
    pub total_found: usize,
    /// Keys already known (live or removed) before the run
    pub existing_count: usize,
    pub new_count: usize,
    pub added: usize,
    pub collisions: usize,
    pub failed_folders: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RegionOutcome {
    Synced(SyncReport),
    Failed { region: String, error: String },
}

impl RegionOutcome {
    pub fn log(&self) {
        match self {
            RegionOutcome::Synced(report) if report.failed_folders > 0 => tracing::warn!(
                region = %report.region,
                added = report.added,
                failed_folders = report.failed_folders,
                "Sync finished with skipped folders"
            ),
            RegionOutcome::Synced(report) => tracing::info!(
                region = %report.region,
                added = report.added,
                total = report.total_found,
                "Sync finished"
            ),
            RegionOutcome::Failed { region, error } => {
                tracing::error!(region = %region, "Sync failed: {}", error)
            }
        }
    }
}

/// Crawls upstream catalogs and adds services the store has not seen yet.
/// Nothing is written until a region's crawl is complete.
#[derive(Clone)]
pub struct Synchronizer {
    walker: Walker,
    catalog: CatalogHandle,
    regions: Arc<Vec<RegionConfig>>,
    region_delay: Duration,
}

impl Synchronizer {
    pub fn new(
        walker: Walker,
        catalog: CatalogHandle,
        regions: Vec<RegionConfig>,
        region_delay: Duration,
    ) -> Self {
        Self {
            walker,
            catalog,
            regions: Arc::new(regions),
            region_delay,
        }
    }

    pub fn regions(&self) -> &[RegionConfig] {
        &self.regions
    }

    pub async fn sync_region(
        &self,
        region: &RegionConfig,
        cancel: &CancellationToken,
        progress: &ProgressSink,
    ) -> Result<SyncReport, SyncError> {
        let name = region.name.as_str();
        progress.emit(SyncProgress::RegionStarted { region: name.to_string() });

        let existing = self.catalog.existing_keys(name.to_string()).await?;
        let walk = self.walker.walk(&region.url, name, cancel, progress).await;
        if walk.cancelled {
            return Err(SyncError::Cancelled { region: name.to_string() });
        }

        let total_found = walk.services.len();
        let (unique, collisions) = diff::dedupe_by_key(walk.services);
        for collision in &collisions {
            tracing::warn!(
                region = name,
                key = %collision.key,
                kept = %collision.kept_url,
                dropped = %collision.dropped_url,
                "Key collision, keeping the first service"
            );
        }

        let new = diff::diff_new(&unique, &existing);
        let new_count = new.len();
        progress.emit(SyncProgress::DiffComputed {
            region: name.to_string(),
            total_found,
            new_count,
        });

        let added = if new.is_empty() {
            0
        } else {
            self.catalog.bulk_upsert(name.to_string(), new).await?
        };
        progress.emit(SyncProgress::Committed { region: name.to_string(), added });

        Ok(SyncReport {
            region: name.to_string(),
            total_found,
            existing_count: existing.len(),
            new_count,
            added,
            collisions: collisions.len(),
            failed_folders: walk.failed_folders.len(),
        })
    }

    /// Sync `regions` one after another. A failing region is reported and the
    /// rest still run.
    pub async fn sync_regions(
        &self,
        regions: &[RegionConfig],
        cancel: &CancellationToken,
        progress: &ProgressSink,
    ) -> Vec<RegionOutcome> {
        let mut outcomes = Vec::with_capacity(regions.len());

        for (i, region) in regions.iter().enumerate() {
            if i > 0 && !self.region_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.region_delay) => {}
                    _ = cancel.cancelled() => {}
                }
            }

            let outcome = match self.sync_region(region, cancel, progress).await {
                Ok(report) => RegionOutcome::Synced(report),
                Err(e) => {
                    progress.emit(SyncProgress::RegionFailed {
                        region: region.name.clone(),
                        error: e.to_string(),
                    });
                    RegionOutcome::Failed { region: region.name.clone(), error: e.to_string() }
                }
            };
            outcome.log();
            outcomes.push(outcome);
        }

        outcomes
    }

    pub async fn sync_all(&self, cancel: &CancellationToken, progress: &ProgressSink) -> Vec<RegionOutcome> {
        let regions = Arc::clone(&self.regions);
        self.sync_regions(&regions, cancel, progress).await
    }

    /// Run a sync in the background. Progress is streamed through the returned
    /// task until it finishes; cancelling `parent` also cancels the task.
    pub fn spawn(&self, regions: Vec<RegionConfig>, parent: &CancellationToken) -> SyncTask {
        let cancel = parent.child_token();
        let (sink, events) = ProgressSink::channel();
        let synchronizer = self.clone();
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            synchronizer.sync_regions(&regions, &task_cancel, &sink).await
        });

        SyncTask { cancel, events, handle }
    }
}

/// A sync running in the background
pub struct SyncTask {
    cancel: CancellationToken,
    events: flume::Receiver<SyncProgress>,
    handle: JoinHandle<Vec<RegionOutcome>>,
}

impl SyncTask {
    /// Progress events; the stream ends once the task is done
    pub fn events(&self) -> impl Stream<Item = SyncProgress> + '_ {
        self.events.stream()
    }

    /// Stop issuing folder requests. Regions not yet committed are reported
    /// as failed and nothing of theirs is written.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn finish(self) -> Result<Vec<RegionOutcome>, tokio::task::JoinError> {
        self.handle.await
    }
}
