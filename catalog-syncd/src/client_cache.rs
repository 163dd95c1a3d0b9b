use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use shared::types::{ServiceDescriptor, TypeFilter};
use crate::catalog_manager::CatalogHandle;
use crate::error::CatalogError;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Where the cache loads the full catalog (all regions) from
pub trait CatalogSource: Send + Sync {
    fn fetch_catalog(&self) -> impl Future<Output = Result<Vec<ServiceDescriptor>, CatalogError>> + Send;
}

impl CatalogSource for CatalogHandle {
    fn fetch_catalog(&self) -> impl Future<Output = Result<Vec<ServiceDescriptor>, CatalogError>> + Send {
        self.list_all()
    }
}

struct Snapshot {
    by_region: HashMap<String, Vec<ServiceDescriptor>>,
    fetched_at: DateTime<Utc>,
}

impl Snapshot {
    fn build(services: Vec<ServiceDescriptor>, fetched_at: DateTime<Utc>) -> Self {
        let mut by_region: HashMap<String, Vec<ServiceDescriptor>> = HashMap::new();
        for service in services {
            by_region.entry(service.region.clone()).or_default().push(service);
        }
        for list in by_region.values_mut() {
            list.sort_by(|a, b| (&a.folder, &a.label).cmp(&(&b.folder, &b.label)));
        }
        Self { by_region, fetched_at }
    }

    fn select(&self, region: Option<&str>, filter: TypeFilter) -> Vec<ServiceDescriptor> {
        match region {
            Some(region) => self
                .by_region
                .get(region)
                .map(|list| {
                    list.iter()
                        .filter(|s| filter.matches(s.service_type))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default(),
            None => {
                let mut all: Vec<ServiceDescriptor> = self
                    .by_region
                    .values()
                    .flatten()
                    .filter(|s| filter.matches(s.service_type))
                    .cloned()
                    .collect();
                all.sort_by(|a, b| {
                    (&a.folder, &a.label, &a.region).cmp(&(&b.folder, &b.label, &b.region))
                });
                all
            }
        }
    }
}

/// Time-boxed copy of the whole catalog, grouped by region.
///
/// Callers arriving while a refresh is in flight wait for it and share its
/// result, so a burst of requests costs one store query.
pub struct CatalogCache<S, C = SystemClock> {
    source: S,
    clock: C,
    ttl: Duration,
    snapshot: Mutex<Option<Snapshot>>,
    invalidated: AtomicBool,
}

impl<S: CatalogSource, C: Clock> CatalogCache<S, C> {
    pub fn new(source: S, clock: C, ttl: Duration) -> Self {
        Self {
            source,
            clock,
            ttl,
            snapshot: Mutex::new(None),
            invalidated: AtomicBool::new(false),
        }
    }

    /// Services of `region` (all regions when `None`) matching `filter`,
    /// sorted by folder then label
    pub async fn get_catalog(
        &self,
        region: Option<&str>,
        filter: TypeFilter,
    ) -> Result<Vec<ServiceDescriptor>, CatalogError> {
        let mut snapshot = self.snapshot.lock().await;
        let now = self.clock.now();

        let invalidated = self.invalidated.swap(false, Ordering::AcqRel);
        let expired = match snapshot.as_ref() {
            None => true,
            // A clock that went backwards keeps the snapshot
            Some(s) => (now - s.fetched_at).to_std().map(|age| age >= self.ttl).unwrap_or(false),
        };

        if invalidated || expired {
            match self.source.fetch_catalog().await {
                Ok(services) => {
                    tracing::debug!(count = services.len(), "Catalog cache refreshed");
                    *snapshot = Some(Snapshot::build(services, now));
                }
                Err(e) => {
                    // Try again on the next call
                    self.invalidated.store(true, Ordering::Release);
                    return Err(e);
                }
            }
        }

        Ok(snapshot
            .as_ref()
            .map(|s| s.select(region, filter))
            .unwrap_or_default())
    }

    /// Force the next `get_catalog` to reload
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
    }
}

/// Invalidate `cache` every time the published catalog hash changes
pub async fn invalidate_on_change<S: CatalogSource, C: Clock>(
    cache: Arc<CatalogCache<S, C>>,
    mut hash_rx: watch::Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            changed = hash_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                cache.invalidate();
            }
            _ = cancel.cancelled() => break,
        }
    }
}
