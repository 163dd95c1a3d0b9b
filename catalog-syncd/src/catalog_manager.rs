use std::collections::HashSet;
use std::thread;
use std::time::Duration;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use shared::types::{LayerRemoval, RemovedServiceRecord, ServiceDescriptor, TypeFilter};
use crate::catalog::db::{CatalogDb, CatalogStat, ServiceSelector};
use crate::catalog::hash;
use crate::config::{CatalogConfig, SyncConfig};
use crate::error::CatalogError;
use crate::sync::progress::ProgressSink;
use crate::sync::Synchronizer;

type Reply<T> = oneshot::Sender<Result<T, CatalogError>>;

/// Commands sent to the catalog thread
pub enum CatalogCommand {
    List {
        region: Option<String>,
        filter: TypeFilter,
        reply: Reply<Vec<ServiceDescriptor>>,
    },
    ExistingKeys(String, Reply<HashSet<String>>),
    BulkUpsert {
        region: Option<String>,
        services: Vec<ServiceDescriptor>,
        reply: Reply<usize>,
    },
    Remove {
        selector: ServiceSelector,
        removed_by: Option<String>,
        layers_removed: Vec<LayerRemoval>,
        reply: Reply<RemovedServiceRecord>,
    },
    Restore(ServiceSelector, Reply<ServiceDescriptor>),
    PermanentlyDelete(ServiceSelector, Reply<()>),
    ClearRemoved(Option<String>, Reply<usize>),
    ListRemoved(Option<String>, Reply<Vec<RemovedServiceRecord>>),
    RenameFolder {
        old: String,
        new: String,
        region: String,
        reply: Reply<usize>,
    },
    RenameService(ServiceSelector, String, Reply<ServiceDescriptor>),
    Stats(Reply<Vec<CatalogStat>>),
    Purge {
        retention_days: u32,
        reply: Reply<usize>,
    },
    Shutdown,
}

/// Handle to interact with the catalog database
#[derive(Clone)]
pub struct CatalogHandle {
    tx: mpsc::Sender<CatalogCommand>,
}

fn publish_hash(db: &CatalogDb, hash_tx: &watch::Sender<String>) {
    match db.list_all() {
        Ok(services) => {
            let new_hash = hash::compute_hash(&services);
            hash_tx.send_if_modified(|current| {
                if *current == new_hash {
                    false
                } else {
                    *current = new_hash;
                    true
                }
            });
        }
        Err(e) => tracing::error!("Failed to recompute catalog hash: {}", e),
    }
}

/// Publish a fresh hash if the command changed the catalog, then reply.
/// Callers never observe their own write before the hash reflects it.
fn answer<T>(
    reply: Reply<T>,
    result: Result<T, CatalogError>,
    changed: impl Fn(&T) -> bool,
    publish: impl FnOnce(),
) {
    if matches!(&result, Ok(value) if changed(value)) {
        publish();
    }
    let _ = reply.send(result);
}

impl CatalogHandle {
    /// Spawn a new catalog thread owning `db`
    pub fn spawn(mut db: CatalogDb, hash_tx: watch::Sender<String>) -> Self {
        let (tx, mut rx) = mpsc::channel::<CatalogCommand>(256);

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    CatalogCommand::List { region, filter, reply } => {
                        let _ = reply.send(db.list_by_region(region.as_deref(), filter));
                    }
                    CatalogCommand::ExistingKeys(region, reply) => {
                        let _ = reply.send(db.existing_keys(&region));
                    }
                    CatalogCommand::BulkUpsert { region, services, reply } => {
                        let result = match region {
                            Some(region) => db.bulk_upsert(&region, &services),
                            None => db.upsert_descriptors(&services),
                        };
                        answer(reply, result, |n| *n > 0, || publish_hash(&db, &hash_tx));
                    }
                    CatalogCommand::Remove { selector, removed_by, layers_removed, reply } => {
                        let result = db.remove(&selector, removed_by, layers_removed);
                        answer(reply, result, |_| true, || publish_hash(&db, &hash_tx));
                    }
                    CatalogCommand::Restore(selector, reply) => {
                        let result = db.restore(&selector);
                        answer(reply, result, |_| true, || publish_hash(&db, &hash_tx));
                    }
                    // Only the live table feeds the hash
                    CatalogCommand::PermanentlyDelete(selector, reply) => {
                        let _ = reply.send(db.permanently_delete(&selector));
                    }
                    CatalogCommand::ClearRemoved(region, reply) => {
                        let _ = reply.send(db.clear_all_removed(region.as_deref()));
                    }
                    CatalogCommand::ListRemoved(region, reply) => {
                        let _ = reply.send(db.list_removed(region.as_deref()));
                    }
                    CatalogCommand::RenameFolder { old, new, region, reply } => {
                        let result = db.rename_folder(&old, &new, &region);
                        answer(reply, result, |n| *n > 0, || publish_hash(&db, &hash_tx));
                    }
                    CatalogCommand::RenameService(selector, label, reply) => {
                        let result = db.rename_service(&selector, &label);
                        answer(reply, result, |_| true, || publish_hash(&db, &hash_tx));
                    }
                    CatalogCommand::Stats(reply) => {
                        let _ = reply.send(db.stats());
                    }
                    CatalogCommand::Purge { retention_days, reply } => {
                        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
                        let _ = reply.send(db.purge_removed_before(cutoff));
                    }
                    CatalogCommand::Shutdown => {
                        tracing::info!("Catalog thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> CatalogCommand,
    ) -> Result<T, CatalogError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| CatalogError::Unavailable)?;
        rx.await.map_err(|_| CatalogError::Unavailable)?
    }

    pub async fn list(&self, region: Option<String>, filter: TypeFilter) -> Result<Vec<ServiceDescriptor>, CatalogError> {
        self.request(|reply| CatalogCommand::List { region, filter, reply }).await
    }

    pub async fn list_all(&self) -> Result<Vec<ServiceDescriptor>, CatalogError> {
        self.list(None, TypeFilter::All).await
    }

    pub async fn existing_keys(&self, region: String) -> Result<HashSet<String>, CatalogError> {
        self.request(|reply| CatalogCommand::ExistingKeys(region, reply)).await
    }

    /// Atomic upsert of `services` into `region`
    pub async fn bulk_upsert(&self, region: String, services: Vec<ServiceDescriptor>) -> Result<usize, CatalogError> {
        self.request(|reply| CatalogCommand::BulkUpsert { region: Some(region), services, reply }).await
    }

    /// Atomic upsert where every descriptor carries its own region
    pub async fn upsert_descriptors(&self, services: Vec<ServiceDescriptor>) -> Result<usize, CatalogError> {
        self.request(|reply| CatalogCommand::BulkUpsert { region: None, services, reply }).await
    }

    pub async fn remove(
        &self,
        selector: ServiceSelector,
        removed_by: Option<String>,
        layers_removed: Vec<LayerRemoval>,
    ) -> Result<RemovedServiceRecord, CatalogError> {
        self.request(|reply| CatalogCommand::Remove { selector, removed_by, layers_removed, reply })
            .await
    }

    pub async fn restore(&self, selector: ServiceSelector) -> Result<ServiceDescriptor, CatalogError> {
        self.request(|reply| CatalogCommand::Restore(selector, reply)).await
    }

    pub async fn permanently_delete(&self, selector: ServiceSelector) -> Result<(), CatalogError> {
        self.request(|reply| CatalogCommand::PermanentlyDelete(selector, reply)).await
    }

    pub async fn clear_removed(&self, region: Option<String>) -> Result<usize, CatalogError> {
        self.request(|reply| CatalogCommand::ClearRemoved(region, reply)).await
    }

    pub async fn list_removed(&self, region: Option<String>) -> Result<Vec<RemovedServiceRecord>, CatalogError> {
        self.request(|reply| CatalogCommand::ListRemoved(region, reply)).await
    }

    pub async fn rename_folder(&self, old: String, new: String, region: String) -> Result<usize, CatalogError> {
        self.request(|reply| CatalogCommand::RenameFolder { old, new, region, reply }).await
    }

    pub async fn rename_service(&self, selector: ServiceSelector, new_label: String) -> Result<ServiceDescriptor, CatalogError> {
        self.request(|reply| CatalogCommand::RenameService(selector, new_label, reply)).await
    }

    pub async fn stats(&self) -> Result<Vec<CatalogStat>, CatalogError> {
        self.request(CatalogCommand::Stats).await
    }

    /// Drop removed records older than `retention_days`
    pub async fn purge_removed(&self, retention_days: u32) -> Result<usize, CatalogError> {
        self.request(|reply| CatalogCommand::Purge { retention_days, reply }).await
    }

    /// Shutdown the catalog thread
    pub async fn shutdown(&self) -> Result<(), CatalogError> {
        self.tx
            .send(CatalogCommand::Shutdown)
            .await
            .map_err(|_| CatalogError::Unavailable)
    }
}

/// Background loop: purges expired removed records and, when configured,
/// re-syncs every region on a fixed interval.
pub async fn run(
    catalog: CatalogHandle,
    synchronizer: Synchronizer,
    catalog_config: CatalogConfig,
    sync_config: SyncConfig,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut maintenance_interval = tokio::time::interval(Duration::from_secs(
        catalog_config.maintenance_interval_secs.max(1),
    ));

    // A zero interval disables periodic sync; the timer then never fires
    let sync_enabled = sync_config.interval_secs > 0;
    let mut sync_interval = tokio::time::interval(Duration::from_secs(sync_config.interval_secs.max(1)));
    sync_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = maintenance_interval.tick() => {
                match catalog.purge_removed(catalog_config.removed_retention_days).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!("Purged {} expired removed services", n),
                    Err(e) => tracing::error!("Failed to run maintenance: {}", e),
                }
            }
            _ = sync_interval.tick(), if sync_enabled => {
                // Outcomes are logged per region by the synchronizer
                synchronizer.sync_all(&cancel, &ProgressSink::none()).await;
            }
            _ = cancel.cancelled() => {
                tracing::info!("Catalog manager shutting down");
                break;
            }
        }
    }

    Ok(())
}
