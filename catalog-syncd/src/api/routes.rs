use std::sync::Arc;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post, put},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use shared::protocol::{
    BULK_ADD_PATH, REMOVED_PATH, REMOVE_PATH, RENAME_FOLDER_PATH, RENAME_PATH, RESTORE_PATH,
    SERVICES_HASH_PATH, SERVICES_PATH, SERVICES_STATS_PATH, SYNC_PATH,
};
use shared::types::{LayerRemoval, RemovedServiceRecord, ServiceDescriptor, TypeFilter};
use crate::catalog::db::{CatalogStat, ServiceSelector};
use crate::catalog::search::{self, SearchType};
use crate::catalog_manager::CatalogHandle;
use crate::client_cache::CatalogCache;
use crate::config::Config;
use crate::sync::{RegionOutcome, Synchronizer};
use super::error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub catalog: CatalogHandle,
    /// Read path for service listings
    pub cache: Arc<CatalogCache<CatalogHandle>>,
    pub synchronizer: Synchronizer,
    pub hash_rx: watch::Receiver<String>,
    pub config: Arc<Config>,
    /// Cancelled on shutdown, aborts running syncs
    pub cancel: CancellationToken,
}

impl AppState {
    /// Canonical region name for a `state` parameter, `None` when absent or blank
    fn region(&self, state: Option<&str>) -> Option<String> {
        state
            .filter(|s| !s.trim().is_empty())
            .map(|s| self.config.normalize_region(s))
    }

    fn selector(&self, service_key: String, state: Option<&str>) -> ServiceSelector {
        ServiceSelector::new(service_key, self.region(state))
    }
}

#[derive(Deserialize)]
pub struct StateQuery {
    pub state: Option<String>,
}

#[derive(Deserialize)]
pub struct ServicesQuery {
    pub state: Option<String>,
    #[serde(rename = "type")]
    pub service_type: Option<String>,
}

#[derive(Deserialize)]
pub struct RemovedQuery {
    pub state: Option<String>,
    pub q: Option<String>,
    #[serde(default)]
    pub search_type: SearchType,
}

#[derive(Deserialize)]
pub struct BulkAddRequest {
    pub services: Vec<ServiceDescriptor>,
}

#[derive(Deserialize)]
pub struct RemoveRequest {
    pub service_key: String,
    pub state: Option<String>,
    pub removed_by: Option<String>,
    #[serde(default)]
    pub layers_removed: Vec<LayerRemoval>,
}

#[derive(Deserialize)]
pub struct RestoreRequest {
    pub service_key: String,
    pub state: Option<String>,
}

#[derive(Deserialize)]
pub struct RenameRequest {
    pub service_key: String,
    pub state: Option<String>,
    pub new_label: String,
}

#[derive(Deserialize)]
pub struct RenameFolderRequest {
    pub old_folder_name: String,
    pub new_folder_name: String,
    pub state: String,
}

#[derive(Serialize)]
pub struct AddedResponse {
    pub added: usize,
}

#[derive(Serialize)]
pub struct UpdatedResponse {
    pub updated: usize,
}

#[derive(Serialize)]
pub struct DeletedResponse {
    pub deleted: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(SERVICES_PATH, get(get_services))
        .route(SERVICES_HASH_PATH, get(get_hash))
        .route(SERVICES_STATS_PATH, get(get_stats))
        .route(BULK_ADD_PATH, post(bulk_add))
        .route(REMOVE_PATH, post(remove_service))
        .route(RENAME_PATH, put(rename_service))
        .route(RENAME_FOLDER_PATH, put(rename_folder))
        .route(REMOVED_PATH, get(get_removed).delete(clear_removed))
        .route(RESTORE_PATH, post(restore_service))
        .route(&format!("{}/:service_key", REMOVED_PATH), delete(delete_removed))
        .route(SYNC_PATH, post(sync))
        .with_state(state)
}

async fn get_services(
    State(state): State<AppState>,
    Query(params): Query<ServicesQuery>,
) -> Result<Json<Vec<ServiceDescriptor>>, ApiError> {
    let filter = TypeFilter::from_query(params.service_type.as_deref())
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let region = state.region(params.state.as_deref());

    let services = state.cache.get_catalog(region.as_deref(), filter).await?;
    Ok(Json(services))
}

async fn get_hash(State(state): State<AppState>) -> String {
    state.hash_rx.borrow().clone()
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<Vec<CatalogStat>>, ApiError> {
    Ok(Json(state.catalog.stats().await?))
}

async fn bulk_add(
    State(state): State<AppState>,
    Json(body): Json<BulkAddRequest>,
) -> Result<Json<AddedResponse>, ApiError> {
    let mut services = body.services;
    for service in &mut services {
        if service.key.trim().is_empty() {
            return Err(ApiError::bad_request("service_key must not be empty"));
        }
        service.region = state.config.normalize_region(&service.region);
    }

    let added = state.catalog.upsert_descriptors(services).await?;
    state.cache.invalidate();
    Ok(Json(AddedResponse { added }))
}

async fn remove_service(
    State(state): State<AppState>,
    Json(body): Json<RemoveRequest>,
) -> Result<Json<RemovedServiceRecord>, ApiError> {
    let selector = state.selector(body.service_key, body.state.as_deref());
    let record = state
        .catalog
        .remove(selector, body.removed_by, body.layers_removed)
        .await?;
    state.cache.invalidate();
    tracing::info!(key = %record.service.key, region = %record.service.region, "Service removed");
    Ok(Json(record))
}

async fn rename_service(
    State(state): State<AppState>,
    Json(body): Json<RenameRequest>,
) -> Result<Json<ServiceDescriptor>, ApiError> {
    let selector = state.selector(body.service_key, body.state.as_deref());
    let service = state.catalog.rename_service(selector, body.new_label).await?;
    state.cache.invalidate();
    Ok(Json(service))
}

async fn rename_folder(
    State(state): State<AppState>,
    Json(body): Json<RenameFolderRequest>,
) -> Result<Json<UpdatedResponse>, ApiError> {
    let region = state
        .region(Some(&body.state))
        .ok_or_else(|| ApiError::bad_request("state must not be empty"))?;
    let updated = state
        .catalog
        .rename_folder(body.old_folder_name, body.new_folder_name, region)
        .await?;
    state.cache.invalidate();
    Ok(Json(UpdatedResponse { updated }))
}

async fn get_removed(
    State(state): State<AppState>,
    Query(params): Query<RemovedQuery>,
) -> Result<Json<Vec<RemovedServiceRecord>>, ApiError> {
    let region = state.region(params.state.as_deref());
    let records = state.catalog.list_removed(region).await?;
    let keyword = params.q.unwrap_or_default();
    Ok(Json(search::filter_removed(records, params.search_type, &keyword)))
}

async fn restore_service(
    State(state): State<AppState>,
    Json(body): Json<RestoreRequest>,
) -> Result<Json<ServiceDescriptor>, ApiError> {
    let selector = state.selector(body.service_key, body.state.as_deref());
    let service = state.catalog.restore(selector).await?;
    state.cache.invalidate();
    tracing::info!(key = %service.key, region = %service.region, "Service restored");
    Ok(Json(service))
}

async fn delete_removed(
    State(state): State<AppState>,
    Path(service_key): Path<String>,
    Query(params): Query<StateQuery>,
) -> Result<StatusCode, ApiError> {
    let selector = state.selector(service_key, params.state.as_deref());
    state.catalog.permanently_delete(selector).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_removed(
    State(state): State<AppState>,
    Query(params): Query<StateQuery>,
) -> Result<Json<DeletedResponse>, ApiError> {
    let region = state.region(params.state.as_deref());
    let deleted = state.catalog.clear_removed(region).await?;
    Ok(Json(DeletedResponse { deleted }))
}

async fn sync(
    State(state): State<AppState>,
    Query(params): Query<StateQuery>,
) -> Result<Json<Vec<RegionOutcome>>, ApiError> {
    let regions = match state.region(params.state.as_deref()) {
        Some(name) => {
            let region = state
                .config
                .find_region(&name)
                .cloned()
                .ok_or_else(|| ApiError::bad_request(format!("unknown region '{}'", name)))?;
            vec![region]
        }
        None => state.synchronizer.regions().to_vec(),
    };

    let task = state.synchronizer.spawn(regions, &state.cancel);
    {
        let mut events = std::pin::pin!(task.events());
        while let Some(event) = events.next().await {
            tracing::debug!(?event, "Sync progress");
        }
    }
    let outcomes = task
        .finish()
        .await
        .map_err(|e| ApiError::internal(format!("sync task failed: {}", e)))?;

    state.cache.invalidate();
    Ok(Json(outcomes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use serde_json::{json, Value};
    use crate::arcgis::fetcher::Fetcher;
    use crate::arcgis::walker::Walker;
    use crate::catalog::db::CatalogDb;
    use crate::catalog::hash;
    use crate::client_cache::SystemClock;
    use crate::test_support::{fast_fetch_config, MockUpstream};

    struct TestApp {
        base: String,
        client: reqwest::Client,
        catalog: CatalogHandle,
    }

    impl TestApp {
        fn url(&self, path: &str) -> String {
            format!("{}{}", self.base, path)
        }

        async fn get_json(&self, path: &str) -> Value {
            let response = self.client.get(self.url(path)).send().await.unwrap();
            assert_eq!(response.status(), reqwest::StatusCode::OK, "GET {}", path);
            response.json().await.unwrap()
        }

        async fn send(&self, method: reqwest::Method, path: &str, body: Value) -> (reqwest::StatusCode, Value) {
            let response = self
                .client
                .request(method, self.url(path))
                .json(&body)
                .send()
                .await
                .unwrap();
            let status = response.status();
            let body = response.json().await.unwrap_or(Value::Null);
            (status, body)
        }

        async fn hash(&self) -> String {
            self.client
                .get(self.url(SERVICES_HASH_PATH))
                .send()
                .await
                .unwrap()
                .text()
                .await
                .unwrap()
        }
    }

    async fn spawn_app(mock: &MockUpstream) -> TestApp {
        let origin = mock.serve().await;
        let config = Config::parse(&format!(
            r#"
            [[regions]]
            code = "WA"
            name = "washington"
            url = "{origin}/rest/services/"

            [[regions]]
            code = "ID"
            name = "idaho"
            url = "{origin}/idaho/rest/services/"
            "#
        ))
        .unwrap();

        let db = CatalogDb::open(":memory:").unwrap();
        let (hash_tx, hash_rx) = watch::channel(hash::compute_hash(&[]));
        let catalog = CatalogHandle::spawn(db, hash_tx);
        let walker = Walker::new(Fetcher::new(fast_fetch_config()).unwrap(), Duration::ZERO);
        let synchronizer = Synchronizer::new(walker, catalog.clone(), config.regions.clone(), Duration::ZERO);
        let cache = Arc::new(CatalogCache::new(catalog.clone(), SystemClock, config.cache.ttl()));

        let state = AppState {
            catalog: catalog.clone(),
            cache,
            synchronizer,
            hash_rx,
            config: Arc::new(config),
            cancel: CancellationToken::new(),
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        TestApp {
            base: format!("http://{}", addr),
            client: reqwest::Client::new(),
            catalog,
        }
    }

    fn upstream_tree(mock: &MockUpstream) {
        mock.json(
            "/rest/services/",
            json!({"folders": ["Air"], "services": [{"name": "Basemap", "type": "MapServer"}]}),
        )
        .json(
            "/rest/services/Air/",
            json!({"services": [
                {"name": "Air/Ozone", "type": "MapServer"},
                {"name": "Air/Sensors", "type": "FeatureServer"}
            ]}),
        );
    }

    fn labels(services: &Value) -> Vec<String> {
        services
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["label"].as_str().unwrap().to_string())
            .collect()
    }

    async fn synced_app() -> (MockUpstream, TestApp) {
        let mock = MockUpstream::new();
        upstream_tree(&mock);
        let app = spawn_app(&mock).await;
        let (status, outcomes) = app
            .send(reqwest::Method::POST, &format!("{}?state=WA", SYNC_PATH), Value::Null)
            .await;
        assert_eq!(status, reqwest::StatusCode::OK);
        assert_eq!(outcomes[0]["status"], "synced");
        assert_eq!(outcomes[0]["added"], 3);
        (mock, app)
    }

    #[tokio::test]
    async fn test_sync_then_list() {
        let (_mock, app) = synced_app().await;

        let maps = app.get_json(&format!("{}?state=wa", SERVICES_PATH)).await;
        assert_eq!(labels(&maps), vec!["Ozone (MapServer)", "Basemap (MapServer)"]);
        assert_eq!(maps[0]["service_key"], "Air_Ozone_MapServer");
        assert_eq!(maps[0]["folder"], "Air");
        assert_eq!(maps[0]["type"], "MapServer");
        assert_eq!(maps[0]["state"], "washington");

        let all = app.get_json(&format!("{}?state=washington&type=all", SERVICES_PATH)).await;
        assert_eq!(all.as_array().unwrap().len(), 3);

        let features = app.get_json(&format!("{}?type=FeatureServer", SERVICES_PATH)).await;
        assert_eq!(labels(&features), vec!["Sensors (FeatureServer)"]);

        let stats = app.get_json(SERVICES_STATS_PATH).await;
        assert!(stats
            .as_array()
            .unwrap()
            .contains(&json!({"state": "washington", "type": "MapServer", "count": 2})));
    }

    #[tokio::test]
    async fn test_resync_keeps_hash() {
        let (_mock, app) = synced_app().await;
        let hash = app.hash().await;
        assert_ne!(hash, hash::compute_hash(&[]));

        let (_, outcomes) = app
            .send(reqwest::Method::POST, &format!("{}?state=WA", SYNC_PATH), Value::Null)
            .await;
        assert_eq!(outcomes[0]["added"], 0);
        assert_eq!(outcomes[0]["existing_count"], 3);
        assert_eq!(app.hash().await, hash);
    }

    #[tokio::test]
    async fn test_remove_search_and_restore() {
        let (_mock, app) = synced_app().await;

        let (status, record) = app
            .send(
                reqwest::Method::POST,
                REMOVE_PATH,
                json!({
                    "service_key": "Air_Ozone_MapServer",
                    "state": "WA",
                    "removed_by": "alice",
                    "layers_removed": ["Monitors", {"name": "Forecast", "sublayers": ["Day 1"]}]
                }),
            )
            .await;
        assert_eq!(status, reqwest::StatusCode::OK);
        assert_eq!(record["service_key"], "Air_Ozone_MapServer");
        assert_eq!(record["removed_by"], "alice");

        let maps = app.get_json(&format!("{}?state=WA", SERVICES_PATH)).await;
        assert_eq!(labels(&maps), vec!["Basemap (MapServer)"]);

        let hits = app
            .get_json(&format!("{}?q=monitor&search_type=layer", REMOVED_PATH))
            .await;
        assert_eq!(hits.as_array().unwrap().len(), 1);
        assert_eq!(hits[0]["layers_removed"], json!([{"name": "Monitors", "sublayers": []}]));
        let misses = app.get_json(&format!("{}?q=water&search_type=folder", REMOVED_PATH)).await;
        assert!(misses.as_array().unwrap().is_empty());

        let (status, restored) = app
            .send(reqwest::Method::POST, RESTORE_PATH, json!({"service_key": "Air_Ozone_MapServer"}))
            .await;
        assert_eq!(status, reqwest::StatusCode::OK);
        assert_eq!(restored["label"], "Ozone (MapServer)");

        let maps = app.get_json(&format!("{}?state=WA", SERVICES_PATH)).await;
        assert_eq!(maps.as_array().unwrap().len(), 2);
        assert!(app.get_json(REMOVED_PATH).await.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_conflict() {
        let (_mock, app) = synced_app().await;
        app.send(reqwest::Method::POST, REMOVE_PATH, json!({"service_key": "Root_Basemap_MapServer"}))
            .await;

        // Same key re-added by hand while the removed copy still exists
        let (status, added) = app
            .send(
                reqwest::Method::POST,
                BULK_ADD_PATH,
                json!({"services": [{
                    "service_key": "Root_Basemap_MapServer",
                    "label": "Basemap v2 (MapServer)",
                    "url": "https://example.org/rest/services/Basemap/MapServer",
                    "folder": "Root",
                    "type": "MapServer",
                    "state": "WA"
                }]}),
            )
            .await;
        assert_eq!(status, reqwest::StatusCode::OK);
        assert_eq!(added, json!({"added": 1}));

        let (status, body) = app
            .send(
                reqwest::Method::POST,
                RESTORE_PATH,
                json!({"service_key": "Root_Basemap_MapServer", "state": "washington"}),
            )
            .await;
        assert_eq!(status, reqwest::StatusCode::CONFLICT);
        assert!(body["detail"].as_str().unwrap().contains("Root_Basemap_MapServer"));

        let maps = app.get_json(&format!("{}?state=WA", SERVICES_PATH)).await;
        assert!(labels(&maps).contains(&"Basemap v2 (MapServer)".to_string()));
    }

    #[tokio::test]
    async fn test_renames() {
        let (_mock, app) = synced_app().await;

        let (status, renamed) = app
            .send(
                reqwest::Method::PUT,
                RENAME_PATH,
                json!({"service_key": "Root_Basemap_MapServer", "state": "WA", "new_label": "Base Map"}),
            )
            .await;
        assert_eq!(status, reqwest::StatusCode::OK);
        assert_eq!(renamed["label"], "Base Map");

        let (status, updated) = app
            .send(
                reqwest::Method::PUT,
                RENAME_FOLDER_PATH,
                json!({"old_folder_name": "Air", "new_folder_name": "Air Quality", "state": "WA"}),
            )
            .await;
        assert_eq!(status, reqwest::StatusCode::OK);
        assert_eq!(updated, json!({"updated": 2}));

        let all = app.get_json(&format!("{}?type=all", SERVICES_PATH)).await;
        let folders: Vec<&str> = all.as_array().unwrap().iter().map(|s| s["folder"].as_str().unwrap()).collect();
        assert_eq!(folders, vec!["Air Quality", "Air Quality", "Root"]);
        assert!(labels(&all).contains(&"Base Map".to_string()));

        let (status, _) = app
            .send(
                reqwest::Method::PUT,
                RENAME_PATH,
                json!({"service_key": "Root_Basemap_MapServer", "new_label": "  "}),
            )
            .await;
        assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_ambiguous_key_needs_state() {
        let mock = MockUpstream::new();
        let app = spawn_app(&mock).await;
        let service = |state: &str| {
            json!({
                "service_key": "Root_Shared_MapServer",
                "label": "Shared (MapServer)",
                "url": format!("https://example.org/{}/Shared/MapServer", state),
                "folder": "Root",
                "type": "MapServer",
                "state": state
            })
        };
        app.send(reqwest::Method::POST, BULK_ADD_PATH, json!({"services": [service("WA"), service("ID")]}))
            .await;

        let (status, _) = app
            .send(reqwest::Method::POST, REMOVE_PATH, json!({"service_key": "Root_Shared_MapServer"}))
            .await;
        assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);

        let (status, record) = app
            .send(
                reqwest::Method::POST,
                REMOVE_PATH,
                json!({"service_key": "Root_Shared_MapServer", "state": "id"}),
            )
            .await;
        assert_eq!(status, reqwest::StatusCode::OK);
        assert_eq!(record["state"], "idaho");
    }

    #[tokio::test]
    async fn test_delete_and_clear_removed() {
        let (_mock, app) = synced_app().await;
        for key in ["Root_Basemap_MapServer", "Air_Ozone_MapServer", "Air_Sensors_FeatureServer"] {
            app.send(reqwest::Method::POST, REMOVE_PATH, json!({"service_key": key, "state": "WA"}))
                .await;
        }

        let response = app
            .client
            .delete(app.url(&format!("{}/Root_Basemap_MapServer?state=WA", REMOVED_PATH)))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);

        let response = app
            .client
            .delete(app.url(&format!("{}/Root_Basemap_MapServer?state=WA", REMOVED_PATH)))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

        let (status, deleted) = app
            .send(reqwest::Method::DELETE, &format!("{}?state=WA", REMOVED_PATH), Value::Null)
            .await;
        assert_eq!(status, reqwest::StatusCode::OK);
        assert_eq!(deleted, json!({"deleted": 2}));
        assert!(app.catalog.list_removed(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bad_requests() {
        let mock = MockUpstream::new();
        let app = spawn_app(&mock).await;

        let response = app
            .client
            .get(app.url(&format!("{}?type=ImageServer", SERVICES_PATH)))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

        let (status, body) = app
            .send(reqwest::Method::POST, REMOVE_PATH, json!({"service_key": "nope", "state": "WA"}))
            .await;
        assert_eq!(status, reqwest::StatusCode::NOT_FOUND);
        assert!(body["detail"].is_string());

        let (status, _) = app
            .send(reqwest::Method::POST, &format!("{}?state=Narnia", SYNC_PATH), Value::Null)
            .await;
        assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
    }
}
